//! # slotctl
//!
//! Stateless bootstrap and topology orchestration for slot-partitioned,
//! replicated in-memory clusters:
//! - Discovers candidate nodes from a service registry
//! - Probes them in parallel for their self-reported state
//! - Partitions the slot space across masters, moving as few slots as possible
//! - Balances replicas across masters and failure domains
//! - Pushes an epoch-stamped topology and waits for every node to confirm it
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Controller (one run, no state)    │
//! │  discover → probe → plan → converge      │
//! └──────┬─────────────────────────┬─────────┘
//!        │ GET /candidates         │ GET  /cluster/state
//!        │                         │ POST /cluster/topology
//! ┌──────▼──────┐   ┌──────────────▼──┬──────────────────┐
//! │  Registry   │   │ Node A (master) │ Node B (replica) │ ...
//! └─────────────┘   │  epoch check    │  epoch check     │
//!                   └─────────────────┴──────────────────┘
//! ```
//!
//! Epochs are the only coordination between runs. A node refuses a topology
//! older than the one it holds, so any number of orchestrators can be
//! triggered concurrently without a lock.
//!
//! ## Usage
//!
//! ### Run a node agent
//! ```bash
//! slotctl-node --id cache-a --bind 127.0.0.1:7001
//! ```
//!
//! ### Orchestrate
//! ```bash
//! # One run against a static candidate list
//! slotctl run --candidates ./candidates.toml --min-masters 3 --replicas 1
//!
//! # Show what would be pushed
//! slotctl plan --registry http://registry.local:8500
//!
//! # Check agreement and slot coverage
//! slotctl verify --candidates ./candidates.toml
//!
//! # Try it without any nodes
//! slotctl simulate --nodes 6 --replicas 1
//! ```

pub mod common;
pub mod node;
pub mod ops;
pub mod orchestrator;
pub mod topology;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use orchestrator::{run_orchestration, Controller, RunResult, RunState};
pub use topology::{Topology, TopologyBuilder};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");

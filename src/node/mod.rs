//! Node side of the control plane: the agent every data node runs, its HTTP
//! surface, and an in-process cluster of agents.

pub mod agent;
pub mod http;
pub mod local;

pub use agent::NodeAgent;
pub use http::{create_router, NodeServer};
pub use local::LocalCluster;

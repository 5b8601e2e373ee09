//! Utility functions for slotctl

use std::time::Duration;

/// Parse duration string (e.g., "250ms", "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let split = s.len() - s.chars().last().map(char::len_utf8).unwrap_or(0);
        (&s[..split], &s[split..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let seconds_per = match unit {
        "ms" => return Ok(Duration::from_millis(num)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    num.checked_mul(seconds_per)
        .map(Duration::from_secs)
        .ok_or_else(|| crate::Error::InvalidConfig(format!("duration out of range: {}", s)))
}

/// Render a duration in the format accepted by [`parse_duration`]
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        format!("{}ms", ms)
    } else {
        format!("{}s", d.as_secs())
    }
}

/// Serde adapter so config files can say `probe_timeout = "2s"`.
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Current time as an RFC 3339 timestamp
pub fn timestamp_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

/// Human-readable slot count, e.g. `5461 (33.33%)`
pub fn format_share(slots: u32, total: u32) -> String {
    if total == 0 {
        return format!("{}", slots);
    }
    format!("{} ({:.2}%)", slots, slots as f64 * 100.0 / total as f64)
}

//! This crate is the composite of the gRPC API layer and the Orchestrator.
//! A simulated backend lets the server run without any accelerator.

pub mod backend;
pub mod grpc;

use std::{num::ParseIntError, time::Duration};

/// Parse `value[s|ms|us|ns]`, e.g. `10ms`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(value) = s.strip_suffix("ns") {
        value.parse().ok().map(Duration::from_nanos)
    } else if let Some(value) = s.strip_suffix("us") {
        value.parse().ok().map(Duration::from_micros)
    } else if let Some(value) = s.strip_suffix("ms") {
        value.parse().ok().map(Duration::from_millis)
    } else if let Some(value) = s.strip_suffix('s') {
        value.parse().ok().map(Duration::from_secs)
    } else {
        None
    }
}

/// Parse a comma separated list such as `4,8`; empty means none.
pub fn parse_list<T>(s: &str) -> Result<Vec<T>, ParseIntError>
where
    T: std::str::FromStr<Err = ParseIntError>,
{
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::parse)
        .collect()
}

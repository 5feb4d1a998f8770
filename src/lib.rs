//! Traffic accounting and time-series aggregation for proxy users and
//! WireGuard peers.

pub mod agent;
pub mod config;
pub mod dashboard;
pub mod export;
pub mod retention;
pub mod sampler;
pub mod source;
pub mod store;

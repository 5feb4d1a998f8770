//! Counter sources consumed by the samplers.
//!
//! Each source exposes absolute, monotonically increasing byte counters.
//! Samplers turn them into deltas or snapshots.

pub mod peer;
pub mod proxy;
pub mod roster;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;

pub use peer::WireGuardDump;
pub use proxy::ProxyStatsClient;
pub use roster::{ConfigFileRoster, PeerNames};

/// Absolute uplink/downlink byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub uplink: u64,
    pub downlink: u64,
}

/// Absolute counters for one VPN peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCounters {
    pub peer_id: String,
    pub rx: u64,
    pub tx: u64,
    /// Empty when the peer has no known endpoint.
    pub endpoint: String,
    /// Unix seconds of the latest handshake, 0 if never.
    pub last_handshake: i64,
}

/// Callback type for recording upstream request metrics.
/// Receives (source, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Errors decoding external counter formats.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SourceError {
    #[error("stats response missing object {path:?}")]
    MissingSection { path: &'static str },

    #[error("dump line {line}: expected {expected} fields, found {found}")]
    FieldCount {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("dump line {line}: invalid {field} value {value:?}")]
    InvalidField {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },
}

/// Absolute per-identity counters.
pub trait UserCounterSource: Send + Sync {
    /// Fetch the current counters keyed by identity.
    fn user_counters(
        &self,
    ) -> impl std::future::Future<Output = Result<HashMap<String, Counters>>> + Send;
}

/// Absolute counters summed across a set of inbound tags.
pub trait AggregateCounterSource: Send + Sync {
    /// Fetch the summed counters for `tags`.
    fn aggregate_counters(
        &self,
        tags: &[String],
    ) -> impl std::future::Future<Output = Result<Counters>> + Send;
}

/// Absolute per-peer counters.
pub trait PeerCounterSource: Send + Sync {
    /// Fetch the current counters for every peer.
    fn peer_counters(&self) -> impl std::future::Future<Output = Result<Vec<PeerCounters>>> + Send;
}

/// The configured identity list.
pub trait IdentityRoster: Send + Sync {
    /// Returns the configured identities, deduplicated, in config order.
    fn identities(&self) -> Result<Vec<String>>;
}

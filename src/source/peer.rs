use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

use super::{MetricsCallback, PeerCounterSource, PeerCounters, SourceError};
use crate::config::PeersConfig;

/// Fields on an interface line of `wg show <iface> dump`.
const INTERFACE_FIELDS: usize = 4;
/// Fields on a peer line of `wg show <iface> dump`.
const PEER_FIELDS: usize = 8;

/// Reads peer counters by running `wg show <iface> dump`.
pub struct WireGuardDump {
    binary: String,
    interface: String,
    timeout: Duration,
    metrics: Option<MetricsCallback>,
}

impl WireGuardDump {
    pub fn new(cfg: &PeersConfig) -> Self {
        Self {
            binary: cfg.wg_binary.clone(),
            interface: cfg.interface.clone(),
            timeout: cfg.timeout,
            metrics: None,
        }
    }

    /// Set a metrics callback for recording command stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb("wireguard", status, duration);
        }
    }

    async fn run_dump(&self) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("show")
            .arg(&self.interface)
            .arg("dump")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| {
                format!(
                    "{} show {} dump timed out after {:?}",
                    self.binary, self.interface, self.timeout
                )
            })?
            .with_context(|| format!("running {}", self.binary))?;

        if !output.status.success() {
            return Err(SourceError::CommandFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }

        String::from_utf8(output.stdout).context("decoding wg output as UTF-8")
    }
}

impl PeerCounterSource for WireGuardDump {
    async fn peer_counters(&self) -> Result<Vec<PeerCounters>> {
        let start = Instant::now();

        let result = match self.run_dump().await {
            Ok(stdout) => parse_dump(&stdout).map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };

        let status = if result.is_ok() { "success" } else { "error" };
        self.record_request(status, start.elapsed());

        let peers = result.with_context(|| format!("reading peers of {}", self.interface))?;
        debug!(interface = %self.interface, peers = peers.len(), "read peer counters");

        Ok(peers)
    }
}

/// Parse the tab-separated output of `wg show <iface> dump`.
///
/// The first line describes the interface. Every following line is a peer:
/// public key, preshared key, endpoint, allowed ips, latest handshake, rx,
/// tx, persistent keepalive.
pub fn parse_dump(output: &str) -> Result<Vec<PeerCounters>, SourceError> {
    let mut peers = Vec::new();

    for (idx, line) in output.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();

        if idx == 0 {
            if fields.len() != INTERFACE_FIELDS {
                return Err(SourceError::FieldCount {
                    line: line_no,
                    expected: INTERFACE_FIELDS,
                    found: fields.len(),
                });
            }
            continue;
        }

        if fields.len() != PEER_FIELDS {
            return Err(SourceError::FieldCount {
                line: line_no,
                expected: PEER_FIELDS,
                found: fields.len(),
            });
        }

        let endpoint = match fields[2] {
            "(none)" => String::new(),
            other => other.to_string(),
        };

        peers.push(PeerCounters {
            peer_id: fields[0].to_string(),
            endpoint,
            last_handshake: parse_field(line_no, "latest-handshake", fields[4])?,
            rx: parse_field(line_no, "transfer-rx", fields[5])?,
            tx: parse_field(line_no, "transfer-tx", fields[6])?,
        });
    }

    Ok(peers)
}

fn parse_field<T: std::str::FromStr>(
    line: usize,
    field: &'static str,
    value: &str,
) -> Result<T, SourceError> {
    value.parse().map_err(|_| SourceError::InvalidField {
        line,
        field,
        value: value.to_string(),
    })
}

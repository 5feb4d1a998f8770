//! Aggregate-traffic attribution via the proxy access log.
//!
//! When the proxy only exposes per-inbound counters, [`LogWatcher`] tails the
//! access log to learn which identities are currently connected, and
//! [`Calculator`] splits each aggregate delta evenly across them.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Tick;
use crate::config::ResetPolicy;
use crate::export::health::HealthMetrics;
use crate::source::{AggregateCounterSource, Counters};
use crate::store::query::Point;
use crate::store::{unix_now, Sample, Store, SOURCE_ATTRIBUTION};

/// Tails an access log and tracks when each identity was last seen.
pub struct LogWatcher {
    path: PathBuf,
    marker: String,
    /// Entries older than this are pruned on every poll.
    retain: i64,
    /// Byte offset of the first unread line. `None` until the first poll.
    offset: Mutex<Option<u64>>,
    last_seen: DashMap<String, i64>,
}

impl LogWatcher {
    pub fn new(path: impl Into<PathBuf>, marker: impl Into<String>, retain: Duration) -> Self {
        Self {
            path: path.into(),
            marker: marker.into(),
            retain: i64::try_from(retain.as_secs()).unwrap_or(i64::MAX),
            offset: Mutex::new(None),
            last_seen: DashMap::new(),
        }
    }

    /// Scans bytes appended since the last poll, stamping each identity found
    /// with `now`. Returns the number of matching lines.
    ///
    /// The first poll starts at the current end of the file. A shrunken file
    /// is read again from the start. A trailing line without a newline is
    /// left for the next poll.
    pub async fn poll(&self, now: i64) -> Result<usize> {
        let size = tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("reading metadata of {}", self.path.display()))?
            .len();

        let previous = *self.offset.lock();
        let offset = match previous {
            None => {
                debug!(path = %self.path.display(), size, "log watcher positioned at end of file");
                *self.offset.lock() = Some(size);
                return Ok(0);
            }
            Some(offset) if size < offset => {
                info!(
                    path = %self.path.display(),
                    size,
                    offset,
                    "log rotated or truncated, rereading"
                );
                0
            }
            Some(offset) => offset,
        };

        let mut hits = 0usize;

        if size > offset {
            let mut file = tokio::fs::File::open(&self.path)
                .await
                .with_context(|| format!("opening {}", self.path.display()))?;
            file.seek(SeekFrom::Start(offset))
                .await
                .with_context(|| format!("seeking {}", self.path.display()))?;

            let mut buf = Vec::with_capacity(usize::try_from(size - offset).unwrap_or(0));
            file.take(size - offset)
                .read_to_end(&mut buf)
                .await
                .with_context(|| format!("reading {}", self.path.display()))?;

            let consumed = buf.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);

            for line in buf[..consumed].split(|&b| b == b'\n') {
                if let Some(identity) = extract_identity(line, &self.marker) {
                    self.last_seen.insert(identity, now);
                    hits += 1;
                }
            }

            *self.offset.lock() = Some(offset + consumed as u64);
        } else {
            *self.offset.lock() = Some(offset);
        }

        self.prune(now);

        Ok(hits)
    }

    fn prune(&self, now: i64) {
        let cutoff = now.saturating_sub(self.retain);
        self.last_seen.retain(|_, seen| *seen >= cutoff);
    }

    /// Identities seen within the trailing window, sorted.
    pub fn active_identities(&self, window: Duration) -> Vec<String> {
        let window = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
        self.active_identities_at(unix_now(), window)
    }

    /// Identities seen at or after `now - window_secs`, sorted.
    pub fn active_identities_at(&self, now: i64, window_secs: i64) -> Vec<String> {
        let cutoff = now.saturating_sub(window_secs);
        let mut active: Vec<String> = self
            .last_seen
            .iter()
            .filter(|entry| *entry.value() >= cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        active.sort();
        active
    }

    /// Spawns the polling loop.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match self.poll(unix_now()).await {
                            Ok(hits) if hits > 0 => debug!(hits, "access log scanned"),
                            Ok(_) => {}
                            Err(e) => warn!(error = ?e, "access log poll failed"),
                        }
                    }
                }
            }
        })
    }
}

/// Returns the token following `marker` up to the next whitespace.
fn extract_identity(line: &[u8], marker: &str) -> Option<String> {
    let marker = marker.as_bytes();
    if marker.is_empty() || line.len() < marker.len() {
        return None;
    }

    let start = line
        .windows(marker.len())
        .position(|window| window == marker)?
        + marker.len();
    let rest = &line[start..];
    let end = rest
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(rest.len());

    if end == 0 {
        return None;
    }

    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

struct CalculatorState {
    previous: Option<Counters>,
    ring: VecDeque<Point>,
}

/// Splits aggregate inbound deltas evenly across active identities.
pub struct Calculator<A> {
    source: A,
    tags: Vec<String>,
    watcher: Arc<LogWatcher>,
    active_window: i64,
    policy: ResetPolicy,
    capacity: usize,
    store: Store,
    health: Option<Arc<HealthMetrics>>,
    state: Mutex<CalculatorState>,
}

/// Outcome of splitting one aggregate delta.
#[derive(Debug, PartialEq, Eq)]
struct Split {
    samples: Vec<Sample>,
    dropped: u64,
}

impl<A: AggregateCounterSource> Calculator<A> {
    pub fn new(
        source: A,
        tags: Vec<String>,
        watcher: Arc<LogWatcher>,
        active_window: Duration,
        policy: ResetPolicy,
        capacity: usize,
        store: Store,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            source,
            tags,
            watcher,
            active_window: i64::try_from(active_window.as_secs()).unwrap_or(i64::MAX),
            policy,
            capacity,
            store,
            health: None,
            state: Mutex::new(CalculatorState {
                previous: None,
                ring: VecDeque::with_capacity(capacity),
            }),
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Recent aggregate deltas, oldest first.
    pub fn recent_points(&self) -> Vec<Point> {
        self.state.lock().ring.iter().copied().collect()
    }

    /// Folds an absolute reading into the baseline and ring buffer, returning
    /// the delta. The first reading only sets the baseline.
    fn advance(&self, now: i64, current: Counters) -> Option<Counters> {
        let mut state = self.state.lock();

        let previous = state.previous.replace(current)?;
        let delta = Counters {
            uplink: self.policy.delta(previous.uplink, current.uplink),
            downlink: self.policy.delta(previous.downlink, current.downlink),
        };

        if state.ring.len() >= self.capacity {
            state.ring.pop_front();
        }
        state.ring.push_back(Point {
            ts: now,
            uplink: delta.uplink,
            downlink: delta.downlink,
        });

        Some(delta)
    }
}

/// Divides `delta` evenly across `active`. Integer remainders and traffic
/// with no active identity are reported as dropped.
fn split(now: i64, delta: Counters, active: &[String]) -> Split {
    let total = delta.uplink.saturating_add(delta.downlink);
    if active.is_empty() {
        return Split {
            samples: Vec::new(),
            dropped: total,
        };
    }

    let n = active.len() as u64;
    let uplink = delta.uplink / n;
    let downlink = delta.downlink / n;
    let dropped = total - (uplink + downlink) * n;

    let samples = if uplink == 0 && downlink == 0 {
        Vec::new()
    } else {
        active
            .iter()
            .map(|identity| Sample {
                identity: identity.clone(),
                ts: now,
                uplink,
                downlink,
            })
            .collect()
    };

    Split { samples, dropped }
}

impl<A: AggregateCounterSource + 'static> Tick for Calculator<A> {
    fn source(&self) -> &'static str {
        SOURCE_ATTRIBUTION
    }

    async fn tick(&self, now: i64) -> Result<usize> {
        let current = self
            .source
            .aggregate_counters(&self.tags)
            .await
            .context("polling aggregate counters")?;

        let Some(delta) = self.advance(now, current) else {
            debug!("aggregate baseline established");
            return Ok(0);
        };
        if delta.uplink == 0 && delta.downlink == 0 {
            return Ok(0);
        }

        let active = self.watcher.active_identities_at(now, self.active_window);
        if let Some(ref health) = self.health {
            health
                .attribution_active_identities
                .set(active.len() as f64);
        }

        let Split { samples, dropped } = split(now, delta, &active);

        if dropped > 0 {
            let reason = if active.is_empty() {
                warn!(
                    uplink = delta.uplink,
                    downlink = delta.downlink,
                    "no active identity, dropping aggregate traffic"
                );
                "no_active_identity"
            } else {
                debug!(dropped, active = active.len(), "split remainder discarded");
                "split_remainder"
            };
            if let Some(ref health) = self.health {
                health
                    .attribution_dropped_bytes
                    .with_label_values(&[reason])
                    .inc_by(dropped as f64);
            }
        }

        if samples.is_empty() {
            return Ok(0);
        }

        let inserted = self
            .store
            .blocking(move |s| s.merge_batch(&samples))
            .await
            .inspect_err(|e| error!(error = ?e, "writing attributed samples failed"))
            .context("writing attributed samples")?;

        debug!(inserted, active = active.len(), "attributed samples written");

        Ok(inserted)
    }
}

//! Periodic retention: hard deletes past the retention window, then 8-hour
//! rollups of rows past the aggregation cutoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::config::RetentionConfig;
use crate::export::health::HealthMetrics;
use crate::sampler::Tick;
use crate::store::rollup::COMPRESSED_BUCKET_SECS;
use crate::store::{bucket_start, Series, Store, SOURCE_RETENTION};

/// Rows removed by one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionOutcome {
    pub traffic_deleted: usize,
    pub peers_deleted: usize,
    pub traffic_compressed: usize,
    pub peers_compressed: usize,
    pub vacuumed: bool,
}

impl RetentionOutcome {
    pub fn rows_removed(&self) -> usize {
        self.traffic_deleted + self.peers_deleted + self.traffic_compressed + self.peers_compressed
    }
}

/// Cutoffs for one pass, in Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cutoffs {
    traffic: i64,
    peers: i64,
    compress: i64,
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

impl Cutoffs {
    /// The rollup cutoff is aligned down to a bucket boundary so compressed
    /// buckets are only ever written whole.
    fn at(now: i64, cfg: &RetentionConfig) -> Self {
        Self {
            traffic: now.saturating_sub(secs(cfg.traffic_retention())),
            peers: now.saturating_sub(secs(cfg.peer_retention())),
            compress: bucket_start(
                now.saturating_sub(secs(cfg.compress_after)),
                COMPRESSED_BUCKET_SECS,
            ),
        }
    }
}

/// Applies retention and rollup to the store.
pub struct RetentionCompressor {
    store: Store,
    cfg: RetentionConfig,
    health: Option<Arc<HealthMetrics>>,
    last: Mutex<Option<RetentionOutcome>>,
}

impl RetentionCompressor {
    pub fn new(store: Store, cfg: RetentionConfig) -> Self {
        Self {
            store,
            cfg,
            health: None,
            last: Mutex::new(None),
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Outcome of the most recent successful pass.
    pub fn last_outcome(&self) -> Option<RetentionOutcome> {
        *self.last.lock()
    }

    /// Runs one full pass at Unix time `now`.
    pub async fn run_pass(&self, now: i64) -> Result<RetentionOutcome> {
        let cutoffs = Cutoffs::at(now, &self.cfg);

        let outcome = self
            .store
            .blocking(move |s| apply(s, cutoffs))
            .await
            .inspect_err(|e| error!(error = ?e, "retention pass failed"))?;

        if let Some(ref health) = self.health {
            let removed = &health.retention_rows_removed;
            removed
                .with_label_values(&[Series::Traffic.as_str(), "delete"])
                .inc_by(outcome.traffic_deleted as f64);
            removed
                .with_label_values(&[Series::Peers.as_str(), "delete"])
                .inc_by(outcome.peers_deleted as f64);
            removed
                .with_label_values(&[Series::Traffic.as_str(), "rollup"])
                .inc_by(outcome.traffic_compressed as f64);
            removed
                .with_label_values(&[Series::Peers.as_str(), "rollup"])
                .inc_by(outcome.peers_compressed as f64);
        }

        info!(
            traffic_deleted = outcome.traffic_deleted,
            peers_deleted = outcome.peers_deleted,
            traffic_compressed = outcome.traffic_compressed,
            peers_compressed = outcome.peers_compressed,
            vacuumed = outcome.vacuumed,
            "retention pass complete"
        );

        *self.last.lock() = Some(outcome);

        Ok(outcome)
    }
}

fn apply(store: &Store, cutoffs: Cutoffs) -> Result<RetentionOutcome> {
    let mut outcome = RetentionOutcome {
        traffic_deleted: store
            .hard_delete_before(Series::Traffic, cutoffs.traffic)
            .context("deleting expired traffic rows")?,
        peers_deleted: store
            .hard_delete_before(Series::Peers, cutoffs.peers)
            .context("deleting expired peer rows")?,
        ..Default::default()
    };

    outcome.traffic_compressed = store
        .compress_before(Series::Traffic, cutoffs.compress, COMPRESSED_BUCKET_SECS)
        .context("rolling up traffic rows")?;
    outcome.peers_compressed = store
        .compress_before(Series::Peers, cutoffs.compress, COMPRESSED_BUCKET_SECS)
        .context("rolling up peer rows")?;

    if outcome.rows_removed() > 0 {
        store.vacuum()?;
        outcome.vacuumed = true;
    }

    Ok(outcome)
}

impl Tick for RetentionCompressor {
    fn source(&self) -> &'static str {
        SOURCE_RETENTION
    }

    async fn tick(&self, now: i64) -> Result<usize> {
        let outcome = self.run_pass(now).await?;
        Ok(outcome.rows_removed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PeerSample, Sample};

    const DAY: i64 = 24 * 3600;

    fn sample(identity: &str, ts: i64, uplink: u64, downlink: u64) -> Sample {
        Sample {
            identity: identity.to_string(),
            ts,
            uplink,
            downlink,
        }
    }

    #[test]
    fn test_cutoffs_aligned_to_bucket() {
        let cfg = RetentionConfig::default();
        let now = 100 * DAY + 5 * 3600;
        let cutoffs = Cutoffs::at(now, &cfg);

        assert_eq!(cutoffs.traffic, now - 90 * DAY);
        assert_eq!(cutoffs.peers, now - 90 * DAY);
        assert_eq!(cutoffs.compress, 93 * DAY);
        assert_eq!(cutoffs.compress % COMPRESSED_BUCKET_SECS, 0);
    }

    #[tokio::test]
    async fn test_pass_compresses_and_vacuums() {
        let store = Store::open_in_memory().expect("store");
        let now = 200 * DAY;
        store
            .append_batch(&[
                sample("bob", 150 * DAY + 1000, 10, 5),
                sample("bob", 150 * DAY + 2000, 20, 5),
                sample("bob", 50 * DAY, 999, 999),
                sample("bob", now - 60, 1, 1),
            ])
            .expect("append");
        store
            .append_peer_batch(&[
                PeerSample {
                    peer_id: "peer-a".into(),
                    ts: 150 * DAY,
                    rx: 10,
                    tx: 10,
                    endpoint: String::new(),
                },
                PeerSample {
                    peer_id: "peer-a".into(),
                    ts: 150 * DAY + 60,
                    rx: 20,
                    tx: 30,
                    endpoint: String::new(),
                },
            ])
            .expect("append peers");

        let compressor = RetentionCompressor::new(store.clone(), RetentionConfig::default());
        let outcome = compressor.run_pass(now).await.expect("pass");

        assert_eq!(
            outcome,
            RetentionOutcome {
                traffic_deleted: 1,
                peers_deleted: 0,
                traffic_compressed: 2,
                peers_compressed: 1,
                vacuumed: true,
            }
        );

        let buckets = store
            .bucketed(Series::Traffic, &[], 150 * DAY, 151 * DAY, DAY)
            .expect("bucketed");
        assert_eq!(buckets.len(), 1);
        assert_eq!((buckets[0].uplink, buckets[0].downlink), (30, 10));

        let second = compressor.run_pass(now).await.expect("second pass");
        assert_eq!(second.rows_removed(), 0);
        assert!(!second.vacuumed);
    }

    #[tokio::test]
    async fn test_tick_reports_rows_removed() {
        let store = Store::open_in_memory().expect("store");
        store.append(&sample("alice", 1, 1, 1)).expect("append");

        let compressor = RetentionCompressor::new(store.clone(), RetentionConfig::default());
        let run = crate::sampler::run_tick(&compressor, &store, None).await;
        assert_eq!(run.source, SOURCE_RETENTION);
        assert_eq!(run.inserted, 1);
        assert!(run.error.is_none());
        assert_eq!(compressor.last_outcome().map(|o| o.traffic_deleted), Some(1));

        let runs = store.recent_runs(Some(SOURCE_RETENTION), 5).expect("runs");
        assert_eq!(runs.len(), 1);
    }
}

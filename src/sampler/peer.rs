use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::Tick;
use crate::export::health::HealthMetrics;
use crate::source::{PeerCounterSource, PeerCounters};
use crate::store::{PeerSample, Store, SOURCE_PEERS};

/// Records cumulative peer counters whenever they change.
pub struct PeerCounterSampler<S> {
    source: S,
    store: Store,
    max_batch: usize,
    health: Option<Arc<HealthMetrics>>,
    /// Last written (rx, tx) per peer.
    retained: Mutex<HashMap<String, (u64, u64)>>,
}

/// Snapshots selected for writing in one tick.
struct PeerBatch {
    rows: Vec<PeerSample>,
    deferred: usize,
}

impl<S: PeerCounterSource> PeerCounterSampler<S> {
    pub fn new(source: S, store: Store, max_batch: usize) -> Self {
        Self {
            source,
            store,
            max_batch: max_batch.max(1),
            health: None,
            retained: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Number of peers with retained counters.
    pub fn retained_len(&self) -> usize {
        self.retained.lock().len()
    }

    /// Selects changed or first-seen peers, up to the batch cap. Retained
    /// state advances only for selected peers so deferred ones are written
    /// on a later tick. Peers no longer reported are pruned.
    fn select(&self, now: i64, peers: &[PeerCounters]) -> PeerBatch {
        let mut retained = self.retained.lock();
        let mut rows = Vec::new();
        let mut deferred = 0usize;

        for peer in peers {
            let changed = match retained.get(&peer.peer_id) {
                None => true,
                Some(&(rx, tx)) => rx != peer.rx || tx != peer.tx,
            };
            if !changed {
                continue;
            }
            if rows.len() >= self.max_batch {
                deferred += 1;
                continue;
            }

            retained.insert(peer.peer_id.clone(), (peer.rx, peer.tx));
            rows.push(PeerSample {
                peer_id: peer.peer_id.clone(),
                ts: now,
                rx: peer.rx,
                tx: peer.tx,
                endpoint: peer.endpoint.clone(),
            });
        }

        let present: HashSet<&str> = peers.iter().map(|p| p.peer_id.as_str()).collect();
        retained.retain(|peer_id, _| present.contains(peer_id.as_str()));

        if let Some(ref health) = self.health {
            health
                .retained_entries
                .with_label_values(&[SOURCE_PEERS])
                .set(retained.len() as f64);
        }

        PeerBatch { rows, deferred }
    }
}

impl<S: PeerCounterSource + 'static> Tick for PeerCounterSampler<S> {
    fn source(&self) -> &'static str {
        SOURCE_PEERS
    }

    async fn tick(&self, now: i64) -> Result<usize> {
        let peers = self
            .source
            .peer_counters()
            .await
            .context("polling peer counters")?;

        let PeerBatch { rows, deferred } = self.select(now, &peers);
        if deferred > 0 {
            warn!(
                deferred,
                max_batch = self.max_batch,
                "peer batch cap reached, deferring remaining snapshots"
            );
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let inserted = self
            .store
            .blocking(move |s| s.append_peer_batch(&rows))
            .await
            .inspect_err(|e| error!(error = ?e, "writing peer snapshots failed"))
            .context("writing peer snapshots")?;

        debug!(peers = peers.len(), inserted, "peer snapshots written");

        Ok(inserted)
    }
}

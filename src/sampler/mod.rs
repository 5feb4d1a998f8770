//! Periodic sampler tasks.
//!
//! Every sampler runs in its own tokio task: wait for a tick, do the work
//! unless paused, record a [`SamplerRun`], repeat. Ticks of one sampler never
//! overlap; different samplers run concurrently.

pub mod attribution;
pub mod counter;
pub mod peer;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::export::health::HealthMetrics;
use crate::store::{unix_now, SamplerRun, Store};

/// One unit of periodic work.
pub trait Tick: Send + Sync + 'static {
    /// Source name recorded in the run log and metrics.
    fn source(&self) -> &'static str;

    /// Performs one tick at Unix time `now`, returning rows written.
    fn tick(&self, now: i64) -> impl Future<Output = Result<usize>> + Send;
}

/// Runs one tick and records its outcome. Never fails: errors end up in the
/// returned run and the run log.
pub async fn run_tick<T: Tick>(
    task: &T,
    store: &Store,
    health: Option<&HealthMetrics>,
) -> SamplerRun {
    let source = task.source();
    let now = unix_now();
    let start = Instant::now();

    let result = task.tick(now).await;
    let elapsed = start.elapsed();

    let (inserted, error) = match result {
        Ok(inserted) => (inserted, None),
        Err(e) => {
            let message = format!("{e:#}");
            warn!(source, error = %message, "sampler tick failed");
            (0, Some(message))
        }
    };

    if let Some(health) = health {
        health.observe_tick(source, elapsed, inserted, error.is_some());
    }

    let run = SamplerRun {
        ts: now,
        duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        inserted,
        error,
        source: source.to_string(),
    };

    let record = run.clone();
    if let Err(e) = store.blocking(move |s| s.record_run(&record)).await {
        error!(source, error = ?e, "recording sampler run failed");
    }

    debug!(
        source,
        inserted = run.inserted,
        duration_ms = run.duration_ms,
        "sampler tick complete"
    );

    run
}

/// Control handle for a spawned sampler.
pub struct SamplerHandle {
    source: &'static str,
    cancel: CancellationToken,
    trigger: mpsc::Sender<()>,
    paused: watch::Sender<bool>,
    health: Option<Arc<HealthMetrics>>,
    join: JoinHandle<()>,
}

impl SamplerHandle {
    pub fn source(&self) -> &'static str {
        self.source
    }

    /// Requests an immediate out-of-schedule tick. Requests made while one is
    /// already pending are coalesced.
    pub fn trigger_once(&self) {
        if self.trigger.try_send(()).is_err() {
            debug!(source = self.source, "tick already pending");
        }
    }

    /// Pauses or resumes the sampler. Paused ticks are skipped and not recorded.
    pub fn set_paused(&self, paused: bool) {
        let previous = self.paused.send_replace(paused);
        if previous != paused {
            info!(source = self.source, paused, "sampler pause state changed");
        }
        if let Some(ref health) = self.health {
            health
                .sampler_paused
                .with_label_values(&[self.source])
                .set(if paused { 1.0 } else { 0.0 });
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Stops the sampler after any in-flight tick completes.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            error!(source = self.source, error = %e, "sampler task panicked");
        }
        info!(source = self.source, "sampler stopped");
    }
}

/// Spawns `task` to tick every `interval`, starting immediately.
pub fn spawn<T: Tick>(
    task: Arc<T>,
    interval: Duration,
    store: Store,
    health: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
) -> SamplerHandle {
    spawn_delayed(task, Duration::ZERO, interval, store, health, cancel)
}

/// Spawns `task` with its first scheduled tick after `delay`, then every
/// `interval`. Cancelling `cancel` (or calling [`SamplerHandle::stop`]) ends
/// the loop at the next tick boundary.
pub fn spawn_delayed<T: Tick>(
    task: Arc<T>,
    delay: Duration,
    interval: Duration,
    store: Store,
    health: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
) -> SamplerHandle {
    let source = task.source();
    let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);
    let (paused_tx, paused_rx) = watch::channel(false);
    let loop_cancel = cancel.clone();
    let loop_health = health.clone();

    let join = tokio::spawn(async move {
        let period = interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + delay, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(source, interval = ?period, delay = ?delay, "sampler started");

        loop {
            tokio::select! {
                biased;
                _ = loop_cancel.cancelled() => return,
                _ = ticker.tick() => {}
                Some(()) = trigger_rx.recv() => {
                    debug!(source, "triggered tick");
                }
            }

            if *paused_rx.borrow() {
                debug!(source, "sampler paused, skipping tick");
                continue;
            }

            run_tick(&*task, &store, loop_health.as_deref()).await;
        }
    });

    SamplerHandle {
        source,
        cancel,
        trigger: trigger_tx,
        paused: paused_tx,
        health,
        join,
    }
}

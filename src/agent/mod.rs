use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, ProxyMode};
use crate::dashboard::DashboardAggregator;
use crate::export::health::HealthMetrics;
use crate::retention::RetentionCompressor;
use crate::sampler::attribution::{Calculator, LogWatcher};
use crate::sampler::counter::{self, CounterSampler};
use crate::sampler::peer::PeerCounterSampler;
use crate::sampler::{self, SamplerHandle};
use crate::source::{ConfigFileRoster, PeerNames, ProxyStatsClient, WireGuardDump};
use crate::store::query::Point;
use crate::store::Store;

/// Agent wires the store, samplers, retention and health server together.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    store: Option<Store>,
    samplers: Vec<SamplerHandle>,
    calculator: Option<Arc<Calculator<ProxyStatsClient>>>,
    watcher: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            store: None,
            samplers: Vec::new(),
            calculator: None,
            watcher: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Opens the store and starts every enabled sampler.
    pub async fn start(&mut self) -> Result<()> {
        let started = Instant::now();

        // 0. Health server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Open the store and apply migrations.
        let db_cfg = self.cfg.database.clone();
        let store = tokio::task::spawn_blocking(move || Store::open(&db_cfg))
            .await
            .context("store open task panicked")?
            .context("opening time-series store")?;

        // 2. Proxy samplers.
        if self.cfg.proxy.enabled {
            match self.cfg.proxy.mode {
                ProxyMode::PerUser => self.start_per_user(&store)?,
                ProxyMode::LogAttribution => self.start_attribution(&store)?,
            }
        }

        // 3. Peer sampler.
        if self.cfg.peers.enabled {
            self.start_peers(&store);
        }

        // 4. Retention.
        let retention = RetentionCompressor::new(store.clone(), self.cfg.retention.clone())
            .with_health(Arc::clone(&self.health));
        self.samplers.push(sampler::spawn_delayed(
            Arc::new(retention),
            self.cfg.retention.startup_delay,
            self.cfg.retention.interval,
            store.clone(),
            Some(Arc::clone(&self.health)),
            self.cancel.child_token(),
        ));

        self.store = Some(store);

        info!(
            samplers = self.samplers.len(),
            elapsed = ?started.elapsed(),
            "agent fully started"
        );

        Ok(())
    }

    fn proxy_client(&self) -> Result<ProxyStatsClient> {
        let client = ProxyStatsClient::new(&self.cfg.proxy).context("creating proxy stats client")?;
        Ok(client.with_metrics(self.health.request_callback()))
    }

    fn start_per_user(&mut self, store: &Store) -> Result<()> {
        let roster = ConfigFileRoster::new(&self.cfg.proxy.config_path);
        let task = CounterSampler::new(
            self.proxy_client()?,
            roster,
            store.clone(),
            self.cfg.counters.reset_policy,
        )
        .with_health(Arc::clone(&self.health));

        self.samplers.push(sampler::spawn(
            Arc::new(task),
            counter::sample_interval(&self.cfg.proxy),
            store.clone(),
            Some(Arc::clone(&self.health)),
            self.cancel.child_token(),
        ));

        info!(
            roster = %self.cfg.proxy.config_path.display(),
            "per-user traffic sampler started"
        );

        Ok(())
    }

    fn start_attribution(&mut self, store: &Store) -> Result<()> {
        let proxy = &self.cfg.proxy;

        let watcher = Arc::new(LogWatcher::new(
            &proxy.log_path,
            proxy.identity_marker.clone(),
            proxy.active_window,
        ));
        self.watcher = Some(
            Arc::clone(&watcher).spawn(proxy.log_poll_interval, self.cancel.child_token()),
        );

        let calculator = Arc::new(
            Calculator::new(
                self.proxy_client()?,
                proxy.tags.clone(),
                watcher,
                proxy.active_window,
                self.cfg.counters.reset_policy,
                proxy.ring_capacity,
                store.clone(),
            )
            .with_health(Arc::clone(&self.health)),
        );

        self.samplers.push(sampler::spawn(
            Arc::clone(&calculator),
            proxy.attribution_interval,
            store.clone(),
            Some(Arc::clone(&self.health)),
            self.cancel.child_token(),
        ));
        self.calculator = Some(calculator);

        warn!(
            log = %proxy.log_path.display(),
            "per-user counters unavailable, attributing aggregate traffic from the access log"
        );

        Ok(())
    }

    fn start_peers(&mut self, store: &Store) {
        let dump =
            WireGuardDump::new(&self.cfg.peers).with_metrics(self.health.request_callback());
        let task = PeerCounterSampler::new(dump, store.clone(), self.cfg.peers.max_batch)
            .with_health(Arc::clone(&self.health));

        self.samplers.push(sampler::spawn(
            Arc::new(task),
            self.cfg.peers.interval,
            store.clone(),
            Some(Arc::clone(&self.health)),
            self.cancel.child_token(),
        ));

        info!(interface = %self.cfg.peers.interface, "peer sampler started");
    }

    /// The opened store, once started.
    pub fn store(&self) -> Option<&Store> {
        self.store.as_ref()
    }

    /// Control handle for the sampler recording under `source`.
    pub fn sampler(&self, source: &str) -> Option<&SamplerHandle> {
        self.samplers.iter().find(|h| h.source() == source)
    }

    /// Recent aggregate deltas in log attribution mode, oldest first.
    pub fn aggregate_points(&self) -> Vec<Point> {
        self.calculator
            .as_ref()
            .map(|c| c.recent_points())
            .unwrap_or_default()
    }

    /// A dashboard aggregator over the running store.
    pub fn dashboard(&self) -> Option<DashboardAggregator> {
        let store = self.store.clone()?;
        Some(DashboardAggregator::new(
            store,
            self.cfg.proxy.enabled,
            self.cfg.peers.enabled,
            PeerNames::new(self.cfg.peers.names.clone()),
            self.cfg.dashboard.top_limit,
        ))
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Samplers finish any in-flight tick first.
        for handle in self.samplers.drain(..) {
            handle.stop().await;
        }

        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.await {
                error!(error = %e, "log watcher task panicked");
            }
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }
}

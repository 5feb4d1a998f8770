use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use trafficd::config::{DatabaseConfig, ResetPolicy, RetentionConfig};
use trafficd::dashboard::{DashboardAggregator, Totals};
use trafficd::retention::RetentionCompressor;
use trafficd::sampler::attribution::{Calculator, LogWatcher};
use trafficd::sampler::counter::CounterSampler;
use trafficd::sampler::peer::PeerCounterSampler;
use trafficd::sampler::{self, Tick};
use trafficd::source::{
    AggregateCounterSource, Counters, IdentityRoster, PeerCounterSource, PeerCounters, PeerNames,
    UserCounterSource,
};
use trafficd::store::{PeerSample, Sample, Store};

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;

/// Replays a fixed sequence of polls, then fails.
struct Scripted<T>(Mutex<VecDeque<T>>);

impl<T> Scripted<T> {
    fn new(polls: Vec<T>) -> Self {
        Self(Mutex::new(polls.into()))
    }

    fn next(&self) -> Result<T> {
        match self.0.lock().pop_front() {
            Some(poll) => Ok(poll),
            None => bail!("source exhausted"),
        }
    }
}

impl UserCounterSource for Scripted<HashMap<String, Counters>> {
    async fn user_counters(&self) -> Result<HashMap<String, Counters>> {
        self.next()
    }
}

impl PeerCounterSource for Scripted<Vec<PeerCounters>> {
    async fn peer_counters(&self) -> Result<Vec<PeerCounters>> {
        self.next()
    }
}

impl AggregateCounterSource for Scripted<Counters> {
    async fn aggregate_counters(&self, _tags: &[String]) -> Result<Counters> {
        self.next()
    }
}

struct FixedRoster(Vec<String>);

impl IdentityRoster for FixedRoster {
    fn identities(&self) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

fn counters(uplink: u64, downlink: u64) -> Counters {
    Counters { uplink, downlink }
}

fn totals(uplink: u64, downlink: u64) -> Totals {
    Totals { uplink, downlink }
}

fn users(readings: &[(&str, u64, u64)]) -> HashMap<String, Counters> {
    readings
        .iter()
        .map(|&(id, uplink, downlink)| (id.to_string(), Counters { uplink, downlink }))
        .collect()
}

fn peer(id: &str, rx: u64, tx: u64) -> PeerCounters {
    PeerCounters {
        peer_id: id.to_string(),
        rx,
        tx,
        endpoint: String::new(),
        last_handshake: 0,
    }
}

fn file_store(dir: &tempfile::TempDir) -> Store {
    Store::open(&DatabaseConfig {
        path: dir.path().join("traffic.db"),
        ..Default::default()
    })
    .expect("open store")
}

#[tokio::test]
async fn test_samplers_to_dashboard() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = file_store(&dir);

    let counter = CounterSampler::new(
        Scripted::new(vec![
            users(&[("alice", 100, 1000), ("bob", 0, 0)]),
            users(&[("alice", 150, 1300), ("bob", 10, 20)]),
            // Proxy restart resets alice's counters.
            users(&[("alice", 40, 60), ("bob", 10, 20)]),
            users(&[("alice", 90, 160), ("bob", 10, 20)]),
        ]),
        FixedRoster(vec!["alice".into(), "bob".into()]),
        store.clone(),
        ResetPolicy::ClampToZero,
    );

    let mut written = Vec::new();
    for now in [60, 120, 180, 240] {
        written.push(counter.tick(now).await.expect("counter tick"));
    }
    assert_eq!(written, vec![0, 2, 0, 1]);

    let peers = PeerCounterSampler::new(
        Scripted::new(vec![
            vec![peer("cGVlcjE=", 1000, 100)],
            vec![peer("cGVlcjE=", 1000, 100)],
            vec![peer("cGVlcjE=", 1600, 400)],
        ]),
        store.clone(),
        1000,
    );
    let mut written = Vec::new();
    for now in [60, 120, 180] {
        written.push(peers.tick(now).await.expect("peer tick"));
    }
    assert_eq!(written, vec![1, 0, 1]);

    let mut names = HashMap::new();
    names.insert("cGVlcjE=".to_string(), "laptop".to_string());
    let aggregator = DashboardAggregator::new(store, true, true, PeerNames::new(names), 5);
    let dash = aggregator.build(0, 300).await.expect("dashboard");

    assert_eq!(dash.interval, 60);
    assert_eq!(dash.totals.proxy, totals(110, 420));
    assert_eq!(dash.totals.peers, totals(600, 300));

    let ranked: Vec<(&str, u64)> = dash
        .top_users
        .iter()
        .map(|c| (c.id.as_str(), c.total))
        .collect();
    assert_eq!(ranked, vec![("alice", 500), ("bob", 30)]);
    assert_eq!(dash.top_peers[0].name, "laptop");
}

#[tokio::test]
async fn test_retention_keeps_dashboard_totals() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = file_store(&dir);
    let now = 30 * DAY;

    let mut samples = Vec::new();
    let mut snapshots = Vec::new();
    for hour in 0..48u64 {
        let ts = 10 * DAY + hour as i64 * HOUR;
        samples.push(Sample {
            identity: "alice".into(),
            ts,
            uplink: 10 + hour,
            downlink: 100,
        });
        snapshots.push(PeerSample {
            peer_id: "peer-a".into(),
            ts,
            rx: 1000 * (hour + 1),
            tx: 200 * (hour + 1),
            endpoint: String::new(),
        });
    }
    samples.push(Sample {
        identity: "alice".into(),
        ts: now - HOUR,
        uplink: 7,
        downlink: 7,
    });
    snapshots.push(PeerSample {
        peer_id: "peer-a".into(),
        ts: now - HOUR,
        rx: 100_000,
        tx: 20_000,
        endpoint: String::new(),
    });
    store.append_batch(&samples).expect("append traffic");
    store.append_peer_batch(&snapshots).expect("append peers");

    let aggregator =
        DashboardAggregator::new(store.clone(), true, true, PeerNames::default(), 5);
    let before = aggregator.build(0, now).await.expect("dashboard before");

    let compressor = RetentionCompressor::new(store.clone(), RetentionConfig::default());
    let outcome = compressor.run_pass(now).await.expect("retention pass");
    assert_eq!(outcome.traffic_compressed, 48);
    assert!(outcome.peers_compressed > 0);
    assert_eq!(outcome.traffic_deleted + outcome.peers_deleted, 0);
    assert!(outcome.vacuumed);

    let after = aggregator.build(0, now).await.expect("dashboard after");
    assert_eq!(after.totals, before.totals);
    assert_eq!(after.top_users, before.top_users);
    assert_eq!(after.top_peers, before.top_peers);

    // Recent raw rows survive the pass untouched.
    let recent = store.range("alice", now - DAY, now).expect("recent range");
    assert_eq!(recent.len(), 1);
}

#[tokio::test]
async fn test_log_attribution_pipeline() {
    let mut log = tempfile::NamedTempFile::new().expect("log file");
    writeln!(log, "history email: carol@example.com").expect("write");

    let dir = tempfile::tempdir().expect("tempdir");
    let store = file_store(&dir);

    let watcher = Arc::new(LogWatcher::new(
        log.path(),
        "email: ",
        Duration::from_secs(600),
    ));
    watcher.poll(1000).await.expect("initial poll");

    writeln!(log, "accepted tcp:a:443 email: alice@example.com").expect("write");
    writeln!(log, "accepted tcp:b:443 email: bob@example.com").expect("write");
    log.flush().expect("flush");
    assert_eq!(watcher.poll(1001).await.expect("poll"), 2);

    let calculator = Calculator::new(
        Scripted::new(vec![counters(1_000, 5_000), counters(1_101, 5_200)]),
        vec!["vless-in".into()],
        Arc::clone(&watcher),
        Duration::from_secs(60),
        ResetPolicy::ClampToZero,
        16,
        store.clone(),
    );

    assert_eq!(calculator.tick(1002).await.expect("baseline"), 0);
    assert_eq!(calculator.tick(1030).await.expect("split"), 2);
    assert_eq!(calculator.recent_points().len(), 1);

    let alice = store.range("alice@example.com", 0, 2000).expect("alice");
    assert_eq!(alice.len(), 1);
    assert_eq!((alice[0].uplink, alice[0].downlink), (50, 100));
    assert!(store
        .range("carol@example.com", 0, 2000)
        .expect("carol")
        .is_empty());
}

#[tokio::test]
async fn test_spawned_sampler_records_runs() {
    let store = Store::open_in_memory().expect("store");
    let counter = CounterSampler::new(
        Scripted::new(vec![users(&[("alice", 1, 1)]), users(&[("alice", 5, 9)])]),
        FixedRoster(vec!["alice".into()]),
        store.clone(),
        ResetPolicy::CountFromZero,
    );

    let cancel = CancellationToken::new();
    let handle = sampler::spawn(
        Arc::new(counter),
        Duration::from_millis(20),
        store.clone(),
        None,
        cancel.child_token(),
    );

    let mut runs = Vec::new();
    for _ in 0..200 {
        runs = store.recent_runs(Some("traffic"), 10).expect("runs");
        if runs.len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.set_paused(true);
    cancel.cancel();
    handle.stop().await;

    // Newest first: the exhausted source fails, earlier ticks succeeded.
    assert!(runs.len() >= 3);
    let oldest: Vec<_> = runs.iter().rev().take(3).collect();
    assert!(oldest[0].error.is_none());
    assert_eq!(oldest[0].inserted, 0);
    assert!(oldest[1].error.is_none());
    assert_eq!(oldest[1].inserted, 1);
    assert!(oldest[2].error.is_some());
}

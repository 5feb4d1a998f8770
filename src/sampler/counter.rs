use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::Tick;
use crate::config::{ProxyConfig, ResetPolicy, MIN_SAMPLE_INTERVAL};
use crate::export::health::HealthMetrics;
use crate::source::{Counters, IdentityRoster, UserCounterSource};
use crate::store::{Sample, Store, SOURCE_TRAFFIC};

/// Returns the per-user sampling interval, raising values below the minimum.
pub fn sample_interval(cfg: &ProxyConfig) -> Duration {
    let effective = cfg.effective_interval();
    if effective != cfg.interval {
        warn!(
            configured = ?cfg.interval,
            effective = ?MIN_SAMPLE_INTERVAL,
            "proxy.interval below minimum, raised"
        );
    }
    effective
}

/// Turns absolute per-identity counters into delta samples.
pub struct CounterSampler<S, R> {
    source: S,
    roster: R,
    store: Store,
    policy: ResetPolicy,
    health: Option<Arc<HealthMetrics>>,
    /// Last absolute counters per identity. Rebuilt from scratch on restart.
    retained: Mutex<HashMap<String, Counters>>,
}

impl<S, R> CounterSampler<S, R>
where
    S: UserCounterSource,
    R: IdentityRoster,
{
    pub fn new(source: S, roster: R, store: Store, policy: ResetPolicy) -> Self {
        Self {
            source,
            roster,
            store,
            policy,
            health: None,
            retained: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Number of identities with a retained baseline.
    pub fn retained_len(&self) -> usize {
        self.retained.lock().len()
    }

    /// Folds one poll into the retained state and returns the positive deltas.
    ///
    /// Identities missing from `roster` are ignored, and their retained
    /// entries are pruned.
    fn observe(
        &self,
        now: i64,
        roster: &[String],
        counters: &HashMap<String, Counters>,
    ) -> Vec<Sample> {
        let mut retained = self.retained.lock();
        let mut samples = Vec::new();

        for identity in roster {
            let Some(current) = counters.get(identity) else {
                continue;
            };

            match retained.insert(identity.clone(), *current) {
                None => {
                    debug!(identity = %identity, "baseline established");
                }
                Some(previous) => {
                    let uplink = self.policy.delta(previous.uplink, current.uplink);
                    let downlink = self.policy.delta(previous.downlink, current.downlink);
                    if uplink > 0 || downlink > 0 {
                        samples.push(Sample {
                            identity: identity.clone(),
                            ts: now,
                            uplink,
                            downlink,
                        });
                    }
                }
            }
        }

        let listed: HashSet<&str> = roster.iter().map(String::as_str).collect();
        retained.retain(|identity, _| listed.contains(identity.as_str()));

        if let Some(ref health) = self.health {
            health
                .retained_entries
                .with_label_values(&[SOURCE_TRAFFIC])
                .set(retained.len() as f64);
        }

        samples
    }
}

impl<S, R> Tick for CounterSampler<S, R>
where
    S: UserCounterSource + 'static,
    R: IdentityRoster + 'static,
{
    fn source(&self) -> &'static str {
        SOURCE_TRAFFIC
    }

    async fn tick(&self, now: i64) -> Result<usize> {
        let roster = self.roster.identities().context("loading identity roster")?;
        let counters = self
            .source
            .user_counters()
            .await
            .context("polling per-user counters")?;

        let ignored = counters
            .keys()
            .filter(|identity| !roster.contains(*identity))
            .count();
        if ignored > 0 {
            debug!(ignored, "counters reported for identities outside the roster");
        }

        let samples = self.observe(now, &roster, &counters);
        if samples.is_empty() {
            return Ok(0);
        }

        let inserted = self
            .store
            .blocking(move |s| s.merge_batch(&samples))
            .await
            .inspect_err(|e| error!(error = ?e, "writing traffic samples failed"))
            .context("writing traffic samples")?;

        debug!(inserted, "traffic samples written");

        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::bail;
    use proptest::prelude::*;

    use super::*;

    struct FakeSource {
        polls: Mutex<VecDeque<Result<HashMap<String, Counters>>>>,
    }

    impl FakeSource {
        fn new(polls: Vec<Result<HashMap<String, Counters>>>) -> Self {
            Self {
                polls: Mutex::new(polls.into()),
            }
        }
    }

    impl UserCounterSource for FakeSource {
        async fn user_counters(&self) -> Result<HashMap<String, Counters>> {
            match self.polls.lock().pop_front() {
                Some(poll) => poll,
                None => bail!("no more polls"),
            }
        }
    }

    struct FixedRoster(Mutex<Vec<String>>);

    impl FixedRoster {
        fn new(ids: &[&str]) -> Self {
            Self(Mutex::new(ids.iter().map(|s| s.to_string()).collect()))
        }
    }

    impl IdentityRoster for FixedRoster {
        fn identities(&self) -> Result<Vec<String>> {
            Ok(self.0.lock().clone())
        }
    }

    fn poll(entries: &[(&str, u64, u64)]) -> Result<HashMap<String, Counters>> {
        Ok(entries
            .iter()
            .map(|(id, up, down)| {
                (
                    id.to_string(),
                    Counters {
                        uplink: *up,
                        downlink: *down,
                    },
                )
            })
            .collect())
    }

    fn sampler(
        polls: Vec<Result<HashMap<String, Counters>>>,
        roster: &[&str],
        policy: ResetPolicy,
    ) -> (CounterSampler<FakeSource, FixedRoster>, Store) {
        let store = Store::open_in_memory().expect("store");
        let sampler = CounterSampler::new(
            FakeSource::new(polls),
            FixedRoster::new(roster),
            store.clone(),
            policy,
        );
        (sampler, store)
    }

    #[tokio::test]
    async fn test_first_poll_is_baseline_then_delta() {
        let (sampler, store) = sampler(
            vec![poll(&[("alice", 100, 50)]), poll(&[("alice", 180, 50)])],
            &["alice"],
            ResetPolicy::ClampToZero,
        );

        assert_eq!(sampler.tick(1000).await.expect("baseline"), 0);
        assert_eq!(sampler.tick(1060).await.expect("delta"), 1);

        let rows = store.range("alice", 0, 2000).expect("range");
        assert_eq!(
            rows,
            vec![Sample {
                identity: "alice".into(),
                ts: 1060,
                uplink: 80,
                downlink: 0
            }]
        );
    }

    #[tokio::test]
    async fn test_same_second_ticks_keep_every_byte() {
        let (sampler, store) = sampler(
            vec![
                poll(&[("alice", 100, 0)]),
                poll(&[("alice", 180, 0)]),
                poll(&[("alice", 300, 0)]),
            ],
            &["alice"],
            ResetPolicy::ClampToZero,
        );

        sampler.tick(1000).await.expect("baseline");
        assert_eq!(sampler.tick(1060).await.expect("scheduled"), 1);
        assert_eq!(sampler.tick(1060).await.expect("triggered"), 1);

        let rows = store.range("alice", 0, 2000).expect("range");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].uplink, 200);
    }

    #[tokio::test]
    async fn test_reset_clamps_to_zero_and_rebaselines() {
        let (sampler, store) = sampler(
            vec![
                poll(&[("alice", 500, 500)]),
                poll(&[("alice", 20, 10)]),
                poll(&[("alice", 50, 30)]),
            ],
            &["alice"],
            ResetPolicy::ClampToZero,
        );

        sampler.tick(1).await.expect("baseline");
        assert_eq!(sampler.tick(2).await.expect("reset"), 0);
        assert_eq!(sampler.tick(3).await.expect("after reset"), 1);

        let rows = store.range("alice", 0, 10).expect("range");
        assert_eq!((rows[0].uplink, rows[0].downlink), (30, 20));
    }

    #[tokio::test]
    async fn test_reset_count_from_zero() {
        let (sampler, store) = sampler(
            vec![poll(&[("alice", 500, 500)]), poll(&[("alice", 20, 10)])],
            &["alice"],
            ResetPolicy::CountFromZero,
        );

        sampler.tick(1).await.expect("baseline");
        assert_eq!(sampler.tick(2).await.expect("reset"), 1);
        let rows = store.range("alice", 0, 10).expect("range");
        assert_eq!((rows[0].uplink, rows[0].downlink), (20, 10));
    }

    #[tokio::test]
    async fn test_unlisted_identities_ignored_and_pruned() {
        let (sampler, store) = sampler(
            vec![
                poll(&[("alice", 1, 1), ("bob", 1, 1), ("mallory", 1, 1)]),
                poll(&[("alice", 5, 5), ("bob", 5, 5), ("mallory", 9, 9)]),
            ],
            &["alice", "bob"],
            ResetPolicy::ClampToZero,
        );

        sampler.tick(1).await.expect("baseline");
        assert_eq!(sampler.retained_len(), 2);

        *sampler.roster.0.lock() = vec!["alice".to_string()];
        assert_eq!(sampler.tick(2).await.expect("second"), 1);
        assert_eq!(sampler.retained_len(), 1);
        assert!(store.range("mallory", 0, 10).expect("range").is_empty());
        assert!(store.range("bob", 0, 10).expect("range").is_empty());
    }

    #[tokio::test]
    async fn test_source_error_leaves_state_untouched() {
        let (sampler, store) = sampler(
            vec![
                poll(&[("alice", 100, 100)]),
                Err(anyhow::anyhow!("connection refused")),
                poll(&[("alice", 150, 100)]),
            ],
            &["alice"],
            ResetPolicy::ClampToZero,
        );

        sampler.tick(1).await.expect("baseline");
        let err = sampler.tick(2).await.unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));
        sampler.tick(3).await.expect("recovered");

        let rows = store.range("alice", 0, 10).expect("range");
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].ts, rows[0].uplink), (3, 50));
    }

    #[test]
    fn test_sample_interval_minimum() {
        let cfg = ProxyConfig {
            interval: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(sample_interval(&cfg), MIN_SAMPLE_INTERVAL);
    }

    proptest! {
        #[test]
        fn test_increasing_sequence_deltas_sum_to_span(
            start in 0u64..1_000_000,
            steps in proptest::collection::vec((1u64..10_000, 1u64..10_000), 1..50),
        ) {
            let store = Store::open_in_memory().expect("store");
            let sampler = CounterSampler::new(
                FakeSource::new(Vec::new()),
                FixedRoster::new(&["alice"]),
                store,
                ResetPolicy::ClampToZero,
            );
            let roster = vec!["alice".to_string()];

            let (mut up, mut down) = (start, start);
            let mut emitted = (0u64, 0u64);
            sampler.observe(0, &roster, &poll(&[("alice", up, down)]).expect("poll"));
            for (i, (du, dd)) in steps.iter().enumerate() {
                up += du;
                down += dd;
                let reading = poll(&[("alice", up, down)]).expect("poll");
                for s in sampler.observe(i as i64 + 1, &roster, &reading) {
                    emitted.0 += s.uplink;
                    emitted.1 += s.downlink;
                }
            }

            prop_assert_eq!(emitted, (up - start, down - start));
        }

        #[test]
        fn test_reset_never_negative(prev in any::<u64>(), cur in any::<u64>()) {
            for policy in [ResetPolicy::ClampToZero, ResetPolicy::CountFromZero] {
                let delta = policy.delta(prev, cur);
                prop_assert!(delta <= cur.max(cur.wrapping_sub(prev)));
                if cur >= prev {
                    prop_assert_eq!(delta, cur - prev);
                }
            }
        }
    }
}

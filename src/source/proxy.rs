use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use super::{
    AggregateCounterSource, Counters, MetricsCallback, SourceError, UserCounterSource,
};
use crate::config::ProxyConfig;

/// Path of the expvar endpoint exposed by the proxy core.
const STATS_PATH: &str = "/debug/vars";

/// HTTP client for the proxy core's JSON stats endpoint.
pub struct ProxyStatsClient {
    http: reqwest::Client,
    endpoint: String,
    metrics: Option<MetricsCallback>,
}

impl ProxyStatsClient {
    /// Create a new stats client.
    pub fn new(cfg: &ProxyConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.stats_url.trim_end_matches('/').to_string(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb("proxy", status, duration);
        }
    }

    /// Fetch and decode the stats section of the expvar document.
    async fn fetch_stats(&self) -> Result<StatsSection> {
        let start = Instant::now();
        let url = format!("{}{}", self.endpoint, STATS_PATH);

        let response = match self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.record_request("error", start.elapsed());
                return Err(e).with_context(|| format!("requesting {url}"));
            }
        };

        let status_code = response.status();
        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request("error", start.elapsed());
            bail!("unexpected status {} from {}: {}", status_code, url, body);
        }

        let doc: ExpvarDocument = match response.json().await {
            Ok(doc) => doc,
            Err(e) => {
                self.record_request("error", start.elapsed());
                return Err(e).with_context(|| format!("decoding response from {url}"));
            }
        };

        self.record_request("success", start.elapsed());

        Ok(doc.into_stats()?)
    }
}

// --- JSON response structures ---

#[derive(Deserialize)]
struct ExpvarDocument {
    #[serde(default)]
    stats: Option<StatsSection>,
}

#[derive(Deserialize, Default)]
struct StatsSection {
    #[serde(default)]
    user: HashMap<String, CounterPair>,
    #[serde(default)]
    inbound: HashMap<String, CounterPair>,
}

#[derive(Deserialize, Default, Clone, Copy)]
struct CounterPair {
    #[serde(default)]
    uplink: u64,
    #[serde(default)]
    downlink: u64,
}

impl From<CounterPair> for Counters {
    fn from(pair: CounterPair) -> Self {
        Self {
            uplink: pair.uplink,
            downlink: pair.downlink,
        }
    }
}

impl ExpvarDocument {
    fn into_stats(self) -> Result<StatsSection, SourceError> {
        self.stats
            .ok_or(SourceError::MissingSection { path: "stats" })
    }
}

impl StatsSection {
    fn users(self) -> HashMap<String, Counters> {
        self.user
            .into_iter()
            .filter(|(identity, _)| !identity.is_empty())
            .map(|(identity, pair)| (identity, pair.into()))
            .collect()
    }

    fn sum_tags(&self, tags: &[String]) -> Counters {
        let mut total = Counters::default();
        for tag in tags {
            match self.inbound.get(tag) {
                Some(pair) => {
                    total.uplink = total.uplink.saturating_add(pair.uplink);
                    total.downlink = total.downlink.saturating_add(pair.downlink);
                }
                None => debug!(tag = %tag, "inbound tag has no counters yet"),
            }
        }
        total
    }
}

impl UserCounterSource for ProxyStatsClient {
    async fn user_counters(&self) -> Result<HashMap<String, Counters>> {
        debug!("fetching per-user counters");

        let stats = self.fetch_stats().await.context("fetching user counters")?;

        Ok(stats.users())
    }
}

impl AggregateCounterSource for ProxyStatsClient {
    async fn aggregate_counters(&self, tags: &[String]) -> Result<Counters> {
        debug!(tags = tags.len(), "fetching aggregate counters");

        let stats = self
            .fetch_stats()
            .await
            .context("fetching aggregate counters")?;

        Ok(stats.sum_tags(tags))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::routing::get;
    use axum::Router;

    use super::*;

    const BODY: &str = r#"{
        "cmdline": ["xray"],
        "stats": {
            "inbound": {
                "vless-in": {"uplink": 100, "downlink": 1000},
                "vmess-in": {"uplink": 5, "downlink": 50},
                "api": {"uplink": 9999, "downlink": 9999}
            },
            "user": {
                "alice@example.com": {"uplink": 100, "downlink": 50},
                "bob@example.com": {"downlink": 7}
            }
        }
    }"#;

    fn parse(body: &str) -> StatsSection {
        let doc: ExpvarDocument = serde_json::from_str(body).expect("valid json");
        doc.into_stats().expect("stats present")
    }

    #[test]
    fn test_parse_user_counters() {
        let users = parse(BODY).users();
        assert_eq!(users.len(), 2);
        assert_eq!(
            users["alice@example.com"],
            Counters {
                uplink: 100,
                downlink: 50
            }
        );
        assert_eq!(users["bob@example.com"].uplink, 0);
    }

    #[test]
    fn test_sum_tags_ignores_unlisted_inbounds() {
        let stats = parse(BODY);
        let tags = vec![
            "vless-in".to_string(),
            "vmess-in".to_string(),
            "missing".to_string(),
        ];
        assert_eq!(
            stats.sum_tags(&tags),
            Counters {
                uplink: 105,
                downlink: 1050
            }
        );
    }

    #[test]
    fn test_missing_stats_section() {
        let doc: ExpvarDocument = serde_json::from_str(r#"{"memstats": {}}"#).expect("json");
        assert_eq!(
            doc.into_stats().err(),
            Some(SourceError::MissingSection { path: "stats" })
        );
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    fn client_for(url: String) -> ProxyStatsClient {
        let cfg = ProxyConfig {
            stats_url: url,
            ..Default::default()
        };
        ProxyStatsClient::new(&cfg).expect("client")
    }

    #[tokio::test]
    async fn test_fetch_over_http_records_metrics() {
        let url = serve(Router::new().route(STATS_PATH, get(|| async { BODY }))).await;

        let successes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&successes);
        let client = client_for(url).with_metrics(Box::new(move |source, status, _| {
            assert_eq!(source, "proxy");
            if status == "success" {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }));

        let users = client.user_counters().await.expect("user counters");
        assert_eq!(users.len(), 2);

        let total = client
            .aggregate_counters(&["vless-in".to_string()])
            .await
            .expect("aggregate counters");
        assert_eq!(total.downlink, 1000);
        assert_eq!(successes.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_fetch_error_status() {
        let url = serve(Router::new().route(
            STATS_PATH,
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down") }),
        ))
        .await;

        let err = client_for(url).user_counters().await.unwrap_err();
        assert!(format!("{err:#}").contains("unexpected status"));
    }
}

//! Chart-ready aggregation over the time-series store.

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::source::PeerNames;
use crate::store::query::{Point, TopEntry};
use crate::store::{bucket_start, Series, Store};

const MINUTE: i64 = 60;
const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;

/// Upper bound on chart slots for one window.
pub const MAX_SLOTS: i64 = 4096;

/// Picks the chart bucket width for a window of `span_secs`.
pub fn bucket_interval(span_secs: i64) -> i64 {
    match span_secs {
        s if s <= HOUR => MINUTE,
        s if s <= 6 * HOUR => 5 * MINUTE,
        s if s <= DAY => 15 * MINUTE,
        s if s <= 7 * DAY => HOUR,
        s if s <= 31 * DAY => 6 * HOUR,
        _ => DAY,
    }
}

/// Running uplink/downlink totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub uplink: u64,
    pub downlink: u64,
}

impl Totals {
    fn add(&mut self, point: &Point) {
        self.uplink = self.uplink.saturating_add(point.uplink);
        self.downlink = self.downlink.saturating_add(point.downlink);
    }

    pub fn total(&self) -> u64 {
        self.uplink.saturating_add(self.downlink)
    }
}

/// One grid slot with cumulative totals per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChartPoint {
    pub ts: i64,
    pub proxy: Totals,
    pub peers: Totals,
}

/// A ranked consumer with its display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Consumer {
    pub id: String,
    pub name: String,
    pub uplink: u64,
    pub downlink: u64,
    pub total: u64,
}

/// Everything the presentation layer needs for one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dashboard {
    pub start: i64,
    pub end: i64,
    pub interval: i64,
    pub series: Vec<ChartPoint>,
    pub totals: ChartTotals,
    pub top_users: Vec<Consumer>,
    pub top_peers: Vec<Consumer>,
}

/// Window totals per source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChartTotals {
    pub proxy: Totals,
    pub peers: Totals,
}

/// Builds [`Dashboard`]s from the store.
pub struct DashboardAggregator {
    store: Store,
    proxy_enabled: bool,
    peers_enabled: bool,
    peer_names: PeerNames,
    top_limit: usize,
}

struct RawWindow {
    proxy: Vec<Point>,
    peers: Vec<Point>,
    top_users: Vec<TopEntry>,
    top_peers: Vec<TopEntry>,
}

impl DashboardAggregator {
    pub fn new(
        store: Store,
        proxy_enabled: bool,
        peers_enabled: bool,
        peer_names: PeerNames,
        top_limit: usize,
    ) -> Self {
        Self {
            store,
            proxy_enabled,
            peers_enabled,
            peer_names,
            top_limit,
        }
    }

    /// Aggregates `[start, end]` into a cumulative chart and top-N lists.
    pub async fn build(&self, start: i64, end: i64) -> Result<Dashboard> {
        if end < start {
            bail!("dashboard window ends ({end}) before it starts ({start})");
        }

        let Some(span) = end.checked_sub(start) else {
            bail!("dashboard window [{start}, {end}] is too large");
        };
        let interval = bucket_interval(span);
        let slots = grid_slots(start, end, interval)?;
        let (proxy_enabled, peers_enabled, limit) =
            (self.proxy_enabled, self.peers_enabled, self.top_limit);

        let raw = self
            .store
            .blocking(move |s| {
                let mut raw = RawWindow {
                    proxy: Vec::new(),
                    peers: Vec::new(),
                    top_users: Vec::new(),
                    top_peers: Vec::new(),
                };
                if proxy_enabled {
                    raw.proxy = s
                        .bucketed(Series::Traffic, &[], start, end, interval)
                        .context("bucketing proxy traffic")?;
                    raw.top_users = s
                        .top_totals(start, end, limit)
                        .context("ranking users")?;
                }
                if peers_enabled {
                    raw.peers = s
                        .bucketed(Series::Peers, &[], start, end, interval)
                        .context("bucketing peer traffic")?;
                    raw.top_peers = s
                        .peer_top_totals(start, end, limit)
                        .context("ranking peers")?;
                }
                Ok(raw)
            })
            .await?;

        let series = cumulative_grid(start, slots, interval, &raw.proxy, &raw.peers);
        let totals = series
            .last()
            .map(|p| ChartTotals {
                proxy: p.proxy,
                peers: p.peers,
            })
            .unwrap_or_default();

        Ok(Dashboard {
            start,
            end,
            interval,
            series,
            totals,
            top_users: raw
                .top_users
                .into_iter()
                .map(|e| consumer(e.identity.clone(), e))
                .collect(),
            top_peers: raw
                .top_peers
                .into_iter()
                .map(|e| consumer(self.peer_names.display_name(&e.identity), e))
                .collect(),
        })
    }
}

fn consumer(name: String, entry: TopEntry) -> Consumer {
    Consumer {
        total: entry.total(),
        name,
        id: entry.identity,
        uplink: entry.uplink,
        downlink: entry.downlink,
    }
}

/// Number of grid slots from `floor(start / interval)` through `end`.
/// Fails when the span overflows or exceeds [`MAX_SLOTS`].
fn grid_slots(start: i64, end: i64, interval: i64) -> Result<usize> {
    let origin = bucket_start(start, interval);
    let slots = end
        .checked_sub(origin)
        .map(|span| span / interval + 1)
        .filter(|slots| (1..=MAX_SLOTS).contains(slots))
        .with_context(|| {
            format!("dashboard window [{start}, {end}] exceeds {MAX_SLOTS} slots of {interval}s")
        })?;
    usize::try_from(slots).context("converting slot count")
}

/// Lays bucketed deltas onto `slots` grid slots starting at
/// `floor(start / interval)` and accumulates them into running totals.
fn cumulative_grid(
    start: i64,
    slots: usize,
    interval: i64,
    proxy: &[Point],
    peers: &[Point],
) -> Vec<ChartPoint> {
    let origin = bucket_start(start, interval);

    let empty = Point {
        ts: 0,
        uplink: 0,
        downlink: 0,
    };
    let mut proxy_deltas = vec![empty; slots];
    let mut peer_deltas = proxy_deltas.clone();

    for (points, deltas) in [(proxy, &mut proxy_deltas), (peers, &mut peer_deltas)] {
        for point in points {
            let Ok(idx) = usize::try_from(point.ts.saturating_sub(origin) / interval) else {
                continue;
            };
            if let Some(slot) = deltas.get_mut(idx) {
                slot.uplink = slot.uplink.saturating_add(point.uplink);
                slot.downlink = slot.downlink.saturating_add(point.downlink);
            }
        }
    }

    let mut proxy_total = Totals::default();
    let mut peer_total = Totals::default();

    (0..slots)
        .map(|i| {
            proxy_total.add(&proxy_deltas[i]);
            peer_total.add(&peer_deltas[i]);
            ChartPoint {
                ts: origin + i as i64 * interval,
                proxy: proxy_total,
                peers: peer_total,
            }
        })
        .collect()
}

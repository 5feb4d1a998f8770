//! Read-side queries: raw ranges, bucketed series and ranked totals.

use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};
use serde::Serialize;

use super::{from_sql_bytes, unix_now, PeerSample, Sample, Series, Store};

/// A (timestamp, uplink, downlink) point. For bucketed series `ts` is the
/// bucket start. Peer rx maps to uplink and tx to downlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Point {
    pub ts: i64,
    pub uplink: u64,
    pub downlink: u64,
}

impl Point {
    pub fn total(&self) -> u64 {
        self.uplink.saturating_add(self.downlink)
    }
}

/// A ranked per-identity total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopEntry {
    pub identity: String,
    pub uplink: u64,
    pub downlink: u64,
}

impl TopEntry {
    pub fn total(&self) -> u64 {
        self.uplink.saturating_add(self.downlink)
    }
}

/// Builds an `AND <column> IN (...)` fragment with placeholders numbered from
/// `first_param`. An empty list yields no filter.
fn identity_filter(column: &str, identities: &[String], first_param: usize) -> String {
    if identities.is_empty() {
        return String::new();
    }

    let placeholders: Vec<String> = (0..identities.len())
        .map(|i| format!("?{}", first_param + i))
        .collect();
    format!(" AND {column} IN ({})", placeholders.join(", "))
}

fn point_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Point> {
    Ok(Point {
        ts: row.get(0)?,
        uplink: from_sql_bytes(row.get(1)?),
        downlink: from_sql_bytes(row.get(2)?),
    })
}

fn top_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TopEntry> {
    Ok(TopEntry {
        identity: row.get(0)?,
        uplink: from_sql_bytes(row.get(1)?),
        downlink: from_sql_bytes(row.get(2)?),
    })
}

impl Store {
    /// Returns raw delta samples for one identity in `[start, end]`, ordered by ts.
    pub fn range(&self, identity: &str, start: i64, end: i64) -> Result<Vec<Sample>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT identity, ts, uplink, downlink FROM traffic_samples
                     WHERE identity = ?1 AND ts >= ?2 AND ts <= ?3
                     ORDER BY ts",
                )
                .context("preparing range query")?;

            let rows = stmt
                .query_map(params![identity, start, end], |row| {
                    Ok(Sample {
                        identity: row.get(0)?,
                        ts: row.get(1)?,
                        uplink: from_sql_bytes(row.get(2)?),
                        downlink: from_sql_bytes(row.get(3)?),
                    })
                })
                .context("querying range")?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("reading range rows")
        })
    }

    /// Returns raw cumulative snapshots for one peer in `[start, end]`, ordered by ts.
    pub fn peer_range(&self, peer_id: &str, start: i64, end: i64) -> Result<Vec<PeerSample>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT peer_id, ts, rx, tx, endpoint FROM peer_samples
                     WHERE peer_id = ?1 AND ts >= ?2 AND ts <= ?3
                     ORDER BY ts",
                )
                .context("preparing peer range query")?;

            let rows = stmt
                .query_map(params![peer_id, start, end], |row| {
                    Ok(PeerSample {
                        peer_id: row.get(0)?,
                        ts: row.get(1)?,
                        rx: from_sql_bytes(row.get(2)?),
                        tx: from_sql_bytes(row.get(3)?),
                        endpoint: row.get(4)?,
                    })
                })
                .context("querying peer range")?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("reading peer range rows")
        })
    }

    /// Returns per-timestamp deltas summed across all identities.
    pub fn global_sum(&self, start: i64, end: i64) -> Result<Vec<Point>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT ts, SUM(uplink), SUM(downlink) FROM traffic_samples
                     WHERE ts >= ?1 AND ts <= ?2
                     GROUP BY ts ORDER BY ts",
                )
                .context("preparing global sum query")?;

            let rows = stmt
                .query_map(params![start, end], point_from_row)
                .context("querying global sum")?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("reading global sum rows")
        })
    }

    /// Returns identities whose traffic over the trailing window reaches
    /// `threshold_bytes`, sorted.
    pub fn active_identities(&self, window: Duration, threshold_bytes: u64) -> Result<Vec<String>> {
        let window = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
        self.active_identities_since(unix_now().saturating_sub(window), threshold_bytes)
    }

    /// Returns identities with at least `threshold_bytes` of traffic at or after `since`.
    pub fn active_identities_since(&self, since: i64, threshold_bytes: u64) -> Result<Vec<String>> {
        let threshold = super::to_sql_bytes(threshold_bytes);

        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT identity FROM traffic_samples
                     WHERE ts >= ?1
                     GROUP BY identity
                     HAVING SUM(uplink) + SUM(downlink) >= ?2
                     ORDER BY identity",
                )
                .context("preparing active identities query")?;

            let rows = stmt
                .query_map(params![since, threshold], |row| row.get::<_, String>(0))
                .context("querying active identities")?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("reading active identities")
        })
    }

    /// Returns the series bucketed by `interval_secs` over `[start, end]`.
    ///
    /// Traffic rows are summed per bucket. Peer snapshots are differenced
    /// per peer with `LAG()`, negative steps clamped to zero, and the last
    /// snapshot before `start` anchors the first in-range delta. Compressed
    /// rollups are re-bucketed and added in both cases. An empty identity
    /// list selects everything.
    pub fn bucketed(
        &self,
        series: Series,
        identities: &[String],
        start: i64,
        end: i64,
        interval_secs: i64,
    ) -> Result<Vec<Point>> {
        let interval_secs = interval_secs.max(1);

        let sql = match series {
            Series::Traffic => sum_bucket_sql(identities),
            Series::Peers => window_bucket_sql(identities),
        };

        let mut values: Vec<Value> = vec![
            Value::Integer(start),
            Value::Integer(end),
            Value::Integer(interval_secs),
        ];
        values.extend(identities.iter().cloned().map(Value::Text));

        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&sql)
                .with_context(|| format!("preparing {} bucket query", series.as_str()))?;

            let rows = stmt
                .query_map(params_from_iter(values.iter()), point_from_row)
                .with_context(|| format!("querying {} buckets", series.as_str()))?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .with_context(|| format!("reading {} buckets", series.as_str()))
        })
    }

    /// Returns the heaviest identities by summed delta over `[start, end]`.
    pub fn top_totals(&self, start: i64, end: i64, limit: usize) -> Result<Vec<TopEntry>> {
        self.ranked(
            "SELECT identity, SUM(up), SUM(down) FROM (
                 SELECT identity, SUM(uplink) AS up, SUM(downlink) AS down
                 FROM traffic_samples
                 WHERE ts >= ?1 AND ts <= ?2
                 GROUP BY identity
                 UNION ALL
                 SELECT identity, SUM(uplink), SUM(downlink)
                 FROM traffic_compressed
                 WHERE bucket_start >= ?1 AND bucket_start <= ?2
                 GROUP BY identity
             )
             GROUP BY identity
             ORDER BY SUM(up) + SUM(down) DESC, identity
             LIMIT ?3",
            start,
            end,
            limit,
        )
    }

    /// Returns the heaviest peers by counter growth (MAX − MIN, anchored on the
    /// last snapshot before `start`) plus compressed sums over `[start, end]`.
    pub fn peer_top_totals(&self, start: i64, end: i64, limit: usize) -> Result<Vec<TopEntry>> {
        self.ranked(
            "SELECT peer_id, SUM(up), SUM(down) FROM (
                 SELECT peer_id, MAX(rx) - MIN(rx) AS up, MAX(tx) - MIN(tx) AS down
                 FROM peer_samples p
                 WHERE ts <= ?2
                   AND ts >= COALESCE(
                       (SELECT MAX(a.ts) FROM peer_samples a
                        WHERE a.peer_id = p.peer_id AND a.ts < ?1),
                       ?1)
                 GROUP BY peer_id
                 UNION ALL
                 SELECT peer_id, SUM(rx), SUM(tx)
                 FROM peer_compressed
                 WHERE bucket_start >= ?1 AND bucket_start <= ?2
                 GROUP BY peer_id
             )
             GROUP BY peer_id
             ORDER BY SUM(up) + SUM(down) DESC, peer_id
             LIMIT ?3",
            start,
            end,
            limit,
        )
    }

    fn ranked(&self, sql: &str, start: i64, end: i64, limit: usize) -> Result<Vec<TopEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql).context("preparing ranking query")?;
            let rows = stmt
                .query_map(params![start, end, limit], top_from_row)
                .context("querying ranking")?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("reading ranking rows")
        })
    }
}

fn sum_bucket_sql(identities: &[String]) -> String {
    let raw_filter = identity_filter("identity", identities, 4);

    format!(
        "SELECT bucket, SUM(up), SUM(down) FROM (
             SELECT (ts / ?3) * ?3 AS bucket, uplink AS up, downlink AS down
             FROM traffic_samples
             WHERE ts >= ?1 AND ts <= ?2{raw_filter}
             UNION ALL
             SELECT (bucket_start / ?3) * ?3, uplink, downlink
             FROM traffic_compressed
             WHERE bucket_start >= ?1 AND bucket_start <= ?2{raw_filter}
         )
         GROUP BY bucket
         ORDER BY bucket"
    )
}

fn window_bucket_sql(identities: &[String]) -> String {
    let filter = identity_filter("peer_id", identities, 4);

    format!(
        "WITH scoped AS (
             SELECT peer_id, ts, rx, tx FROM peer_samples p
             WHERE ts <= ?2{filter}
               AND ts >= COALESCE(
                   (SELECT MAX(a.ts) FROM peer_samples a
                    WHERE a.peer_id = p.peer_id AND a.ts < ?1),
                   ?1)
         ),
         diffs AS (
             SELECT ts,
                    rx - LAG(rx) OVER (PARTITION BY peer_id ORDER BY ts) AS drx,
                    tx - LAG(tx) OVER (PARTITION BY peer_id ORDER BY ts) AS dtx
             FROM scoped
         )
         SELECT bucket, SUM(up), SUM(down) FROM (
             SELECT (ts / ?3) * ?3 AS bucket,
                    CASE WHEN drx > 0 THEN drx ELSE 0 END AS up,
                    CASE WHEN dtx > 0 THEN dtx ELSE 0 END AS down
             FROM diffs
             WHERE drx IS NOT NULL AND ts >= ?1
             UNION ALL
             SELECT (bucket_start / ?3) * ?3, rx, tx
             FROM peer_compressed
             WHERE bucket_start >= ?1 AND bucket_start <= ?2{filter}
         )
         GROUP BY bucket
         ORDER BY bucket"
    )
}

//! Retention-side maintenance: hard deletes and 8-hour rollups.

use anyhow::{Context, Result};
use rusqlite::params;

use super::{Series, Store};

/// Rollup bucket width used for compressed rows.
pub const COMPRESSED_BUCKET_SECS: i64 = 8 * 3600;

impl Store {
    /// Deletes raw rows of `series` older than `cutoff`, together with
    /// compressed buckets that end at or before it. Returns raw rows removed.
    ///
    /// The newest peer snapshot before the cutoff survives as the anchor for
    /// that peer's next delta.
    pub fn hard_delete_before(&self, series: Series, cutoff: i64) -> Result<usize> {
        let (raw_sql, compressed_sql) = match series {
            Series::Traffic => (
                "DELETE FROM traffic_samples WHERE ts < ?1",
                "DELETE FROM traffic_compressed WHERE bucket_start + ?2 <= ?1",
            ),
            Series::Peers => (
                "DELETE FROM peer_samples
                 WHERE ts < ?1
                   AND ts < (SELECT MAX(a.ts) FROM peer_samples a
                             WHERE a.peer_id = peer_samples.peer_id AND a.ts < ?1)",
                "DELETE FROM peer_compressed WHERE bucket_start + ?2 <= ?1",
            ),
        };

        self.with_conn(|conn| {
            let tx = conn.transaction().context("starting hard delete")?;
            let removed = tx
                .execute(raw_sql, params![cutoff])
                .with_context(|| format!("deleting raw {} rows", series.as_str()))?;
            tx.execute(compressed_sql, params![cutoff, COMPRESSED_BUCKET_SECS])
                .with_context(|| format!("deleting compressed {} rows", series.as_str()))?;
            tx.commit().context("committing hard delete")?;
            Ok(removed)
        })
    }

    /// Rolls raw rows older than `cutoff` into `bucket_secs` buckets and deletes
    /// the contributing rows in the same transaction. Returns raw rows removed.
    ///
    /// Peer snapshots are differenced before summing, and the newest snapshot
    /// per peer before the cutoff stays behind as the anchor for later deltas.
    pub fn compress_before(&self, series: Series, cutoff: i64, bucket_secs: i64) -> Result<usize> {
        let bucket_secs = bucket_secs.max(1);

        self.with_conn(|conn| {
            let tx = conn.transaction().context("starting rollup")?;

            let removed = match series {
                Series::Traffic => {
                    tx.execute(
                        "INSERT INTO traffic_compressed (identity, bucket_start, uplink, downlink)
                         SELECT identity, (ts / ?2) * ?2 AS bucket, SUM(uplink), SUM(downlink)
                         FROM traffic_samples
                         WHERE ts < ?1
                         GROUP BY identity, bucket
                         ON CONFLICT(identity, bucket_start) DO UPDATE SET
                             uplink = uplink + excluded.uplink,
                             downlink = downlink + excluded.downlink",
                        params![cutoff, bucket_secs],
                    )
                    .context("merging traffic rollup")?;

                    tx.execute("DELETE FROM traffic_samples WHERE ts < ?1", params![cutoff])
                        .context("deleting rolled-up traffic rows")?
                }
                Series::Peers => {
                    tx.execute(
                        "WITH diffs AS (
                             SELECT peer_id, ts,
                                    rx - LAG(rx) OVER (PARTITION BY peer_id ORDER BY ts) AS drx,
                                    tx - LAG(tx) OVER (PARTITION BY peer_id ORDER BY ts) AS dtx
                             FROM peer_samples
                             WHERE ts < ?1
                         )
                         INSERT INTO peer_compressed (peer_id, bucket_start, rx, tx)
                         SELECT peer_id, (ts / ?2) * ?2 AS bucket,
                                SUM(CASE WHEN drx > 0 THEN drx ELSE 0 END),
                                SUM(CASE WHEN dtx > 0 THEN dtx ELSE 0 END)
                         FROM diffs
                         WHERE drx IS NOT NULL
                         GROUP BY peer_id, bucket
                         HAVING SUM(CASE WHEN drx > 0 THEN drx ELSE 0 END)
                              + SUM(CASE WHEN dtx > 0 THEN dtx ELSE 0 END) > 0
                         ON CONFLICT(peer_id, bucket_start) DO UPDATE SET
                             rx = rx + excluded.rx,
                             tx = tx + excluded.tx",
                        params![cutoff, bucket_secs],
                    )
                    .context("merging peer rollup")?;

                    tx.execute(
                        "DELETE FROM peer_samples
                         WHERE ts < ?1
                           AND ts < (SELECT MAX(a.ts) FROM peer_samples a
                                     WHERE a.peer_id = peer_samples.peer_id AND a.ts < ?1)",
                        params![cutoff],
                    )
                    .context("deleting rolled-up peer rows")?
                }
            };

            tx.commit().context("committing rollup")?;

            tracing::debug!(source = series.as_str(), cutoff, removed, "rollup committed");

            Ok(removed)
        })
    }
}

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: include_str!("sql/001_init.up.sql"),
        down_sql: include_str!("sql/001_init.down.sql"),
    },
    Migration {
        version: 2,
        up_sql: include_str!("sql/002_sampler_runs.up.sql"),
        down_sql: include_str!("sql/002_sampler_runs.down.sql"),
    },
];

/// Returns the newest embedded schema version.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Ensures the schema_migrations tracking table exists.
fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER NOT NULL,
            dirty   INTEGER NOT NULL
        )",
    )
    .context("creating schema_migrations table")?;

    Ok(())
}

/// Returns the current migration version and dirty state.
fn current_version(conn: &Connection) -> Result<(u32, bool)> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT version, dirty FROM schema_migrations LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("querying migration version")?;

    match row {
        Some((version, dirty)) => Ok((u32::try_from(version).unwrap_or(0), dirty != 0)),
        None => Ok((0, false)),
    }
}

/// Sets the migration version in the tracking table.
fn set_version(conn: &Connection, version: u32, dirty: bool) -> Result<()> {
    conn.execute("DELETE FROM schema_migrations", [])
        .context("clearing schema_migrations")?;

    if version == 0 {
        return Ok(());
    }

    conn.execute(
        "INSERT INTO schema_migrations (version, dirty) VALUES (?1, ?2)",
        params![i64::from(version), i64::from(dirty)],
    )
    .context("inserting migration version")?;

    Ok(())
}

/// Applies all pending forward migrations.
///
/// Each migration is marked dirty before its SQL runs and clean afterwards,
/// both steps inside one transaction. A dirty version left behind by an
/// older binary blocks startup until resolved by hand.
pub fn migrate_up(conn: &mut Connection) -> Result<()> {
    ensure_migrations_table(conn)?;

    let (current, dirty) = current_version(conn)?;
    if dirty {
        bail!("migration version {current} is dirty, manual intervention required");
    }

    let mut applied = 0u32;

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }

        tracing::info!(version = migration.version, "applying migration");

        let tx = conn.transaction().context("starting migration transaction")?;
        set_version(&tx, migration.version, true)?;
        tx.execute_batch(migration.up_sql)
            .with_context(|| format!("applying migration version {}", migration.version))?;
        set_version(&tx, migration.version, false)?;
        tx.commit()
            .with_context(|| format!("committing migration version {}", migration.version))?;

        applied += 1;
    }

    if applied == 0 {
        tracing::debug!(version = current, "no pending migrations");
    } else {
        let (version, _) = current_version(conn)?;
        tracing::info!(version, applied, "migrations completed");
    }

    Ok(())
}

/// Rolls back the last applied migration.
pub fn migrate_down(conn: &mut Connection) -> Result<()> {
    ensure_migrations_table(conn)?;

    let (current, _) = current_version(conn)?;
    if current == 0 {
        tracing::info!("no migrations to roll back");
        return Ok(());
    }

    let migration = MIGRATIONS
        .iter()
        .find(|m| m.version == current)
        .with_context(|| format!("migration version {current} not found"))?;

    let prev = MIGRATIONS
        .iter()
        .filter(|m| m.version < current)
        .map(|m| m.version)
        .max()
        .unwrap_or(0);

    tracing::info!(version = current, "rolling back migration");

    let tx = conn.transaction().context("starting rollback transaction")?;
    set_version(&tx, current, true)?;
    tx.execute_batch(migration.down_sql)
        .with_context(|| format!("rolling back migration version {current}"))?;
    set_version(&tx, prev, false)?;
    tx.commit().context("committing rollback")?;

    tracing::info!(version = prev, "rollback completed");

    Ok(())
}

/// Returns the current migration version and dirty flag.
pub fn status(conn: &Connection) -> Result<(u32, bool)> {
    ensure_migrations_table(conn)?;
    current_version(conn)
}

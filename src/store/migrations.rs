//! Schema migrations.
//!
//! Applied versions are tracked in a `_migrations` table; pending ones run
//! in order inside one transaction each, so a failed migration leaves the
//! schema at the previous version.

use rusqlite::Connection;
use tracing::info;

use super::error::StoreError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_users_table",
        sql: include_str!("sql/001_create_users.sql"),
    },
    Migration {
        version: 2,
        description: "create_jobs_table",
        sql: include_str!("sql/002_create_jobs.sql"),
    },
    Migration {
        version: 3,
        description: "job_state_monotonic_trigger",
        sql: include_str!("sql/003_job_state_monotonic.sql"),
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        info!(
            "Running migration v{}: {}",
            migration.version, migration.description
        );

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
        tx.commit()?;
    }

    Ok(())
}

/// Highest applied migration version.
pub fn current_version(conn: &Connection) -> Result<u32, StoreError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?)
}

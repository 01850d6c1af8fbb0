//! Durable job store.
//!
//! One SQLite file is shared by every process of a deployment: the worker
//! flips jobs to `done`, while `submit`, `status` and `cleanup` (often in
//! other processes) insert, read and delete rows. Inside a process all access
//! goes through one [`Database`] handle, whose mutex makes each store call
//! atomic with respect to the worker task and request handlers.
//!
//! Across processes SQLite does the locking. File databases run in WAL mode,
//! so readers never wait on the writer, and carry a [`BUSY_TIMEOUT`] so two
//! writers (a submit landing while the worker marks a job done) queue instead
//! of failing with `SQLITE_BUSY`.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{info, warn};

pub mod error;
pub mod jobs;
pub mod migrations;

pub use error::StoreError;
pub use jobs::{Job, JobId, JobState, JobStore, User};

/// How long a write waits for another process's write lock.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the job database. Clones share the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the job database at `path`, creating it (and its directory) on
    /// first use, and bring the schema up to date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!(mode = %mode, "WAL unavailable, status polls may wait on the worker");
        }
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Self::prepare(conn)?;

        info!("Job database ready at {}", path.display());
        Ok(db)
    }

    /// Private database for tests and one-shot runs. Nothing is shared with
    /// other processes, so WAL and the busy timeout do not apply.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    /// Settings every connection needs, then migrations.
    fn prepare(conn: Connection) -> Result<Self, StoreError> {
        // Deleting a user cascades to their jobs.
        conn.pragma_update(None, "foreign_keys", true)?;
        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with the connection locked.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }

    /// Run `f` inside one transaction: committed if `f` returns `Ok`,
    /// rolled back otherwise.
    pub fn in_transaction<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }
}

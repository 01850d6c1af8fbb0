//! Job and user records: create, look up, list pending, mark done, delete.
//!
//! The only state transition is `pending → done`, performed by a
//! conditional update so that it happens at most once per job no matter how
//! often [`JobStore::mark_done`] is called. A database trigger rejects any
//! attempt to move a `done` row back to `pending`.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{Database, StoreError};
use crate::config::extension_of;

/// Opaque external handle of a job (a UUID v4 string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Processing state of a job. Monotonic: `Done` never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Done,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Done => "done",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "done" => Some(JobState::Done),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One uploaded document.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub original_filename: String,
    pub owner_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub state: JobState,
    pub custom_instruction: Option<String>,
}

impl Job {
    /// Name of the stored upload: the job id plus the original extension.
    pub fn upload_name(&self) -> String {
        upload_name(&self.id, &self.original_filename)
    }

    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }
}

/// `<id>.<ext>` for a stored upload, or just `<id>` without an extension.
pub fn upload_name(id: &JobId, original_filename: &str) -> String {
    match extension_of(original_filename) {
        Some(ext) => format!("{id}.{ext}"),
        None => id.to_string(),
    }
}

/// An owner grouping, keyed by unique email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
}

const JOB_COLUMNS: &str = "j.uid, j.filename, u.email, j.created_at, j.completed_at, j.state, \
                           j.custom_instruction";

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn job_from_row(row: &Row<'_>) -> Result<Job, rusqlite::Error> {
    let state: String = row.get(5)?;
    let state = JobState::parse(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown job state '{state}'").into(),
        )
    })?;
    let created_at: String = row.get(3)?;
    let completed_at: Option<String> = row.get(4)?;

    Ok(Job {
        id: JobId(row.get(0)?),
        original_filename: row.get(1)?,
        owner_email: row.get(2)?,
        created_at: parse_ts(3, &created_at)?,
        completed_at: completed_at.map(|s| parse_ts(4, &s)).transpose()?,
        state,
        custom_instruction: row.get(6)?,
    })
}

fn normalise_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Store of jobs and their owners. Cloning is cheap.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a `pending` job and returns its id.
    ///
    /// When `owner_email` is given the user is created if needed, in the
    /// same transaction as the job.
    pub fn create(
        &self,
        filename: &str,
        owner_email: Option<&str>,
        instruction: Option<&str>,
    ) -> Result<JobId, StoreError> {
        let id = JobId::generate();
        let created_at = format_ts(&Utc::now());
        let instruction = instruction.map(str::trim).filter(|i| !i.is_empty());

        self.db.in_transaction(|conn| {
            let user_id = match owner_email {
                Some(email) => Some(find_or_create_user_in(conn, email)?.id),
                None => None,
            };
            conn.execute(
                "INSERT INTO jobs (uid, filename, created_at, state, custom_instruction, user_id)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
                params![id.as_str(), filename, created_at, instruction, user_id],
            )?;
            Ok(())
        })?;

        Ok(id)
    }

    /// Finds a job by its id. Unknown ids yield `Ok(None)`.
    pub fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs j LEFT JOIN users u ON u.id = j.user_id
                 WHERE j.uid = ?1"
            );
            Ok(conn.query_row(&sql, params![id], job_from_row).optional()?)
        })
    }

    /// All `pending` jobs, oldest first.
    pub fn list_pending(&self) -> Result<Vec<Job>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs j LEFT JOIN users u ON u.id = j.user_id
                 WHERE j.state = 'pending' ORDER BY j.created_at, j.id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], job_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Transitions a job from `pending` to `done`.
    ///
    /// Returns `true` if this call performed the transition. A second call
    /// (or a call on an unknown id) returns `false` and changes nothing, so
    /// the first `completed_at` wins.
    pub fn mark_done(&self, id: &str, completed_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let completed_at = format_ts(&completed_at);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE jobs SET state = 'done', completed_at = ?2
                 WHERE uid = ?1 AND state = 'pending'",
                params![id, completed_at],
            )?;
            Ok(changed == 1)
        })
    }

    /// Removes a job record. Returns whether a row was deleted.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM jobs WHERE uid = ?1", params![id])?;
            Ok(changed == 1)
        })
    }

    /// Counts jobs in the given state.
    pub fn count_by_state(&self, state: JobState) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let count: u64 = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE state = ?1",
                params![state.as_str()],
                |r| r.get(0),
            )?;
            Ok(count)
        })
    }

    // ── Users ────────────────────────────────────────────────────────────

    pub fn find_or_create_user(&self, email: &str) -> Result<User, StoreError> {
        self.db.with_conn(|conn| find_or_create_user_in(conn, email))
    }

    pub fn find_user(&self, email: &str) -> Result<Option<User>, StoreError> {
        let email = normalise_email(email);
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, email FROM users WHERE email = ?1",
                    params![email],
                    |r| {
                        Ok(User {
                            id: r.get(0)?,
                            email: r.get(1)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// All jobs owned by `email`, oldest first.
    pub fn jobs_for_user(&self, email: &str) -> Result<Vec<Job>, StoreError> {
        let email = normalise_email(email);
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs j JOIN users u ON u.id = j.user_id
                 WHERE u.email = ?1 ORDER BY j.created_at, j.id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![email], job_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Deletes a user; the database cascades the deletion to owned jobs.
    ///
    /// Returns the jobs that were removed so the caller can delete their
    /// files, or `None` if no such user exists.
    pub fn delete_user(&self, email: &str) -> Result<Option<Vec<Job>>, StoreError> {
        let email = normalise_email(email);
        self.db.in_transaction(|conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs j JOIN users u ON u.id = j.user_id
                 WHERE u.email = ?1 ORDER BY j.created_at, j.id"
            );
            let owned = {
                let mut stmt = conn.prepare(&sql)?;
                let owned = stmt
                    .query_map(params![email], job_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                owned
            };
            let removed = conn.execute("DELETE FROM users WHERE email = ?1", params![email])?;
            Ok((removed == 1).then_some(owned))
        })
    }
}

fn find_or_create_user_in(conn: &rusqlite::Connection, email: &str) -> Result<User, StoreError> {
    let email = normalise_email(email);
    conn.execute(
        "INSERT INTO users (email) VALUES (?1) ON CONFLICT(email) DO NOTHING",
        params![email],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM users WHERE email = ?1",
        params![email],
        |r| r.get(0),
    )?;
    Ok(User { id, email })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_store() -> JobStore {
        JobStore::new(Database::open_in_memory().expect("Failed to create test database"))
    }

    #[test]
    fn test_create_and_get() {
        let store = test_store();
        let id = store.create("deck.pptx", None, Some("Summarise this slide")).unwrap();

        let job = store.get(id.as_str()).unwrap().expect("job exists");
        assert_eq!(job.original_filename, "deck.pptx");
        assert_eq!(job.state, JobState::Pending);
        assert!(job.completed_at.is_none());
        assert!(job.owner_email.is_none());
        assert_eq!(job.custom_instruction.as_deref(), Some("Summarise this slide"));
    }

    #[test]
    fn test_ids_are_uuids() {
        let store = test_store();
        let id = store.create("a.pdf", None, None).unwrap();
        assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn test_get_unknown_is_none() {
        let store = test_store();
        assert!(store.get("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_blank_instruction_is_stored_as_none() {
        let store = test_store();
        let id = store.create("a.pdf", None, Some("  ")).unwrap();
        assert!(store.get(id.as_str()).unwrap().unwrap().custom_instruction.is_none());
    }

    #[test]
    fn test_list_pending_excludes_done() {
        let store = test_store();
        let a = store.create("a.pdf", None, None).unwrap();
        let b = store.create("b.pdf", None, None).unwrap();
        let c = store.create("c.pdf", None, None).unwrap();
        store.mark_done(b.as_str(), Utc::now()).unwrap();

        let pending: Vec<JobId> = store.list_pending().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(pending, vec![a, c]);
    }

    #[test]
    fn test_mark_done_first_write_wins() {
        let store = test_store();
        let id = store.create("a.pdf", None, None).unwrap();
        let first = Utc::now();
        let later = first + Duration::hours(1);

        assert!(store.mark_done(id.as_str(), first).unwrap());
        assert!(!store.mark_done(id.as_str(), later).unwrap());

        let job = store.get(id.as_str()).unwrap().unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(
            job.completed_at.unwrap().timestamp_micros(),
            first.timestamp_micros()
        );
    }

    #[test]
    fn test_mark_done_unknown_id() {
        let store = test_store();
        assert!(!store.mark_done("ghost", Utc::now()).unwrap());
    }

    #[test]
    fn test_done_cannot_revert_to_pending() {
        let store = test_store();
        let id = store.create("a.pdf", None, None).unwrap();
        store.mark_done(id.as_str(), Utc::now()).unwrap();

        let result = store.db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET state = 'pending' WHERE uid = ?1",
                params![id.as_str()],
            )?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(store.get(id.as_str()).unwrap().unwrap().is_done());
    }

    #[test]
    fn test_delete() {
        let store = test_store();
        let id = store.create("a.pdf", None, None).unwrap();
        assert!(store.delete(id.as_str()).unwrap());
        assert!(!store.delete(id.as_str()).unwrap());
        assert!(store.get(id.as_str()).unwrap().is_none());
    }

    #[test]
    fn test_owner_is_created_once() {
        let store = test_store();
        store.create("a.pdf", Some("Ada@Example.com"), None).unwrap();
        store.create("b.pdf", Some("ada@example.com "), None).unwrap();

        let user = store.find_user("ada@example.com").unwrap().unwrap();
        assert_eq!(user.email, "ada@example.com");
        assert_eq!(store.jobs_for_user("ada@example.com").unwrap().len(), 2);
    }

    #[test]
    fn test_delete_user_cascades_to_jobs() {
        let store = test_store();
        let owned = store.create("a.pdf", Some("ada@example.com"), None).unwrap();
        let anonymous = store.create("b.pdf", None, None).unwrap();

        let removed = store.delete_user("ada@example.com").unwrap().unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, owned);
        assert!(store.get(owned.as_str()).unwrap().is_none());
        assert!(store.get(anonymous.as_str()).unwrap().is_some());
        assert!(store.find_user("ada@example.com").unwrap().is_none());
    }

    #[test]
    fn test_delete_unknown_user() {
        let store = test_store();
        assert!(store.delete_user("nobody@example.com").unwrap().is_none());
    }

    #[test]
    fn test_count_by_state() {
        let store = test_store();
        let a = store.create("a.pdf", None, None).unwrap();
        store.create("b.pdf", None, None).unwrap();
        store.mark_done(a.as_str(), Utc::now()).unwrap();
        assert_eq!(store.count_by_state(JobState::Pending).unwrap(), 1);
        assert_eq!(store.count_by_state(JobState::Done).unwrap(), 1);
    }

    #[test]
    fn test_upload_name_uses_lowercase_extension() {
        let id = JobId::from("1234");
        assert_eq!(upload_name(&id, "Deck.PPTX"), "1234.pptx");
        assert_eq!(upload_name(&id, "README"), "1234");
    }

    #[test]
    fn test_concurrent_creates() {
        let store = test_store();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.create(&format!("f{i}.pdf"), None, None).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.list_pending().unwrap().len(), 8);
    }
}

//! Persistent request queue.
//!
//! Every tile of every topic becomes a row in `Requests`. Rows start out
//! `Pending` and only move to `Done` once a validated response is stored, so a
//! crawl can be stopped at any point and resumed by reading `Pending` rows
//! again. A response body is kept per request (`Responses`, upserted) and
//! every validation failure leaves a trace in `FailedRequests`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::Config;
use crate::dimension::TopicId;
use crate::tile::FilterPayload;
use crate::{Error, Result};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for the queue tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS Requests (
    request_id INTEGER PRIMARY KEY AUTOINCREMENT,
    topic_id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'Pending' CHECK(status IN ('Pending', 'Done', 'Error')),
    timestamp TEXT NOT NULL,
    UNIQUE (topic_id, payload)
);

CREATE INDEX IF NOT EXISTS idx_requests_topic_status ON Requests (topic_id, status);

CREATE TABLE IF NOT EXISTS Responses (
    response_id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id INTEGER NOT NULL UNIQUE REFERENCES Requests(request_id),
    response_text TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS FailedRequests (
    failure_id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id INTEGER NOT NULL REFERENCES Requests(request_id),
    info TEXT,
    timestamp TEXT NOT NULL
);
";

const DROP_TABLES: &str = r"
DROP TABLE IF EXISTS FailedRequests;
DROP TABLE IF EXISTS Responses;
DROP TABLE IF EXISTS Requests;
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Pending,
    Done,
    /// Given up on after repeated validation failures.
    Error,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "Pending",
            RequestStatus::Done => "Done",
            RequestStatus::Error => "Error",
        }
    }
}

impl ToSql for RequestStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RequestStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "Pending" => Ok(RequestStatus::Pending),
            "Done" => Ok(RequestStatus::Done),
            "Error" => Ok(RequestStatus::Error),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: i64,
    pub topic: TopicId,
    pub payload: FilterPayload,
    pub status: RequestStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub request_id: i64,
    pub text: String,
    pub stored_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRequest {
    pub request_id: i64,
    pub info: Option<String>,
    pub failed_at: String,
}

/// What `mark_failed` did to the owning request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still `Pending`, eligible for the next run.
    Retained { failures: u32 },
    /// Moved to `Error` after reaching the failure threshold.
    Escalated { failures: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub done: u64,
    pub error: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.done + self.error
    }
}

/// `SQLite`-backed request queue.
///
/// Uses a single `Mutex<Connection>`; callers share it behind an `Arc`.
pub struct RequestQueue {
    conn: Mutex<Connection>,
    max_failures: Option<u32>,
}

impl RequestQueue {
    /// Open or create the queue database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::open(&config.db_path)?.with_failure_threshold(config.max_validation_failures))
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_failures: None,
        })
    }

    /// After `threshold` recorded failures a request moves to `Error`.
    /// `None` keeps failed requests `Pending` forever.
    pub fn with_failure_threshold(mut self, threshold: Option<u32>) -> Self {
        self.max_failures = threshold;
        self
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Inserts one `Pending` request per payload in a single transaction.
    ///
    /// A payload already queued for the topic is skipped, whatever its status.
    /// Returns the number of requests actually inserted.
    pub fn bulk_enqueue(&self, topic: TopicId, payloads: &[FilterPayload]) -> Result<usize> {
        if payloads.is_empty() {
            return Ok(0);
        }
        let now = Self::now_sqlite();
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO Requests (topic_id, payload, status, timestamp) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for payload in payloads {
                let json = serde_json::to_string(payload)?;
                inserted += stmt.execute(params![topic.0, json, RequestStatus::Pending, now])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// All `Pending` requests in insertion order, optionally for one topic.
    pub fn fetch_pending(&self, topic: Option<TopicId>) -> Result<Vec<Request>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT request_id, topic_id, payload, status, timestamp FROM Requests \
             WHERE status = ?1 AND (?2 IS NULL OR topic_id = ?2) \
             ORDER BY request_id",
        )?;
        let rows = stmt
            .query_map(params![RequestStatus::Pending, topic.map(|t| t.0)], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, RequestStatus>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, topic, payload, status, created_at)| {
                Ok(Request {
                    id,
                    topic: TopicId(topic),
                    payload: serde_json::from_str(&payload)?,
                    status,
                    created_at,
                })
            })
            .collect()
    }

    pub fn request(&self, request_id: i64) -> Result<Option<Request>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT topic_id, payload, status, timestamp FROM Requests WHERE request_id = ?1",
                [request_id],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, RequestStatus>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(topic, payload, status, created_at)| {
            Ok(Request {
                id: request_id,
                topic: TopicId(topic),
                payload: serde_json::from_str(&payload)?,
                status,
                created_at,
            })
        })
        .transpose()
    }

    /// Stores `body` as the request's response (replacing any earlier one)
    /// and marks the request `Done`, atomically.
    ///
    /// A request in `Error` is left alone and reported as [`Error::RequestClosed`].
    pub fn mark_done(&self, request_id: i64, body: &str) -> Result<()> {
        let now = Self::now_sqlite();
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let status: Option<RequestStatus> = tx
            .query_row(
                "SELECT status FROM Requests WHERE request_id = ?1",
                [request_id],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            None => return Err(Error::UnknownRequest(request_id)),
            Some(RequestStatus::Error) => return Err(Error::RequestClosed(request_id)),
            Some(RequestStatus::Pending | RequestStatus::Done) => {}
        }
        tx.execute(
            "UPDATE Requests SET status = ?1 WHERE request_id = ?2",
            params![RequestStatus::Done, request_id],
        )?;
        tx.execute(
            "INSERT INTO Responses (request_id, response_text, timestamp) VALUES (?1, ?2, ?3) \
             ON CONFLICT(request_id) DO UPDATE SET response_text = ?2, timestamp = ?3",
            params![request_id, body, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Records a validation failure. The request stays `Pending` unless the
    /// failure threshold is configured and reached.
    pub fn mark_failed(&self, request_id: i64, info: &str) -> Result<FailureOutcome> {
        let now = Self::now_sqlite();
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM Requests WHERE request_id = ?1)",
            [request_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(Error::UnknownRequest(request_id));
        }
        tx.execute(
            "INSERT INTO FailedRequests (request_id, info, timestamp) VALUES (?1, ?2, ?3)",
            params![request_id, info, now],
        )?;
        let failures: u32 = tx.query_row(
            "SELECT COUNT(*) FROM FailedRequests WHERE request_id = ?1",
            [request_id],
            |row| row.get(0),
        )?;

        let outcome = match self.max_failures {
            Some(threshold) if failures >= threshold => {
                tx.execute(
                    "UPDATE Requests SET status = ?1 WHERE request_id = ?2 AND status = ?3",
                    params![RequestStatus::Error, request_id, RequestStatus::Pending],
                )?;
                FailureOutcome::Escalated { failures }
            }
            _ => FailureOutcome::Retained { failures },
        };
        tx.commit()?;
        Ok(outcome)
    }

    pub fn failures(&self, request_id: i64) -> Result<Vec<FailedRequest>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT request_id, info, timestamp FROM FailedRequests \
             WHERE request_id = ?1 ORDER BY failure_id",
        )?;
        let failures = stmt
            .query_map([request_id], |row| {
                Ok(FailedRequest {
                    request_id: row.get(0)?,
                    info: row.get(1)?,
                    failed_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(failures)
    }

    /// Stored responses of a topic's `Done` requests, in request order.
    pub fn done_responses(&self, topic: TopicId) -> Result<Vec<StoredResponse>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.request_id, s.response_text, s.timestamp FROM Requests r \
             JOIN Responses s ON s.request_id = r.request_id \
             WHERE r.topic_id = ?1 AND r.status = ?2 ORDER BY r.request_id",
        )?;
        let responses = stmt
            .query_map(params![topic.0, RequestStatus::Done], |row| {
                Ok(StoredResponse {
                    request_id: row.get(0)?,
                    text: row.get(1)?,
                    stored_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(responses)
    }

    pub fn status_counts(&self, topic: Option<TopicId>) -> Result<StatusCounts> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM Requests \
             WHERE ?1 IS NULL OR topic_id = ?1 GROUP BY status",
        )?;
        let mut counts = StatusCounts::default();
        let rows = stmt.query_map([topic.map(|t| t.0)], |row| {
            Ok((row.get::<_, RequestStatus>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match status {
                RequestStatus::Pending => counts.pending = count,
                RequestStatus::Done => counts.done = count,
                RequestStatus::Error => counts.error = count,
            }
        }
        Ok(counts)
    }

    pub fn topics_with_pending(&self) -> Result<Vec<TopicId>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT topic_id FROM Requests WHERE status = ?1 ORDER BY topic_id",
        )?;
        let topics = stmt
            .query_map([RequestStatus::Pending], |row| row.get::<_, u32>(0).map(TopicId))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(topics)
    }

    /// Drops and recreates every queue table.
    pub fn reset_all(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(DROP_TABLES)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(())
    }
}

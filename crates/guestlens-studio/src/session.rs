//! Local guest session cache.
//!
//! The session lives as one JSON value in a small SQLite key/value table.
//! Whoever writes last wins.

use crate::api::GuestMatch;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Storage key of the guest session.
pub const SESSION_KEY: &str = "studio_guest_session";

/// Age in hours at which a session expires.
pub const SESSION_TTL_HOURS: i64 = 24;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session store: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("failed to encode session: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A registered guest's access to one event gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestSession {
    pub event_id: String,
    pub guest_id: String,
    pub guest_name: String,
    /// Opaque token issued by the endpoint.
    pub token: String,
    pub matched_photo_ids: Vec<String>,
    pub matched_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl GuestSession {
    pub fn from_match(event_id: &str, guest_name: &str, matched: GuestMatch, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event_id.to_string(),
            guest_id: matched.guest_id,
            guest_name: guest_name.to_string(),
            token: matched.token,
            matched_count: matched.total_matches,
            matched_photo_ids: matched.matched_photo_ids,
            timestamp: now,
        }
    }
}

pub struct SessionCache {
    con: Mutex<Connection>,
}

impl SessionCache {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, SessionError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, SessionError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(con: Connection) -> Result<Self, SessionError> {
        con.execute_batch(
            "CREATE TABLE IF NOT EXISTS local_storage (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self { con: Mutex::new(con) })
    }

    fn con(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.con.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn save(&self, session: &GuestSession) -> Result<(), SessionError> {
        let value = serde_json::to_string(session)?;
        self.con().execute(
            "INSERT INTO local_storage (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SESSION_KEY, value],
        )?;
        tracing::debug!(event_id = %session.event_id, guest_id = %session.guest_id, "guest session saved");
        Ok(())
    }

    /// The stored session, if any. A value that no longer parses is removed
    /// and reported as absent.
    pub fn load(&self) -> Result<Option<GuestSession>, SessionError> {
        let con = self.con();
        let value: Option<String> = con
            .query_row(
                "SELECT value FROM local_storage WHERE key = ?1",
                [SESSION_KEY],
                |row| row.get(0),
            )
            .optional()?;

        let Some(value) = value else {
            return Ok(None);
        };
        match serde_json::from_str(&value) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable guest session");
                con.execute("DELETE FROM local_storage WHERE key = ?1", [SESSION_KEY])?;
                Ok(None)
            }
        }
    }

    pub fn clear(&self) -> Result<(), SessionError> {
        self.con()
            .execute("DELETE FROM local_storage WHERE key = ?1", [SESSION_KEY])?;
        Ok(())
    }

    /// Whether `session` is unexpired and, when `event_id` is given, belongs
    /// to that event.
    pub fn is_valid(session: &GuestSession, event_id: Option<&str>) -> bool {
        Self::is_valid_at(session, event_id, Utc::now())
    }

    pub fn is_valid_at(session: &GuestSession, event_id: Option<&str>, now: DateTime<Utc>) -> bool {
        if now - session.timestamp >= Duration::hours(SESSION_TTL_HOURS) {
            return false;
        }
        event_id.map_or(true, |id| id == session.event_id)
    }
}

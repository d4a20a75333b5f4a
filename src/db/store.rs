//! SQLite settings store: target definitions and the event log.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::*;
use super::secret::{SecretCodec, SecretError};

refinery::embed_migrations!("migrations");

/// Default number of events returned by [`SettingsStore::list_events`].
pub const DEFAULT_EVENT_LIMIT: usize = 100;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Sink for lifecycle events.
///
/// Recording is best-effort: implementations swallow and log their own
/// failures.
pub trait EventRecorder: Send + Sync {
    fn record(&self, target_id: Option<&str>, kind: EventKind, message: &str);
}

/// Thread-safe settings store.
///
/// Writes go through a single writer connection and are serialized; reads
/// use a separate connection and see WAL snapshots, so they never wait on
/// a writer.
#[derive(Clone)]
pub struct SettingsStore {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
    codec: Arc<SecretCodec>,
}

impl SettingsStore {
    /// Open (or create) the store at the given file path.
    pub fn open<P: AsRef<Path>>(path: P, codec: SecretCodec) -> Result<Self, DbError> {
        let path = path.as_ref();

        let mut writer = Connection::open(path)?;
        writer.busy_timeout(Duration::from_secs(5))?;
        let mode: String = writer.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        tracing::debug!("Settings store journal mode: {}", mode);

        migrations::runner()
            .run(&mut writer)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        let reader = Connection::open(path)?;
        reader.busy_timeout(Duration::from_secs(5))?;

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
            codec: Arc::new(codec),
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.writer.lock().map_err(|_| DbError::Poisoned)
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.reader.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Definitions ---

    /// Add a new definition and record a `Connected` event.
    ///
    /// Returns false when the write fails (including a duplicate id).
    pub fn add_definition(&self, def: &DatabaseDefinition) -> bool {
        match self.try_add_definition(def) {
            Ok(()) => {
                self.append_event(
                    Some(&def.id),
                    EventKind::Connected,
                    &format!("Target '{}' added ({})", def.label, def.backend_type),
                );
                true
            }
            Err(e) => {
                tracing::error!(target_id = %def.id, "Failed to add definition: {}", e);
                false
            }
        }
    }

    fn try_add_definition(&self, def: &DatabaseDefinition) -> Result<(), DbError> {
        let encoded = self.codec.encode(&def.connection_secret)?;
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO targets (id, label, connectionSecret, backendType, lastKnownDbName, status, lastError, createdAt, updatedAt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                def.id,
                def.label,
                encoded,
                def.backend_type.as_str(),
                def.last_known_db_name,
                def.status,
                def.last_error,
                format_time(&def.created_at),
                format_time(&def.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Overwrite an existing definition. No event is recorded.
    pub fn update_definition(&self, id: &str, def: &DatabaseDefinition) -> bool {
        match self.try_update_definition(id, def) {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(target_id = %id, "Update skipped: definition not found");
                false
            }
            Err(e) => {
                tracing::error!(target_id = %id, "Failed to update definition: {}", e);
                false
            }
        }
    }

    fn try_update_definition(&self, id: &str, def: &DatabaseDefinition) -> Result<bool, DbError> {
        let encoded = self.codec.encode(&def.connection_secret)?;
        let conn = self.writer()?;
        let rows = conn.execute(
            "UPDATE targets SET label=?1, connectionSecret=?2, backendType=?3, lastKnownDbName=?4, status=?5, lastError=?6,
             updatedAt=?7 WHERE id=?8",
            params![
                def.label,
                encoded,
                def.backend_type.as_str(),
                def.last_known_db_name,
                def.status,
                def.last_error,
                format_time(&Utc::now()),
                id,
            ],
        )?;
        Ok(rows > 0)
    }

    /// Delete a definition and record a `Disconnected` event.
    ///
    /// Returns `Ok(false)` when no row matched, so of two concurrent removes
    /// exactly one sees `true`. The target's past events are kept until
    /// retention removes them.
    pub fn remove_definition(&self, id: &str) -> Result<bool, DbError> {
        let rows = {
            let conn = self.writer()?;
            conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?
        };

        if rows == 0 {
            tracing::debug!(target_id = %id, "Remove skipped: definition not found");
            return Ok(false);
        }

        self.append_event(Some(id), EventKind::Disconnected, "Target removed");
        Ok(true)
    }

    /// Record the outcome of the latest probe on a definition.
    ///
    /// `error` replaces the stored last error; `None` clears it.
    pub fn record_probe_outcome(&self, id: &str, status: &str, db_name: Option<&str>, error: Option<&str>) -> bool {
        let result = self.writer().and_then(|conn| {
            Ok(conn.execute(
                "UPDATE targets SET status=?1, lastKnownDbName=COALESCE(?2, lastKnownDbName), lastError=?3, updatedAt=?4
                 WHERE id=?5",
                params![status, db_name, error, format_time(&Utc::now()), id],
            )?)
        });

        match result {
            Ok(rows) => rows > 0,
            Err(e) => {
                tracing::error!(target_id = %id, "Failed to record probe outcome: {}", e);
                false
            }
        }
    }

    /// Get all definitions, newest first, with secrets decoded.
    ///
    /// Rows whose secret cannot be decoded are skipped.
    pub fn list_definitions(&self) -> Result<Vec<DatabaseDefinition>, DbError> {
        let rows = {
            let conn = self.reader()?;
            let mut stmt = conn.prepare(
                "SELECT id, label, connectionSecret, backendType, lastKnownDbName, status, createdAt, updatedAt, lastError
                 FROM targets ORDER BY createdAt DESC, id ASC",
            )?;
            let rows = stmt
                .query_map([], StoredDefinition::from_row)?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        let definitions = rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                match row.decode(&self.codec) {
                    Ok(def) => Some(def),
                    Err(e) => {
                        tracing::warn!(target_id = %id, "Skipping definition with undecodable secret: {}", e);
                        None
                    }
                }
            })
            .collect();

        Ok(definitions)
    }

    /// Get a definition by id, with its secret decoded.
    pub fn get_definition(&self, id: &str) -> Result<Option<DatabaseDefinition>, DbError> {
        let row = {
            let conn = self.reader()?;
            conn.query_row(
                "SELECT id, label, connectionSecret, backendType, lastKnownDbName, status, createdAt, updatedAt, lastError
                 FROM targets WHERE id = ?1",
                params![id],
                StoredDefinition::from_row,
            )
            .optional()?
        };

        match row {
            Some(row) => Ok(Some(row.decode(&self.codec)?)),
            None => Ok(None),
        }
    }

    // --- Events ---

    /// Append an event stamped with the current time. Failures are logged.
    pub fn append_event(&self, target_id: Option<&str>, kind: EventKind, message: &str) {
        if let Err(e) = self.append_event_at(target_id, kind, message, Utc::now()) {
            tracing::error!(
                target_id = target_id.unwrap_or("-"),
                kind = kind.as_str(),
                "Failed to append event: {}",
                e
            );
        }
    }

    /// Append an event with an explicit timestamp and return its id.
    pub fn append_event_at(
        &self,
        target_id: Option<&str>,
        kind: EventKind,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT INTO events (targetId, kind, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![target_id, kind.as_str(), message, format_time(&timestamp)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get events newest first, optionally for one target only.
    pub fn list_events(&self, target_id: Option<&str>, limit: usize) -> Result<Vec<Event>, DbError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, targetId, kind, message, timestamp FROM events
             WHERE (?1 IS NULL OR targetId = ?1)
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;

        let events = stmt
            .query_map(params![target_id, limit as i64], |row| {
                let time_str: String = row.get(4)?;
                Ok(Event {
                    id: row.get(0)?,
                    target_id: row.get(1)?,
                    kind: row.get(2)?,
                    message: row.get(3)?,
                    timestamp: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(events)
    }

    /// Delete events older than `horizon`. Returns the number of rows removed.
    pub fn sweep_expired_events(&self, horizon: Duration, batch_size: usize) -> Result<usize, DbError> {
        let horizon = ChronoDuration::from_std(horizon).unwrap_or_else(|_| ChronoDuration::days(1));
        self.delete_events_before(Utc::now() - horizon, batch_size)
    }

    /// Delete events stamped before `cutoff`, at most `batch_size` rows per
    /// transaction. The writer lock is released between batches.
    pub fn delete_events_before(&self, cutoff: DateTime<Utc>, batch_size: usize) -> Result<usize, DbError> {
        let batch_size = batch_size.max(1);
        let cutoff = format_time(&cutoff);
        let mut total = 0;

        loop {
            let deleted = {
                let conn = self.writer()?;
                let tx = conn.unchecked_transaction()?;
                let deleted = tx.execute(
                    "DELETE FROM events WHERE id IN
                     (SELECT id FROM events WHERE timestamp < ?1 ORDER BY id LIMIT ?2)",
                    params![cutoff, batch_size as i64],
                )?;
                tx.commit()?;
                deleted
            };

            total += deleted;
            if deleted < batch_size {
                break;
            }
        }

        Ok(total)
    }
}

impl EventRecorder for SettingsStore {
    fn record(&self, target_id: Option<&str>, kind: EventKind, message: &str) {
        self.append_event(target_id, kind, message);
    }
}

/// A `targets` row before its secret is decoded.
struct StoredDefinition {
    id: String,
    label: String,
    encoded_secret: String,
    backend_type: BackendType,
    last_known_db_name: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
    last_error: Option<String>,
}

impl StoredDefinition {
    fn from_row(row: &rusqlite::Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            label: row.get(1)?,
            encoded_secret: row.get(2)?,
            backend_type: row.get(3)?,
            last_known_db_name: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            last_error: row.get(8)?,
        })
    }

    fn decode(self, codec: &SecretCodec) -> Result<DatabaseDefinition, SecretError> {
        let connection_secret = codec.decode(&self.encoded_secret)?;
        Ok(DatabaseDefinition {
            id: self.id,
            label: self.label,
            connection_secret,
            backend_type: self.backend_type,
            last_known_db_name: self.last_known_db_name,
            status: self.status,
            last_error: self.last_error,
            created_at: parse_db_time(&self.created_at).unwrap_or_else(Utc::now),
            updated_at: parse_db_time(&self.updated_at).unwrap_or_else(Utc::now),
        })
    }
}

impl FromSql for BackendType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl FromSql for EventKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use stepgraph_core::error::{Result, StepgraphError};
use stepgraph_core::traits::HistoryStore;
use stepgraph_core::types::HistoryEntry;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS conversation_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        thread_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        user_input TEXT NOT NULL,
        agent_response TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_conversation_thread
        ON conversation_log(thread_id, id);";

fn db_err(e: impl std::fmt::Display) -> StepgraphError {
    StepgraphError::Database(e.to_string())
}

/// SQLite-backed per-thread conversation log.
pub struct SqliteHistory {
    conn: Mutex<Connection>,
}

impl SqliteHistory {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StepgraphError::Database(format!("Failed to create db directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Conversation log opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// `":memory:"` selects an in-memory database, anything else a file.
    pub fn from_location(location: &str) -> Result<Self> {
        if location == ":memory:" {
            Self::in_memory()
        } else {
            Self::open(Path::new(location))
        }
    }
}

impl HistoryStore for SqliteHistory {
    fn append(
        &self,
        thread_id: &str,
        user_input: &str,
        agent_response: Option<&str>,
    ) -> BoxFuture<'_, Result<()>> {
        let thread_id = thread_id.to_string();
        let user_input = user_input.to_string();
        let agent_response = agent_response.map(str::to_string);
        let timestamp = Utc::now().to_rfc3339();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO conversation_log (thread_id, timestamp, user_input, agent_response)
                 VALUES (?1, ?2, ?3, ?4)",
                params![thread_id, timestamp, user_input, agent_response],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load(&self, thread_id: &str, limit: usize) -> BoxFuture<'_, Result<Vec<HistoryEntry>>> {
        let thread_id = thread_id.to_string();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;

            // Newest `limit` rows, flipped back to chronological order.
            let mut stmt = conn
                .prepare(
                    "SELECT id, thread_id, timestamp, user_input, agent_response
                     FROM (
                         SELECT * FROM conversation_log
                         WHERE thread_id = ?1
                         ORDER BY id DESC
                         LIMIT ?2
                     )
                     ORDER BY id ASC",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![thread_id, limit as i64], |row| {
                    let ts_str: String = row.get(2)?;
                    let timestamp = DateTime::parse_from_rfc3339(&ts_str)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                        })?;
                    Ok(HistoryEntry {
                        id: row.get(0)?,
                        thread_id: row.get(1)?,
                        timestamp,
                        user_input: row.get(3)?,
                        agent_response: row.get(4)?,
                    })
                })
                .map_err(db_err)?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(db_err)?);
            }
            Ok(entries)
        })
    }
}

//! SQLite persistence for the registry and project contexts.

mod projects;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, Row, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::error::{Result, VdwError};
use schema::{LEDGER_SCHEMA, MIGRATIONS, SCHEMA_VERSION};

/// Write transactions retry this many times while the file is busy or locked.
const MAX_WRITE_ATTEMPTS: u32 = 5;
const BUSY_BACKOFF: Duration = Duration::from_millis(20);

/// Cloneable handle to one SQLite connection.
///
/// All access goes through the inner mutex, so writes from concurrent callers
/// in this process are serialized; busy errors from other processes are
/// retried by [`Database::with_transaction`].
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens the database in the platform data directory, creating it if needed.
    pub fn open_default() -> anyhow::Result<Self> {
        let path = Self::default_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(path = %path.display(), "opening registry database");
        Ok(Self::open(&path)?)
    }

    pub fn default_path() -> anyhow::Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "vdw", "vdw")
            .ok_or_else(|| anyhow::anyhow!("could not resolve a data directory"))?;
        Ok(dirs.data_dir().join("vdw.db"))
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(Duration::from_millis(250))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Applies every migration newer than the stored schema version.
    /// Returns the schema version after the call.
    pub fn migrate(&self) -> Result<u32> {
        self.with_transaction(|tx| {
            tx.execute_batch(LEDGER_SCHEMA)?;
            let current: u32 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
            if current > SCHEMA_VERSION {
                return Err(VdwError::Validation(format!(
                    "database schema version {current} is newer than supported version {SCHEMA_VERSION}"
                )));
            }

            for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
                tx.execute_batch(migration.sql)?;
                tx.execute(
                    "INSERT INTO migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                    params![migration.version, migration.description, Utc::now().to_rfc3339()],
                )?;
                tx.pragma_update(None, "user_version", migration.version)?;
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applied migration"
                );
            }

            Ok(current.max(SCHEMA_VERSION))
        })
    }

    pub fn schema_version(&self) -> Result<u32> {
        self.with_connection(|conn| Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?))
    }

    /// Ledger rows as `(version, description)`, oldest first.
    pub fn applied_migrations(&self) -> Result<Vec<(u32, String)>> {
        self.with_connection(|conn| {
            let mut stmt =
                conn.prepare("SELECT version, description FROM migrations ORDER BY version")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }

    /// Runs `f` inside an IMMEDIATE transaction and commits if it returns `Ok`.
    ///
    /// Any error rolls the transaction back, so callers get all-or-nothing
    /// writes. Busy and locked failures are retried with a short backoff.
    pub fn with_transaction<T>(&self, mut f: impl FnMut(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let outcome = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(VdwError::from)
                .and_then(|tx| {
                    let value = f(&tx)?;
                    tx.commit()?;
                    Ok(value)
                });

            match outcome {
                Err(err) if is_busy(&err) => {
                    warn!(attempt, "database busy, retrying write");
                    std::thread::sleep(BUSY_BACKOFF * attempt);
                }
                other => return other,
            }
        }

        Err(VdwError::Concurrency {
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }
}

fn is_busy(err: &VdwError) -> bool {
    matches!(
        err,
        VdwError::Database(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

pub(crate) fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(idx, &raw)
}

pub(crate) fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| parse_timestamp(idx, &raw)).transpose()
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        serde_json::from_str::<serde_json::Value>(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

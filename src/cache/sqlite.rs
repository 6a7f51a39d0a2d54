use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::ffi::ErrorCode;
use rusqlite::{params, Connection, Error as SqliteError, OpenFlags, OptionalExtension};
use tracing::{info, warn};

use super::{move_aside, ResolutionCache};
use crate::errors::{AppError, AppResult};
use crate::resolution::{CacheEntry, FAILED_METHOD};

/// Cache table in a local SQLite file, one row per query.
pub struct SqliteCache {
    connection: Mutex<Connection>,
    path: PathBuf,
    recovered: bool,
}

impl SqliteCache {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match establish(&path) {
            Ok(connection) => {
                info!(
                    target: "geocode_cache",
                    path = %path.display(),
                    "sqlite geocode cache ready"
                );
                Ok(Self {
                    connection: Mutex::new(connection),
                    path,
                    recovered: false,
                })
            }
            Err(err) if should_attempt_recovery(&err, &path) => {
                warn!(
                    target: "geocode_cache",
                    path = %path.display(),
                    error = %err,
                    "sqlite geocode cache unreadable; starting with an empty cache"
                );
                let connection = match move_aside(&path) {
                    Some(quarantined) => {
                        info!(
                            target: "geocode_cache",
                            quarantined = %quarantined.display(),
                            "corrupt cache kept for inspection"
                        );
                        remove_if_exists(&sidecar_path(&path, "wal"))?;
                        remove_if_exists(&sidecar_path(&path, "shm"))?;
                        establish(&path)?
                    }
                    None => {
                        warn!(
                            target: "geocode_cache",
                            path = %path.display(),
                            "keeping this run's cache in memory"
                        );
                        prepare(Connection::open_in_memory()?)?
                    }
                };
                Ok(Self {
                    connection: Mutex::new(connection),
                    path,
                    recovered: true,
                })
            }
            Err(err) => Err(err),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

impl ResolutionCache for SqliteCache {
    fn get(&self, query: &str) -> AppResult<Option<CacheEntry>> {
        let connection = self.connection.lock();
        let raw: Option<String> = connection
            .query_row(
                "SELECT entry_json FROM geocode_cache WHERE query = ?1",
                [query],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(AppError::from))
            .transpose()
    }

    fn put(&self, query: &str, entry: &CacheEntry) -> AppResult<()> {
        let entry_json = serde_json::to_string(entry)?;
        self.connection.lock().execute(
            "INSERT INTO geocode_cache (query, entry_json, method, created_at)
             VALUES (?1, ?2, ?3, DATETIME('now'))
             ON CONFLICT(query) DO UPDATE SET
                entry_json = excluded.entry_json,
                method = excluded.method,
                created_at = excluded.created_at",
            params![query, entry_json, entry.method()],
        )?;
        Ok(())
    }

    fn invalidate(&self, query: &str) -> AppResult<bool> {
        let removed = self
            .connection
            .lock()
            .execute("DELETE FROM geocode_cache WHERE query = ?1", [query])?;
        Ok(removed > 0)
    }

    fn invalidate_failures(&self) -> AppResult<usize> {
        let removed = self.connection.lock().execute(
            "DELETE FROM geocode_cache WHERE method = ?1",
            [FAILED_METHOD],
        )?;
        if removed > 0 {
            info!(target: "geocode_cache", removed, "invalidated cached failures");
        }
        Ok(removed)
    }

    fn len(&self) -> AppResult<usize> {
        let count: i64 =
            self.connection
                .lock()
                .query_row("SELECT COUNT(*) FROM geocode_cache", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

fn establish(path: &Path) -> AppResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    prepare(Connection::open_with_flags(path, flags)?)
}

fn prepare(connection: Connection) -> AppResult<Connection> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS geocode_cache (
            query TEXT PRIMARY KEY,
            entry_json TEXT NOT NULL,
            method TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_geocode_cache_method ON geocode_cache(method);
        "#,
    )?;
    verify_entries(&connection)?;
    Ok(connection)
}

/// Decodes every stored entry so a damaged cache is caught at open rather
/// than halfway through a batch.
fn verify_entries(connection: &Connection) -> AppResult<()> {
    let mut stmt = connection.prepare("SELECT entry_json FROM geocode_cache")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let raw: String = row.get(0)?;
        serde_json::from_str::<CacheEntry>(&raw)?;
    }
    Ok(())
}

fn should_attempt_recovery(err: &AppError, path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    match err {
        AppError::Json(_) => true,
        AppError::Database(SqliteError::SqliteFailure(code, message)) => {
            matches!(code.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
                || message
                    .as_deref()
                    .map(|msg| msg.contains("database disk image is malformed"))
                    .unwrap_or(false)
        }
        _ => false,
    }
}

fn remove_if_exists(path: &Path) -> AppResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AppError::Io(err)),
    }
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{name}-{suffix}"))
}

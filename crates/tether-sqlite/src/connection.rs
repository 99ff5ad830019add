use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rusqlite::Connection;
use tether_core::DatabaseConfig;
use tether_lease::{Resource, ResourceError, ResourceFactory};
use tracing::debug;

use crate::error::{Result, SqliteError};

/// Opens the SQLite database named in `[database]`.
#[derive(Debug, Clone)]
pub struct SqliteFactory {
    path: String,
    busy_timeout: Duration,
}

impl SqliteFactory {
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            path: config.path.clone(),
            busy_timeout: config.busy_timeout(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl ResourceFactory for SqliteFactory {
    type Resource = SqliteConnection;

    fn open(&self) -> std::result::Result<SqliteConnection, ResourceError> {
        ensure_parent_dir(&self.path);
        let conn = open_connection(&self.path, self.busy_timeout)
            .map_err(|e| ResourceError::Open(e.to_string()))?;
        debug!(path = %self.path, "sqlite connection ready");
        Ok(SqliteConnection {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn describe(&self) -> String {
        format!("sqlite://{}", self.path)
    }
}

fn open_connection(path: &str, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

/// The one connection shared by every reservation holder.
///
/// Statements are serialized through an internal mutex. Once closed, every
/// call reports [`SqliteError::Closed`].
pub struct SqliteConnection {
    conn: Mutex<Option<Connection>>,
}

impl SqliteConnection {
    pub fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard.as_ref().ok_or(SqliteError::Closed)?;
        Ok(f(conn)?)
    }

    pub fn is_closed(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Resource for SqliteConnection {
    fn close(&self) -> std::result::Result<(), ResourceError> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match conn {
            Some(conn) => conn
                .close()
                .map_err(|(_, e)| ResourceError::Close(e.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::LeaseConfig;
    use tether_lease::{ReservationRegistry, WorkRunner};

    fn factory(dir: &tempfile::TempDir) -> SqliteFactory {
        let path = dir.path().join("nested").join("tether.db");
        SqliteFactory::from_config(&DatabaseConfig {
            path: path.to_string_lossy().into_owned(),
            busy_timeout_ms: 1_000,
        })
    }

    #[test]
    fn open_creates_parent_dir_and_applies_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(&dir);
        let conn = factory.open().unwrap();

        assert!(dir.path().join("nested").is_dir());
        let mode: String = conn
            .with_conn(|c| c.query_row("PRAGMA journal_mode", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let fk: i64 = conn
            .with_conn(|c| c.query_row("PRAGMA foreign_keys", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(fk, 1);
        assert!(factory.describe().starts_with("sqlite://"));
    }

    #[test]
    fn closed_connection_reports_closed() {
        let dir = tempfile::tempdir().unwrap();
        let conn = factory(&dir).open().unwrap();
        conn.close().unwrap();

        assert!(conn.is_closed());
        let err = conn.with_conn(|c| c.execute_batch("SELECT 1")).unwrap_err();
        assert!(matches!(err, SqliteError::Closed));
        // Closing again is harmless.
        conn.close().unwrap();
    }

    #[test]
    fn unopenable_path_is_an_open_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a database file.
        let factory = SqliteFactory::from_config(&DatabaseConfig {
            path: dir.path().to_string_lossy().into_owned(),
            busy_timeout_ms: 1_000,
        });
        assert!(matches!(factory.open(), Err(ResourceError::Open(_))));
    }

    #[tokio::test]
    async fn runner_tasks_share_one_connection() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ReservationRegistry::new(factory(&dir), &LeaseConfig::default());
        let runner = WorkRunner::new(registry.clone());

        runner
            .submit_blocking(|ctx| {
                ctx.resource().with_conn(|c| {
                    c.execute_batch("CREATE TABLE IF NOT EXISTS hits (n INTEGER NOT NULL)")
                })
            })
            .await
            .unwrap();

        let inserts: Vec<_> = (0..5)
            .map(|n| {
                runner.submit_blocking(move |ctx| {
                    ctx.resource()
                        .with_conn(|c| c.execute("INSERT INTO hits (n) VALUES (?1)", [n]))
                })
            })
            .collect();
        for insert in inserts {
            insert.await.unwrap();
        }

        let count: i64 = runner
            .submit_blocking(|ctx| {
                ctx.resource()
                    .with_conn(|c| c.query_row("SELECT COUNT(*) FROM hits", [], |r| r.get(0)))
            })
            .await
            .unwrap();
        assert_eq!(count, 5);
        assert_eq!(registry.status().opens, 1);

        let report = runner.cancel_all().await;
        assert!(report.resource_closed);
        assert!(report.close_error.is_none());
    }
}

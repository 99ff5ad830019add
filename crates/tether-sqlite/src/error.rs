use thiserror::Error;

/// Errors raised while running statements on the shared connection.
#[derive(Debug, Error)]
pub enum SqliteError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The connection was closed (evicted or force-reset) before this call.
    #[error("Connection is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SqliteError>;

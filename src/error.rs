use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Upstream returned HTTP {status} for {url}")]
    Upstream { status: u16, url: String },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Circuit breaker open, call rejected")]
    CircuitOpen,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{failed_chunks} write chunks failed for event {event_id}")]
    PartialWrite { event_id: i64, failed_chunks: usize },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bootstrap error: {0}")]
    Bootstrap(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Network-level or server-side failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Upstream { status, .. } => *status >= 500 || *status == 429,
            AppError::Transport(_) | AppError::Timeout(_) => true,
            AppError::Database(e) => !matches!(
                e,
                sqlx::Error::RowNotFound | sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. }
            ),
            _ => false,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::CircuitOpen | AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

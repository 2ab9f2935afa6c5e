use thiserror::Error;

/// Errors raised by the domain modules (seed, migrate, notify, schedule).
///
/// IPC handlers turn these into `{code, message}` envelopes; see
/// `ipc::helpers::HandlerErr`.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Invalid(String),
}

impl PortalError {
    pub fn code(&self) -> &'static str {
        match self {
            PortalError::Db(_) => "db_query_failed",
            PortalError::Io(_) => "io_failed",
            PortalError::Json(_) => "bad_json",
            PortalError::NotFound(_) => "not_found",
            PortalError::Forbidden(_) => "forbidden",
            PortalError::Invalid(_) => "bad_params",
        }
    }
}

pub type PortalResult<T> = Result<T, PortalError>;

use thiserror::Error;

/// Result alias used by every marketplace operation.
pub type MarketResult<T> = Result<T, MarketError>;

/// Failures surfaced to callers of the marketplace core.
///
/// Everything except `Unavailable` and `Internal` describes a problem with the
/// request itself and is safe to report back to the user. `Unavailable` means
/// the store could not be reached and nothing was committed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarketError {
    /// A unique constraint (username, email) rejected the write.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The referenced user, listing or message does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("users cannot review themselves")]
    SelfReview,

    /// The actor has no rights over the target record.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The purchase asked for more units than the listing has left.
    #[error("insufficient inventory: requested {requested}, available {available}")]
    InsufficientInventory { requested: i64, available: i64 },

    /// Durable storage could not be reached; the operation was rolled back.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MarketError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// True for failures a caller may retry with the same transaction token.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::InsufficientInventory { .. }
        )
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for MarketError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        use rusqlite::ffi;

        match &err {
            rusqlite::Error::SqliteFailure(e, msg) => {
                let detail = msg.clone().unwrap_or_else(|| e.to_string());
                match e.code {
                    ErrorCode::ConstraintViolation
                        if e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                            || e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                    {
                        Self::DuplicateKey(detail)
                    }
                    ErrorCode::ConstraintViolation => Self::InvalidArgument(detail),
                    ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::NotADatabase
                    | ErrorCode::ReadOnly => Self::Unavailable(detail),
                    _ => Self::Internal(detail),
                }
            }
            _ => Self::Internal(err.to_string()),
        }
    }
}

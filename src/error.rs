//! Task failure taxonomy.
//!
//! Handlers return `anyhow::Result`; the executor walks the error chain and
//! classifies the failure by the category of the errors it finds, never by
//! message text.

use thiserror::Error;

/// Failure categories raised by handlers and providers.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("no handler registered for task kind '{0}'")]
    UnknownKind(String),

    #[error("provider error: {0}")]
    Provider(String),
}

impl TaskError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        TaskError::NotFound { entity, id }
    }
}

/// How the executor reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff until retries are exhausted.
    Transient,
    /// Moved straight to the dead-letter state.
    Permanent,
}

/// Classify a handler failure by the first recognised error in its chain.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(task_err) = cause.downcast_ref::<TaskError>() {
            return match task_err {
                TaskError::Timeout(_) | TaskError::Connection(_) | TaskError::Io(_) => {
                    ErrorClass::Transient
                }
                _ => ErrorClass::Permanent,
            };
        }

        if cause.downcast_ref::<std::io::Error>().is_some() {
            return ErrorClass::Transient;
        }

        if let Some(sql_err) = cause.downcast_ref::<rusqlite::Error>() {
            return if is_busy(sql_err) {
                ErrorClass::Transient
            } else {
                ErrorClass::Permanent
            };
        }

        if let Some(http_err) = cause.downcast_ref::<ureq::Error>() {
            return match http_err {
                ureq::Error::Status(code, _) if *code != 429 && *code < 500 => {
                    ErrorClass::Permanent
                }
                _ => ErrorClass::Transient,
            };
        }

        if let Some(img_err) = cause.downcast_ref::<image::ImageError>() {
            return match img_err {
                image::ImageError::IoError(_) => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            };
        }
    }

    ErrorClass::Permanent
}

/// Lock contention on the store is a transient condition.
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Map a `ureq` failure onto the task taxonomy.
///
/// Transport failures and 429/5xx responses are connection-class; other HTTP
/// statuses mean the request itself was rejected.
pub fn from_http(err: ureq::Error) -> TaskError {
    match err {
        ureq::Error::Status(code, response) if code == 429 || code >= 500 => {
            TaskError::Connection(format!("{} returned {}", response.get_url(), code))
        }
        ureq::Error::Status(code, response) => {
            TaskError::Provider(format!("{} returned {}", response.get_url(), code))
        }
        ureq::Error::Transport(transport) => {
            if transport.kind() == ureq::ErrorKind::Io {
                TaskError::Timeout(transport.to_string())
            } else {
                TaskError::Connection(transport.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_io_errors_are_transient() {
        let err = anyhow::Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(classify(&err), ErrorClass::Transient);
    }

    #[test]
    fn test_context_does_not_hide_category() {
        let result: anyhow::Result<()> = Err(TaskError::Timeout("caption".into()))
            .context("Failed to caption asset 4");
        assert_eq!(classify(&result.unwrap_err()), ErrorClass::Transient);
    }

    #[test]
    fn test_missing_entity_is_permanent() {
        let err = anyhow::Error::from(TaskError::not_found("asset", 12));
        assert_eq!(classify(&err), ErrorClass::Permanent);
        assert_eq!(err.to_string(), "asset 12 not found");
    }

    #[test]
    fn test_unrecognised_errors_are_permanent() {
        let err = anyhow::anyhow!("timeout while connecting");
        assert_eq!(classify(&err), ErrorClass::Permanent);
    }

    #[test]
    fn test_sqlite_busy_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert_eq!(classify(&anyhow::Error::from(busy)), ErrorClass::Transient);

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert_eq!(
            classify(&anyhow::Error::from(constraint)),
            ErrorClass::Permanent
        );
    }
}

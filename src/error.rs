//! Error types shared by the storage services and the task layer

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use thiserror::Error;

use crate::table::entity::EntityError;
use crate::table::query::QueryError;

/// Result type returned by every storage service call.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors reported by a storage service backend.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Failures a retry policy is allowed to retry (busy database, interrupted IO, ...).
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transient(_))
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                ServiceError::Transient(err.to_string())
            }
            _ => ServiceError::Backend(err.to_string()),
        }
    }
}

impl From<io::Error> for ServiceError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ServiceError::NotFound(err.to_string()),
            io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                ServiceError::Transient(err.to_string())
            }
            _ => ServiceError::Backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Backend(format!("corrupt stored record: {}", err))
    }
}

/// Queue of errors a mock backend returns before serving calls normally.
#[derive(Debug, Default)]
pub struct InjectedFailures {
    pending: Mutex<VecDeque<ServiceError>>,
}

impl InjectedFailures {
    pub fn push(&self, error: ServiceError) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(error);
        }
    }

    /// Fails the current call when an injected error is pending.
    pub fn check(&self) -> ServiceResult<()> {
        match self.pending.lock().ok().and_then(|mut p| p.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Errors that make a task invocation fail.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Please provide at least a {0} parameter")]
    MissingParameter(&'static str),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("action failed: {0}")]
    Action(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid task options: {0}")]
    Options(#[from] serde_json::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("unknown task: {0}")]
    UnknownTask(String),
}

impl TaskError {
    /// Create an Io error tagged with the path it happened on.
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

use std::path::PathBuf;

use thiserror::Error;

/// The abstract error kinds of the caching bridge (see spec §7).
///
/// Protocol-specific status mapping happens above this crate; these
/// variants are what every component in the core agrees on.
#[derive(Debug, Error)]
pub enum RqError {
    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    #[error("invalid name: {name}")]
    InvalidName { name: String },

    #[error("not supported: {what}")]
    NotSupported { what: String },

    #[error("transport error talking to remote: {source}")]
    Transport {
        #[source]
        source: anyhow::Error,
    },

    #[error("remote returned status {status}: {message}")]
    RemoteStatus { status: u16, message: String },

    #[error("local I/O failure at {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("internal invariant violated: {detail}")]
    InternalInvariant { detail: String },
}

impl RqError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName { name: name.into() }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::InternalInvariant {
            detail: detail.into(),
        }
    }

    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LocalIo {
            path: path.into(),
            source,
        }
    }

    pub fn transport(source: impl Into<anyhow::Error>) -> Self {
        Self::Transport {
            source: source.into(),
        }
    }

    /// Whether the Processor should retry this failure rather than purge immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            RqError::Transport { .. } => true,
            RqError::RemoteStatus { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}

pub type RqResult<T> = Result<T, RqError>;

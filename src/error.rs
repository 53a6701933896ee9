//! Error types for the session controller and the sandbox capability.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced to callers of the session controller.
///
/// `Clone` because one initialization outcome is shared by every caller that
/// joined it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("sandbox environment not initialized")]
    NotInitialized,

    #[error("sandbox was already booted in this page lifetime")]
    AlreadyBooted,

    #[error("dependency installation exited with code {code}")]
    InstallFailed { code: i32 },

    #[error("dependency installation already in progress")]
    InstallInProgress,

    #[error("failed to spawn `{command}`: {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("failed to boot sandbox: {0}")]
    BootFailed(String),

    #[error("failed to mount file tree: {0}")]
    MountFailed(String),

    #[error("timed out waiting for disposal to finish")]
    DisposalTimeout,

    #[error("process error: {0}")]
    Process(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Errors reported by a sandbox implementation.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path segment: {0:?}")]
    InvalidPath(String),

    #[error("no such process: {0}")]
    ProcessNotFound(u32),

    #[error("spawn: {0}")]
    Spawn(String),

    #[error("environment closed")]
    Closed,
}

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

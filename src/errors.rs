//! Typed error hierarchy for the slipway worker.
//!
//! One enum per subsystem:
//! - `DockerError`: container daemon calls
//! - `CloneError`: repository cloning
//! - `BuildError`: image builds
//! - `PersistError`: artifact export, upload and download
//! - `PipelineError`: build pipeline stages
//! - `DeployError`: stack provisioning and teardown
//! - `StatusError`: Assembly status writes
//!
//! Pipeline and deploy errors map to the terminal Assembly status a failed
//! run records.

use std::path::PathBuf;

use slipway_common::AssemblyStatus;
use thiserror::Error;

/// Errors from the container daemon.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Failed to connect to container daemon: {0}")]
    Connect(String),

    #[error("Container daemon {op} failed: {message}")]
    Api { op: &'static str, message: String },

    #[error("Container daemon {op} timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DockerError {
    pub fn api(op: &'static str, message: impl ToString) -> Self {
        Self::Api {
            op,
            message: message.to_string(),
        }
    }

    /// Daemon hiccups and local I/O errors are worth another attempt; timeouts
    /// are not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Timeout { .. })
    }
}

/// Errors from the repository cloner.
#[derive(Debug, Error)]
pub enum CloneError {
    #[error("No commit SHA produced after {attempts} attempts: {last_error}")]
    NoCommitSha { attempts: u32, last_error: String },

    #[error("Clone destination {path} is unusable: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the image builder.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Image build for {tag} failed: {message}")]
    Failed { tag: String, message: String },

    #[error("Image build for {tag} timed out after {secs}s")]
    TimedOut { tag: String, secs: u64 },

    #[error("Failed to prepare build context {path}: {source}")]
    Context {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the artifact persister.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Artifact {path} is {size} bytes, at or above the {limit}-byte ceiling")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Only {available} bytes free under {path}, need at least {required}")]
    InsufficientSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("Download of {object} interrupted {resumes} times, giving up")]
    ResumesExhausted { object: String, resumes: u32 },

    #[error("Blob store {op} failed: {message}")]
    BlobStore { op: &'static str, message: String },

    #[error("Operation not supported by the {backend} backend: {op}")]
    Unsupported {
        backend: &'static str,
        op: &'static str,
    },

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PersistError {
    pub fn blob(op: &'static str, message: impl ToString) -> Self {
        Self::BlobStore {
            op,
            message: message.to_string(),
        }
    }
}

/// Errors from a guarded Assembly status write.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Assembly {id} not found")]
    NotFound { id: i64 },

    #[error("Assembly {id} is being deleted")]
    Deleting { id: i64 },

    #[error("Assembly {id} cannot move from {from} to {to}")]
    Backwards {
        id: i64,
        from: AssemblyStatus,
        to: AssemblyStatus,
    },

    #[error("Metadata store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors from the build pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Assembly {id} not found")]
    AssemblyNotFound { id: i64 },

    #[error("Image {id} not found")]
    ImageNotFound { id: i64 },

    #[error("Language pack {id} is not usable: {reason}")]
    LanguagePackUnusable { id: i64, reason: String },

    /// Another actor started deleting the Assembly; the run stops quietly.
    #[error("Assembly {id} is being deleted")]
    Deleting { id: i64 },

    #[error("Unit tests timed out after {secs}s")]
    UnitTestTimedOut { secs: u64 },

    #[error("Working directory {path} unusable: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Clone(#[from] CloneError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("Metadata store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl PipelineError {
    /// Status to record for a run that ended with this error, or `None` when
    /// nothing must be written.
    pub fn terminal_status(&self) -> Option<AssemblyStatus> {
        match self {
            Self::Deleting { .. } => None,
            _ => Some(AssemblyStatus::Error),
        }
    }
}

impl From<StatusError> for PipelineError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::NotFound { id } => Self::AssemblyNotFound { id },
            StatusError::Deleting { id } => Self::Deleting { id },
            StatusError::Store(e) => Self::Store(e),
            other => Self::Store(anyhow::anyhow!(other.to_string())),
        }
    }
}

/// Errors from the deployment engine.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Assembly {id} not found")]
    AssemblyNotFound { id: i64 },

    #[error("No deploy strategy for image format '{format}' with storage backend '{backend}'")]
    UnsupportedStrategy { format: String, backend: String },

    #[error("Network lookup failed: {0}")]
    Network(String),

    #[error("Stack {stack} failed: {reason}")]
    StackFailed { stack: String, reason: String },

    #[error("Stack {stack} not ready after {attempts} polls")]
    StackTimedOut { stack: String, attempts: u32 },

    #[error("Stack {stack} has no usable outputs: {reason}")]
    BadOutputs { stack: String, reason: String },

    #[error("Stack {stack} could not be deleted: {reason}")]
    StackDeleteFailed { stack: String, reason: String },

    #[error("Application at {address} unreachable after {attempts} probes")]
    AppUnreachable { address: String, attempts: u32 },

    #[error("Orchestration service {op} failed: {message}")]
    Orchestration { op: &'static str, message: String },

    #[error("Assembly {id} is being deleted")]
    Deleting { id: i64 },

    #[error("Job log unavailable: {0}")]
    JobLog(#[source] anyhow::Error),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("Metadata store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl DeployError {
    pub fn orchestration(op: &'static str, message: impl ToString) -> Self {
        Self::Orchestration {
            op,
            message: message.to_string(),
        }
    }

    /// Status to record for a deploy that ended with this error.
    pub fn terminal_status(&self) -> Option<AssemblyStatus> {
        match self {
            Self::Deleting { .. } | Self::AssemblyNotFound { .. } => None,
            Self::StackFailed { .. } | Self::StackTimedOut { .. } | Self::BadOutputs { .. } => {
                Some(AssemblyStatus::ErrorStackCreateFailed)
            }
            Self::StackDeleteFailed { .. } => Some(AssemblyStatus::ErrorStackDeleteFailed),
            Self::AppUnreachable { .. } => Some(AssemblyStatus::ErrorCodeDeployment),
            _ => Some(AssemblyStatus::Error),
        }
    }
}

impl From<StatusError> for DeployError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::NotFound { id } => Self::AssemblyNotFound { id },
            StatusError::Deleting { id } => Self::Deleting { id },
            StatusError::Store(e) => Self::Store(e),
            other => Self::Store(anyhow::anyhow!(other.to_string())),
        }
    }
}

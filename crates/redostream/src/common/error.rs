//! Error types for the replication engine.
//!
//! Every failure carries a stable numeric code so operators can grep logs
//! and alerting rules survive message rewording. Code ranges:
//!
//! - `10xxx` runtime (I/O, allocation, connections)
//! - `20xxx` file parse errors (configuration, state, checkpoint)
//! - `30xxx` configuration value errors
//! - `40xxx` data errors (degraded output, never fatal alone)
//! - `50xxx` redo-stream structural errors (fatal)
//! - `60xxx` warnings reported alongside degraded frames

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories, used for routing and shutdown policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad configuration: fatal at startup, non-zero exit.
    Configuration,
    /// Malformed input data: the affected frame degrades, processing goes on.
    Data,
    /// Structural inconsistency in the redo stream: fatal.
    Redo,
    /// Environment failures (I/O, allocation, sinks): retried or escalated
    /// to soft shutdown.
    Runtime,
    /// Not a failure: a blocked wait was interrupted by shutdown.
    Shutdown,
}

/// Engine errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration value or combination.
    #[error("configuration error [{code}]: {message}")]
    Config { code: u32, message: String },

    /// Malformed input that degrades a single record or column.
    #[error("data error [{code}]: {message}")]
    Data { code: u32, message: String },

    /// Structural inconsistency in the redo stream.
    #[error("redo error [{code}]: {message}")]
    Redo { code: u32, message: String },

    /// Environment failure.
    #[error("runtime error [{code}]: {message}")]
    Runtime { code: u32, message: String },

    /// I/O failure with the file or socket it concerns.
    #[error("runtime error [{code}]: {context}: {source}")]
    Io {
        code: u32,
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization failure.
    #[error("parse error [20001]: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocked wait observed shutdown. Not an error; lets threads unwind.
    #[error("shutdown signaled")]
    Shutdown,
}

impl Error {
    pub fn config(code: u32, message: impl Into<String>) -> Self {
        Self::Config { code, message: message.into() }
    }

    pub fn data(code: u32, message: impl Into<String>) -> Self {
        Self::Data { code, message: message.into() }
    }

    pub fn redo(code: u32, message: impl Into<String>) -> Self {
        Self::Redo { code, message: message.into() }
    }

    pub fn runtime(code: u32, message: impl Into<String>) -> Self {
        Self::Runtime { code, message: message.into() }
    }

    pub fn io(code: u32, context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { code, context: context.into(), source }
    }

    /// The stable numeric code for logs and alerting.
    pub fn code(&self) -> u32 {
        match self {
            Self::Config { code, .. }
            | Self::Data { code, .. }
            | Self::Redo { code, .. }
            | Self::Runtime { code, .. }
            | Self::Io { code, .. } => *code,
            Self::Json(_) => 20001,
            Self::Shutdown => 10018,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config { .. } => ErrorCategory::Configuration,
            Self::Data { .. } | Self::Json(_) => ErrorCategory::Data,
            Self::Redo { .. } => ErrorCategory::Redo,
            Self::Runtime { .. } | Self::Io { .. } => ErrorCategory::Runtime,
            Self::Shutdown => ErrorCategory::Shutdown,
        }
    }

    /// Whether a worker hitting this error must ask for process shutdown.
    ///
    /// Data errors degrade output but never take the process down on their
    /// own; shutdown signals are the exit path itself.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Data | ErrorCategory::Shutdown)
    }

    /// Whether a component that opts into retry may retry this error.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Io { source, .. } => {
                use std::io::ErrorKind;
                matches!(
                    source.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                        | ErrorKind::WouldBlock
                )
            }
            Self::Runtime { .. } => false,
            _ => false,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the agent.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Timeline error: {0}")]
    Timeline(#[from] TimelineError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed timelines and ad-hoc commands.
#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    #[error("Failed to read timeline {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write timeline {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed timeline document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Empty command")]
    Empty,

    #[error("Invalid time of day '{0}' (expected HH:MM[:SS])")]
    InvalidTimeOfDay(String),

    #[error("Invalid cron schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },
}

/// Errors raised while launching a handler.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("No handler registered for type {handler_type}")]
    UnknownHandler { handler_type: String },

    #[error("Handler {handler_type} failed to construct: {reason}")]
    Construction { handler_type: String, reason: String },

    #[error("Handler {handler_type} has schedule type Cron but no schedule")]
    MissingSchedule { handler_type: String },

    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} did not stop within {grace:?}")]
    StopTimeout { id: Uuid, grace: Duration },

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error("Timeline error: {0}")]
    Timeline(#[from] TimelineError),
}

/// Failures inside an activity generator.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Cancelled")]
    Cancelled,

    #[error("Failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Invalid event for {handler_type}: {reason}")]
    InvalidEvent { handler_type: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Control-plane transport failures. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("Channel disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("Send of {method} failed: {reason}")]
    SendFailed { method: String, reason: String },

    #[error("Server returned {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process enumeration and termination failures.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to enumerate processes: {0}")]
    Enumerate(String),

    #[error("Failed to kill process {pid}: {reason}")]
    Kill { pid: u32, reason: String },

    #[error("Refusing to kill own process {pid}")]
    OwnProcess { pid: u32 },
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;

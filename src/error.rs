use std::{io, path::PathBuf};

use quinn::{ConnectError, ConnectionError, ReadExactError, WriteError};

use crate::protocol::TaskName;

/// Everything that can go wrong in the pipeline, from the queue wire up to a
/// phase's database work.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("could not connect to the queue registry: {0}")]
    ConnectError(#[from] ConnectError),

    #[error("queue registry connection lost: {0}")]
    ConnectionError(#[from] ConnectionError),

    #[error("stream write failed: {0}")]
    WriteError(#[from] WriteError),

    #[error("stream read failed: {0}")]
    ReadExactError(#[from] ReadExactError),

    #[error("tls setup failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("could not generate a self-signed certificate: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer sent a handshake message that is not valid at this point of
    /// the exchange.
    #[error("unexpected handshake message: {0}")]
    BadHandshake(&'static str),

    /// The peer's answer to our challenge was not keyed with the shared
    /// secret.
    #[error("peer failed the shared-secret challenge")]
    AuthenticationFailed,

    #[error("the registry answered with a response that does not match the request")]
    UnexpectedResponse,

    #[error("a message could not be decoded")]
    CouldNotDecodeMessage,

    #[error("a message could not be encoded")]
    CouldNotEncodeMessage,

    #[error("frame of {0} bytes is over the size limit")]
    FrameTooLarge(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("required input is missing: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("cache file {} is corrupt or from another build", .0.display())]
    CorruptCache(PathBuf),

    #[error("unexpected column headers in {}", .0.display())]
    UnexpectedColumns(PathBuf),

    #[error("malformed value {value:?} in column {column}")]
    MalformedValue { column: String, value: String },

    #[error("{tool} failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    #[error("servant was started with a different configuration (digest {0})")]
    ConfigMismatch(String),

    #[error("no handler is registered for task {0}")]
    UnknownTask(TaskName),

    #[error("task {task} cannot run work item {item}")]
    UnexpectedItem { task: TaskName, item: String },

    #[error("background task panicked or was cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

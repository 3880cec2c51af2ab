use std::io;
use thiserror::Error;

/// Why the request parser gave up on a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("malformed header")]
    MalformedHeader,
    #[error("request body exceeds the configured limit")]
    BodyTooLarge,
    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,
}

impl ParseError {
    /// Status code sent back before the connection is closed.
    pub fn status(self) -> u16 {
        match self {
            ParseError::BodyTooLarge => 413,
            _ => 400,
        }
    }
}

/// Central error type for the Etude engine.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Error during HTTP request parsing.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    /// TLS configuration or session failure.
    #[error("TLS error: {0}")]
    Tls(String),
    /// Invalid configuration value.
    #[error("Config error: {0}")]
    Config(String),
    /// The worker pool could not spawn or has stopped.
    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}

pub type EtudeResult<T> = Result<T, EtudeError>;

use thiserror::Error;

/// Errors that can occur while loading config, decoding protocol specs, or
/// running a transport.
///
/// The distinction between [`GatewayError::TransientIo`] and
/// [`GatewayError::Unrecoverable`] matters to the supervisor: transient
/// errors are retried in place, unrecoverable ones cause the owning
/// transport to be torn down and reconnected from scratch.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol specification error: {0}")]
    Spec(String),

    #[error("transient I/O error: {0}")]
    TransientIo(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unrecoverable error: {0}")]
    Unrecoverable(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

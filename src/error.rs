use thiserror::Error;

/// Top-level error type for the engine.
///
/// Recoverable errors are swallowed at the lowest competent layer; these
/// variants are the ones that surface to a caller or into an event.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("signalling error: {0}")]
    Signalling(String),

    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("media channel error: {0}")]
    MediaChannel(String),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("engine already shut down")]
    Shutdown,
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

/// Errors specific to wire (de)serialization. Always a protocol violation:
/// the caller is expected to close the offending connection.
#[derive(Debug, Error, Clone)]
pub enum CodecError {
    #[error("frame exceeds maximum size ({0} > {1})")]
    FrameTooLarge(u32, u32),

    #[error("json error: {0}")]
    Json(String),

    #[error("base64 error: {0}")]
    Base64(String),

    #[error("unknown message type: {0}")]
    UnknownKind(u8),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Json(e.to_string())
    }
}

impl From<CodecError> for EngineError {
    fn from(e: CodecError) -> Self {
        EngineError::Protocol(e.to_string())
    }
}

/// Errors from the discovery backend seam.
#[derive(Debug, Error, Clone)]
pub enum DiscoveryError {
    #[error("mdns daemon error: {0}")]
    Daemon(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DiscoveryError {
    fn from(e: std::io::Error) -> Self {
        DiscoveryError::Io(e.to_string())
    }
}

impl From<DiscoveryError> for EngineError {
    fn from(e: DiscoveryError) -> Self {
        EngineError::Discovery(e.to_string())
    }
}

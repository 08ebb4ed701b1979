use thiserror::Error;

/// Gateway-wide error type
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed or unexpected binary data on a device channel
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A process, port or socket failed to come up within its timeout
    #[error("Connect error: {0}")]
    Connect(String),

    /// No common viable codec profile between device and remote offer
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Port allocation or forwarding failure
    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

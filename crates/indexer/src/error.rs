use thiserror::Error;

/// Errors raised by the line-framed transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish a connection to the indexer.
    #[error("failed to dial indexer at {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The remote side closed the connection.
    #[error("server closed connection (potentially because we sent an unsupported request)")]
    ConnectionClosed,

    /// The TLS server name was not acceptable.
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),

    /// Read or write failed for a reason other than a closed socket.
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was abandoned because the client is shutting down.
    #[error("operation cancelled: client is shutting down")]
    Cancelled,
}

/// Errors surfaced by the typed indexer client.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server answered with a JSON-RPC error object.
    #[error("indexer rpc error (code {code}): {message}")]
    Rpc { code: i64, message: String },

    /// The response could not be decoded into the expected shape.
    #[error("failed to decode indexer response: {0}")]
    Decode(String),

    /// The request could not be serialized.
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl IndexerError {
    pub(crate) fn decode(e: impl std::fmt::Display) -> Self {
        Self::Decode(e.to_string())
    }
}

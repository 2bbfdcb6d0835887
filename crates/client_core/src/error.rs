use thiserror::Error;

/// A page fetch that could not be honored. The cache it would have replaced
/// is left untouched; the caller decides whether to retry.
#[derive(Debug, Error)]
pub enum StoreQueryError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store rejected query ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("store response malformed: {0}")]
    Decode(String),
}

/// Transport-level failure on the event channel. Always transient: the
/// channel client retries with backoff until it is explicitly disconnected.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("connection closed by peer")]
    Closed,
}

/// Error produced by a bus adapter.
///
/// Publish failures are best-effort territory: callers log them and drop the
/// message rather than retrying. Subscription failures are terminal for the
/// subscribing task.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The underlying redis transport failed.
    #[error("redis transport error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Terminal socket error reported by a connection's reader or writer task.
///
/// Each task reports at most one of these, once, through its error signal to
/// the controller, and then stops. These never cross a connection boundary.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// The websocket transport failed. Oversized inbound frames surface here
    /// as well, via the configured message-size limit.
    #[error("websocket transport error: {0}")]
    Transport(#[from] axum::Error),

    /// The peer closed the connection or went away.
    #[error("peer closed the connection")]
    Closed,

    /// The peer stayed silent past the liveness window.
    #[error("liveness deadline exceeded")]
    ReadTimeout,

    /// A single socket write exceeded the write deadline.
    #[error("write deadline exceeded")]
    WriteTimeout,
}

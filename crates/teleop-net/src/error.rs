use thiserror::Error;

/// Why the line sequence ended.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("peer closed the connection")]
    Disconnected,
    #[error("connection i/o: {0}")]
    Io(#[from] std::io::Error),
}

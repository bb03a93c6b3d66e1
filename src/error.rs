use thiserror::Error;

/// Error taxonomy for the client. Transport and authorization failures are
/// kept apart so the shell can show a connectivity banner for one and a
/// credentials message for the other.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    /// Unrecognized frame shapes, chunks for unknown ids. Logged and dropped
    /// at the socket boundary, never allowed to tear down the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

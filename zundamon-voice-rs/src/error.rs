//! Error types shared by the speech service and the avatar relay.

use thiserror::Error;

/// Result type alias for zundamon-voice operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Engine not reachable yet, timed out, or returned a server error.
    /// Retried by the synthesis client.
    #[error("transport error: {0}")]
    Transport(String),

    /// The link to the synthesis host can never work again in this session
    /// (invalid endpoint, audio output gone). Disables speech.
    #[error("host link invalidated: {0}")]
    LinkInvalidated(String),

    /// The engine rejected the request (4xx). Aborts only the current chunk.
    #[error("synthesis rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Audio payload could not be decoded or played
    #[error("audio error: {0}")]
    Audio(String),

    /// Avatar relay error
    #[error("relay error: {0}")]
    Relay(String),

    /// Configuration or settings error
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Fatal errors disable the feature for the rest of the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LinkInvalidated(_))
    }

    /// Transient I/O failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            // A request that cannot even be built will fail the same way every time
            Self::LinkInvalidated(e.to_string())
        } else if let Some(status) = e.status().filter(|s| s.is_client_error()) {
            Self::Rejected {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            Self::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy() {
        assert!(Error::LinkInvalidated("gone".into()).is_fatal());
        assert!(!Error::LinkInvalidated("gone".into()).is_retryable());
        assert!(Error::Transport("refused".into()).is_retryable());
        assert!(!Error::Transport("refused".into()).is_fatal());

        let rejected = Error::Rejected {
            status: 422,
            body: "bad text".into(),
        };
        assert!(!rejected.is_fatal());
        assert!(!rejected.is_retryable());
    }
}

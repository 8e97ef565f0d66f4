//! Errors returned by the client and its transports.
//!
//! Failures that come from the server itself travel as
//! [`ResponseError`](crate::ResponseError) inside a response; this type
//! covers everything that goes wrong on our side of the pipe.

use thiserror::Error;

pub type LspResult<T> = Result<T, LspError>;

#[derive(Debug, Error)]
pub enum LspError {
    /// The call is not allowed in the client's current state. Nothing was
    /// changed or sent.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// `shutdown` outside of the initialized state.
    #[error("Invalid client state: {0}")]
    InvalidState(String),

    /// No client is registered under the given id.
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Spawning or talking to the server process failed.
    #[error("Server process error: {0}")]
    Process(String),

    /// A well-framed body that is not a JSON-RPC message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Bad header block or body encoding.
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// The server rejected `initialize` and no retry was allowed.
    #[error("Server initialization failed: {0}")]
    Initialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),
}

impl LspError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing(message.into())
    }

    pub fn request_failed(message: impl Into<String>) -> Self {
        Self::RequestFailed(message.into())
    }

    /// Whether the connection to the server is gone, as opposed to a
    /// single bad call or message.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::Process(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let cases = [
            (
                LspError::precondition("initialize requires state uninitialized"),
                "Precondition failed: initialize requires state uninitialized",
            ),
            (
                LspError::InvalidState("shutdown requested while error".to_string()),
                "Invalid client state: shutdown requested while error",
            ),
            (
                LspError::UnknownClient("client#4".to_string()),
                "Unknown client: client#4",
            ),
            (
                LspError::Process("rust-analyzer: not found".to_string()),
                "Server process error: rust-analyzer: not found",
            ),
            (
                LspError::framing("missing Content-Length header"),
                "Framing error: missing Content-Length header",
            ),
            (
                LspError::protocol("expected an object"),
                "Protocol error: expected an object",
            ),
            (
                LspError::Initialization("boom".to_string()),
                "Server initialization failed: boom",
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_conversions() {
        let io: LspError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
        assert!(matches!(io, LspError::Io(_)));
        assert!(io.is_connection_error());

        let json: LspError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(json.to_string().starts_with("JSON error"));
        assert!(!json.is_connection_error());
    }

    #[test]
    fn test_connection_errors() {
        assert!(LspError::connection_failed("Transport closed").is_connection_error());
        assert!(!LspError::request_failed("client is not reachable").is_connection_error());
        assert!(!LspError::precondition("x").is_connection_error());
    }
}

pub mod paths;
pub mod verb;

pub use verb::{ClientVerb, VerbUsage};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for a single line on the wire, handshake or command.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Default listen/connect address.
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Command name that ends a session's dispatch loop once it has run.
pub const EXIT_COMMAND: &str = "exit";

/// Identifier assigned to an authenticated connection (`<username>-<n>`).
pub type ConnectionId = String;

/// First frame sent by the client after the TLS handshake.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub token: String,
}

/// Single frame the server answers the credentials with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandshakeReply {
    Ok { id: ConnectionId },
    Error,
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("malformed handshake message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("authentication rejected by server")]
    Rejected,

    #[error("connection closed during handshake")]
    Closed,
}

impl Credentials {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
        }
    }

    /// Encode as one newline-free JSON frame.
    pub fn to_line(&self) -> Result<String, HandshakeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_line(line: &str) -> Result<Self, HandshakeError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

impl HandshakeReply {
    pub fn ok(id: impl Into<ConnectionId>) -> Self {
        Self::Ok { id: id.into() }
    }

    pub fn to_line(&self) -> Result<String, HandshakeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_line(line: &str) -> Result<Self, HandshakeError> {
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Connection id on success, `Rejected` otherwise.
    pub fn into_id(self) -> Result<ConnectionId, HandshakeError> {
        match self {
            HandshakeReply::Ok { id } => Ok(id),
            HandshakeReply::Error => Err(HandshakeError::Rejected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_wire_format() {
        let creds = Credentials::new("alice", "secret123");
        let line = creds.to_line().unwrap();
        assert_eq!(line, r#"{"username":"alice","token":"secret123"}"#);
        assert!(!line.contains('\n'));
    }

    #[test]
    fn reply_ok_wire_format() {
        let line = HandshakeReply::ok("alice-0").to_line().unwrap();
        assert_eq!(line, r#"{"status":"ok","id":"alice-0"}"#);
    }

    #[test]
    fn reply_error_wire_format() {
        let line = HandshakeReply::Error.to_line().unwrap();
        assert_eq!(line, r#"{"status":"error"}"#);
    }

    #[test]
    fn reply_parses_with_trailing_newline() {
        let reply = HandshakeReply::from_line("{\"status\":\"ok\",\"id\":\"bob-3\"}\n").unwrap();
        assert_eq!(reply.into_id().unwrap(), "bob-3");
    }

    #[test]
    fn error_reply_is_rejected() {
        let reply = HandshakeReply::from_line(r#"{"status":"error"}"#).unwrap();
        assert!(matches!(reply.into_id(), Err(HandshakeError::Rejected)));
    }

    #[test]
    fn malformed_credentials_are_reported() {
        let err = Credentials::from_line("not json").unwrap_err();
        assert!(err.to_string().contains("malformed handshake"));

        let err = Credentials::from_line(r#"{"username":"alice"}"#).unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed(_)));
    }
}

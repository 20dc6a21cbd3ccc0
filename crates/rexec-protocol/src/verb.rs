//! Client-local management verbs. These never reach the server.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientVerb {
    ListConn,
    CloseConn(String),
    ChangeConn(String),
    Connect {
        addr: String,
        username: String,
        token: String,
    },
    /// Anything else goes to the active connection verbatim.
    Forward(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Usage: {0}")]
pub struct VerbUsage(pub &'static str);

impl ClientVerb {
    pub fn parse(line: &str) -> Result<Self, VerbUsage> {
        let mut words = line.split_whitespace();
        let verb = match words.next() {
            Some(verb) => verb,
            None => return Ok(Self::Forward(line.to_string())),
        };
        let rest: Vec<&str> = words.collect();
        match (verb, rest.as_slice()) {
            ("listconn", []) => Ok(Self::ListConn),
            ("listconn", _) => Err(VerbUsage("listconn")),
            ("closeconn", [id]) => Ok(Self::CloseConn(id.to_string())),
            ("closeconn", _) => Err(VerbUsage("closeconn <conn.ID>")),
            ("changeconn", [id]) => Ok(Self::ChangeConn(id.to_string())),
            ("changeconn", _) => Err(VerbUsage("changeconn <conn.ID>")),
            ("connect", [addr, username, token]) => Ok(Self::Connect {
                addr: addr.to_string(),
                username: username.to_string(),
                token: token.to_string(),
            }),
            ("connect", _) => Err(VerbUsage("connect <host:port> <user> <token>")),
            _ => Ok(Self::Forward(line.to_string())),
        }
    }
}

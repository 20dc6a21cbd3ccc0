//! TLS command server: handshake, credential check and one dispatch
//! engine per authenticated connection.

pub mod config;
pub mod connection;
pub mod credentials;
pub mod server;
pub mod session;
pub mod tls;

pub use config::{Cli, ServerConfig};
pub use credentials::{CredentialCheck, TokenFile};
pub use server::{ServerState, serve};
pub use session::{SessionInfo, SessionTable};

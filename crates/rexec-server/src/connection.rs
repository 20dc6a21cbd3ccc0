use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use librexec::{CommandIo, SessionEnd};
use rexec_protocol::{ConnectionId, Credentials, HandshakeError, HandshakeReply};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::server::ServerState;
use crate::session::{SessionInfo, SessionTable};

/// How long a peer may take to send its credentials.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Removes the session entry however the connection ends.
struct SessionGuard {
    table: Arc<SessionTable>,
    id: ConnectionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

/// Serve one accepted, already encrypted connection.
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, state: Arc<ServerState>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut io = CommandIo::from_stream(stream);

    let credentials = match read_credentials(&mut io, &state).await {
        Ok(credentials) => credentials,
        Err(err) => {
            warn!(peer = %peer, error = %err, "handshake failed");
            if !matches!(err, HandshakeError::Closed) {
                reply(&mut io, &HandshakeReply::Error).await;
            }
            let _ = io.shutdown().await;
            return;
        }
    };

    let id = state.sessions.next_id(&credentials.username);
    // Registered before the reply so the peer never sees itself missing.
    state.sessions.insert(SessionInfo {
        id: id.clone(),
        username: credentials.username.clone(),
        peer,
        connected_at: Local::now(),
    });
    let _guard = SessionGuard {
        table: Arc::clone(&state.sessions),
        id: id.clone(),
    };
    if !reply(&mut io, &HandshakeReply::ok(id.clone())).await {
        return;
    }
    info!(conn_id = %id, user = %credentials.username, peer = %peer, "session started");

    match state.engine.run(&mut io).await {
        Ok(SessionEnd::Exit) => info!(conn_id = %id, "session ended by exit"),
        Ok(SessionEnd::Eof) => info!(conn_id = %id, "session closed by peer"),
        Err(err) => info!(conn_id = %id, error = %err, "session write failed"),
    }
    let _ = io.shutdown().await;
}

async fn read_credentials(
    io: &mut CommandIo,
    state: &ServerState,
) -> Result<Credentials, HandshakeError> {
    let line = match tokio::time::timeout(HANDSHAKE_TIMEOUT, io.read_line()).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) | Ok(Err(_)) | Err(_) => return Err(HandshakeError::Closed),
    };
    let credentials = Credentials::from_line(&line)?;
    if !state
        .credentials
        .check_credential(&credentials.username, &credentials.token)
    {
        return Err(HandshakeError::Rejected);
    }
    Ok(credentials)
}

/// Write one reply frame; false when the peer is gone.
async fn reply(io: &mut CommandIo, reply: &HandshakeReply) -> bool {
    let line = match reply.to_line() {
        Ok(line) => line,
        Err(err) => {
            warn!(error = %err, "cannot encode handshake reply");
            return false;
        }
    };
    match io.write_line(&line).await {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, "handshake reply not delivered");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::TokenFile;
    use librexec::{Engine, Registry};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, duplex};

    fn state(dir: &tempfile::TempDir) -> Arc<ServerState> {
        let tokens = dir.path().join("tokens.txt");
        std::fs::write(&tokens, "alice:secret123\n").unwrap();
        let engine = Engine::new(Arc::new(Registry::new())).with_banner(vec!["banner".to_string()]);
        Arc::new(ServerState::new(
            engine,
            Arc::new(SessionTable::new()),
            Arc::new(TokenFile::new(tokens)),
        ))
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn valid_credentials_open_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let (local, remote) = duplex(4096);
        let server = tokio::spawn(handle_connection(local, peer(), Arc::clone(&state)));

        let (read, mut write) = tokio::io::split(remote);
        let mut lines = BufReader::new(read).lines();
        write
            .write_all(b"{\"username\":\"alice\",\"token\":\"secret123\"}\n")
            .await
            .unwrap();

        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some(r#"{"status":"ok","id":"alice-0"}"#)
        );
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("banner"));
        assert_eq!(state.sessions.list()[0].id, "alice-0");

        write.shutdown().await.unwrap();
        server.await.unwrap();
        assert!(state.sessions.is_empty());
    }

    #[tokio::test]
    async fn wrong_token_is_rejected_and_closed() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let (local, mut remote) = duplex(4096);
        let server = tokio::spawn(handle_connection(local, peer(), Arc::clone(&state)));

        remote
            .write_all(b"{\"username\":\"alice\",\"token\":\"wrong\"}\n")
            .await
            .unwrap();
        server.await.unwrap();

        let mut out = String::new();
        remote.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "{\"status\":\"error\"}\n");
        assert!(state.sessions.is_empty());
    }

    #[tokio::test]
    async fn malformed_handshake_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let (local, mut remote) = duplex(4096);
        let server = tokio::spawn(handle_connection(local, peer(), state));

        remote.write_all(b"hello\n").await.unwrap();
        server.await.unwrap();

        let mut out = String::new();
        remote.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "{\"status\":\"error\"}\n");
    }

    #[tokio::test]
    async fn ids_are_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        for expected in ["alice-0", "alice-1"] {
            let (local, remote) = duplex(4096);
            let server = tokio::spawn(handle_connection(local, peer(), Arc::clone(&state)));
            let (read, mut write) = tokio::io::split(remote);
            let mut lines = BufReader::new(read).lines();
            write
                .write_all(b"{\"username\":\"alice\",\"token\":\"secret123\"}\n")
                .await
                .unwrap();
            let reply = lines.next_line().await.unwrap().expect("reply");
            assert_eq!(HandshakeReply::from_line(&reply).unwrap().into_id().unwrap(), expected);
            write.shutdown().await.unwrap();
            server.await.unwrap();
        }
    }
}

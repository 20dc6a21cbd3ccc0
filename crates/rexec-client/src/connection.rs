use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures_util::StreamExt;
use rexec_protocol::{ConnectionId, Credentials, HandshakeError, HandshakeReply, MAX_LINE_BYTES};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::debug;

use crate::tls;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Any duplex byte stream a session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BoxedTransport = Box<dyn Transport>;
pub type LineReader = FramedRead<ReadHalf<BoxedTransport>, LinesCodec>;
pub type LineWriter = WriteHalf<BoxedTransport>;

/// An authenticated session with a rexec server.
pub struct Connection {
    id: ConnectionId,
    lines: LineReader,
    writer: LineWriter,
}

impl Connection {
    /// TCP connect, TLS handshake, then the credential exchange.
    pub async fn open(
        addr: &str,
        server_name: &str,
        credentials: &Credentials,
        connector: &TlsConnector,
    ) -> Result<Self> {
        let tcp = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let tls = connector
            .connect(tls::server_name(server_name)?, tcp)
            .await
            .with_context(|| format!("TLS handshake with {addr} failed"))?;
        Self::handshake(tls, credentials).await
    }

    /// Send credentials over an established stream and wait for the
    /// server's verdict.
    pub async fn handshake<S>(stream: S, credentials: &Credentials) -> Result<Self>
    where
        S: Transport + 'static,
    {
        let (reader, mut writer) = tokio::io::split(Box::new(stream) as BoxedTransport);
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        let mut frame = credentials.to_line()?;
        frame.push('\n');
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await?;

        let reply = match tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next()).await {
            Ok(Some(Ok(line))) => line,
            Ok(Some(Err(err))) => return Err(anyhow!("failed to read handshake reply: {err}")),
            Ok(None) => return Err(HandshakeError::Closed.into()),
            Err(_) => return Err(anyhow!("timed out waiting for handshake reply")),
        };
        let id = HandshakeReply::from_line(&reply)?.into_id()?;
        debug!(conn_id = %id, "handshake accepted");
        Ok(Self { id, lines, writer })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next inbound line, `None` once the server has closed.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        match self.lines.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(err)) => Err(anyhow!("read failed: {err}")),
            None => Ok(None),
        }
    }

    pub fn into_parts(self) -> (ConnectionId, LineReader, LineWriter) {
        (self.id, self.lines, self.writer)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, duplex};

    /// Client side of a fake server that answers the handshake with `reply`
    /// and then hands back its end of the pipe.
    pub(crate) async fn fake_handshake(
        reply: &'static str,
    ) -> (Result<Connection>, tokio::task::JoinHandle<(String, DuplexStream)>) {
        let (client, server) = duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            let mut line = String::new();
            reader.read_line(&mut line).await.expect("read credentials");
            let mut server = reader.into_inner();
            server.write_all(reply.as_bytes()).await.expect("reply");
            (line, server)
        });
        let connection = Connection::handshake(client, &Credentials::new("alice", "secret123")).await;
        (connection, server)
    }

    #[tokio::test]
    async fn accepted_handshake_yields_id() {
        let (connection, server) = fake_handshake("{\"status\":\"ok\",\"id\":\"alice-0\"}\n").await;
        let mut connection = connection.expect("handshake");
        assert_eq!(connection.id(), "alice-0");

        let (sent, mut server) = server.await.unwrap();
        assert_eq!(sent, "{\"username\":\"alice\",\"token\":\"secret123\"}\n");

        server.write_all(b"banner\n>").await.unwrap();
        assert_eq!(connection.next_line().await.unwrap().as_deref(), Some("banner"));
        drop(server);
        // The trailing partial line is still delivered.
        assert_eq!(connection.next_line().await.unwrap().as_deref(), Some(">"));
        assert_eq!(connection.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejected_handshake_is_an_error() {
        let (connection, _server) = fake_handshake("{\"status\":\"error\"}\n").await;
        let err = connection.err().expect("rejected");
        assert!(err.to_string().contains("rejected"), "{err}");
    }

    #[tokio::test]
    async fn closed_before_reply_is_an_error() {
        let (client, server) = duplex(1024);
        drop(server);
        let err = Connection::handshake(client, &Credentials::new("a", "b"))
            .await
            .err()
            .expect("closed");
        // The write itself may fail first; either way no session exists.
        assert!(!err.to_string().is_empty());
    }
}

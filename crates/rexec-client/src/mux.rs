use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};
use futures_util::StreamExt;
use rexec_protocol::{ClientVerb, ConnectionId, Credentials};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::connection::{Connection, LineReader, LineWriter};

pub const GREETING: &str =
    "The management commands for conn connection are: listconn, closeconn, changeconn, connect!";

struct Entry {
    tx: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
}

/// Connections, the active id and the console share one lock so a relayed
/// line never interleaves with a management message.
struct State {
    conns: BTreeMap<ConnectionId, Entry>,
    active: Option<ConnectionId>,
    out: Box<dyn Write + Send>,
}

impl State {
    fn say(&mut self, message: &str) {
        let _ = writeln!(self.out, "{message}");
        let _ = self.out.flush();
    }

    fn prompt(&mut self) {
        let active = self.active.as_deref().unwrap_or("");
        let _ = write!(self.out, "@{active}->");
        let _ = self.out.flush();
    }

    /// Inbound lines overwrite the half-typed prompt, then restore it.
    fn relay(&mut self, line: &str) {
        let _ = write!(self.out, "\r{line}\n");
        self.prompt();
    }
}

struct Dialer {
    connector: TlsConnector,
    server_name: String,
}

/// Client-side set of authenticated connections with one active target.
#[derive(Clone)]
pub struct ConnectionSet {
    state: Arc<Mutex<State>>,
    dialer: Option<Arc<Dialer>>,
}

impl ConnectionSet {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                conns: BTreeMap::new(),
                active: None,
                out: Box::new(out),
            })),
            dialer: None,
        }
    }

    /// Enables the `connect` verb.
    pub fn with_dialer(mut self, connector: TlsConnector, server_name: impl Into<String>) -> Self {
        self.dialer = Some(Arc::new(Dialer {
            connector,
            server_name: server_name.into(),
        }));
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active(&self) -> Option<ConnectionId> {
        self.lock().active.clone()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.lock().conns.keys().cloned().collect()
    }

    pub fn greet(&self) {
        let mut state = self.lock();
        state.say(GREETING);
        state.prompt();
    }

    pub fn say(&self, message: &str) {
        self.lock().say(message);
    }

    /// Dial, authenticate and add a connection, which becomes active.
    pub async fn connect(&self, addr: &str, username: &str, token: &str) -> Result<ConnectionId> {
        let dialer = self
            .dialer
            .as_ref()
            .ok_or_else(|| anyhow!("no TLS connector configured"))?;
        self.say(&format!("Connecting to {addr}"));
        let credentials = Credentials::new(username, token);
        let connection =
            Connection::open(addr, &dialer.server_name, &credentials, &dialer.connector).await?;
        Ok(self.add(connection))
    }

    /// Register an authenticated connection and make it active. An id
    /// already held by another server's connection gets a `#n` suffix
    /// locally; the existing connection is left untouched.
    pub fn add(&self, connection: Connection) -> ConnectionId {
        let (server_id, reader, writer) = connection.into_parts();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.lock();
        let id = local_id(&state.conns, &server_id);
        if id != server_id {
            state.say(&format!(
                "[!] Connection ID {server_id} is already in use, registered as {id}"
            ));
        }
        // Spawned under the lock so the reader cannot finish before its
        // entry exists.
        tokio::spawn(pump(rx, writer));
        let reader = tokio::spawn(relay(Arc::clone(&self.state), id.clone(), reader));
        state.conns.insert(id.clone(), Entry { tx, reader });
        state.active = Some(id.clone());
        state.say(&format!("Connection established with ID: {id}"));
        info!(conn_id = %id, "connection added");
        id
    }

    /// Handle one line of operator input, then re-prompt.
    pub async fn handle_line(&self, line: &str) {
        match ClientVerb::parse(line) {
            Err(usage) => self.say(&usage.to_string()),
            Ok(ClientVerb::ListConn) => self.list(),
            Ok(ClientVerb::CloseConn(id)) => self.close(&id),
            Ok(ClientVerb::ChangeConn(id)) => self.change(&id),
            Ok(ClientVerb::Connect {
                addr,
                username,
                token,
            }) => {
                if let Err(err) = self.connect(&addr, &username, &token).await {
                    self.say(&format!("[!] {err:#}"));
                }
            }
            Ok(ClientVerb::Forward(line)) => {
                if !line.trim().is_empty() {
                    self.forward(line);
                }
            }
        }
        self.lock().prompt();
    }

    fn list(&self) {
        let mut state = self.lock();
        let lines: Vec<String> = state
            .conns
            .keys()
            .map(|id| {
                let mark = if state.active.as_deref() == Some(id) { "*" } else { " " };
                format!("{mark} {id}")
            })
            .collect();
        state.say("Active connections:");
        for line in lines {
            state.say(&line);
        }
    }

    pub fn close(&self, id: &str) {
        let mut state = self.lock();
        match state.conns.remove(id) {
            Some(entry) => {
                entry.reader.abort();
                // Dropping the sender ends the writer, which closes the stream.
                drop(entry.tx);
                if state.active.as_deref() == Some(id) {
                    state.active = None;
                }
                state.say(&format!("Connection {id} closed"));
            }
            None => state.say(&format!("Connection {id} does not exist")),
        }
    }

    fn change(&self, id: &str) {
        let mut state = self.lock();
        if state.conns.contains_key(id) {
            state.active = Some(id.to_string());
            state.say(&format!("Switched to connection {id}"));
        } else {
            state.say(&format!("Connection {id} does not exist"));
        }
    }

    fn forward(&self, line: String) {
        let mut state = self.lock();
        let Some(active) = state.active.clone() else {
            state.say("No active connection");
            return;
        };
        let sent = state
            .conns
            .get(&active)
            .map(|entry| entry.tx.send(line).is_ok())
            .unwrap_or(false);
        if !sent {
            state.say(&format!("[!] Error sending to {active}"));
        }
    }

    pub fn close_all(&self) {
        let ids = self.ids();
        for id in ids {
            self.close(&id);
        }
    }
}

fn local_id(conns: &BTreeMap<ConnectionId, Entry>, server_id: &str) -> ConnectionId {
    if !conns.contains_key(server_id) {
        return server_id.to_string();
    }
    (2..)
        .map(|n| format!("{server_id}#{n}"))
        .find(|candidate| !conns.contains_key(candidate))
        .unwrap_or_else(|| server_id.to_string())
}

async fn pump(mut rx: mpsc::UnboundedReceiver<String>, mut writer: LineWriter) {
    while let Some(line) = rx.recv().await {
        let mut frame = line.into_bytes();
        frame.push(b'\n');
        if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn relay(state: Arc<Mutex<State>>, id: ConnectionId, mut lines: LineReader) {
    loop {
        match lines.next().await {
            Some(Ok(line)) => {
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .relay(&line);
            }
            Some(Err(err)) => {
                debug!(conn_id = %id, error = %err, "read failed");
                break;
            }
            None => break,
        }
    }

    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.conns.remove(&id).is_some() {
        if state.active.as_deref() == Some(id.as_str()) {
            state.active = None;
        }
        let _ = write!(state.out, "\r");
        state.say(&format!("[!] Connection {id} closed by server"));
        state.prompt();
        info!(conn_id = %id, "connection lost");
    }
}

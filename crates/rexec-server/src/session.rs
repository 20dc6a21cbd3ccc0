use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use librexec::{
    CommandContext, CommandDescriptor, CommandError, CommandHandler, CommandIo, CommandOutput,
    CommandProvider,
};
use rexec_protocol::ConnectionId;

pub const SERVER_CATEGORY: &str = "server";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: ConnectionId,
    pub username: String,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Local>,
}

/// Live authenticated connections, keyed by connection id.
#[derive(Default)]
pub struct SessionTable {
    counter: AtomicU64,
    sessions: Mutex<BTreeMap<ConnectionId, SessionInfo>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<username>-<n>`, with `n` counted across all users.
    pub fn next_id(&self, username: &str) -> ConnectionId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{username}-{n}")
    }

    pub fn insert(&self, info: SessionInfo) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.id.clone(), info);
    }

    pub fn remove(&self, id: &str) -> Option<SessionInfo> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Provides the `sessions` command.
pub struct SessionCommands {
    table: Arc<SessionTable>,
}

impl SessionCommands {
    pub fn new(table: Arc<SessionTable>) -> Self {
        Self { table }
    }
}

impl CommandProvider for SessionCommands {
    fn provide_commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor::new("sessions", Arc::new(ListSessions(Arc::clone(&self.table))))
                .description("List connected sessions")
                .usage("sessions")
                .category(SERVER_CATEGORY),
        ]
    }
}

struct ListSessions(Arc<SessionTable>);

#[async_trait]
impl CommandHandler for ListSessions {
    async fn call(
        &self,
        io: &mut CommandIo,
        _ctx: CommandContext,
        _args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let sessions = self.0.list();
        if sessions.is_empty() {
            io.write_line("No active sessions").await?;
        }
        for session in &sessions {
            io.write_line(&format!(
                "{}\t{}\t{}\t{}",
                session.id,
                session.username,
                session.peer,
                session.connected_at.format("%Y-%m-%d %H:%M:%S")
            ))
            .await?;
        }
        Ok(sessions.len().to_string().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    fn info(table: &SessionTable, user: &str) -> SessionInfo {
        SessionInfo {
            id: table.next_id(user),
            username: user.to_string(),
            peer: "127.0.0.1:40000".parse().unwrap(),
            connected_at: Local::now(),
        }
    }

    #[test]
    fn ids_count_across_users() {
        let table = SessionTable::new();
        assert_eq!(table.next_id("alice"), "alice-0");
        assert_eq!(table.next_id("bob"), "bob-1");
        assert_eq!(table.next_id("alice"), "alice-2");
    }

    #[test]
    fn insert_and_remove() {
        let table = SessionTable::new();
        let alice = info(&table, "alice");
        table.insert(alice.clone());
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove(&alice.id), Some(alice));
        assert!(table.is_empty());
        assert_eq!(table.remove("alice-0"), None);
    }

    #[tokio::test]
    async fn sessions_command_lists_live_entries() {
        let table = Arc::new(SessionTable::new());
        table.insert(info(&table, "alice"));
        let command = SessionCommands::new(Arc::clone(&table)).provide_commands().remove(0);

        let (local, mut remote) = duplex(4096);
        let mut io = CommandIo::from_stream(local);
        command
            .handler
            .call(&mut io, CommandContext::background(), Vec::new())
            .await
            .unwrap();
        drop(io);

        let mut out = String::new();
        remote.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("alice-0\talice\t127.0.0.1:40000\t"), "{out}");
    }
}

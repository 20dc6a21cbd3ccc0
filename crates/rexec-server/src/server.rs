use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use librexec::commands::{CoreCommands, CustomCommands, ExternalCommands, TaskCommands};
use librexec::{Engine, ProviderSet, Registry, TaskManager, VERSION};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::credentials::{CredentialCheck, TokenFile};
use crate::session::{SessionCommands, SessionTable};
use crate::tls;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection needs, shared by all of them.
pub struct ServerState {
    pub engine: Engine,
    pub sessions: Arc<SessionTable>,
    pub credentials: Arc<dyn CredentialCheck>,
    tasks: Option<TaskManager>,
}

impl ServerState {
    pub fn new(
        engine: Engine,
        sessions: Arc<SessionTable>,
        credentials: Arc<dyn CredentialCheck>,
    ) -> Self {
        Self {
            engine,
            sessions,
            credentials,
            tasks: None,
        }
    }

    /// Composition root: registry, providers, task manager and engine.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let tasks = TaskManager::new(config.pool_size).context("failed to create task manager")?;
        let sessions = Arc::new(SessionTable::new());

        let providers = ProviderSet::new();
        providers.add_provider(Arc::new(CoreCommands::new(Arc::clone(&registry))));
        providers.add_provider(Arc::new(TaskCommands::new(tasks.clone(), Arc::clone(&registry))));
        providers.add_provider(Arc::new(CustomCommands));
        providers.add_provider(Arc::new(ExternalCommands::new(&config.plugins)));
        providers.add_provider(Arc::new(SessionCommands::new(Arc::clone(&sessions))));
        let count = providers.register_all(&registry);
        info!(commands = count, providers = providers.provider_count(), "commands registered");

        let engine = Engine::new(registry)
            .with_timeout(config.command_timeout)
            .with_banner(banner());

        Ok(Self {
            engine,
            sessions,
            credentials: Arc::new(TokenFile::new(&config.tokens)),
            tasks: Some(tasks),
        })
    }

    pub fn tasks(&self) -> Option<&TaskManager> {
        self.tasks.as_ref()
    }
}

pub fn banner() -> Vec<String> {
    vec![
        format!("rexec engine v{VERSION}"),
        "Type 'help' for available commands".to_string(),
    ]
}

/// Accept TLS connections until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("shutdown requested, stopping accept loop");
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                debug!(peer = %peer, "accepted");

                let acceptor = acceptor.clone();
                let state = Arc::clone(&state);
                connections.retain(|handle| !handle.is_finished());
                connections.push(tokio::spawn(async move {
                    match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                        Ok(Ok(tls)) => handle_connection(tls, peer, state).await,
                        Ok(Err(err)) => warn!(peer = %peer, error = %err, "TLS handshake failed"),
                        Err(_) => warn!(peer = %peer, "TLS handshake timed out"),
                    }
                }));
            }
        }
    }

    for handle in connections.drain(..) {
        handle.abort();
    }
    if let Some(tasks) = state.tasks() {
        tasks.shutdown();
    }
    Ok(())
}

/// Bind, serve, and stop on Ctrl-C.
pub async fn run(config: ServerConfig) -> Result<()> {
    let acceptor = tls::load_acceptor(&config.cert, &config.key)?;
    let state = Arc::new(ServerState::from_config(&config)?);
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(
        addr = %listener.local_addr()?,
        pool_size = config.pool_size,
        version = VERSION,
        "rexec server started"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                shutdown_tx.send_replace(true);
            }
            Err(err) => {
                // Keep the sender alive; only an interrupt stops the server.
                warn!(error = %err, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        }
    });

    serve(listener, acceptor, state, shutdown_rx).await
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rexec_client::{Connection, Trust, connector};
use rexec_protocol::Credentials;
use rexec_server::{ServerConfig, ServerState, serve, tls};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct TestServer {
    addr: SocketAddr,
    ca: PathBuf,
    state: Arc<ServerState>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let generated =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = dir.path().join("server.crt");
        let key = dir.path().join("server.key");
        std::fs::write(&cert, generated.cert.pem()).unwrap();
        std::fs::write(&key, generated.key_pair.serialize_pem()).unwrap();
        let tokens = dir.path().join("tokens.txt");
        std::fs::write(&tokens, "# test users\nalice:secret123\nbob:hunter2\n").unwrap();

        let config = ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            cert: cert.clone(),
            key: key.clone(),
            tokens,
            plugins: dir.path().join("plugins"),
            pool_size: 2,
            command_timeout: Duration::from_secs(30),
        };
        let acceptor = tls::load_acceptor(&config.cert, &config.key).unwrap();
        let state = Arc::new(ServerState::from_config(&config).unwrap());
        let listener = TcpListener::bind(&config.listen).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(serve(listener, acceptor, Arc::clone(&state), rx));

        Self {
            addr,
            ca: cert,
            state,
            shutdown,
            handle,
            _dir: dir,
        }
    }

    async fn connect(&self, username: &str, token: &str) -> anyhow::Result<Session> {
        let connector = connector(&Trust::Roots(self.ca.clone()))?;
        let connection = Connection::open(
            &self.addr.to_string(),
            "localhost",
            &Credentials::new(username, token),
            &connector,
        )
        .await?;
        Ok(Session { connection })
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        self.handle.await.unwrap().unwrap();
    }
}

struct Session {
    connection: Connection,
}

impl Session {
    async fn send(&mut self, line: &str) {
        self.connection.send_line(line).await.unwrap();
    }

    /// Collect lines until one contains `needle`. Prompts carry no newline, so
    /// they show up glued to the front of the following line.
    async fn read_until(&mut self, needle: &str) -> String {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let line = tokio::time::timeout_at(deadline, self.connection.next_line())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}, saw {seen:?}"))
                .unwrap()
                .unwrap_or_else(|| panic!("closed before {needle:?}, saw {seen:?}"));
            seen.push_str(&line);
            seen.push('\n');
            if line.contains(needle) {
                return seen;
            }
        }
    }

    async fn run(&mut self, line: &str, needle: &str) -> String {
        self.send(line).await;
        self.read_until(needle).await
    }
}

#[tokio::test]
async fn authenticated_session_gets_id_and_banner() {
    let server = TestServer::spawn().await;
    let mut alice = server.connect("alice", "secret123").await.unwrap();
    assert_eq!(alice.connection.id(), "alice-0");
    alice.read_until("Type 'help' for available commands").await;

    let bob = server.connect("bob", "hunter2").await.unwrap();
    assert_eq!(bob.connection.id(), "bob-1");

    let out = alice.run("sessions", "bob-1").await;
    assert!(out.contains("alice-0"), "{out}");
    server.stop().await;
}

#[tokio::test]
async fn bad_credentials_are_rejected() {
    let server = TestServer::spawn().await;
    let err = server.connect("alice", "wrong").await.err().expect("rejected");
    assert!(format!("{err:#}").contains("rejected"), "{err:#}");

    let err = server.connect("mallory", "secret123").await.err().expect("rejected");
    assert!(format!("{err:#}").contains("rejected"), "{err:#}");
    assert!(server.state.sessions.is_empty());
    server.stop().await;
}

#[tokio::test]
async fn unknown_command_is_reported_and_session_survives() {
    let server = TestServer::spawn().await;
    let mut alice = server.connect("alice", "secret123").await.unwrap();

    let out = alice.run("foo", "Unknown command: foo").await;
    assert!(out.contains("Type 'help'"), "{out}");

    let out = alice.run("echo still here", "still here").await;
    assert!(out.contains("still here"), "{out}");
    server.stop().await;
}

#[tokio::test]
async fn background_task_lifecycle() {
    let server = TestServer::spawn().await;
    let mut alice = server.connect("alice", "secret123").await.unwrap();

    alice.run("bg greet", "Started task 1: greet []").await;
    let listing = alice.run("check", "\tgreet\t").await;
    assert!(listing.contains("1\t"), "{listing}");

    alice.run("kill 1", "Killed task 1 (greet)").await;
    alice.run("check", "No running background tasks").await;

    alice.run("bg greet", "Started task 2: greet []").await;
    alice.run("interact 2", "Interacting with task 2").await;
    alice.read_until("hello world").await;
    // The name prompt has no newline; it arrives glued to the reply.
    let out = alice.run("Bob", "Task completed").await;
    assert!(out.contains("Hello World, Bob"), "{out}");
    server.stop().await;
}

#[tokio::test]
async fn background_tasks_are_shared_between_sessions() {
    let server = TestServer::spawn().await;
    let mut alice = server.connect("alice", "secret123").await.unwrap();
    let mut bob = server.connect("bob", "hunter2").await.unwrap();

    alice.run("bg greet", "Started task 1").await;
    bob.run("check", "\tgreet\t").await;
    bob.run("kill 1", "Killed task 1 (greet)").await;
    server.stop().await;
}

#[tokio::test]
async fn exit_closes_only_that_session() {
    let server = TestServer::spawn().await;
    let mut alice = server.connect("alice", "secret123").await.unwrap();
    let mut bob = server.connect("bob", "hunter2").await.unwrap();

    alice.run("exit", "Bye!").await;
    let end = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match alice.connection.next_line().await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    })
    .await;
    assert!(end.is_ok(), "server kept the session open");

    bob.run("echo bob-still-here", "bob-still-here").await;
    server.stop().await;
}

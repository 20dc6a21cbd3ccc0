use std::sync::Arc;
use std::time::Duration;

use rexec_protocol::EXIT_COMMAND;
use tracing::{debug, warn};

use crate::context::CommandContext;
use crate::io::CommandIo;
use crate::registry::Registry;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PROMPT: &str = ">";

/// What the loop should do after one dispatched line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Exit,
}

/// Why a session's loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Eof,
    Exit,
}

/// Per-session read, tokenize, lookup, invoke loop.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    timeout: Duration,
    prompt: String,
    banner: Vec<String>,
}

impl Engine {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            prompt: DEFAULT_PROMPT.to_string(),
            banner: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_banner(mut self, lines: Vec<String>) -> Self {
        self.banner = lines;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run until the peer hangs up or `exit` has been dispatched.
    pub async fn run(&self, io: &mut CommandIo) -> std::io::Result<SessionEnd> {
        for line in &self.banner {
            io.write_line(line).await?;
        }
        loop {
            io.write_str(&self.prompt).await?;
            let line = match io.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(SessionEnd::Eof),
                Err(err) => {
                    debug!(error = %err, "session read failed");
                    return Ok(SessionEnd::Eof);
                }
            };
            if self.execute_line(io, &line).await? == Dispatch::Exit {
                return Ok(SessionEnd::Exit);
            }
        }
    }

    /// Dispatch one input line. Only stream write failures are returned;
    /// lookup and handler failures are reported on the stream.
    pub async fn execute_line(&self, io: &mut CommandIo, line: &str) -> std::io::Result<Dispatch> {
        let mut parts = line.split_whitespace();
        let Some(name) = parts.next() else {
            return Ok(Dispatch::Continue);
        };
        let args: Vec<String> = parts.map(str::to_string).collect();

        let Some(descriptor) = self.registry.get(name) else {
            io.write_line(&format!("Unknown command: {name}")).await?;
            io.write_line("Type 'help' for available commands").await?;
            return Ok(Dispatch::Continue);
        };

        let ctx = CommandContext::with_timeout(self.timeout);
        debug!(command = %name, args = args.len(), "dispatching");
        match descriptor.handler.call(io, ctx, args).await {
            Ok(output) => debug!(command = %name, bytes = output.len(), "command finished"),
            Err(err) => {
                warn!(command = %name, error = %err, "command failed");
                io.write_line(&format!("Error: {err}")).await?;
            }
        }

        if name == EXIT_COMMAND {
            Ok(Dispatch::Exit)
        } else {
            Ok(Dispatch::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandHandler, CommandOutput};
    use crate::error::CommandError;
    use crate::test_support::{Tagged, descriptor, read_available};
    use async_trait::async_trait;
    use tokio::io::{AsyncWriteExt, duplex};

    struct Fails;

    #[async_trait]
    impl CommandHandler for Fails {
        async fn call(
            &self,
            _io: &mut CommandIo,
            _ctx: CommandContext,
            _args: Vec<String>,
        ) -> Result<CommandOutput, CommandError> {
            Err(CommandError::failed("boom"))
        }
    }

    struct EchoArgs;

    #[async_trait]
    impl CommandHandler for EchoArgs {
        async fn call(
            &self,
            io: &mut CommandIo,
            ctx: CommandContext,
            args: Vec<String>,
        ) -> Result<CommandOutput, CommandError> {
            assert!(ctx.deadline().is_some());
            io.write_line(&args.join("|")).await?;
            Ok(Vec::new())
        }
    }

    fn engine() -> Engine {
        let registry = Arc::new(Registry::new());
        registry.register(descriptor("exit", Tagged("bye")));
        registry.register(descriptor("fail", Fails));
        registry.register(descriptor("args", EchoArgs));
        Engine::new(registry)
    }

    #[tokio::test]
    async fn unknown_command_is_reported_and_loop_continues() {
        let (local, mut remote) = duplex(4096);
        let mut io = CommandIo::from_stream(local);
        let engine = engine();

        let dispatch = engine.execute_line(&mut io, "foo bar").await.unwrap();
        assert_eq!(dispatch, Dispatch::Continue);
        let out = read_available(&mut remote).await;
        assert!(out.contains("Unknown command: foo"), "got {out:?}");
        assert!(out.contains("help"));
    }

    #[tokio::test]
    async fn handler_error_is_written_inline() {
        let (local, mut remote) = duplex(4096);
        let mut io = CommandIo::from_stream(local);

        engine().execute_line(&mut io, "fail").await.unwrap();
        assert_eq!(read_available(&mut remote).await, "Error: boom\n");
    }

    #[tokio::test]
    async fn whitespace_is_collapsed_between_arguments() {
        let (local, mut remote) = duplex(4096);
        let mut io = CommandIo::from_stream(local);

        engine().execute_line(&mut io, "  args  a \t b   c ").await.unwrap();
        assert_eq!(read_available(&mut remote).await, "a|b|c\n");
    }

    #[tokio::test]
    async fn blank_lines_reprompt_and_exit_stops_loop() {
        let (local, mut remote) = duplex(4096);
        let engine = engine().with_banner(vec!["hello".to_string()]);
        let session = tokio::spawn(async move {
            let mut io = CommandIo::from_stream(local);
            engine.run(&mut io).await
        });

        remote.write_all(b"\n   \nexit\nargs never\n").await.unwrap();
        let end = session.await.expect("join").expect("run");
        assert_eq!(end, SessionEnd::Exit);

        let out = read_available(&mut remote).await;
        assert_eq!(out, "hello\n>>>");
    }

    #[tokio::test]
    async fn eof_ends_loop() {
        let (local, mut remote) = duplex(4096);
        let engine = engine();
        let session = tokio::spawn(async move {
            let mut io = CommandIo::from_stream(local);
            engine.run(&mut io).await
        });

        remote.write_all(b"args x\n").await.unwrap();
        remote.shutdown().await.unwrap();
        let end = session.await.expect("join").expect("run");
        assert_eq!(end, SessionEnd::Eof);
        assert_eq!(read_available(&mut remote).await, ">x\n>");
    }
}

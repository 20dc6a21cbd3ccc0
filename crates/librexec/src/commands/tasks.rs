use std::sync::Arc;

use async_trait::async_trait;

use super::{SYSTEM_CATEGORY, handler};
use crate::command::{CommandDescriptor, CommandHandler, CommandOutput};
use crate::context::CommandContext;
use crate::error::CommandError;
use crate::interact::AttachOutcome;
use crate::io::CommandIo;
use crate::provider::CommandProvider;
use crate::registry::Registry;
use crate::task::TaskManager;

/// bg, interact, check, kill, reboot and exit.
pub struct TaskCommands {
    manager: TaskManager,
    registry: Arc<Registry>,
}

impl TaskCommands {
    pub fn new(manager: TaskManager, registry: Arc<Registry>) -> Self {
        Self { manager, registry }
    }
}

impl CommandProvider for TaskCommands {
    fn provide_commands(&self) -> Vec<CommandDescriptor> {
        let manager = &self.manager;
        vec![
            CommandDescriptor::new(
                "bg",
                handler(Background {
                    manager: manager.clone(),
                    registry: Arc::clone(&self.registry),
                }),
            )
            .description("Run a background-capable command on the task pool")
            .usage("bg <task_name> [args...]")
            .category(SYSTEM_CATEGORY),
            CommandDescriptor::new("interact", handler(Interact(manager.clone())))
                .description("Attach to a background task; type 'exit' to detach")
                .usage("interact <task_id>")
                .category(SYSTEM_CATEGORY),
            CommandDescriptor::new("check", handler(Check(manager.clone())))
                .description("List running background tasks")
                .usage("check")
                .category(SYSTEM_CATEGORY),
            CommandDescriptor::new("kill", handler(Kill(manager.clone())))
                .description("Stop a background task")
                .usage("kill <task_id>")
                .category(SYSTEM_CATEGORY),
            CommandDescriptor::new("reboot", handler(Reboot(manager.clone())))
                .description("Restart the task manager and every running task")
                .usage("reboot")
                .category(SYSTEM_CATEGORY),
            CommandDescriptor::new("exit", handler(Exit))
                .description("End this session")
                .usage("exit")
                .category(SYSTEM_CATEGORY),
        ]
    }
}

struct Background {
    manager: TaskManager,
    registry: Arc<Registry>,
}

#[async_trait]
impl CommandHandler for Background {
    async fn call(
        &self,
        io: &mut CommandIo,
        _ctx: CommandContext,
        args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let Some((name, rest)) = args.split_first() else {
            return Err(CommandError::usage("bg <task_name> [args...]"));
        };
        self.manager.sync_background_functions(&self.registry);
        let id = self.manager.start_task(io, name, rest.to_vec()).await?;
        Ok(id.to_string().into_bytes())
    }
}

fn single_id<'a>(args: &'a [String], usage: &str) -> Result<&'a str, CommandError> {
    match args {
        [id] => Ok(id),
        _ => Err(CommandError::usage(usage)),
    }
}

struct Interact(TaskManager);

#[async_trait]
impl CommandHandler for Interact {
    async fn call(
        &self,
        io: &mut CommandIo,
        _ctx: CommandContext,
        args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let id = single_id(&args, "interact <task_id>")?;
        let outcome = self.0.interact_task(io, id).await?;
        Ok(match outcome {
            AttachOutcome::Detached => b"detached".to_vec(),
            AttachOutcome::Completed => b"completed".to_vec(),
        })
    }
}

struct Check(TaskManager);

#[async_trait]
impl CommandHandler for Check {
    async fn call(
        &self,
        io: &mut CommandIo,
        _ctx: CommandContext,
        _args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let count = self.0.list_tasks(io).await?;
        Ok(count.to_string().into_bytes())
    }
}

struct Kill(TaskManager);

#[async_trait]
impl CommandHandler for Kill {
    async fn call(
        &self,
        io: &mut CommandIo,
        _ctx: CommandContext,
        args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let id = single_id(&args, "kill <task_id>")?;
        self.0.kill_task(io, id).await?;
        Ok(Vec::new())
    }
}

struct Reboot(TaskManager);

#[async_trait]
impl CommandHandler for Reboot {
    async fn call(
        &self,
        io: &mut CommandIo,
        _ctx: CommandContext,
        _args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        let restarted = self.0.reboot(io).await?;
        Ok(restarted.to_string().into_bytes())
    }
}

/// The pool is shared by every session, so leaving only ends this one.
struct Exit;

#[async_trait]
impl CommandHandler for Exit {
    async fn call(
        &self,
        io: &mut CommandIo,
        _ctx: CommandContext,
        _args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        io.write_line("Bye!").await?;
        Ok(b"Bye!".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::custom::CustomCommands;
    use crate::engine::{Engine, SessionEnd};
    use crate::provider::ProviderSet;
    use crate::test_support::{read_available, read_until};
    use tokio::io::{AsyncWriteExt, duplex};

    fn engine() -> (Engine, TaskManager) {
        let registry = Arc::new(Registry::new());
        let manager = TaskManager::new(2).expect("manager");
        let providers = ProviderSet::new();
        providers.add_provider(Arc::new(TaskCommands::new(manager.clone(), Arc::clone(&registry))));
        providers.add_provider(Arc::new(CustomCommands));
        providers.register_all(&registry);
        (Engine::new(registry), manager)
    }

    #[tokio::test]
    async fn bg_check_kill_flow() {
        let (engine, manager) = engine();
        let (local, mut remote) = duplex(64 * 1024);
        let mut io = CommandIo::from_stream(local);

        engine.execute_line(&mut io, "bg greet").await.unwrap();
        assert_eq!(read_available(&mut remote).await, "Started task 1: greet []\n");
        assert_eq!(manager.tasks().len(), 1);

        engine.execute_line(&mut io, "check").await.unwrap();
        let listing = read_available(&mut remote).await;
        assert!(listing.starts_with("1\t"), "{listing}");
        assert!(listing.ends_with("\tgreet\t\n"), "{listing}");

        engine.execute_line(&mut io, "kill 1").await.unwrap();
        assert_eq!(read_available(&mut remote).await, "Killed task 1 (greet)\n");

        engine.execute_line(&mut io, "kill 1").await.unwrap();
        assert_eq!(read_available(&mut remote).await, "Error: task 1 not found\n");
    }

    #[tokio::test]
    async fn task_errors_are_reported_inline() {
        let (engine, _) = engine();
        let (local, mut remote) = duplex(64 * 1024);
        let mut io = CommandIo::from_stream(local);

        engine.execute_line(&mut io, "bg").await.unwrap();
        assert_eq!(read_available(&mut remote).await, "Error: usage: bg <task_name> [args...]\n");

        engine.execute_line(&mut io, "bg exit").await.unwrap();
        assert_eq!(
            read_available(&mut remote).await,
            "Error: function exit is not registered for background use\n"
        );

        engine.execute_line(&mut io, "interact abc").await.unwrap();
        assert_eq!(read_available(&mut remote).await, "Error: invalid task id: abc\n");

        engine.execute_line(&mut io, "check").await.unwrap();
        assert_eq!(read_available(&mut remote).await, "No running background tasks\n");
    }

    #[tokio::test]
    async fn interact_with_greet_until_it_completes() {
        let (engine, manager) = engine();
        let (local, mut remote) = duplex(64 * 1024);
        let session = tokio::spawn(async move {
            let mut io = CommandIo::from_stream(local);
            engine.run(&mut io).await
        });

        remote.write_all(b"bg greet\n").await.unwrap();
        read_until(&mut remote, "Started task 1").await;
        remote.write_all(b"interact 1\n").await.unwrap();
        read_until(&mut remote, "Please enter your name:").await;

        remote.write_all(b"Ferris\n").await.unwrap();
        let out = read_until(&mut remote, "Task completed").await;
        assert!(out.contains("Hello World, Ferris"), "{out}");
        assert!(manager.tasks().is_empty());

        remote.write_all(b"exit\n").await.unwrap();
        let out = read_until(&mut remote, "Bye!").await;
        assert!(!out.contains("Error"), "{out}");
        assert_eq!(session.await.expect("join").expect("run"), SessionEnd::Exit);
    }

    #[tokio::test]
    async fn exit_leaves_the_pool_usable() {
        let (engine, manager) = engine();
        let (local, mut remote) = duplex(64 * 1024);
        let mut io = CommandIo::from_stream(local);

        engine.execute_line(&mut io, "exit").await.unwrap();
        assert_eq!(read_available(&mut remote).await, "Bye!\n");

        engine.execute_line(&mut io, "bg greet").await.unwrap();
        assert_eq!(manager.tasks().len(), 1);
    }
}

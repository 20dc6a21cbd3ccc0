use async_trait::async_trait;

use super::handler;
use crate::command::{CommandDescriptor, CommandHandler, CommandOutput};
use crate::context::CommandContext;
use crate::error::CommandError;
use crate::io::CommandIo;
use crate::provider::CommandProvider;

pub const CUSTOM_CATEGORY: &str = "custom";

/// Demo commands that exercise interactive background I/O.
pub struct CustomCommands;

impl CommandProvider for CustomCommands {
    fn provide_commands(&self) -> Vec<CommandDescriptor> {
        vec![
            CommandDescriptor::new("greet", handler(Greet))
                .description("Ask for a name and greet it")
                .usage("greet")
                .category(CUSTOM_CATEGORY)
                .background(true),
        ]
    }
}

struct Greet;

#[async_trait]
impl CommandHandler for Greet {
    async fn call(
        &self,
        io: &mut CommandIo,
        _ctx: CommandContext,
        _args: Vec<String>,
    ) -> Result<CommandOutput, CommandError> {
        io.write_line("hello world").await?;
        io.write_line("Please enter your name: ").await?;
        let name = io.read_line().await?.unwrap_or_default();
        io.write_line(&format!("Hello World, {}", name.trim())).await?;
        Ok(b"greet finished".to_vec())
    }
}

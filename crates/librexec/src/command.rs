use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::CommandContext;
use crate::error::CommandError;
use crate::io::CommandIo;

/// Bytes a handler reports back to its caller besides what it wrote.
pub type CommandOutput = Vec<u8>;

/// A named command's behavior. Handlers write their own output to `io`;
/// the returned bytes are informational only.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(
        &self,
        io: &mut CommandIo,
        ctx: CommandContext,
        args: Vec<String>,
    ) -> Result<CommandOutput, CommandError>;
}

/// Metadata plus handler for one command. Immutable once registered.
#[derive(Clone)]
pub struct CommandDescriptor {
    pub name: String,
    pub description: String,
    pub usage: String,
    pub category: String,
    /// Whether `bg` may run this command on the task pool.
    pub background: bool,
    pub handler: Arc<dyn CommandHandler>,
}

impl CommandDescriptor {
    pub fn new(name: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        let name = name.into();
        Self {
            usage: name.clone(),
            name,
            description: String::new(),
            category: String::new(),
            background: false,
            handler,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("background", &self.background)
            .finish_non_exhaustive()
    }
}

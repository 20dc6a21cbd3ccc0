//! Built-in command providers.

use std::sync::Arc;

use crate::command::CommandHandler;

pub mod custom;
pub mod external;
pub mod process;
pub mod system;
pub mod tasks;

pub use custom::CustomCommands;
pub use external::ExternalCommands;
pub use system::CoreCommands;
pub use tasks::TaskCommands;

pub const SYSTEM_CATEGORY: &str = "system";

pub(crate) fn handler(handler: impl CommandHandler + 'static) -> Arc<dyn CommandHandler> {
    Arc::new(handler)
}

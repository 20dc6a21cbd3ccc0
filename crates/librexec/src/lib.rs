//! Command registry, dispatch engine and background task manager.
//!
//! A session hands its stream to an [`Engine`], which resolves each input
//! line through the [`Registry`]. Handlers may push long-running work onto
//! the [`TaskManager`], whose tasks can later be attached to, listed and
//! killed from any session.

pub mod command;
pub mod commands;
pub mod context;
pub mod engine;
pub mod error;
pub mod interact;
pub mod io;
pub mod output;
pub mod pool;
pub mod provider;
pub mod registry;
pub mod task;

pub use command::{CommandDescriptor, CommandHandler, CommandOutput};
pub use context::CommandContext;
pub use engine::{Dispatch, Engine, SessionEnd};
pub use error::{CommandError, PoolError, TaskError};
pub use interact::AttachOutcome;
pub use io::CommandIo;
pub use provider::{CommandProvider, ProviderSet, StaticProvider};
pub use registry::Registry;
pub use task::{BackgroundFn, TaskId, TaskManager, TaskStatus, TaskSummary};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use thiserror::Error;

use crate::task::TaskId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool saturated ({capacity} workers busy)")]
    Saturated { capacity: usize },

    #[error("worker pool is closed")]
    Closed,

    #[error("worker pool capacity must be at least 1")]
    InvalidCapacity,
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} is not running")]
    NotRunning(TaskId),

    #[error("invalid task id: {0}")]
    InvalidId(String),

    #[error("reboot already in progress")]
    RebootInProgress,

    #[error("pool submission failed: {0}")]
    PoolSubmit(#[from] PoolError),

    #[error("cannot register {name} as a background function: {reason}")]
    Registration { name: String, reason: String },

    #[error("function {0} is not registered for background use")]
    UnknownFunction(String),

    #[error("task {0} already has an interactive session attached")]
    AlreadyAttached(TaskId),

    #[error("task has finished")]
    TaskFinished,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{0}")]
    Failed(String),

    #[error("usage: {0}")]
    Usage(String),

    #[error("command '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommandError {
    pub fn failed(message: impl Into<String>) -> Self {
        CommandError::Failed(message.into())
    }

    pub fn usage(text: impl Into<String>) -> Self {
        CommandError::Usage(text.into())
    }
}

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::trace;

use crate::error::TaskError;
use crate::io::CommandIo;
use crate::task::Task;

/// How an interactive window ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The user typed `exit` or the session input closed; the task keeps running.
    Detached,
    /// The task finished or was stopped while attached.
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttachState {
    Polling,
    Detaching,
    Completing,
    Detached(AttachOutcome),
}

/// One interactive window over a running task.
pub(crate) struct Attachment {
    task: Arc<Task>,
    cursor: usize,
    poll_interval: Duration,
}

impl Attachment {
    pub(crate) fn new(task: Arc<Task>, poll_interval: Duration) -> Self {
        let cursor = task.delivered.load(Ordering::Acquire);
        Self {
            task,
            cursor,
            poll_interval,
        }
    }

    /// Copy output produced since the last flush to the session.
    async fn flush(&mut self, io: &mut CommandIo) -> Result<(), TaskError> {
        let fresh = self.task.output.read_from(self.cursor);
        if fresh.is_empty() {
            return Ok(());
        }
        io.write_all(&fresh).await?;
        self.cursor += fresh.len();
        self.task.delivered.fetch_max(self.cursor, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) async fn run(mut self, io: &mut CommandIo) -> Result<AttachOutcome, TaskError> {
        // History first, so the operator sees everything not yet shown.
        self.flush(io).await?;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let done = self.task.done.clone();
        let mut state = AttachState::Polling;

        loop {
            state = match state {
                AttachState::Polling => {
                    let event = tokio::select! {
                        biased;
                        _ = done.cancelled() => Event::Completed,
                        _ = ticker.tick() => Event::Tick,
                        line = io.read_line() => Event::Input(line),
                    };
                    match event {
                        Event::Completed => AttachState::Completing,
                        Event::Tick => {
                            self.flush(io).await?;
                            AttachState::Polling
                        }
                        Event::Input(Ok(Some(line))) if line.trim() == rexec_protocol::EXIT_COMMAND => {
                            AttachState::Detaching
                        }
                        Event::Input(Ok(Some(line))) => match self.task.write_input(&line).await {
                            Ok(()) => AttachState::Polling,
                            Err(TaskError::TaskFinished) => {
                                trace!(task_id = self.task.id, "input refused, task finished");
                                self.flush(io).await?;
                                return Err(TaskError::TaskFinished);
                            }
                            Err(err) => return Err(err),
                        },
                        Event::Input(Ok(None)) | Event::Input(Err(_)) => AttachState::Detaching,
                    }
                }
                AttachState::Detaching => {
                    self.flush(io).await?;
                    AttachState::Detached(AttachOutcome::Detached)
                }
                AttachState::Completing => {
                    self.flush(io).await?;
                    io.write_line("\nTask completed").await?;
                    AttachState::Detached(AttachOutcome::Completed)
                }
                AttachState::Detached(outcome) => return Ok(outcome),
            };
        }
    }
}

enum Event {
    Completed,
    Tick,
    Input(std::io::Result<Option<String>>),
}

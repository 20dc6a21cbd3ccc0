use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Local};
use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{CommandDescriptor, CommandHandler};
use crate::context::CommandContext;
use crate::error::TaskError;
use crate::interact::{AttachOutcome, Attachment};
use crate::io::CommandIo;
use crate::output::OutputBuffer;
use crate::pool::WorkerPool;
use crate::registry::Registry;

pub type TaskId = u64;

/// In-memory capacity of each task's input and output pipe.
const PIPE_CAPACITY: usize = 64 * 1024;
const DRAIN_CHUNK: usize = 1024;
pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Stopped,
    Finished,
}

/// A handler validated for execution on the task pool.
#[derive(Clone)]
pub struct BackgroundFn {
    name: String,
    handler: Arc<dyn CommandHandler>,
}

impl BackgroundFn {
    pub fn new(name: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Result<Self, TaskError> {
        let name = name.into();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(TaskError::Registration {
                reason: "name must be a single non-empty word".to_string(),
                name,
            });
        }
        Ok(Self { name, handler })
    }

    /// Only descriptors flagged as background-capable qualify.
    pub fn from_descriptor(descriptor: &CommandDescriptor) -> Result<Self, TaskError> {
        if !descriptor.background {
            return Err(TaskError::Registration {
                name: descriptor.name.clone(),
                reason: "command is not background-capable".to_string(),
            });
        }
        Self::new(descriptor.name.clone(), Arc::clone(&descriptor.handler))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One background unit of execution.
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub args: Vec<String>,
    pub started_at: DateTime<Local>,
    status: Mutex<TaskStatus>,
    /// Write end of the input pipe; `None` once closed.
    input: tokio::sync::Mutex<Option<DuplexStream>>,
    pub(crate) output: Arc<OutputBuffer>,
    /// Fires once, on completion or forced stop.
    pub(crate) done: CancellationToken,
    /// Bytes of output already shown to an interactive session.
    pub(crate) delivered: AtomicUsize,
    attached: AtomicBool,
}

impl Task {
    fn new(id: TaskId, name: String, args: Vec<String>, input: DuplexStream) -> Self {
        Self {
            id,
            name,
            args,
            started_at: Local::now(),
            status: Mutex::new(TaskStatus::Running),
            input: tokio::sync::Mutex::new(Some(input)),
            output: Arc::new(OutputBuffer::new()),
            done: CancellationToken::new(),
            delivered: AtomicUsize::new(0),
            attached: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: TaskStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn output(&self) -> Vec<u8> {
        self.output.snapshot()
    }

    /// Force-stop: mark stopped and broadcast completion.
    fn stop(&self) {
        self.set_status(TaskStatus::Stopped);
        self.done.cancel();
    }

    fn finish(&self) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status == TaskStatus::Running {
            *status = TaskStatus::Finished;
        }
        drop(status);
        self.done.cancel();
    }

    async fn close_input(&self) {
        // Dropping the write end delivers EOF to the task body.
        self.input.lock().await.take();
    }

    pub(crate) async fn write_input(&self, line: &str) -> Result<(), TaskError> {
        use tokio::io::AsyncWriteExt;

        let mut guard = self.input.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(TaskError::TaskFinished);
        };
        let mut payload = Vec::with_capacity(line.len() + 1);
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');

        tokio::select! {
            written = writer.write_all(&payload) => match written {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Err(TaskError::TaskFinished),
                Err(err) => Err(TaskError::Io(err)),
            },
            _ = self.done.cancelled() => Err(TaskError::TaskFinished),
        }
    }

    pub(crate) fn try_attach(self: &Arc<Self>) -> Result<AttachGuard, TaskError> {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TaskError::AlreadyAttached(self.id))?;
        Ok(AttachGuard {
            task: Arc::clone(self),
        })
    }
}

/// Clears the single-attacher flag when the interactive window closes.
pub(crate) struct AttachGuard {
    task: Arc<Task>,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.task.attached.store(false, Ordering::Release);
    }
}

/// Point-in-time view of a live task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub id: TaskId,
    pub name: String,
    pub args: Vec<String>,
    pub status: TaskStatus,
    pub started_at: DateTime<Local>,
}

struct TaskTable {
    tasks: HashMap<TaskId, Arc<Task>>,
    last_id: TaskId,
    pool: WorkerPool,
}

struct Inner {
    table: Mutex<TaskTable>,
    functions: RwLock<HashMap<String, BackgroundFn>>,
    pool_size: usize,
    poll_interval: Duration,
    rebooting: AtomicBool,
}

impl Inner {
    fn lock_table(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_task(&self, task: &Arc<Task>) {
        let mut table = self.lock_table();
        if table
            .tasks
            .get(&task.id)
            .is_some_and(|live| Arc::ptr_eq(live, task))
        {
            table.tasks.remove(&task.id);
        }
    }
}

/// Resets the reboot flag however the reboot ends.
struct RebootGuard<'a>(&'a AtomicBool);

impl Drop for RebootGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Pooled background execution with pipe-redirected I/O.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn new(pool_size: usize) -> Result<Self, TaskError> {
        Self::with_poll_interval(pool_size, DEFAULT_POLL_INTERVAL)
    }

    /// Like `new`, with a custom interactive output poll period.
    pub fn with_poll_interval(pool_size: usize, poll_interval: Duration) -> Result<Self, TaskError> {
        let pool = WorkerPool::new(pool_size)?;
        Ok(Self {
            inner: Arc::new(Inner {
                table: Mutex::new(TaskTable {
                    tasks: HashMap::new(),
                    last_id: 0,
                    pool,
                }),
                functions: RwLock::new(HashMap::new()),
                pool_size,
                poll_interval,
                rebooting: AtomicBool::new(false),
            }),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    pub fn register_function(&self, function: BackgroundFn) {
        debug!(function = %function.name, "registered background function");
        self.inner
            .functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(function.name.clone(), function);
    }

    /// Register every background-capable command currently in `registry`.
    pub fn sync_background_functions(&self, registry: &Registry) -> usize {
        let mut synced = 0;
        for descriptor in registry.list().iter().filter(|d| d.background) {
            match BackgroundFn::from_descriptor(descriptor) {
                Ok(function) => {
                    self.register_function(function);
                    synced += 1;
                }
                Err(err) => warn!(command = %descriptor.name, error = %err, "skipping background command"),
            }
        }
        synced
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.inner
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    fn function(&self, name: &str) -> Result<BackgroundFn, TaskError> {
        self.inner
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::UnknownFunction(name.to_string()))
    }

    /// Start `name` on the pool and report the new id to `io`.
    pub async fn start_task(
        &self,
        io: &mut CommandIo,
        name: &str,
        args: Vec<String>,
    ) -> Result<TaskId, TaskError> {
        let function = self.function(name)?;
        let task = self.spawn(function, args)?;
        io.write_line(&format!(
            "Started task {}: {} [{}]",
            task.id,
            task.name,
            task.args.join(" ")
        ))
        .await?;
        Ok(task.id)
    }

    fn spawn(&self, function: BackgroundFn, args: Vec<String>) -> Result<Arc<Task>, TaskError> {
        let (input_writer, input_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (output_writer, output_reader) = tokio::io::duplex(PIPE_CAPACITY);

        let mut table = self.inner.lock_table();
        table.last_id += 1;
        let id = table.last_id;
        let task = Arc::new(Task::new(id, function.name.clone(), args, input_writer));
        let drain = tokio::spawn(drain_output(output_reader, Arc::clone(&task.output)));
        table.tasks.insert(id, Arc::clone(&task));

        let job = run_task(
            Arc::clone(&self.inner),
            Arc::clone(&task),
            function,
            input_reader,
            output_writer,
            drain,
        );
        if let Err(err) = table.pool.submit(job) {
            task.stop();
            table.tasks.remove(&id);
            warn!(task_id = id, name = %task.name, error = %err, "task rejected by pool");
            return Err(err.into());
        }

        info!(task_id = id, name = %task.name, args = ?task.args, "task started");
        Ok(task)
    }

    /// Live tasks ordered by id.
    pub fn tasks(&self) -> Vec<TaskSummary> {
        let table = self.inner.lock_table();
        let mut tasks: Vec<TaskSummary> = table
            .tasks
            .values()
            .filter(|task| task.status() == TaskStatus::Running)
            .map(|task| TaskSummary {
                id: task.id,
                name: task.name.clone(),
                args: task.args.clone(),
                status: task.status(),
                started_at: task.started_at,
            })
            .collect();
        tasks.sort_by_key(|task| task.id);
        tasks
    }

    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.inner.lock_table().tasks.get(&id).cloned()
    }

    pub async fn list_tasks(&self, io: &mut CommandIo) -> Result<usize, TaskError> {
        let tasks = self.tasks();
        if tasks.is_empty() {
            io.write_line("No running background tasks").await?;
            return Ok(0);
        }
        for task in &tasks {
            io.write_line(&format!(
                "{}\t{}\t{}\t{}",
                task.id,
                task.started_at.format("%Y-%m-%d %H:%M:%S"),
                task.name,
                task.args.join(" ")
            ))
            .await?;
        }
        Ok(tasks.len())
    }

    fn running_task(&self, id: TaskId) -> Result<Arc<Task>, TaskError> {
        let table = self.inner.lock_table();
        let task = table.tasks.get(&id).ok_or(TaskError::NotFound(id))?;
        if task.status() != TaskStatus::Running {
            return Err(TaskError::NotRunning(id));
        }
        Ok(Arc::clone(task))
    }

    /// Bind `io` to a running task until `exit` is typed or the task ends.
    pub async fn interact_task(
        &self,
        io: &mut CommandIo,
        raw_id: &str,
    ) -> Result<AttachOutcome, TaskError> {
        let id = parse_task_id(raw_id)?;
        let task = self.running_task(id)?;
        let _guard = task.try_attach()?;

        io.write_line(&format!("Interacting with task {id}")).await?;
        debug!(task_id = id, "attached");
        let outcome = Attachment::new(Arc::clone(&task), self.inner.poll_interval)
            .run(io)
            .await;
        debug!(task_id = id, outcome = ?outcome, "detached");
        outcome
    }

    pub async fn kill_task(&self, io: &mut CommandIo, raw_id: &str) -> Result<(), TaskError> {
        let id = parse_task_id(raw_id)?;
        let task = {
            let mut table = self.inner.lock_table();
            let task = table.tasks.get(&id).ok_or(TaskError::NotFound(id))?;
            if task.status() != TaskStatus::Running {
                return Err(TaskError::NotRunning(id));
            }
            let task = Arc::clone(task);
            task.stop();
            table.tasks.remove(&id);
            task
        };
        task.close_input().await;

        info!(task_id = id, name = %task.name, "task killed");
        io.write_line(&format!("Killed task {id} ({})", task.name))
            .await?;
        Ok(())
    }

    /// Stop everything, rebuild the pool, and start the previously running
    /// tasks again with fresh ids.
    pub async fn reboot(&self, io: &mut CommandIo) -> Result<usize, TaskError> {
        if self.inner.rebooting.swap(true, Ordering::AcqRel) {
            return Err(TaskError::RebootInProgress);
        }
        let _guard = RebootGuard(&self.inner.rebooting);

        let (restart, stopped, old_pool) = {
            let mut table = self.inner.lock_table();
            let mut running: Vec<&Arc<Task>> = table
                .tasks
                .values()
                .filter(|task| task.status() == TaskStatus::Running)
                .collect();
            running.sort_by_key(|task| task.id);
            let restart: Vec<(String, Vec<String>)> = running
                .into_iter()
                .map(|task| (task.name.clone(), task.args.clone()))
                .collect();

            let stopped: Vec<Arc<Task>> = table.tasks.drain().map(|(_, task)| task).collect();
            for task in &stopped {
                task.stop();
            }

            // The closed pool stays installed, so nothing new is admitted
            // until the stopped bodies have given their workers back.
            table.pool.release();
            (restart, stopped, table.pool.clone())
        };
        for task in &stopped {
            task.close_input().await;
        }
        info!(stopped = stopped.len(), restarting = restart.len(), "task manager rebooting");
        old_pool.wait().await;
        self.inner.lock_table().pool = WorkerPool::new(self.inner.pool_size)?;

        io.write_line("Rebooting task manager...").await?;
        let mut restarted = 0;
        for (name, args) in restart {
            match self.start_task(io, &name, args).await {
                Ok(_) => restarted += 1,
                Err(TaskError::Io(err)) => return Err(TaskError::Io(err)),
                Err(err) => {
                    warn!(name = %name, error = %err, "task restart failed");
                    io.write_line(&format!("Failed to restart {name}: {err}"))
                        .await?;
                }
            }
        }
        io.write_line("Task manager rebooted successfully").await?;
        Ok(restarted)
    }

    /// Refuse new work; running bodies are left to finish on their own.
    pub fn shutdown(&self) {
        self.inner.lock_table().pool.release();
    }
}

pub fn parse_task_id(raw: &str) -> Result<TaskId, TaskError> {
    raw.trim()
        .parse::<TaskId>()
        .map_err(|_| TaskError::InvalidId(raw.to_string()))
}

async fn drain_output(mut reader: DuplexStream, output: Arc<OutputBuffer>) {
    let mut buf = [0u8; DRAIN_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => output.append(&buf[..n]),
        }
    }
}

async fn run_task(
    inner: Arc<Inner>,
    task: Arc<Task>,
    function: BackgroundFn,
    input: DuplexStream,
    output: DuplexStream,
    drain: JoinHandle<()>,
) {
    let mut io = CommandIo::new(input, output);
    let ctx = CommandContext::with_token(task.done.clone());

    let result = AssertUnwindSafe(function.handler.call(&mut io, ctx, task.args.clone()))
        .catch_unwind()
        .await;
    match result {
        Ok(Ok(out)) => debug!(task_id = task.id, bytes = out.len(), "task body returned"),
        Ok(Err(err)) => {
            warn!(task_id = task.id, error = %err, "task body failed");
            let _ = io.write_line(&format!("Error: {err}")).await;
        }
        Err(_) => warn!(task_id = task.id, "task body panicked"),
    }

    let _ = io.shutdown().await;
    drop(io);
    task.close_input().await;
    // The buffer must be complete before completion is observable.
    let _ = drain.await;
    task.finish();
    inner.remove_task(&task);
    info!(task_id = task.id, name = %task.name, "task finished");
}

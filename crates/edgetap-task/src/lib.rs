//! Cooperative task plumbing shared by the capture pipeline.
//!
//! Every long-running loop implements [`Task`] and observes a [`ShutdownSignal`] at its
//! suspension points. A [`TaskSet`] groups the tasks of one lifecycle (e.g.: a capture
//! session) so they can be stopped together with a deadline.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

#[derive(Debug)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = watch::channel(false);
        (Self(sender), ShutdownSignal(receiver))
    }

    /// Requests shutdown. Signals observed after this call resolve immediately.
    pub fn signal(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Waits until shutdown is requested (or the handle is gone).
    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|requested| *requested).await;
    }

    pub fn is_signaled(&self) -> bool {
        *self.0.borrow()
    }
}

/// Aborts the running task when dropped.
/// Also see https://github.com/tokio-rs/tokio/issues/1830 for some background.
#[must_use]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub async fn join(mut self) -> Result<T, JoinError> {
        (&mut self.0).await
    }

    /// Immediately abort the task
    pub fn abort(&self) {
        self.0.abort()
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> ChildTask<T::Output>
where
    T: Task + 'static,
{
    let task_fut = task.run(shutdown_signal);
    let handle = spawn_task_impl(task_fut, T::NAME);
    ChildTask(handle)
}

#[cfg(not(all(feature = "named_tasks", tokio_unstable)))]
#[track_caller]
fn spawn_task_impl<T>(future: T, _name: &str) -> JoinHandle<T::Output>
where
    T: Future + Send + 'static,
    T::Output: Send + 'static,
{
    tokio::task::spawn(future)
}

#[cfg(all(feature = "named_tasks", tokio_unstable))]
#[track_caller]
fn spawn_task_impl<T>(future: T, name: &str) -> JoinHandle<T::Output>
where
    T: Future + Send + 'static,
    T::Output: Send + 'static,
{
    // NOTE: requires RUSTFLAGS="--cfg tokio_unstable" and the `named_tasks` feature.
    tokio::task::Builder::new()
        .name(name)
        .spawn(future)
        .expect("task builder never fails without a runtime-level error")
}

/// How a task of a [`TaskSet`] ended.
#[derive(Debug)]
pub enum TaskOutcome<O> {
    Finished { name: &'static str, output: O },
    Panicked { name: &'static str, error: JoinError },
    Aborted { name: &'static str },
}

impl<O> TaskOutcome<O> {
    pub fn name(&self) -> &'static str {
        match self {
            TaskOutcome::Finished { name, .. } | TaskOutcome::Panicked { name, .. } | TaskOutcome::Aborted { name } => {
                *name
            }
        }
    }
}

/// Tasks sharing a single shutdown handle.
pub struct TaskSet<O> {
    tasks: Vec<(&'static str, ChildTask<O>)>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl<O: Send + 'static> TaskSet<O> {
    pub fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        Self {
            tasks: Vec::new(),
            shutdown_handle,
            shutdown_signal,
        }
    }

    pub fn register<T>(&mut self, task: T)
    where
        T: Task<Output = O> + 'static,
    {
        let child = spawn_task(task, self.shutdown_signal.clone());
        self.tasks.push((T::NAME, child));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signals shutdown, then joins the tasks in registration order.
    ///
    /// Tasks still running once `grace` is elapsed are aborted.
    pub async fn shutdown(self, grace: Duration) -> Vec<TaskOutcome<O>> {
        self.shutdown_handle.signal();

        let deadline = tokio::time::Instant::now() + grace;
        let mut outcomes = Vec::with_capacity(self.tasks.len());

        for (name, child) in self.tasks {
            let outcome = match tokio::time::timeout_at(deadline, child.join()).await {
                Ok(Ok(output)) => TaskOutcome::Finished { name, output },
                Ok(Err(error)) if error.is_cancelled() => TaskOutcome::Aborted { name },
                Ok(Err(error)) => TaskOutcome::Panicked { name, error },
                // The join future owned the ChildTask; dropping it aborted the task.
                Err(_elapsed) => TaskOutcome::Aborted { name },
            };

            outcomes.push(outcome);
        }

        outcomes
    }
}

impl<O: Send + 'static> Default for TaskSet<O> {
    fn default() -> Self {
        Self::new()
    }
}

//! Cooperative periodic task scheduler.
//!
//! A [`Task`] runs an async step function over and over, no more often than
//! its minimum interval, until it is stopped. Cancellation is cooperative:
//! the step receives a [`TaskContext`] whose token must be polled at safe
//! points with [`TaskContext::checkpoint`].
//!
//! Tokens are generation counted. Every [`Task::restart`] bumps the
//! generation; a token compares its own generation with the current one, so
//! a step holding a token from an earlier iteration always sees itself as
//! cancelled.
//!
//! ```text
//!   spawn ──► running ──(iteration)──► sleep(min_interval − elapsed) ──┐
//!               ▲                                                       │
//!               └──────────────── round += 1 ◄──────────────────────────┘
//!
//!   restart(): cancel current token, next iteration starts immediately
//!   abort():   running = false, cancel, wait for exit
//!   stop():    running = false, wait for exit
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Error Types
// ============================================================================

/// Outcome of a failed or interrupted iteration.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The iteration observed cancellation at a checkpoint.
    ///
    /// Not a failure: the loop swallows it and never reports it.
    #[error("Task iteration aborted")]
    Aborted,

    /// The step function failed
    #[error("Task iteration failed: {0}")]
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl TaskError {
    /// Wrap any error as an iteration failure.
    pub fn failed(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Failed(err.into())
    }

    /// Whether this is the cancellation signal.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Result type for task steps.
pub type TaskResult<T> = Result<T, TaskError>;

/// Boxed step future.
pub type TaskFuture = Pin<Box<dyn Future<Output = TaskResult<()>> + Send>>;

// ============================================================================
// Cancellation
// ============================================================================

/// Cancellation token bound to one generation of a [`Task`].
#[derive(Clone, Debug)]
pub struct CancelToken {
    generation: u64,
    rx: watch::Receiver<u64>,
}

impl CancelToken {
    /// Generation this token was issued for.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the task moved past this token's generation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() != self.generation
    }

    /// Cooperative cancellation point.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Aborted`] once the token is cancelled.
    pub fn checkpoint(&self) -> TaskResult<()> {
        if self.is_cancelled() {
            Err(TaskError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled or its task is gone.
    pub async fn cancelled(&self) {
        let generation = self.generation;
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|current| *current != generation).await;
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` when the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.cancelled() => false,
        }
    }
}

#[cfg(test)]
impl CancelToken {
    /// Token driven by the returned sender instead of a [`Task`].
    pub(crate) fn manual() -> (watch::Sender<u64>, Self) {
        let (tx, rx) = watch::channel(0);
        (tx, Self { generation: 0, rx })
    }
}

/// Everything a step function receives for one iteration.
#[derive(Clone, Debug)]
pub struct TaskContext {
    /// Token of this iteration
    pub token: CancelToken,
    /// Iteration counter, starting at 0
    pub round: u64,
}

impl TaskContext {
    /// Shorthand for [`CancelToken::checkpoint`].
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Aborted`] once the iteration is cancelled.
    #[inline]
    pub fn checkpoint(&self) -> TaskResult<()> {
        self.token.checkpoint()
    }

    /// Shorthand for [`CancelToken::sleep`].
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.token.sleep(duration).await
    }
}

// ============================================================================
// Task
// ============================================================================

/// Task behaviour settings.
#[derive(Clone, Debug)]
pub struct TaskOptions {
    /// Minimum time between the starts of two iterations
    pub min_interval: Duration,
    /// Keep looping after a failed iteration
    pub auto_restart: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            auto_restart: true,
        }
    }
}

/// Events published by a running task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskEvent {
    /// An iteration failed with the given message
    Error(String),
}

type Handler = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

struct Shared {
    running: watch::Sender<bool>,
    generation: watch::Sender<u64>,
    events: broadcast::Sender<TaskEvent>,
}

impl Shared {
    fn token(&self) -> CancelToken {
        let rx = self.generation.subscribe();
        let generation = *rx.borrow();
        CancelToken { generation, rx }
    }

    fn cancel(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

/// A periodic, cancellable loop around an async step function.
pub struct Task {
    shared: Arc<Shared>,
    exited: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

impl Task {
    /// Start looping `handler` immediately.
    pub fn spawn<F, Fut>(handler: F, options: TaskOptions) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx| Box::pin(handler(ctx)) as TaskFuture);
        let (events, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            running: watch::Sender::new(true),
            generation: watch::Sender::new(0),
            events,
        });
        let (exit_tx, exited) = watch::channel(false);

        let handle = tokio::spawn(run_loop(handler, options, Arc::clone(&shared), exit_tx));

        Self { shared, exited, handle }
    }

    /// Whether the loop is still accepting iterations.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.shared.running.borrow()
    }

    /// Current cancellation generation; increases by one per restart.
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.shared.generation.borrow()
    }

    /// Subscribe to task events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events.subscribe()
    }

    /// Cancel the in-flight iteration and begin the next one right away.
    pub fn restart(&self) {
        if self.is_running() {
            self.shared.cancel();
        }
    }

    /// Cancel the in-flight iteration and wait for the loop to exit.
    pub async fn abort(&self) {
        self.shared.running.send_replace(false);
        self.shared.cancel();
        self.wait_exit().await;
    }

    /// Let the in-flight iteration finish, then wait for the loop to exit.
    pub async fn stop(&self) {
        self.shared.running.send_replace(false);
        self.wait_exit().await;
    }

    async fn wait_exit(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.shared.running.send_replace(false);
        self.shared.cancel();
        self.handle.abort();
    }
}

async fn run_loop(
    handler: Handler,
    options: TaskOptions,
    shared: Arc<Shared>,
    exit_tx: watch::Sender<bool>,
) {
    let mut running_rx = shared.running.subscribe();
    let mut round = 0u64;

    while *shared.running.borrow() {
        let started = Instant::now();
        let token = shared.token();
        let idle = token.clone();

        // Each iteration runs as its own task so a panicking step is
        // reported like any other failure.
        let outcome = tokio::spawn(handler(TaskContext { token, round })).await;
        let failure = match outcome {
            Ok(Ok(())) | Ok(Err(TaskError::Aborted)) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(join_err) => Some(format!("Task iteration panicked: {join_err}")),
        };

        if let Some(message) = failure {
            tracing::error!("Task round {} failed: {}", round, message);
            let _ = shared.events.send(TaskEvent::Error(message));
            if !options.auto_restart {
                break;
            }
        }

        round += 1;

        if !*shared.running.borrow() || idle.is_cancelled() {
            continue;
        }

        let remaining = options.min_interval.saturating_sub(started.elapsed());
        if !remaining.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(remaining) => {}
                () = idle.cancelled() => {}
                _ = running_rx.wait_for(|running| !*running) => {}
            }
        }
    }

    shared.running.send_replace(false);
    let _ = exit_tx.send(true);
}

// ============================================================================
// Tests
// ============================================================================

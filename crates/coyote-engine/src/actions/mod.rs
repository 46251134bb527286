//! Override actions that preempt a controller's default output.
//!
//! An action is queued on a [`GameController`]; while it is at the head of
//! the queue the control loop calls [`GameAction::execute`] instead of the
//! default strength/waveform cycle. At most one action of a given
//! [`GameAction::kind`] is queued; a second one merges into the first
//! through [`GameAction::update_from`].

mod fire;

use std::any::Any;
use std::future::Future;
use std::pin::Pin;

use crate::controller::GameController;
use crate::task::{TaskContext, TaskResult};

pub use fire::{FireAction, FireConfig, FireUpdateMode, FIRE_MAX_DURATION, FIRE_MAX_STRENGTH};

/// Boxed future borrowed for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What the control loop does with an action after an iteration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Run it again next iteration
    Continue,
    /// Remove it from the queue
    Done,
}

/// A queued override of the default output.
pub trait GameAction: Send + Sync + 'static {
    /// Identity; actions of the same kind merge instead of stacking.
    fn kind(&self) -> &'static str;

    /// Queue position, highest first.
    fn priority(&self) -> i32 {
        0
    }

    /// Called once when the action is first queued.
    fn initialize<'a>(&'a self, game: &'a GameController) -> BoxFuture<'a, ()>;

    /// Run one iteration of the action.
    ///
    /// # Errors
    ///
    /// Returns [`crate::task::TaskError::Aborted`] when cancelled, or any
    /// failure that should be reported by the control loop.
    fn execute<'a>(
        &'a self,
        game: &'a GameController,
        ctx: &'a TaskContext,
    ) -> BoxFuture<'a, TaskResult<ActionOutcome>>;

    /// Merge a newer action of the same kind into this one.
    fn update_from<'a>(
        &'a self,
        game: &'a GameController,
        other: &'a dyn GameAction,
    ) -> BoxFuture<'a, ()>;

    /// Called when the action is removed before reporting [`ActionOutcome::Done`].
    fn on_stop(&self, _game: &GameController) {}

    /// Downcasting support for [`GameAction::update_from`].
    fn as_any(&self) -> &dyn Any;
}

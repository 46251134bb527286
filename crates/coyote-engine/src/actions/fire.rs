//! Timed strength boost ("fire").

use std::any::Any;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{ActionOutcome, BoxFuture, GameAction};
use crate::controller::GameController;
use crate::task::{TaskContext, TaskResult};

/// Largest boost a fire action may add.
pub const FIRE_MAX_STRENGTH: u32 = 30;

/// Longest a fire action may last, and the longest single output window.
pub const FIRE_MAX_DURATION: Duration = Duration::from_secs(30);

/// How a repeated fire combines with the running one.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FireUpdateMode {
    /// End `time` after the update
    #[default]
    Replace,
    /// Extend the current end by `time`
    Append,
}

/// Fire request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FireConfig {
    /// Boost on top of the base strength
    pub strength: u32,
    /// Duration in milliseconds
    pub time: u64,
    /// Waveform to play while firing
    #[serde(default)]
    pub pulse_id: Option<String>,
    /// Merge behaviour for repeated requests
    #[serde(default)]
    pub update_mode: FireUpdateMode,
}

#[derive(Debug)]
struct FireState {
    strength: u32,
    end_at: Instant,
    pulse_id: Option<String>,
}

/// Raises output by a fixed boost until a deadline, then drops back to the
/// base strength and leaves the queue.
#[derive(Debug)]
pub struct FireAction {
    config: FireConfig,
    priority: i32,
    state: Mutex<FireState>,
}

impl FireAction {
    /// Kind shared by all fire actions.
    pub const KIND: &'static str = "fire";

    /// Fire with the default priority.
    #[must_use]
    pub fn new(config: FireConfig) -> Self {
        let state = FireState {
            strength: config.strength.min(FIRE_MAX_STRENGTH),
            end_at: Instant::now() + duration_of(&config),
            pulse_id: config.pulse_id.clone(),
        };
        Self {
            config,
            priority: 0,
            state: Mutex::new(state),
        }
    }

    /// Override the queue priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Request this action was built from.
    #[must_use]
    pub fn config(&self) -> &FireConfig {
        &self.config
    }

    /// Active boost.
    #[must_use]
    pub fn strength(&self) -> u32 {
        self.state().strength
    }

    /// Time left until the fire ends.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.state().end_at.saturating_duration_since(Instant::now())
    }

    fn state(&self) -> MutexGuard<'_, FireState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_over(&self) -> bool {
        Instant::now() >= self.state().end_at
    }
}

fn duration_of(config: &FireConfig) -> Duration {
    Duration::from_millis(config.time).min(FIRE_MAX_DURATION)
}

/// Strength `base + boost`, bounded by the device limit.
fn boosted(game: &GameController, boost: u32) -> u32 {
    game.client_strength().clamp(game.strength_config().strength.saturating_add(boost))
}

impl GameAction for FireAction {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn initialize<'a>(&'a self, game: &'a GameController) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let strength = {
                let mut state = self.state();
                state.end_at = Instant::now() + duration_of(&self.config);
                if state.pulse_id.is_none() {
                    state.pulse_id =
                        game.game_config().fire_pulse_id.or_else(|| game.current_pulse_id());
                }
                state.strength
            };
            game.set_temp_strength(strength);
        })
    }

    fn execute<'a>(
        &'a self,
        game: &'a GameController,
        ctx: &'a TaskContext,
    ) -> BoxFuture<'a, TaskResult<ActionOutcome>> {
        Box::pin(async move {
            let (boost, window, pulse_id) = {
                let state = self.state();
                let left = state.end_at.saturating_duration_since(Instant::now());
                (state.strength, left.min(FIRE_MAX_DURATION), state.pulse_id.clone())
            };

            game.set_client_strength(boosted(game, boost)).await?;

            let lower_early: BoxFuture<'_, ()> = Box::pin(async move {
                if self.is_over() {
                    let base = game.client_strength().clamp(game.strength_config().strength);
                    if let Err(e) = game.set_client_strength(base).await {
                        tracing::warn!("Failed to end fire on {}: {}", game.client_id(), e);
                    }
                }
            });
            game.output_pulse(pulse_id.as_deref(), window, &ctx.token, Some(lower_early))
                .await?;

            if self.is_over() {
                game.set_temp_strength(0);
                tracing::debug!("Fire ended on {}", game.client_id());
                return Ok(ActionOutcome::Done);
            }
            Ok(ActionOutcome::Continue)
        })
    }

    fn update_from<'a>(
        &'a self,
        game: &'a GameController,
        other: &'a dyn GameAction,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(other) = other.as_any().downcast_ref::<FireAction>() else {
                return;
            };
            let config = &other.config;

            let boost = {
                let mut state = self.state();
                let now = Instant::now();
                state.end_at = match config.update_mode {
                    FireUpdateMode::Replace => now + duration_of(config),
                    FireUpdateMode::Append => {
                        (state.end_at.max(now) + duration_of(config)).min(now + FIRE_MAX_DURATION)
                    }
                };
                if config.pulse_id.is_some() {
                    state.pulse_id.clone_from(&config.pulse_id);
                }
                if config.strength > 0 {
                    state.strength = config.strength.min(FIRE_MAX_STRENGTH);
                    Some(state.strength)
                } else {
                    None
                }
            };

            if let Some(boost) = boost {
                game.set_temp_strength(boost);
                if let Err(e) = game.set_client_strength(boosted(game, boost)).await {
                    tracing::warn!("Failed to apply fire update on {}: {}", game.client_id(), e);
                }
            }
        })
    }

    fn on_stop(&self, game: &GameController) {
        game.set_temp_strength(0);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Tests
// ============================================================================

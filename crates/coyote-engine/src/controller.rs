//! Per-device game controller.
//!
//! A [`GameController`] keeps a bound device playing waveforms and perturbs
//! its strength on a randomized schedule. Short-lived [`GameAction`]s, kept
//! in a priority-ordered list, can take over individual iterations of the
//! control loop without discarding the underlying configuration.
//!
//! ```text
//!              ┌──────────── Task iteration ────────────┐
//!              │ no session?     → stop game            │
//!              │ action queued?  → action.execute()     │
//!              │ otherwise:                             │
//!              │   pick waveform (playlist)             │
//!              │   window = uniform(interval) seconds   │
//!              │   target = base + uniform(0, random)   │
//!              │   ramp up +2 / 200ms, or drop at once  │
//!              │   checkpoint, stream window            │
//!              └────────────────────────────────────────┘
//! ```

use std::cmp::Reverse;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use coyote_core::{Channel, StrengthInfo, WaveformScript};

use crate::actions::{ActionOutcome, BoxFuture, GameAction};
use crate::cache::ConfigCache;
use crate::library::{LibraryEvent, PulseInfo, PulseLibrary};
use crate::playlist::{PlaylistMode, PulsePlaylist};
use crate::session::{DgLabSession, SessionError, SessionEvent, SessionResult};
use crate::subscription::Subscription;
use crate::task::{CancelToken, Task, TaskContext, TaskOptions, TaskResult};

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by controller operations.
#[derive(Debug, Error)]
pub enum GameError {
    /// The client id already has a live device
    #[error("Client already bound: {0}")]
    AlreadyBound(String),

    /// The controller was destroyed
    #[error("Game controller closed: {0}")]
    Closed(String),

    /// Session failure
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Result type for controller operations.
pub type GameResult<T> = Result<T, GameError>;

// ============================================================================
// Configuration
// ============================================================================

/// Base target strength and the amplitude of its random increment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrengthConfig {
    /// Base strength
    pub strength: u32,
    /// Upper bound of the random increment
    pub random_strength: u32,
}

impl Default for StrengthConfig {
    fn default() -> Self {
        Self {
            strength: 5,
            random_strength: 5,
        }
    }
}

/// Partial strength update merged into the current config.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrengthConfigPatch {
    /// New base strength
    pub strength: Option<u32>,
    /// New random increment bound
    pub random_strength: Option<u32>,
}

impl StrengthConfigPatch {
    /// Apply onto `base`.
    #[must_use]
    pub fn apply(&self, base: StrengthConfig) -> StrengthConfig {
        StrengthConfig {
            strength: self.strength.unwrap_or(base.strength),
            random_strength: self.random_strength.unwrap_or(base.random_strength),
        }
    }
}

/// One waveform id or a list of them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PulseIds {
    /// A single id
    One(String),
    /// A playlist
    Many(Vec<String>),
}

impl PulseIds {
    /// Flatten into a list.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(id) => vec![id.clone()],
            Self::Many(ids) => ids.clone(),
        }
    }
}

impl Default for PulseIds {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

/// User-facing game settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameConfig {
    /// Seconds between strength decisions, sampled from `[min, max]`
    pub strength_change_interval: [u32; 2],
    /// Drive channel B as well
    pub enable_b_channel: bool,
    /// Channel B strength as a multiple of channel A's
    pub b_channel_strength_multiplier: f64,
    /// Waveform ids to play; empty plays the library default
    pub pulse_id: PulseIds,
    /// Playlist mode over `pulse_id`
    pub pulse_mode: PlaylistMode,
    /// Seconds between waveform changes
    pub pulse_change_interval: u32,
    /// Waveform for fire actions
    pub fire_pulse_id: Option<String>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            strength_change_interval: [15, 30],
            enable_b_channel: false,
            b_channel_strength_multiplier: 1.0,
            pulse_id: PulseIds::default(),
            pulse_mode: PlaylistMode::Single,
            pulse_change_interval: 60,
            fire_pulse_id: None,
        }
    }
}

impl GameConfig {
    fn playlist_changed(&self, other: &Self) -> bool {
        self.pulse_id != other.pulse_id
            || self.pulse_mode != other.pulse_mode
            || self.pulse_change_interval != other.pulse_change_interval
    }

    fn restart_required(&self, other: &Self) -> bool {
        self.playlist_changed(other)
            || self.strength_change_interval != other.strength_change_interval
            || self.enable_b_channel != other.enable_b_channel
            || (self.b_channel_strength_multiplier - other.b_channel_strength_multiplier).abs()
                > f64::EPSILON
    }

    fn build_playlist(&self) -> PulsePlaylist {
        PulsePlaylist::starting_at(
            self.pulse_id.to_vec(),
            self.pulse_mode,
            Duration::from_secs(u64::from(self.pulse_change_interval)),
            Instant::now().into_std(),
        )
    }

    fn sample_window<R: Rng>(&self, rng: &mut R) -> Duration {
        let [min, max] = self.strength_change_interval;
        let secs = if min < max { rng.gen_range(min..=max) } else { min };
        Duration::from_secs(u64::from(secs))
    }
}

/// Controller tuning.
#[derive(Clone, Debug)]
pub struct ControllerOptions {
    /// Strength changes up to this many units are applied without a restart
    pub direct_strength_delta: i64,
    /// Step of the upward strength ramp
    pub ramp_step: u32,
    /// Period of the upward strength ramp
    pub ramp_interval: Duration,
    /// Upper bound on script expansions per output window
    pub max_batches: usize,
    /// Extra wait after a queue longer than the window
    pub output_tail: Duration,
    /// Control loop settings
    pub task: TaskOptions,
    /// Strength config of a fresh controller
    pub default_strength: StrengthConfig,
    /// Game config of a fresh controller
    pub default_game: GameConfig,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            direct_strength_delta: 5,
            ramp_step: 2,
            ramp_interval: Duration::from_millis(200),
            max_batches: 50,
            output_tail: Duration::from_millis(200),
            task: TaskOptions::default(),
            default_strength: StrengthConfig::default(),
            default_game: GameConfig::default(),
        }
    }
}

/// Strength of channel A plus the temporary boost on top of it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStrengthInfo {
    /// Current device strength
    pub strength: u32,
    /// Device limit
    pub limit: u32,
    /// Active temporary boost
    pub temp_strength: u32,
}

/// Events published by a controller.
#[derive(Clone, Debug, PartialEq)]
pub enum GameEvent {
    /// A device session was bound
    ClientConnected,
    /// The bound device went away
    ClientDisconnected,
    /// The control loop started
    GameStarted,
    /// The control loop stopped
    GameStopped,
    /// Device or temporary strength changed
    StrengthChanged(GameStrengthInfo),
    /// The strength config was replaced
    StrengthConfigUpdated(StrengthConfig),
    /// The shared waveform list changed
    PulseListUpdated(Vec<PulseInfo>),
    /// The controller was destroyed; always the last event
    Close,
}

// ============================================================================
// Controller
// ============================================================================

struct ActionSlot {
    action: Arc<dyn GameAction>,
    priority: i32,
}

struct GameState {
    strength_config: StrengthConfig,
    game_config: GameConfig,
    playlist: PulsePlaylist,
    actions: Vec<ActionSlot>,
    temp_strength: u32,
    custom_pulses: Vec<WaveformScript>,
}

/// Autonomous control loop for one device.
pub struct GameController {
    client_id: String,
    options: ControllerOptions,
    library: Arc<PulseLibrary>,
    cache: Option<Arc<ConfigCache<StrengthConfig>>>,
    state: Mutex<GameState>,
    session: RwLock<Option<Arc<DgLabSession>>>,
    task: tokio::sync::Mutex<Option<Task>>,
    ramp: Mutex<Option<JoinHandle<()>>>,
    client_subscription: Mutex<Subscription>,
    library_subscription: Mutex<Subscription>,
    events: broadcast::Sender<GameEvent>,
    closed: AtomicBool,
    weak_self: Weak<Self>,
}

impl std::fmt::Debug for GameController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameController")
            .field("client_id", &self.client_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl GameController {
    /// Create a controller for `client_id`, not yet bound to a device.
    pub fn new(
        client_id: impl Into<String>,
        library: Arc<PulseLibrary>,
        cache: Option<Arc<ConfigCache<StrengthConfig>>>,
        options: ControllerOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let state = GameState {
            strength_config: options.default_strength,
            playlist: options.default_game.build_playlist(),
            game_config: options.default_game.clone(),
            actions: Vec::new(),
            temp_strength: 0,
            custom_pulses: Vec::new(),
        };

        Arc::new_cyclic(|weak_self| Self {
            client_id: client_id.into(),
            options,
            library,
            cache,
            state: Mutex::new(state),
            session: RwLock::new(None),
            task: tokio::sync::Mutex::new(None),
            ramp: Mutex::new(None),
            client_subscription: Mutex::new(Subscription::new()),
            library_subscription: Mutex::new(Subscription::new()),
            events,
            closed: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// Restore cached settings and start following the waveform library.
    pub fn initialize(&self) {
        if let Some(cached) = self.cache.as_ref().and_then(|c| c.get(&self.cache_key())) {
            tracing::info!("Restored strength config for {}", self.client_id);
            self.state().strength_config = cached;
            let _ = self.events.send(GameEvent::StrengthConfigUpdated(cached));
        }

        let events = self.events.clone();
        self.library_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listen(self.library.subscribe(), move |LibraryEvent::ListUpdated(list)| {
                let _ = events.send(GameEvent::PulseListUpdated(list));
                async { ControlFlow::Continue(()) }
            });
    }

    fn cache_key(&self) -> String {
        format!("coyote-game:{}:strength", self.client_id)
    }

    fn state(&self) -> MutexGuard<'_, GameState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Client id this controller serves.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Subscribe to controller events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.events.subscribe()
    }

    /// Bound session, if any.
    #[must_use]
    pub fn session(&self) -> Option<Arc<DgLabSession>> {
        self.session.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether [`Self::destroy`] ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether a live device is bound.
    #[must_use]
    pub fn has_live_client(&self) -> bool {
        self.session().is_some_and(|s| !s.is_closed())
    }

    /// Current strength config.
    #[must_use]
    pub fn strength_config(&self) -> StrengthConfig {
        self.state().strength_config
    }

    /// Current game config.
    #[must_use]
    pub fn game_config(&self) -> GameConfig {
        self.state().game_config.clone()
    }

    /// Channel A state of the bound device.
    #[must_use]
    pub fn client_strength(&self) -> StrengthInfo {
        self.session().map(|s| s.strength(Channel::A)).unwrap_or_default()
    }

    /// Channel A state plus the temporary boost.
    #[must_use]
    pub fn game_strength(&self) -> GameStrengthInfo {
        let info = self.client_strength();
        GameStrengthInfo {
            strength: info.strength,
            limit: info.limit,
            temp_strength: self.state().temp_strength,
        }
    }

    /// Set the temporary boost and publish the new game strength.
    pub fn set_temp_strength(&self, value: u32) {
        self.state().temp_strength = value;
        let _ = self.events.send(GameEvent::StrengthChanged(self.game_strength()));
    }

    /// Waveform id the playlist selects right now.
    pub fn current_pulse_id(&self) -> Option<String> {
        self.state()
            .playlist
            .current_pulse_id_at(Instant::now().into_std())
            .map(ToString::to_string)
    }

    /// Replace the per-controller waveforms, looked up before the library.
    pub fn set_custom_pulses(&self, pulses: Vec<WaveformScript>) {
        self.state().custom_pulses = pulses;
    }

    /// Kinds of queued actions, highest priority first.
    #[must_use]
    pub fn action_kinds(&self) -> Vec<&'static str> {
        self.state().actions.iter().map(|slot| slot.action.kind()).collect()
    }

    /// Queued action of `kind`.
    #[must_use]
    pub fn action(&self, kind: &str) -> Option<Arc<dyn GameAction>> {
        self.state()
            .actions
            .iter()
            .find(|slot| slot.action.kind() == kind)
            .map(|slot| Arc::clone(&slot.action))
    }

    /// Whether the control loop is running.
    pub async fn is_running(&self) -> bool {
        self.task.lock().await.as_ref().is_some_and(Task::is_running)
    }

    /// Cancellation generation of the running loop.
    pub async fn task_generation(&self) -> Option<u64> {
        self.task.lock().await.as_ref().map(Task::generation)
    }

    // ========================================================================
    // Client Binding
    // ========================================================================

    /// Attach a device session, replacing any previous one.
    ///
    /// Output is reset to zero strength and empty queues.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::Closed`] on a destroyed controller, or the
    /// session failure while resetting the device.
    pub async fn bind_client(&self, session: Arc<DgLabSession>) -> GameResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GameError::Closed(self.client_id.clone()));
        }

        self.stop_game_inner(true).await;
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));
        self.subscribe_client(&session);

        tracing::info!(
            "Client bound: {} -> {}",
            self.client_id,
            session.target_id().unwrap_or_default()
        );
        let _ = self.events.send(GameEvent::ClientConnected);
        let _ = self.events.send(GameEvent::GameStopped);

        self.state().temp_strength = 0;
        self.set_client_strength(0).await?;
        session.reset().await?;

        let _ = self.events.send(GameEvent::StrengthChanged(GameStrengthInfo {
            strength: 0,
            limit: session.strength(Channel::A).limit,
            temp_strength: 0,
        }));
        Ok(())
    }

    fn subscribe_client(&self, session: &Arc<DgLabSession>) {
        let weak = self.weak_self.clone();
        let bound = Arc::downgrade(session);

        let mut subscription = Subscription::new();
        subscription.listen(session.subscribe(), move |event| {
            let weak = weak.clone();
            let bound = bound.clone();
            async move {
                let Some(game) = weak.upgrade() else {
                    return ControlFlow::Break(());
                };
                match event {
                    SessionEvent::StrengthChanged { .. } => {
                        let _ = game.events.send(GameEvent::StrengthChanged(game.game_strength()));
                        ControlFlow::Continue(())
                    }
                    SessionEvent::Close => {
                        game.handle_client_closed(&bound);
                        ControlFlow::Break(())
                    }
                    _ => ControlFlow::Continue(()),
                }
            }
        });

        // dropping the previous subscription detaches its listeners
        *self.client_subscription.lock().unwrap_or_else(PoisonError::into_inner) = subscription;
    }

    fn handle_client_closed(&self, closed: &Weak<DgLabSession>) {
        {
            let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
            let same = session
                .as_ref()
                .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), closed.as_ptr()));
            if !same {
                return;
            }
            *session = None;
        }

        tracing::info!("Client disconnected: {}", self.client_id);
        let _ = self.events.send(GameEvent::ClientDisconnected);

        if let Some(game) = self.weak_self.upgrade() {
            tokio::spawn(async move { game.destroy().await });
        }
    }

    // ========================================================================
    // Configuration Updates
    // ========================================================================

    /// Replace the strength config.
    ///
    /// Small changes are applied to the device directly; larger ones restart
    /// the game.
    ///
    /// # Errors
    ///
    /// Returns the session failure of the direct path.
    pub async fn update_strength_config(&self, config: StrengthConfig) -> GameResult<()> {
        {
            let mut state = self.state();
            if state.strength_config == config {
                return Ok(());
            }
            state.strength_config = config;
        }
        let _ = self.events.send(GameEvent::StrengthConfigUpdated(config));

        let Some(session) = self.session() else {
            return Ok(());
        };

        let current = session.strength(Channel::A);
        let delta = i64::from(config.strength) - i64::from(current.strength);
        if delta <= self.options.direct_strength_delta {
            self.cancel_ramp();
            self.set_client_strength(current.clamp(config.strength)).await?;
        } else {
            self.restart_game().await;
        }
        Ok(())
    }

    /// Merge `patch` into the strength config.
    ///
    /// # Errors
    ///
    /// See [`Self::update_strength_config`].
    pub async fn patch_strength_config(&self, patch: StrengthConfigPatch) -> GameResult<()> {
        let merged = patch.apply(self.strength_config());
        self.update_strength_config(merged).await
    }

    /// Replace the game config, restarting when output-relevant settings
    /// changed.
    pub async fn update_game_config(&self, config: GameConfig) {
        let restart = {
            let mut state = self.state();
            if state.game_config == config {
                return;
            }
            if config.playlist_changed(&state.game_config) {
                state.playlist = config.build_playlist();
            }
            let restart = config.restart_required(&state.game_config);
            state.game_config = config;
            restart
        };

        if restart {
            self.restart_game().await;
        }
    }

    // ========================================================================
    // Actions
    // ========================================================================

    /// Queue `action`, or merge it into the queued action of the same kind.
    ///
    /// The loop restarts when the action ends up at the head of the queue.
    pub async fn start_action(&self, action: Arc<dyn GameAction>) {
        let kind = action.kind();

        match self.action(kind) {
            Some(existing) => {
                existing.update_from(self, action.as_ref()).await;
                let mut state = self.state();
                let slot = state.actions.iter_mut().find(|slot| slot.action.kind() == kind);
                if let Some(slot) = slot {
                    slot.priority = action.priority();
                }
            }
            None => {
                action.initialize(self).await;
                self.state().actions.push(ActionSlot {
                    priority: action.priority(),
                    action,
                });
            }
        }

        let at_head = {
            let mut state = self.state();
            state.actions.sort_by_key(|slot| Reverse(slot.priority));
            state.actions.first().is_some_and(|slot| slot.action.kind() == kind)
        };

        tracing::debug!("Action {} started on {}", kind, self.client_id);
        if at_head {
            self.restart_game_task().await;
        }
    }

    /// Remove the queued action of `kind`.
    pub async fn stop_action(&self, kind: &str) {
        let removed = {
            let mut state = self.state();
            state
                .actions
                .iter()
                .position(|slot| slot.action.kind() == kind)
                .map(|index| (index, state.actions.remove(index)))
        };

        if let Some((index, slot)) = removed {
            slot.action.on_stop(self);
            tracing::debug!("Action {} stopped on {}", kind, self.client_id);
            if index == 0 {
                self.restart_game().await;
            }
        }
    }

    // ========================================================================
    // Game Lifecycle
    // ========================================================================

    /// Start the control loop. No-op without a bound device or when running.
    pub async fn start_game(&self) {
        self.start_game_inner(false).await;
    }

    /// Abort the control loop.
    pub async fn stop_game(&self) {
        self.stop_game_inner(false).await;
    }

    /// Stop and start again, if running.
    pub async fn restart_game(&self) {
        if self.session().is_none() || !self.is_running().await {
            return;
        }
        self.stop_game_inner(true).await;
        self.start_game_inner(true).await;
    }

    /// Reset the device and restart only the current loop iteration.
    pub async fn restart_game_task(&self) {
        let Some(session) = self.session() else { return };

        let task = self.task.lock().await;
        if let Some(task) = task.as_ref().filter(|t| t.is_running()) {
            self.cancel_ramp();
            if let Err(e) = session.reset().await {
                tracing::warn!("Reset before restart failed on {}: {}", self.client_id, e);
            }
            task.restart();
        }
    }

    async fn start_game_inner(&self, silent: bool) {
        let Some(session) = self.session() else { return };
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        if let Err(e) = session.reset().await {
            tracing::warn!("Reset before start failed on {}: {}", self.client_id, e);
        }
        let initial = session.strength(Channel::A).clamp(self.strength_config().strength);
        if let Err(e) = self.set_client_strength(initial).await {
            tracing::warn!("Failed to set initial strength on {}: {}", self.client_id, e);
        }

        let weak = self.weak_self.clone();
        let game_task = Task::spawn(
            move |ctx| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(game) => game.run_step(ctx).await,
                        None => Ok(()),
                    }
                }
            },
            self.options.task.clone(),
        );
        *task = Some(game_task);

        tracing::info!("Game started: {}", self.client_id);
        if !silent {
            let _ = self.events.send(GameEvent::GameStarted);
        }
    }

    async fn stop_game_inner(&self, silent: bool) {
        let mut task = self.task.lock().await;
        let Some(running) = task.take() else { return };

        running.abort().await;
        drop(task);
        self.cancel_ramp();

        tracing::info!("Game stopped: {}", self.client_id);
        if !silent {
            let _ = self.events.send(GameEvent::GameStopped);
        }

        if let Some(session) = self.session() {
            if let Err(e) = session.reset().await {
                tracing::warn!("Reset after stop failed on {}: {}", self.client_id, e);
            }
        }
    }

    /// Stop everything, cache the strength config and emit `Close`.
    pub async fn destroy(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.abort().await;
        }
        self.cancel_ramp();

        if let Some(cache) = &self.cache {
            cache.set(self.cache_key(), self.strength_config());
        }

        self.client_subscription.lock().unwrap_or_else(PoisonError::into_inner).close();
        self.library_subscription.lock().unwrap_or_else(PoisonError::into_inner).close();
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;

        tracing::info!("Game controller destroyed: {}", self.client_id);
        let _ = self.events.send(GameEvent::Close);
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Set channel A to `strength`, and channel B to its multiple when
    /// enabled. No-op without a live device.
    ///
    /// # Errors
    ///
    /// Returns the session failure, including a strength above the limit.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub async fn set_client_strength(&self, strength: u32) -> SessionResult<()> {
        let Some(session) = self.session().filter(|s| !s.is_closed()) else {
            return Ok(());
        };

        session.set_strength(Channel::A, strength).await?;

        let (enable_b, multiplier) = {
            let state = self.state();
            (state.game_config.enable_b_channel, state.game_config.b_channel_strength_multiplier)
        };
        if enable_b {
            let scaled = (f64::from(strength) * multiplier.max(0.0)).floor() as u32;
            let b = session.strength(Channel::B).clamp(scaled);
            session.set_strength(Channel::B, b).await?;
        }
        Ok(())
    }

    /// Stream `pulse_id` to the device for `window`.
    ///
    /// The script is expanded repeatedly until the queued output exceeds the
    /// window, then the call sleeps until the queue should have drained.
    /// `on_window_end` is awaited once the window itself has elapsed. If the
    /// sleep is cancelled the used channel queues are cleared.
    ///
    /// # Errors
    ///
    /// Returns the session failure while sending frames.
    pub async fn output_pulse(
        &self,
        pulse_id: Option<&str>,
        window: Duration,
        token: &CancelToken,
        on_window_end: Option<BoxFuture<'_, ()>>,
    ) -> SessionResult<()> {
        let Some(session) = self.session().filter(|s| !s.is_closed()) else {
            return Ok(());
        };

        let (script, enable_b) = {
            let state = self.state();
            (
                self.library.resolve(pulse_id, &state.custom_pulses),
                state.game_config.enable_b_channel,
            )
        };

        let started = Instant::now();
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let mut queued_ms = 0u64;

        for _ in 0..self.options.max_batches {
            let batch = script.expand(&mut rand::thread_rng());
            if batch.frames.is_empty() {
                break;
            }

            session.send_pulse(Channel::A, &batch.frames).await?;
            if enable_b {
                session.send_pulse(Channel::B, &batch.frames).await?;
            }

            queued_ms += u64::from(batch.duration_ms);
            if queued_ms > window_ms {
                break;
            }
        }

        let elapsed = started.elapsed();
        let queued = Duration::from_millis(queued_ms);
        let total = if queued < window {
            window.saturating_sub(queued).saturating_sub(elapsed)
        } else {
            (queued + self.options.output_tail).saturating_sub(elapsed)
        };

        let finished = match on_window_end {
            Some(hook) => {
                let first = window.saturating_sub(elapsed).min(total);
                let mut finished = token.sleep(first).await;
                if finished {
                    hook.await;
                    finished = token.sleep(total - first).await;
                }
                finished
            }
            None => token.sleep(total).await,
        };

        if !finished {
            session.clear_pulse(Channel::A).await?;
            if enable_b {
                session.clear_pulse(Channel::B).await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Control Loop
    // ========================================================================

    async fn run_step(self: Arc<Self>, ctx: TaskContext) -> TaskResult<()> {
        let Some(session) = self.session() else {
            let game = Arc::clone(&self);
            tokio::spawn(async move { game.stop_game().await });
            return Ok(());
        };

        let head = self.state().actions.first().map(|slot| Arc::clone(&slot.action));
        if let Some(action) = head {
            if action.execute(&self, &ctx).await? == ActionOutcome::Done {
                let kind = action.kind();
                self.state().actions.retain(|slot| slot.action.kind() != kind);
                tracing::debug!("Action {} finished on {}", kind, self.client_id);
            }
            return Ok(());
        }

        let (pulse_id, window, target) = {
            let mut state = self.state();
            let pulse_id = state
                .playlist
                .current_pulse_id_at(Instant::now().into_std())
                .map(ToString::to_string);
            let mut rng = rand::thread_rng();
            let window = state.game_config.sample_window(&mut rng);
            let config = state.strength_config;
            let target = config.strength.saturating_add(rng.gen_range(0..=config.random_strength));
            (pulse_id, window, target)
        };

        let current = session.strength(Channel::A);
        let target = current.clamp(target);

        if target > current.strength {
            self.spawn_ramp(current.strength, target, ctx.token.clone());
        } else if let Err(e) = self.set_client_strength(target).await {
            tracing::warn!("Failed to set strength on {}: {}", self.client_id, e);
        }

        if let Err(e) = ctx.checkpoint() {
            self.cancel_ramp();
            return Err(e);
        }

        let result = self.output_pulse(pulse_id.as_deref(), window, &ctx.token, None).await;
        self.cancel_ramp();
        result.map_err(Into::into)
    }

    /// Ramp channel A from `from` up to `target` in the background,
    /// replacing any ramp still in flight.
    fn spawn_ramp(&self, from: u32, target: u32, token: CancelToken) {
        let weak = self.weak_self.clone();
        let (step, period) = (self.options.ramp_step, self.options.ramp_interval);

        let handle = tokio::spawn(async move {
            let mut current = from;
            while current < target {
                if !token.sleep(period).await {
                    break;
                }
                let Some(game) = weak.upgrade() else { break };
                current = current.saturating_add(step).min(target);
                if let Err(e) = game.set_client_strength(current).await {
                    tracing::warn!("Strength ramp failed on {}: {}", game.client_id, e);
                    break;
                }
            }
        });

        let previous = self.ramp.lock().unwrap_or_else(PoisonError::into_inner).replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn cancel_ramp(&self) {
        let ramp = self.ramp.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(ramp) = ramp {
            ramp.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::connect_simulated;
    use std::any::Any;

    fn fast_game() -> GameConfig {
        GameConfig {
            strength_change_interval: [1, 1],
            ..GameConfig::default()
        }
    }

    fn controller(strength: StrengthConfig, game: GameConfig) -> Arc<GameController> {
        let library = Arc::new(PulseLibrary::from_scripts(Vec::new()));
        let controller = GameController::new(
            "dev1",
            library,
            None,
            ControllerOptions {
                default_strength: strength,
                default_game: game,
                ..ControllerOptions::default()
            },
        );
        controller.initialize();
        controller
    }

    /// Occupies iterations until stopped.
    struct HoldAction {
        kind: &'static str,
        priority: i32,
    }

    fn hold(kind: &'static str, priority: i32) -> Arc<HoldAction> {
        Arc::new(HoldAction { kind, priority })
    }

    impl GameAction for HoldAction {
        fn kind(&self) -> &'static str {
            self.kind
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn initialize<'a>(&'a self, _game: &'a GameController) -> BoxFuture<'a, ()> {
            Box::pin(async {})
        }

        fn execute<'a>(
            &'a self,
            _game: &'a GameController,
            ctx: &'a TaskContext,
        ) -> BoxFuture<'a, TaskResult<ActionOutcome>> {
            Box::pin(async move {
                ctx.sleep(Duration::from_secs(60)).await;
                ctx.checkpoint()?;
                Ok(ActionOutcome::Continue)
            })
        }

        fn update_from<'a>(
            &'a self,
            _game: &'a GameController,
            _other: &'a dyn GameAction,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async {})
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_game_converges_to_base_strength() {
        for limit in [20, 6] {
            let strength = StrengthConfig {
                strength: 10,
                random_strength: 0,
            };
            let game = controller(strength, fast_game());
            let (session, sim) = connect_simulated("dev1", limit, limit).await;

            game.bind_client(session).await.unwrap();
            game.start_game().await;
            tokio::time::sleep(Duration::from_secs(5)).await;

            assert_eq!(sim.strength()[0], 10.min(limit));
            assert!(sim.max_seen()[0] <= limit);
            assert_eq!(game.game_strength().strength, 10.min(limit));

            game.destroy().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramps_up_in_steps() {
        let game = controller(StrengthConfig::default(), fast_game());
        let (session, sim) = connect_simulated("dev1", 50, 50).await;
        game.bind_client(session).await.unwrap();

        let (_cancel, token) = CancelToken::manual();
        game.spawn_ramp(0, 9, token);
        tokio::time::sleep(Duration::from_secs(3)).await;

        let sets: Vec<String> = sim
            .messages()
            .into_iter()
            .filter(|m| m.starts_with("strength-1+2+") && m != "strength-1+2+0")
            .collect();
        assert_eq!(
            sets,
            vec![
                "strength-1+2+2",
                "strength-1+2+4",
                "strength-1+2+6",
                "strength-1+2+8",
                "strength-1+2+9",
            ]
        );
        assert_eq!(sim.strength()[0], 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_stops_when_cancelled() {
        let game = controller(StrengthConfig::default(), fast_game());
        let (session, sim) = connect_simulated("dev1", 50, 50).await;
        game.bind_client(session).await.unwrap();

        let (cancel, token) = CancelToken::manual();
        game.spawn_ramp(0, 20, token);
        tokio::time::sleep(Duration::from_millis(450)).await;
        cancel.send_replace(1);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(sim.strength()[0], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_strength_change_stops_ramp() {
        let game = controller(StrengthConfig::default(), fast_game());
        let (session, sim) = connect_simulated("dev1", 50, 50).await;
        game.bind_client(session).await.unwrap();

        let (_cancel, token) = CancelToken::manual();
        game.spawn_ramp(0, 20, token);
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(sim.strength()[0], 8);

        game.update_strength_config(StrengthConfig {
            strength: 2,
            random_strength: 0,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let sets: Vec<String> = sim
            .messages()
            .into_iter()
            .filter(|m| m.starts_with("strength-1+2+"))
            .collect();
        assert_eq!(sets.last().map(String::as_str), Some("strength-1+2+2"));
        assert!(!sets.iter().any(|m| m == "strength-1+2+10"));
        assert_eq!(sim.strength()[0], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_window_clears_both_channels() {
        let game = controller(
            StrengthConfig::default(),
            GameConfig {
                enable_b_channel: true,
                ..fast_game()
            },
        );
        let (session, sim) = connect_simulated("dev1", 20, 20).await;
        game.bind_client(session).await.unwrap();

        let (cancel, token) = CancelToken::manual();
        let runner = Arc::clone(&game);
        let output = tokio::spawn(async move {
            runner
                .output_pulse(None, Duration::from_secs(10), &token, None)
                .await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.send_replace(1);
        output.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let messages = sim.messages();
        let last_pulse = messages
            .iter()
            .rposition(|m| m.starts_with("pulse-"))
            .unwrap();
        let after = &messages[last_pulse..];
        assert!(after.iter().any(|m| m == "clear-1"));
        assert!(after.iter().any(|m| m == "clear-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_settings_restart_the_game() {
        let base = GameConfig {
            strength_change_interval: [30, 30],
            ..GameConfig::default()
        };
        let game = controller(StrengthConfig::default(), base.clone());
        let (session, sim) = connect_simulated("dev1", 20, 20).await;
        game.bind_client(session).await.unwrap();
        game.start_game().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let clears = || sim.messages().iter().filter(|m| *m == "clear-1").count();

        let before = clears();
        let fire_only = GameConfig {
            fire_pulse_id: Some("spark".to_string()),
            ..base.clone()
        };
        game.update_game_config(fire_only.clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(clears(), before);

        let with_b = GameConfig {
            enable_b_channel: true,
            ..fire_only
        };
        game.update_game_config(with_b.clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after_b = clears();
        assert!(after_b > before);

        game.update_game_config(GameConfig {
            strength_change_interval: [20, 20],
            ..with_b
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(clears() > after_b);
        assert!(game.is_running().await);

        game.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_b_channel_follows_multiplier_within_its_limit() {
        let game = controller(
            StrengthConfig {
                strength: 10,
                random_strength: 0,
            },
            GameConfig {
                enable_b_channel: true,
                b_channel_strength_multiplier: 0.5,
                ..fast_game()
            },
        );
        let (session, sim) = connect_simulated("dev1", 20, 3).await;
        game.bind_client(session).await.unwrap();
        game.start_game().await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(sim.strength(), [10, 3]);
        assert!(sim.messages().iter().any(|m| m.starts_with("pulse-B:")));

        game.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_priority_action_preempts() {
        let game = controller(StrengthConfig::default(), fast_game());
        let (session, _sim) = connect_simulated("dev1", 20, 20).await;
        game.bind_client(session).await.unwrap();
        game.start_game().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        game.start_action(hold("low", 1)).await;
        assert_eq!(game.task_generation().await, Some(1));

        game.start_action(hold("high", 10)).await;
        assert_eq!(game.action_kinds(), vec!["high", "low"]);
        assert_eq!(game.task_generation().await, Some(2));

        // a lower-priority arrival queues behind without restarting
        game.start_action(hold("mid", 5)).await;
        assert_eq!(game.action_kinds(), vec!["high", "mid", "low"]);
        assert_eq!(game.task_generation().await, Some(2));

        game.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_kind_merges_instead_of_stacking() {
        let game = controller(StrengthConfig::default(), fast_game());

        game.start_action(hold("hold", 1)).await;
        game.start_action(hold("other", 2)).await;
        game.start_action(hold("hold", 3)).await;

        assert_eq!(game.action_kinds(), vec!["hold", "other"]);

        game.stop_action("hold").await;
        assert_eq!(game.action_kinds(), vec!["other"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_strength_change_skips_restart() {
        let game = controller(
            StrengthConfig {
                strength: 10,
                random_strength: 0,
            },
            GameConfig {
                strength_change_interval: [30, 30],
                ..GameConfig::default()
            },
        );
        let (session, sim) = connect_simulated("dev1", 30, 30).await;
        game.bind_client(session).await.unwrap();
        game.start_game().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let clears_before = sim.messages().iter().filter(|m| *m == "clear-1").count();

        game.patch_strength_config(StrengthConfigPatch {
            strength: Some(13),
            random_strength: None,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(sim.strength()[0], 13);
        assert_eq!(sim.messages().iter().filter(|m| *m == "clear-1").count(), clears_before);

        // a large jump restarts the game, which resets the queues
        game.patch_strength_config(StrengthConfigPatch {
            strength: Some(25),
            random_strength: None,
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(sim.messages().iter().filter(|m| *m == "clear-1").count() > clears_before);
        assert_eq!(sim.strength()[0], 25);
        assert!(game.is_running().await);

        game.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_strength_config_event_only_on_change() {
        let game = controller(StrengthConfig::default(), fast_game());
        let mut events = game.subscribe();

        game.update_strength_config(StrengthConfig::default()).await.unwrap();
        assert!(events.try_recv().is_err());

        let config = StrengthConfig {
            strength: 7,
            random_strength: 1,
        };
        game.update_strength_config(config).await.unwrap();
        assert_eq!(events.try_recv().unwrap(), GameEvent::StrengthConfigUpdated(config));
    }

    #[tokio::test(start_paused = true)]
    async fn test_game_config_change_rebuilds_playlist() {
        let game = controller(StrengthConfig::default(), fast_game());
        assert_eq!(game.current_pulse_id(), None);

        game.update_game_config(GameConfig {
            pulse_id: PulseIds::One("tide".to_string()),
            ..fast_game()
        })
        .await;
        assert_eq!(game.current_pulse_id().as_deref(), Some("tide"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_destroys_controller() {
        let cache = Arc::new(ConfigCache::default());
        let game = GameController::new(
            "dev1",
            Arc::new(PulseLibrary::from_scripts(Vec::new())),
            Some(Arc::clone(&cache)),
            ControllerOptions::default(),
        );
        game.initialize();
        let (session, sim) = connect_simulated("dev1", 20, 20).await;
        game.bind_client(Arc::clone(&session)).await.unwrap();
        game.start_game().await;
        game.update_strength_config(StrengthConfig {
            strength: 3,
            random_strength: 2,
        })
        .await
        .unwrap();
        let mut events = game.subscribe();

        sim.handle.abort();
        let mut seen = Vec::new();
        while let Ok(event) = events.recv().await {
            let last = event == GameEvent::Close;
            seen.push(event);
            if last {
                break;
            }
        }

        assert!(seen.contains(&GameEvent::ClientDisconnected));
        assert!(!game.is_running().await);
        assert!(game.session().is_none());
        assert_eq!(
            cache.get("coyote-game:dev1:strength"),
            Some(StrengthConfig {
                strength: 3,
                random_strength: 2
            })
        );
    }

    #[test]
    fn test_game_config_json_names() {
        let config: GameConfig = serde_json::from_str(
            r#"{"strengthChangeInterval":[5,10],"enableBChannel":true,
                "pulseId":"a","pulseMode":"sequence"}"#,
        )
        .unwrap();

        assert_eq!(config.strength_change_interval, [5, 10]);
        assert!(config.enable_b_channel);
        assert_eq!(config.pulse_id.to_vec(), vec!["a".to_string()]);
        assert_eq!(config.pulse_mode, PlaylistMode::Sequence);
        assert_eq!(config.pulse_change_interval, 60);
        assert!(config.restart_required(&GameConfig::default()));
    }
}

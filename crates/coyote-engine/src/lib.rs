//! Coyote Engine - device sessions and per-device control loops
//!
//! This crate runs on tokio and drives connected Coyote devices:
//! - A cooperative, restartable task loop with cancellation checkpoints
//! - Line-delimited JSON transport over any async byte stream
//! - The device protocol session (bind handshake, heartbeat, commands)
//! - Game controllers that keep a device playing waveforms
//! - A registry that maps client ids to controllers
//!
//! # Modules
//!
//! - [`task`]: Periodic cancellable task loop
//! - [`transport`]: Link abstraction and the stream adapter
//! - [`session`]: Device protocol session
//! - [`controller`]: Game controller and its configuration
//! - [`actions`]: Override actions such as fire
//! - [`playlist`]: Waveform rotation
//! - [`library`]: Shared waveform library
//! - [`cache`]: Settings cache
//! - [`registry`]: Controller registry

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod actions;
pub mod cache;
pub mod controller;
pub mod library;
pub mod playlist;
pub mod registry;
pub mod session;
pub mod subscription;
pub mod task;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export key types
pub use actions::{ActionOutcome, FireAction, FireConfig, GameAction};
pub use cache::{CacheConfig, ConfigCache};
pub use controller::{
    ControllerOptions, GameConfig, GameController, GameError, GameEvent, GameResult,
    GameStrengthInfo, StrengthConfig, StrengthConfigPatch,
};
pub use library::{LibraryError, PulseLibrary};
pub use playlist::{PlaylistMode, PulsePlaylist};
pub use registry::{GameRegistry, RegistryConfig};
pub use session::{DgLabSession, SessionConfig, SessionError, SessionEvent};
pub use task::{CancelToken, Task, TaskContext, TaskError, TaskOptions};
pub use transport::{read_hello, spawn_line_transport, Link, TransportConfig, TransportError};

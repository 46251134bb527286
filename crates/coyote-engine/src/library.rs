//! Shared waveform library.
//!
//! Holds the waveform scripts loaded from a JSON file. Readers take cheap
//! [`Arc`] snapshots; a reload swaps the whole list and publishes
//! [`LibraryEvent::ListUpdated`]. Scripts are never mutated in place.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use coyote_core::WaveformScript;

/// Errors raised while loading the library.
#[derive(Debug, Error)]
pub enum LibraryError {
    /// File could not be read
    #[error("Failed to read waveform file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not a valid waveform list
    #[error("Invalid waveform file {path}: {source}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },

    /// Reload requested on a library without a backing file
    #[error("Waveform library has no backing file")]
    NoBackingFile,
}

/// Result type for library operations.
pub type LibraryResult<T> = Result<T, LibraryError>;

/// Identity of a waveform, as published in change notifications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PulseInfo {
    /// Waveform id
    pub id: String,
    /// Display name
    pub name: String,
}

/// Library change notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LibraryEvent {
    /// The list was replaced
    ListUpdated(Vec<PulseInfo>),
}

/// File-backed, read-mostly waveform list.
pub struct PulseLibrary {
    path: Option<PathBuf>,
    scripts: RwLock<Arc<Vec<WaveformScript>>>,
    modified: Mutex<Option<SystemTime>>,
    events: broadcast::Sender<LibraryEvent>,
}

impl PulseLibrary {
    /// A library with the given scripts and no backing file.
    #[must_use]
    pub fn from_scripts(scripts: Vec<WaveformScript>) -> Self {
        Self::build(None, scripts, None)
    }

    /// Load a library from a JSON array of waveform scripts.
    ///
    /// # Errors
    ///
    /// Returns [`LibraryError`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> LibraryResult<Self> {
        let path = path.as_ref().to_path_buf();
        let (scripts, modified) = read_file(&path)?;
        tracing::info!("Loaded {} waveforms from {}", scripts.len(), path.display());
        Ok(Self::build(Some(path), scripts, modified))
    }

    fn build(
        path: Option<PathBuf>,
        scripts: Vec<WaveformScript>,
        modified: Option<SystemTime>,
    ) -> Self {
        let (events, _) = broadcast::channel(8);
        Self {
            path,
            scripts: RwLock::new(Arc::new(scripts)),
            modified: Mutex::new(modified),
            events,
        }
    }

    /// Re-read the backing file and publish the new list.
    ///
    /// # Errors
    ///
    /// Returns [`LibraryError`] if there is no file or it is invalid; the
    /// current list is kept in that case.
    pub fn reload(&self) -> LibraryResult<()> {
        let path = self.path.as_ref().ok_or(LibraryError::NoBackingFile)?;
        let (scripts, modified) = read_file(path)?;
        *self.modified.lock().unwrap_or_else(PoisonError::into_inner) = modified;
        self.replace(scripts);
        Ok(())
    }

    /// Swap in a new list and publish it.
    pub fn replace(&self, scripts: Vec<WaveformScript>) {
        let infos = scripts
            .iter()
            .map(|s| PulseInfo {
                id: s.id.clone(),
                name: s.name.clone(),
            })
            .collect();
        *self.scripts.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(scripts);

        tracing::info!("Waveform list updated");
        let _ = self.events.send(LibraryEvent::ListUpdated(infos));
    }

    /// Current list.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<WaveformScript>> {
        Arc::clone(&self.scripts.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Waveform by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<WaveformScript> {
        self.snapshot().iter().find(|s| s.id == id).cloned()
    }

    /// First waveform in the list, or one second of silence.
    #[must_use]
    pub fn default_pulse(&self) -> WaveformScript {
        self.snapshot().first().cloned().unwrap_or_else(WaveformScript::fallback)
    }

    /// Look `id` up in `custom` first, then in the library, then fall back
    /// to [`Self::default_pulse`].
    #[must_use]
    pub fn resolve(&self, id: Option<&str>, custom: &[WaveformScript]) -> WaveformScript {
        id.and_then(|id| custom.iter().find(|s| s.id == id).cloned().or_else(|| self.get(id)))
            .unwrap_or_else(|| self.default_pulse())
    }

    /// Subscribe to change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.events.subscribe()
    }

    /// Poll the backing file's modification time and reload on change.
    ///
    /// The watcher stops when the library is dropped.
    pub fn watch(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(library) = weak.upgrade() else { break };
                let Some(path) = library.path.as_ref() else { break };

                let current = std::fs::metadata(path).and_then(|m| m.modified()).ok();
                let known = *library.modified.lock().unwrap_or_else(PoisonError::into_inner);
                if current.is_none() || current == known {
                    continue;
                }

                if let Err(e) = library.reload() {
                    tracing::warn!("Waveform reload failed: {}", e);
                    *library.modified.lock().unwrap_or_else(PoisonError::into_inner) = current;
                }
            }
        })
    }
}

fn read_file(path: &Path) -> LibraryResult<(Vec<WaveformScript>, Option<SystemTime>)> {
    let io_err = |source| LibraryError::Io {
        path: path.to_path_buf(),
        source,
    };

    let text = std::fs::read_to_string(path).map_err(io_err)?;
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    let scripts = serde_json::from_str(&text).map_err(|source| LibraryError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    Ok((scripts, modified))
}

// ============================================================================
// Tests
// ============================================================================

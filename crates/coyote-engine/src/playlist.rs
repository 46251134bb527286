//! Waveform playlist: which waveform id a controller plays right now.

use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Default time between waveform changes.
pub const DEFAULT_CHANGE_INTERVAL: Duration = Duration::from_secs(60);

/// How a playlist moves through its ids.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistMode {
    /// Always the first id
    #[default]
    Single,
    /// In order, wrapping around
    Sequence,
    /// Shuffled, reshuffled on every wrap
    Random,
}

/// Time-driven selection over a list of waveform ids.
#[derive(Clone, Debug)]
pub struct PulsePlaylist {
    ids: Vec<String>,
    mode: PlaylistMode,
    current_index: usize,
    change_interval: Duration,
    next_change_at: Instant,
}

impl PulsePlaylist {
    /// Build a playlist. `change_interval` is ignored for single mode, and a
    /// zero interval falls back to [`DEFAULT_CHANGE_INTERVAL`].
    #[must_use]
    pub fn new(ids: Vec<String>, mode: PlaylistMode, change_interval: Duration) -> Self {
        Self::starting_at(ids, mode, change_interval, Instant::now())
    }

    /// Build a playlist whose first change is due `change_interval` after `now`.
    #[must_use]
    pub fn starting_at(
        ids: Vec<String>,
        mode: PlaylistMode,
        change_interval: Duration,
        now: Instant,
    ) -> Self {
        let change_interval = if change_interval.is_zero() {
            DEFAULT_CHANGE_INTERVAL
        } else {
            change_interval
        };

        let mut playlist = Self {
            ids,
            mode,
            current_index: 0,
            change_interval,
            next_change_at: now + change_interval,
        };
        if playlist.mode == PlaylistMode::Random {
            playlist.shuffle();
        }
        playlist
    }

    /// Selection mode.
    #[must_use]
    pub fn mode(&self) -> PlaylistMode {
        self.mode
    }

    /// Ids in current play order.
    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Index of the id currently playing.
    #[must_use]
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Id to play now.
    pub fn current_pulse_id(&mut self) -> Option<&str> {
        self.current_pulse_id_at(Instant::now())
    }

    /// Id to play at `now`, advancing at most one step once the change time
    /// has passed.
    pub fn current_pulse_id_at(&mut self, now: Instant) -> Option<&str> {
        if self.mode == PlaylistMode::Single || self.ids.len() <= 1 {
            return self.ids.first().map(String::as_str);
        }

        if now > self.next_change_at {
            self.next_change_at = now + self.change_interval;
            self.current_index += 1;

            if self.current_index >= self.ids.len() {
                self.current_index = 0;
                if self.mode == PlaylistMode::Random {
                    self.shuffle();
                }
            }
        }

        self.ids.get(self.current_index).map(String::as_str)
    }

    fn shuffle(&mut self) {
        self.ids.shuffle(&mut rand::thread_rng());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_single_mode_never_changes() {
        let start = Instant::now();
        let mut playlist = PulsePlaylist::starting_at(
            ids(&["a", "b", "c"]),
            PlaylistMode::Single,
            Duration::from_secs(1),
            start,
        );

        for secs in [0, 5, 60, 3600] {
            let at = start + Duration::from_secs(secs);
            assert_eq!(playlist.current_pulse_id_at(at), Some("a"));
        }
        assert_eq!(playlist.current_index(), 0);
    }

    #[test]
    fn test_single_entry_never_changes_in_any_mode() {
        let start = Instant::now();
        for mode in [PlaylistMode::Sequence, PlaylistMode::Random] {
            let mut playlist =
                PulsePlaylist::starting_at(ids(&["only"]), mode, Duration::from_secs(1), start);
            let later = start + Duration::from_secs(100);
            assert_eq!(playlist.current_pulse_id_at(later), Some("only"));
            assert_eq!(playlist.current_index(), 0);
        }
    }

    #[test]
    fn test_sequence_advances_and_wraps() {
        let start = Instant::now();
        let mut playlist = PulsePlaylist::starting_at(
            ids(&["a", "b", "c"]),
            PlaylistMode::Sequence,
            Duration::from_secs(10),
            start,
        );

        assert_eq!(playlist.current_pulse_id_at(start + Duration::from_secs(5)), Some("a"));
        assert_eq!(playlist.current_pulse_id_at(start + Duration::from_secs(11)), Some("b"));
        // next change is due 10s after the previous one was observed
        assert_eq!(playlist.current_pulse_id_at(start + Duration::from_secs(15)), Some("b"));
        assert_eq!(playlist.current_pulse_id_at(start + Duration::from_secs(22)), Some("c"));
        assert_eq!(playlist.current_pulse_id_at(start + Duration::from_secs(33)), Some("a"));
    }

    #[test]
    fn test_random_mode_keeps_all_ids() {
        let start = Instant::now();
        let mut playlist = PulsePlaylist::starting_at(
            ids(&["a", "b", "c", "d"]),
            PlaylistMode::Random,
            Duration::from_secs(1),
            start,
        );

        let mut t = start;
        for _ in 0..20 {
            t += Duration::from_secs(2);
            let id = playlist.current_pulse_id_at(t).map(ToString::to_string);
            assert!(matches!(id.as_deref(), Some("a" | "b" | "c" | "d")));
        }

        let mut sorted = playlist.ids().to_vec();
        sorted.sort();
        assert_eq!(sorted, ids(&["a", "b", "c", "d"]));
    }

    #[test]
    fn test_empty_playlist_has_no_selection() {
        let mut playlist = PulsePlaylist::new(Vec::new(), PlaylistMode::Sequence, Duration::ZERO);
        assert_eq!(playlist.current_pulse_id(), None);
    }

    #[test]
    fn test_mode_wire_names() {
        assert_eq!(serde_json::to_string(&PlaylistMode::Random).unwrap(), r#""random""#);
        assert_eq!(
            serde_json::from_str::<PlaylistMode>(r#""sequence""#).unwrap(),
            PlaylistMode::Sequence
        );
    }
}

//! Player state machine
//!
//! Pulls entries from one active playlist, drives each through
//! download -> play -> finish, and exposes transport controls.
//!
//! **Module organization:**
//! - `core`: struct definition, construction, the signal driver task
//! - `control`: transport operations (play, pause, resume, skip, volume,
//!   estimates, snapshots)
//!
//! **Concurrency:** player state lives behind one async mutex. Transitions
//! are check-and-set under it; waits on downloads happen in spawned tasks
//! that report back through the driver's channel, so the lock is never held
//! across I/O. Voice sink completion callbacks only post to that channel.

mod control;
mod core;

pub use self::core::Player;

use crate::entry::EntrySnapshot;
use crate::playlist::PlaylistSnapshot;
use serde::{Deserialize, Serialize};

/// Player state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    /// Not pulling; waiting for `play()` or an entry to be queued
    Idle,
    /// Pull loop active, about to take the next entry
    Waiting,
    /// Current entry is being prepared
    Downloading,
    Playing,
    Paused,
}

impl PlayerState {
    /// True when a current entry is held
    pub fn has_entry(&self) -> bool {
        matches!(
            self,
            PlayerState::Downloading | PlayerState::Playing | PlayerState::Paused
        )
    }
}

/// Outcome of [`Player::play`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayStatus {
    /// Paused entry resumed in place
    Resumed,
    /// Pull loop started and took an entry
    Started,
    /// Playlist was empty; the player went back to idle
    WaitingForEntries,
    /// Already playing, downloading or pulling
    AlreadyActive,
}

/// Outcome of [`Player::pause`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    Paused,
    /// Entry still downloading; it will start paused
    Deferred,
}

/// Serializable player state for a [`crate::store::Store`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub playlist: PlaylistSnapshot,
    pub current: Option<EntrySnapshot>,
    pub progress_seconds: f64,
    pub volume: f32,
}

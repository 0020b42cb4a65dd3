//! Lifecycle events emitted by playlists and players
//!
//! All components of one session share a single [`SessionBus`]. Events carry
//! an [`EntrySnapshot`] rather than the live entry so they can be serialized
//! and outlive the entry they describe.

use crate::entry::{Entry, EntrySnapshot};
use crate::error::ErrorCause;
use chrono::{DateTime, Utc};
use qplay_common::events::{BusEvent, EventBus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event bus type shared by a session's playlists and player
pub type SessionBus = EventBus<PlayerEvent>;

/// Discriminant of [`PlayerEvent`], used to register handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    EntryAdded,
    Play,
    Pause,
    Resume,
    Stop,
    FinishedPlaying,
    Error,
}

impl EventKind {
    /// External event name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::EntryAdded => "entry-added",
            EventKind::Play => "play",
            EventKind::Pause => "pause",
            EventKind::Resume => "resume",
            EventKind::Stop => "stop",
            EventKind::FinishedPlaying => "finished-playing",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PlayerEvent {
    /// Entry was queued
    ///
    /// `position` is the 1-based queue position after insertion.
    EntryAdded {
        playlist: String,
        entry: EntrySnapshot,
        position: usize,
        timestamp: DateTime<Utc>,
    },

    /// Entry started playing on the voice sink
    Play {
        entry: EntrySnapshot,
        timestamp: DateTime<Utc>,
    },

    /// Playback paused
    Pause {
        entry: EntrySnapshot,
        timestamp: DateTime<Utc>,
    },

    /// Playback resumed
    Resume {
        entry: EntrySnapshot,
        timestamp: DateTime<Utc>,
    },

    /// Playlist exhausted (or player torn down); player is idle
    Stop { timestamp: DateTime<Utc> },

    /// Entry finished (naturally or skipped after it started)
    FinishedPlaying {
        entry: EntrySnapshot,
        timestamp: DateTime<Utc>,
    },

    /// A failure aborted preparation or playback
    Error {
        entry: Option<EntrySnapshot>,
        cause: ErrorCause,
        timestamp: DateTime<Utc>,
    },
}

impl PlayerEvent {
    pub(crate) fn entry_added(playlist: &str, entry: &Entry, position: usize) -> Self {
        PlayerEvent::EntryAdded {
            playlist: playlist.to_string(),
            entry: entry.snapshot(),
            position,
            timestamp: qplay_common::time::now(),
        }
    }

    pub(crate) fn play(entry: &Entry) -> Self {
        PlayerEvent::Play {
            entry: entry.snapshot(),
            timestamp: qplay_common::time::now(),
        }
    }

    pub(crate) fn pause(entry: &Entry) -> Self {
        PlayerEvent::Pause {
            entry: entry.snapshot(),
            timestamp: qplay_common::time::now(),
        }
    }

    pub(crate) fn resume(entry: &Entry) -> Self {
        PlayerEvent::Resume {
            entry: entry.snapshot(),
            timestamp: qplay_common::time::now(),
        }
    }

    pub(crate) fn stop() -> Self {
        PlayerEvent::Stop {
            timestamp: qplay_common::time::now(),
        }
    }

    pub(crate) fn finished(entry: &Entry) -> Self {
        PlayerEvent::FinishedPlaying {
            entry: entry.snapshot(),
            timestamp: qplay_common::time::now(),
        }
    }

    pub(crate) fn error(entry: Option<&Entry>, cause: ErrorCause) -> Self {
        PlayerEvent::Error {
            entry: entry.map(Entry::snapshot),
            cause,
            timestamp: qplay_common::time::now(),
        }
    }

    /// Entry the event concerns, if any
    pub fn entry(&self) -> Option<&EntrySnapshot> {
        match self {
            PlayerEvent::EntryAdded { entry, .. }
            | PlayerEvent::Play { entry, .. }
            | PlayerEvent::Pause { entry, .. }
            | PlayerEvent::Resume { entry, .. }
            | PlayerEvent::FinishedPlaying { entry, .. } => Some(entry),
            PlayerEvent::Error { entry, .. } => entry.as_ref(),
            PlayerEvent::Stop { .. } => None,
        }
    }

    /// Id of the entry the event concerns, if any
    pub fn entry_id(&self) -> Option<Uuid> {
        self.entry().map(|e| e.id)
    }
}

impl BusEvent for PlayerEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            PlayerEvent::EntryAdded { .. } => EventKind::EntryAdded,
            PlayerEvent::Play { .. } => EventKind::Play,
            PlayerEvent::Pause { .. } => EventKind::Pause,
            PlayerEvent::Resume { .. } => EventKind::Resume,
            PlayerEvent::Stop { .. } => EventKind::Stop,
            PlayerEvent::FinishedPlaying { .. } => EventKind::FinishedPlaying,
            PlayerEvent::Error { .. } => EventKind::Error,
        }
    }
}

//! External collaborator interfaces
//!
//! The engine never resolves URLs, encodes audio or talks to a voice
//! transport itself. It calls out through these traits:
//! - [`Resolver`]: source reference -> metadata + local file
//! - [`VoiceSink`]: plays a local file on the voice transport
//! - [`ReferenceCheck`]: whether a cached file is still needed elsewhere

use crate::entry::Entry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Metadata returned by [`Resolver::resolve`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMedia {
    /// Display title
    pub title: String,
    /// Length in seconds, if the source reports one
    pub duration_seconds: Option<f64>,
    /// Opaque locator handed back to [`Resolver::download`]
    pub locator: String,
}

/// Typed resolver failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    /// Content type or scheme the resolver cannot handle
    #[error("unsupported source: {0}")]
    Unsupported(String),

    /// Source does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Network failure while resolving
    #[error("network error: {0}")]
    Network(String),
}

/// Turns source references into local files
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Look up metadata and a downloadable locator for `source_ref`
    async fn resolve(&self, source_ref: &str) -> Result<ResolvedMedia, ResolveError>;

    /// Fetch `locator` to local storage
    ///
    /// `destination_hint` is the path the cache would like the file at; the
    /// resolver may pick a different name (e.g. to add an extension) and
    /// must return the path it actually wrote. Must be safe to retry.
    async fn download(&self, locator: &str, destination_hint: &Path) -> anyhow::Result<PathBuf>;
}

/// Error reported by a voice sink
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Everything a sink needs to start one entry
#[derive(Debug, Clone, PartialEq)]
pub struct PlayRequest {
    /// Entry being played (for sink-side logging)
    pub entry_id: Uuid,
    /// Local file to play
    pub path: PathBuf,
    /// Linear volume, 0.0-1.0
    pub volume: f32,
    /// Offset to start from (non-zero when resuming a restored entry)
    pub start_at: Duration,
    /// Known length of the entry
    pub duration: Option<Duration>,
}

/// Completion callback handed to [`VoiceSink::play`]
///
/// Receives `None` on natural end of stream and `Some(err)` when the sink
/// failed mid-stream. May be invoked from any thread.
pub type CompletionCallback = Box<dyn FnOnce(Option<SinkError>) + Send + 'static>;

/// Audio output for one session
///
/// All methods must return promptly: the engine calls them while holding its
/// state lock. `stop()` is only meaningful while the sink is actively
/// playing; the engine resumes a paused sink before stopping it.
pub trait VoiceSink: Send + Sync {
    /// Start playing; `on_complete` fires exactly once when playback ends
    fn play(&self, request: PlayRequest, on_complete: CompletionCallback) -> Result<(), SinkError>;

    /// Pause the active stream
    fn pause(&self);

    /// Resume a paused stream
    fn resume(&self);

    /// Stop the active stream; the completion callback still fires
    fn stop(&self);

    /// Change volume on the live stream without interrupting it
    fn set_volume(&self, volume: f32);

    /// Position within the active stream
    fn progress(&self) -> Duration;
}

/// Query hook consulted before a retired entry's file is deleted
///
/// Multi-session hosts back this with their view of every live queue so a
/// file shared by two sessions is not deleted from under one of them.
pub trait ReferenceCheck: Send + Sync {
    /// True if another live entry still needs `entry`'s backing file
    fn is_referenced_elsewhere(&self, entry: &Entry) -> bool;
}

/// [`ReferenceCheck`] for single-session hosts
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExternalReferences;

impl ReferenceCheck for NoExternalReferences {
    fn is_referenced_elsewhere(&self, _entry: &Entry) -> bool {
        false
    }
}

//! Error types for qplay-engine
//!
//! Defines module-specific error types using thiserror for clear error propagation.
//!
//! Failure classes:
//! - **Resolution**: the source cannot be turned into a playable locator (permanent)
//! - **Download**: transient network/storage failure while fetching
//! - **Playback**: the voice sink failed mid-stream
//! - **State**: the caller asked for something invalid in the current state

use crate::collaborators::ResolveError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for qplay-engine
#[derive(Error, Debug)]
pub enum Error {
    /// Source could not be resolved into a downloadable locator
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolveError),

    /// Download or local storage failure
    #[error("Download error: {0}")]
    Download(String),

    /// Preparation was cancelled before completing
    #[error("Preparation cancelled")]
    Cancelled,

    /// Voice sink failure
    #[error("Playback error: {0}")]
    Playback(String),

    /// Operation invalid for the current player state
    #[error("Invalid state: {0}")]
    State(#[from] StateError),

    /// Queue management errors (bad index, closed playlist)
    #[error("Queue error: {0}")]
    Queue(String),

    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors from the shared library
    #[error(transparent)]
    Common(#[from] qplay_common::Error),
}

/// Convenience Result type using qplay-engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Caller invoked an operation that is invalid right now
///
/// Always returned synchronously to the caller, never emitted as an event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    /// `pause()` outside `Playing`
    #[error("not playing")]
    NotPlaying,

    /// `resume()` outside `Paused`
    #[error("not paused")]
    NotPaused,

    /// `skip()` with nothing playing or downloading
    #[error("nothing to skip")]
    NothingToSkip,

    /// The player was torn down
    #[error("player detached from voice transport")]
    Detached,

    /// Volume outside 0.0-1.0 or not a number
    #[error("invalid volume {0}")]
    InvalidVolume(f32),
}

/// Failure carried by a prepare-handle
///
/// Cloneable because every coalesced waiter on the same preparation
/// receives the same outcome.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PrepareError {
    /// Resolver rejected the source
    #[error("resolution failed: {0}")]
    Resolution(#[from] ResolveError),

    /// Fetch to local storage failed
    #[error("download failed: {0}")]
    Download(String),

    /// Preparation was cancelled (skip, removal, teardown)
    #[error("preparation cancelled")]
    Cancelled,
}

impl From<PrepareError> for Error {
    fn from(err: PrepareError) -> Self {
        match err {
            PrepareError::Resolution(e) => Error::Resolution(e),
            PrepareError::Download(msg) => Error::Download(msg),
            PrepareError::Cancelled => Error::Cancelled,
        }
    }
}

/// Typed cause attached to `error` events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ErrorCause {
    /// Entry source could not be resolved; not retried
    Resolution(String),
    /// Download failed; the pull loop backs off and moves on
    Download(String),
    /// Sink failed mid-stream; entry retired as failed
    Playback(String),
    /// The pull loop itself failed; the player went idle
    Fatal(String),
    /// Preparation of the current entry was cancelled by another caller
    Cancelled,
}

impl From<&PrepareError> for ErrorCause {
    fn from(err: &PrepareError) -> Self {
        match err {
            PrepareError::Resolution(e) => ErrorCause::Resolution(e.to_string()),
            PrepareError::Download(msg) => ErrorCause::Download(msg.clone()),
            PrepareError::Cancelled => ErrorCause::Cancelled,
        }
    }
}

//! # qplay engine
//!
//! Queue + player engine for a queue-driven media player.
//!
//! **Purpose:** Keep a continuously mutated queue of media references
//! downloaded just in time, play entries back to back through an external
//! voice sink, and report lifecycle events to observers.
//!
//! **Architecture:** [`entry::Entry`] (cache lifecycle, coalesced
//! preparation) -> [`playlist::Playlist`] (ordered queue with look-ahead
//! pre-caching) -> [`player::Player`] (state machine + signal driver), all
//! wired together per session by [`session::Session`]. Resolution and audio
//! output are external collaborators (see [`collaborators`]).

pub mod cache;
pub mod collaborators;
pub mod config;
pub mod entry;
pub mod error;
pub mod events;
pub mod local;
pub mod player;
pub mod playlist;
pub mod session;
pub mod store;

pub use error::{Error, Result};
pub use events::{EventKind, PlayerEvent, SessionBus};
pub use session::Session;

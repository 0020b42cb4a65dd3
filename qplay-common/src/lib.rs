//! # qplay Common Library
//!
//! Shared code for the qplay crates:
//! - Generic synchronous/broadcast EventBus
//! - Error and Result types
//! - Configuration file resolution
//! - Time helpers and human-readable formatting

pub mod config;
pub mod error;
pub mod events;
pub mod human_time;
pub mod time;

pub use error::{Error, Result};
pub use events::{BusEvent, EventBus, HandlerId};

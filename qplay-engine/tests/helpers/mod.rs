//! Test helper modules for qplay-engine integration tests
//!
//! Provides reusable test infrastructure components:
//! - MockResolver: scripted per-source outcomes, gated downloads, counters
//! - MockSink: records sink calls, fires completion from a foreign thread
//! - Harness: a session wired to both mocks plus event-wait helpers

#![allow(dead_code)]

pub mod harness;
pub mod mock_resolver;
pub mod mock_sink;

pub use harness::{eventually, test_config, Harness, EVENT_TIMEOUT};
pub use mock_resolver::{MockResolver, Script};
pub use mock_sink::{MockSink, SinkCall};

//! Session harness wired to the mocks

use super::{MockResolver, MockSink};
use qplay_engine::config::EngineConfig;
use qplay_engine::entry::Entry;
use qplay_engine::player::{Player, PlayerSnapshot, PlayerState};
use qplay_engine::playlist::Playlist;
use qplay_engine::{EventKind, PlayerEvent, Session};
use qplay_common::events::BusEvent;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Upper bound on any single wait; a hang fails the test instead
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine config pointing at `dir` with a short retry backoff
pub fn test_config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        cache_dir: dir.path().join("cache"),
        retry_backoff_ms: 20,
        ..Default::default()
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub resolver: Arc<MockResolver>,
    pub sink: Arc<MockSink>,
    pub session: Session,
    pub events: broadcast::Receiver<PlayerEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        adjust(&mut config);

        let resolver = MockResolver::new();
        let sink = MockSink::new();
        let session = Session::new(&config, resolver.clone(), sink.clone());
        let events = session.events().subscribe();

        Self {
            dir,
            resolver,
            sink,
            session,
            events,
        }
    }

    /// Session rebuilt from `snapshot` on fresh mocks
    pub fn restored(snapshot: &PlayerSnapshot) -> Self {
        Self::restored_with(snapshot, |_| {})
    }

    /// Like [`Harness::restored`], scripting the resolver before the session
    /// starts preparing anything
    pub fn restored_with(snapshot: &PlayerSnapshot, script: impl FnOnce(&MockResolver)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let resolver = MockResolver::new();
        script(&resolver);
        let sink = MockSink::new();
        let session = Session::restore(&config, resolver.clone(), sink.clone(), snapshot);
        let events = session.events().subscribe();

        Self {
            dir,
            resolver,
            sink,
            session,
            events,
        }
    }

    pub fn player(&self) -> &Player {
        self.session.player()
    }

    pub fn playlist(&self) -> Arc<Playlist> {
        self.session.playlist()
    }

    /// Queue `source` (scripted with `duration_seconds`) at the tail
    pub fn enqueue(&self, source: &str, duration_seconds: f64) -> Arc<Entry> {
        self.resolver.track(source, duration_seconds);
        let entry = Entry::new(source, Some("tester".to_string()));
        self.playlist().add_entry(entry.clone(), false).unwrap();
        entry
    }

    /// Next event that is not `entry-added`
    pub async fn next_event(&mut self) -> PlayerEvent {
        loop {
            let event = timeout(EVENT_TIMEOUT, self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event bus closed");
            if event.kind() != EventKind::EntryAdded {
                return event;
            }
        }
    }

    /// Next non-`entry-added` event, which must be `kind`
    pub async fn expect_event(&mut self, kind: EventKind) -> PlayerEvent {
        let event = self.next_event().await;
        assert_eq!(event.kind(), kind, "unexpected event {:?}", event);
        event
    }

    /// Next `kind` event for `entry`
    pub async fn expect_entry_event(&mut self, kind: EventKind, entry: &Entry) -> PlayerEvent {
        let event = self.expect_event(kind).await;
        assert_eq!(event.entry_id(), Some(entry.id()), "event for wrong entry: {:?}", event);
        event
    }

    /// Assert no lifecycle event arrives within `window`
    pub async fn expect_quiet(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Err(_) => return,
                Ok(Ok(event)) if event.kind() == EventKind::EntryAdded => continue,
                Ok(other) => panic!("unexpected event {:?}", other),
            }
        }
    }

    pub async fn wait_for_state(&self, state: PlayerState) {
        let player = self.player();
        timeout(EVENT_TIMEOUT, async {
            while player.state().await != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("player never reached {:?}", state));

        let current = self.player().current_entry().await;
        assert_eq!(state.has_entry(), current.is_some(), "current entry in {:?}", state);
    }

    /// Wait until `source` has started downloading `count` times
    pub async fn wait_for_downloads(&self, source: &str, count: usize) {
        let resolver = &self.resolver;
        timeout(EVENT_TIMEOUT, async {
            while resolver.downloads_of(source) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never downloaded {} times", source, count));
    }
}

/// Poll `check` until it holds or the timeout expires
pub async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(EVENT_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

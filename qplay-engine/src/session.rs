//! Per-session ownership
//!
//! One [`Session`] owns everything a voice session needs: the event bus, the
//! media cache, the active playlist and the player. Hosts keep one per
//! session; nothing here is process-global.

use crate::cache::MediaCache;
use crate::collaborators::{ReferenceCheck, Resolver, VoiceSink};
use crate::config::EngineConfig;
use crate::events::SessionBus;
use crate::player::{Player, PlayerSnapshot};
use crate::playlist::Playlist;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info};

/// Name of the playlist a fresh session starts with
pub const DEFAULT_PLAYLIST: &str = "main";

/// Playlist + player + shared plumbing for one session
pub struct Session {
    events: Arc<SessionBus>,
    cache: Arc<MediaCache>,
    player: Player,
    /// Every playlist this session handed out or started with
    playlists: Mutex<Vec<Weak<Playlist>>>,
}

impl Session {
    /// Fresh session with an empty default playlist
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: &EngineConfig,
        resolver: Arc<dyn Resolver>,
        sink: Arc<dyn VoiceSink>,
    ) -> Self {
        Self::with_reference_check(config, resolver, sink, None)
    }

    /// Fresh session whose cache consults `references` before deleting files
    pub fn with_reference_check(
        config: &EngineConfig,
        resolver: Arc<dyn Resolver>,
        sink: Arc<dyn VoiceSink>,
        references: Option<Arc<dyn ReferenceCheck>>,
    ) -> Self {
        let (events, cache) = Self::plumbing(config, resolver, references);
        let playlist = Playlist::new(
            DEFAULT_PLAYLIST,
            config.precache_depth,
            Arc::clone(&cache),
            Arc::clone(&events),
        );
        let playlists = Mutex::new(vec![Arc::downgrade(&playlist)]);
        let player = Player::new(playlist, sink, Arc::clone(&cache), Arc::clone(&events), config);

        info!("Session started");
        Self {
            events,
            cache,
            player,
            playlists,
        }
    }

    /// Session rebuilt from a stored snapshot
    pub fn restore(
        config: &EngineConfig,
        resolver: Arc<dyn Resolver>,
        sink: Arc<dyn VoiceSink>,
        snapshot: &PlayerSnapshot,
    ) -> Self {
        let (events, cache) = Self::plumbing(config, resolver, None);
        let player = Player::restore(snapshot, sink, Arc::clone(&cache), Arc::clone(&events), config);
        let playlists = Mutex::new(vec![Arc::downgrade(&player.active_playlist())]);

        info!(
            "Session restored ({} queued, current: {})",
            snapshot.playlist.entries.len(),
            snapshot.current.is_some()
        );
        Self {
            events,
            cache,
            player,
            playlists,
        }
    }

    fn plumbing(
        config: &EngineConfig,
        resolver: Arc<dyn Resolver>,
        references: Option<Arc<dyn ReferenceCheck>>,
    ) -> (Arc<SessionBus>, Arc<MediaCache>) {
        let events = Arc::new(SessionBus::new(config.event_capacity));
        let mut cache = MediaCache::new(resolver, config);
        if let Some(references) = references {
            cache = cache.with_reference_check(references);
        }
        (events, Arc::new(cache))
    }

    pub fn events(&self) -> &Arc<SessionBus> {
        &self.events
    }

    pub fn cache(&self) -> &Arc<MediaCache> {
        &self.cache
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    /// The player's active playlist
    pub fn playlist(&self) -> Arc<Playlist> {
        self.player.active_playlist()
    }

    /// New empty playlist sharing this session's cache and event bus
    ///
    /// The session closes it on teardown.
    pub fn create_playlist(&self, name: impl Into<String>, precache_depth: usize) -> Arc<Playlist> {
        let playlist = Playlist::new(
            name,
            precache_depth,
            Arc::clone(&self.cache),
            Arc::clone(&self.events),
        );

        let mut playlists = self.playlists.lock().unwrap_or_else(PoisonError::into_inner);
        playlists.retain(|p| p.strong_count() > 0);
        playlists.push(Arc::downgrade(&playlist));
        playlist
    }

    /// Tear the session down: detach the player, cancel all preparations
    ///
    /// Closes the active playlist and every playlist the session created,
    /// including ones swapped out of the player.
    pub async fn close(self) {
        self.player.shutdown().await;

        let mut open: Vec<Arc<Playlist>> = self
            .playlists
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        open.push(self.player.active_playlist());
        for playlist in &open {
            if !playlist.is_closed() {
                debug!("Closing playlist '{}'", playlist.name());
                playlist.close();
            }
        }
        info!("Session closed");
    }
}

//! Core player - construction, shared state and the signal driver
//!
//! **Responsibilities:**
//! - Player struct definition and initialization (fresh or restored)
//! - The driver task: consumes preparation results, sink completions and
//!   wake-ups, and advances the pull loop
//! - Helpers shared by the transport operations in `control`

use super::PlayerState;
use crate::cache::{CachePin, MediaCache};
use crate::collaborators::{CompletionCallback, PlayRequest, SinkError, VoiceSink};
use crate::config::EngineConfig;
use crate::entry::{Entry, PrepareHandle};
use crate::error::{ErrorCause, PrepareError, Result};
use crate::events::{EventKind, PlayerEvent, SessionBus};
use crate::playlist::Playlist;
use qplay_common::events::HandlerId;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Messages consumed by the driver task
pub(super) enum Signal {
    /// An entry landed in `playlist`, or it became active; start if idle
    Wake { playlist: String },
    /// Backoff elapsed; continue the pull loop
    Pull,
    /// Current entry's preparation settled
    Prepared {
        generation: u64,
        result: std::result::Result<Arc<Entry>, PrepareError>,
    },
    /// Voice sink finished the stream started for `generation`
    Completed {
        generation: u64,
        error: Option<SinkError>,
    },
}

/// In-flight wait on the current entry's preparation
pub(super) struct Download {
    pub(super) handle: PrepareHandle,
    pub(super) waiter: CancellationToken,
}

/// Snapshot entry played before the playlist is pulled
pub(super) struct Restored {
    pub(super) entry: Arc<Entry>,
    pub(super) offset: Duration,
    handle: PrepareHandle,
    _pin: CachePin,
}

/// State guarded by the player lock
pub(super) struct Core {
    pub(super) state: PlayerState,
    pub(super) current: Option<Arc<Entry>>,
    /// Keeps the current entry's file from being retired under the sink
    pub(super) pin: Option<CachePin>,
    /// Bumped whenever the current entry changes; stale signals carry an old value
    pub(super) generation: u64,
    pub(super) download: Option<Download>,
    /// Pause requested while downloading; survives entries that fail to
    /// prepare and is cleared only once applied, by skip, or by shutdown
    pub(super) pause_requested: bool,
    /// The sink holds a stream for the current entry
    pub(super) sink_started: bool,
    pub(super) volume: f32,
    /// Offset the current entry starts from
    pub(super) start_at: Duration,
    pub(super) restored: Option<Restored>,
    pub(super) detached: bool,
}

/// Side effects collected under the lock and applied after releasing it
#[derive(Default)]
pub(super) struct Effects {
    pub(super) events: Vec<PlayerEvent>,
    /// Entries that left the player for good
    pub(super) retired: Vec<Arc<Entry>>,
    /// Schedule a pull after the retry backoff
    pub(super) backoff: bool,
    /// Stop the driver
    pub(super) halt: bool,
}

pub(super) struct Shared {
    pub(super) core: Mutex<Core>,
    playlist: RwLock<Arc<Playlist>>,
    pub(super) sink: Arc<dyn VoiceSink>,
    pub(super) cache: Arc<MediaCache>,
    pub(super) events: Arc<SessionBus>,
    pub(super) signals: mpsc::UnboundedSender<Signal>,
    pub(super) shutdown: CancellationToken,
    retry_backoff: Duration,
    pub(super) auto_playback: bool,
}

/// Playback state machine bound to one voice sink
///
/// Dropping the player stops its driver task; call [`Player::shutdown`]
/// first to also stop the sink and release the current entry.
pub struct Player {
    pub(super) shared: Arc<Shared>,
    handler: HandlerId,
}

impl Player {
    /// Create an idle player pulling from `playlist`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        playlist: Arc<Playlist>,
        sink: Arc<dyn VoiceSink>,
        cache: Arc<MediaCache>,
        events: Arc<SessionBus>,
        config: &EngineConfig,
    ) -> Self {
        Self::build(playlist, sink, cache, events, config, None, config.default_volume)
    }

    /// Rebuild a player from a snapshot
    ///
    /// The player starts idle. The restored current entry is prepared right
    /// away and played first, from the saved progress, on the next `play()`.
    pub fn restore(
        snapshot: &super::PlayerSnapshot,
        sink: Arc<dyn VoiceSink>,
        cache: Arc<MediaCache>,
        events: Arc<SessionBus>,
        config: &EngineConfig,
    ) -> Self {
        let playlist = Playlist::restore(&snapshot.playlist, Arc::clone(&cache), Arc::clone(&events));

        let restored = snapshot.current.as_ref().map(|current| {
            let entry = Entry::from_snapshot(current);
            Restored {
                handle: entry.request_prepare(&cache),
                _pin: cache.pin(entry.source_ref()),
                offset: qplay_common::time::seconds_to_duration(snapshot.progress_seconds),
                entry,
            }
        });

        let volume = if (0.0..=1.0).contains(&snapshot.volume) {
            snapshot.volume
        } else {
            warn!(
                "Ignoring restored volume {}, using {}",
                snapshot.volume, config.default_volume
            );
            config.default_volume
        };

        Self::build(playlist, sink, cache, events, config, restored, volume)
    }

    fn build(
        playlist: Arc<Playlist>,
        sink: Arc<dyn VoiceSink>,
        cache: Arc<MediaCache>,
        events: Arc<SessionBus>,
        config: &EngineConfig,
        restored: Option<Restored>,
        volume: f32,
    ) -> Self {
        let (signals, receiver) = mpsc::unbounded_channel();

        info!(
            "Creating player on playlist '{}' (volume {:.2}, auto_playback={})",
            playlist.name(),
            volume,
            config.auto_playback
        );

        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                state: PlayerState::Idle,
                current: None,
                pin: None,
                generation: 0,
                download: None,
                pause_requested: false,
                sink_started: false,
                volume,
                start_at: Duration::ZERO,
                restored,
                detached: false,
            }),
            playlist: RwLock::new(playlist),
            sink,
            cache: Arc::clone(&cache),
            events: Arc::clone(&events),
            signals: signals.clone(),
            shutdown: CancellationToken::new(),
            retry_backoff: config.retry_backoff(),
            auto_playback: config.auto_playback,
        });

        // Handlers run on the emitter's thread; only post to the driver
        let handler = events.on(EventKind::EntryAdded, move |event| {
            if let PlayerEvent::EntryAdded { playlist, .. } = event {
                let _ = signals.send(Signal::Wake {
                    playlist: playlist.clone(),
                });
            }
            Ok(())
        });

        cache.spawn(drive(Arc::clone(&shared), receiver));

        Self { shared, handler }
    }

    /// Current state
    pub async fn state(&self) -> PlayerState {
        self.shared.core.lock().await.state
    }

    /// Entry being downloaded, played or paused
    pub async fn current_entry(&self) -> Option<Arc<Entry>> {
        self.shared.core.lock().await.current.clone()
    }

    /// Position within the current entry
    pub async fn progress(&self) -> Duration {
        let core = self.shared.core.lock().await;
        self.shared.position(&core)
    }

    pub async fn volume(&self) -> f32 {
        self.shared.core.lock().await.volume
    }

    /// True once torn down (or stopped by a fatal pull-loop error)
    pub async fn is_detached(&self) -> bool {
        self.shared.core.lock().await.detached
    }

    pub fn active_playlist(&self) -> Arc<Playlist> {
        self.shared.playlist()
    }

    /// Swap the playlist entries are pulled from
    ///
    /// The current entry keeps playing. An idle player with auto-playback
    /// starts pulling if the new playlist has entries.
    pub fn set_active_playlist(&self, playlist: Arc<Playlist>) -> Arc<Playlist> {
        let name = playlist.name().to_string();
        let has_entries = !playlist.is_empty();
        let previous = {
            let mut active = self
                .shared
                .playlist
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *active, playlist)
        };

        info!("Active playlist '{}' -> '{}'", previous.name(), name);
        if has_entries {
            let _ = self.shared.signals.send(Signal::Wake { playlist: name });
        }
        previous
    }

    /// Tear the player down (voice transport gone)
    ///
    /// Stops the sink, cancels any in-flight download and releases the
    /// current entry under normal cache policy. Emits `stop` if the player
    /// was active. Further transport calls fail with `Detached`.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let mut fx = Effects::default();
        {
            let mut core = shared.core.lock().await;
            let was_active = core.state != PlayerState::Idle;

            if core.sink_started {
                if core.state == PlayerState::Paused {
                    shared.sink.resume();
                }
                shared.sink.stop();
            }
            if let Some(download) = core.download.take() {
                download.waiter.cancel();
                download.handle.cancel();
            }
            if let Some(entry) = shared.end_current(&mut core) {
                fx.retired.push(entry);
            }
            if let Some(restored) = core.restored.take() {
                restored.handle.cancel();
                fx.retired.push(restored.entry);
            }
            core.pause_requested = false;
            core.state = PlayerState::Idle;
            core.detached = true;

            if was_active {
                fx.events.push(PlayerEvent::stop());
            }
            fx.halt = true;
        }

        shared.events.off(self.handler);
        shared.apply(fx);
        info!("Player detached");
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shared.events.off(self.handler);
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    pub(super) fn playlist(&self) -> Arc<Playlist> {
        Arc::clone(&self.playlist.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Position within the current (or restored) entry
    pub(super) fn position(&self, core: &Core) -> Duration {
        if core.sink_started {
            self.sink.progress()
        } else if core.current.is_some() {
            core.start_at
        } else {
            core.restored.as_ref().map_or(Duration::ZERO, |r| r.offset)
        }
    }

    /// Take the next entry and start preparing it
    ///
    /// Caller has set `state` to `Waiting`. Returns false (and goes idle,
    /// emitting `stop`) if there is nothing to play; fails if the playlist
    /// is closed.
    pub(super) fn pull_next(&self, core: &mut Core, fx: &mut Effects) -> Result<bool> {
        if let Some(restored) = core.restored.take() {
            let Restored { entry, offset, .. } = restored;
            info!("Resuming restored entry {} at {:?}", entry.id(), offset);
            self.begin_download(core, entry, offset);
            return Ok(true);
        }

        let playlist = self.playlist();
        match playlist.get_next_entry() {
            Ok(Some(entry)) => {
                self.begin_download(core, entry, Duration::ZERO);
                Ok(true)
            }
            Ok(None) => {
                info!("Playlist '{}' exhausted, player idle", playlist.name());
                core.state = PlayerState::Idle;
                core.pause_requested = false;
                fx.events.push(PlayerEvent::stop());
                Ok(false)
            }
            Err(e) => {
                core.state = PlayerState::Idle;
                core.pause_requested = false;
                Err(e)
            }
        }
    }

    /// Continue the pull loop; a failing playlist stops the player
    pub(super) fn advance(&self, core: &mut Core, fx: &mut Effects) {
        if let Err(e) = self.pull_next(core, fx) {
            error!("Pull loop stopped: {}", e);
            core.state = PlayerState::Idle;
            core.detached = true;
            fx.events
                .push(PlayerEvent::error(None, ErrorCause::Fatal(e.to_string())));
            fx.halt = true;
        }
    }

    fn begin_download(&self, core: &mut Core, entry: Arc<Entry>, start_at: Duration) {
        core.generation += 1;
        let generation = core.generation;

        let handle = entry.request_prepare(&self.cache);
        let waiter = self.shutdown.child_token();

        core.state = PlayerState::Downloading;
        core.pin = Some(self.cache.pin(entry.source_ref()));
        core.current = Some(Arc::clone(&entry));
        core.start_at = start_at;
        core.sink_started = false;
        core.download = Some(Download {
            handle: handle.clone(),
            waiter: waiter.clone(),
        });

        info!("Downloading '{}' ({})", entry.title(), entry.id());

        let signals = self.signals.clone();
        self.cache.spawn(async move {
            tokio::select! {
                _ = waiter.cancelled() => {}
                result = handle.wait() => {
                    let _ = signals.send(Signal::Prepared { generation, result });
                }
            }
        });
    }

    /// Hand the current entry's file to the sink
    pub(super) fn start_sink(
        &self,
        core: &mut Core,
        entry: &Arc<Entry>,
    ) -> std::result::Result<(), SinkError> {
        let path = entry
            .local_path()
            .ok_or_else(|| SinkError(format!("entry {} has no cached file", entry.id())))?;

        let request = PlayRequest {
            entry_id: entry.id(),
            path,
            volume: core.volume,
            start_at: core.start_at,
            duration: entry.duration(),
        };

        let generation = core.generation;
        let signals = self.signals.clone();
        let on_complete: CompletionCallback = Box::new(move |error| {
            let _ = signals.send(Signal::Completed { generation, error });
        });

        self.sink.play(request, on_complete)?;
        core.sink_started = true;
        Ok(())
    }

    /// Release the current entry and return to `Waiting`
    ///
    /// Invalidates every outstanding signal for it. Does not touch the sink.
    pub(super) fn end_current(&self, core: &mut Core) -> Option<Arc<Entry>> {
        core.generation += 1;
        if let Some(download) = core.download.take() {
            download.waiter.cancel();
        }
        core.state = PlayerState::Waiting;
        core.sink_started = false;
        core.start_at = Duration::ZERO;
        core.pin = None;
        core.current.take()
    }

    /// Current entry's file could not be played
    pub(super) fn fail_playback(&self, core: &mut Core, err: SinkError, fx: &mut Effects) {
        if let Some(entry) = self.end_current(core) {
            warn!("Playback of {} failed: {}", entry.id(), err);
            entry.invalidate();
            fx.events.push(PlayerEvent::error(
                Some(&entry),
                ErrorCause::Playback(err.0),
            ));
            fx.retired.push(entry);
        }
        self.advance(core, fx);
    }

    /// Apply effects collected under the lock
    pub(super) fn apply(&self, fx: Effects) {
        if !fx.retired.is_empty() {
            let playlist = self.playlist();
            for entry in &fx.retired {
                if !playlist.contains_source(entry.source_ref()) {
                    self.cache.retire(entry);
                }
            }
        }

        for event in fx.events {
            self.events.emit(event);
        }

        if fx.backoff {
            let signals = self.signals.clone();
            let shutdown = self.shutdown.clone();
            let delay = self.retry_backoff;
            self.cache.spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        let _ = signals.send(Signal::Pull);
                    }
                }
            });
        }

        if fx.halt {
            self.shutdown.cancel();
        }
    }

    async fn on_wake(&self, playlist: String) {
        if !self.auto_playback || playlist != self.playlist().name() {
            return;
        }

        let mut fx = Effects::default();
        {
            let mut core = self.core.lock().await;
            if core.state != PlayerState::Idle || core.detached {
                return;
            }
            info!("Entries queued in '{}', starting playback", playlist);
            core.state = PlayerState::Waiting;
            self.advance(&mut core, &mut fx);
        }
        self.apply(fx);
    }

    async fn on_pull(&self) {
        let mut fx = Effects::default();
        {
            let mut core = self.core.lock().await;
            if core.state != PlayerState::Waiting || core.detached {
                return;
            }
            self.advance(&mut core, &mut fx);
        }
        self.apply(fx);
    }

    async fn on_prepared(
        &self,
        generation: u64,
        result: std::result::Result<Arc<Entry>, PrepareError>,
    ) {
        let mut fx = Effects::default();
        {
            let mut core = self.core.lock().await;
            if core.generation != generation || core.state != PlayerState::Downloading {
                debug!("Ignoring stale preparation result (generation {})", generation);
                return;
            }
            core.download = None;
            let Some(entry) = core.current.clone() else {
                return;
            };

            match result {
                Ok(_) if core.pause_requested => {
                    core.pause_requested = false;
                    core.state = PlayerState::Paused;
                    info!("'{}' ready, starting paused", entry.title());
                    fx.events.push(PlayerEvent::pause(&entry));
                }
                Ok(_) => match self.start_sink(&mut core, &entry) {
                    Ok(()) => {
                        core.state = PlayerState::Playing;
                        info!("Playing '{}' ({})", entry.title(), entry.id());
                        fx.events.push(PlayerEvent::play(&entry));
                    }
                    Err(e) => self.fail_playback(&mut core, e, &mut fx),
                },
                Err(e) => {
                    warn!(
                        "Could not prepare '{}' ({}): {}; moving on",
                        entry.title(),
                        entry.id(),
                        e
                    );
                    self.end_current(&mut core);
                    fx.events
                        .push(PlayerEvent::error(Some(&entry), ErrorCause::from(&e)));
                    fx.retired.push(entry);
                    fx.backoff = true;
                }
            }
        }
        self.apply(fx);
    }

    async fn on_completed(&self, generation: u64, error: Option<SinkError>) {
        let mut fx = Effects::default();
        {
            let mut core = self.core.lock().await;
            if core.generation != generation || !core.sink_started {
                debug!("Ignoring stale completion (generation {})", generation);
                return;
            }
            let Some(entry) = self.end_current(&mut core) else {
                return;
            };

            match error {
                None => {
                    info!("Finished '{}' ({})", entry.title(), entry.id());
                    fx.events.push(PlayerEvent::finished(&entry));
                }
                Some(e) => {
                    warn!("Sink failed mid-stream on {}: {}", entry.id(), e);
                    entry.invalidate();
                    fx.events.push(PlayerEvent::error(
                        Some(&entry),
                        ErrorCause::Playback(e.0),
                    ));
                }
            }
            fx.retired.push(entry);
            self.advance(&mut core, &mut fx);
        }
        self.apply(fx);
    }
}

/// Driver task: serializes every asynchronous input into state transitions
async fn drive(shared: Arc<Shared>, mut signals: mpsc::UnboundedReceiver<Signal>) {
    debug!("Player driver started");

    loop {
        let signal = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };

        match signal {
            Signal::Wake { playlist } => shared.on_wake(playlist).await,
            Signal::Pull => shared.on_pull().await,
            Signal::Prepared { generation, result } => {
                shared.on_prepared(generation, result).await
            }
            Signal::Completed { generation, error } => {
                shared.on_completed(generation, error).await
            }
        }
    }

    debug!("Player driver stopped");
}

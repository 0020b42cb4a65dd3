//! Transport operations for Player
//!
//! **Responsibilities:**
//! - play / pause / resume / skip / volume
//! - Time-until-entry estimates
//! - Snapshots for persistence
//!
//! Every operation takes the player lock once, performs its check-and-set
//! transition, and applies the collected side effects (events, cache
//! retirement) after releasing it.

use super::core::{Core, Effects, Player, Shared};
use super::{PauseOutcome, PlayStatus, PlayerSnapshot, PlayerState};
use crate::entry::Entry;
use crate::error::{Error, Result, StateError};
use crate::events::PlayerEvent;
use crate::playlist::Estimate;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

impl Player {
    /// Start or resume playback
    ///
    /// - `Paused`: resumes in place, no re-download
    /// - `Idle`: starts the pull loop; an empty playlist sends the player
    ///   straight back to idle (emitting `stop`)
    /// - otherwise: no-op
    pub async fn play(&self) -> Result<PlayStatus> {
        let shared = &self.shared;
        let mut fx = Effects::default();
        let result = {
            let mut core = shared.core.lock().await;
            if core.detached {
                return Err(StateError::Detached.into());
            }

            match core.state {
                PlayerState::Paused => {
                    shared.resume_locked(&mut core, &mut fx).map(|()| PlayStatus::Resumed)
                }
                PlayerState::Playing | PlayerState::Downloading | PlayerState::Waiting => {
                    Ok(PlayStatus::AlreadyActive)
                }
                PlayerState::Idle => {
                    info!("Play requested, starting pull loop");
                    core.state = PlayerState::Waiting;
                    match shared.pull_next(&mut core, &mut fx) {
                        Ok(true) => Ok(PlayStatus::Started),
                        Ok(false) => Ok(PlayStatus::WaitingForEntries),
                        Err(e) => {
                            core.detached = true;
                            fx.halt = true;
                            Err(e)
                        }
                    }
                }
            }
        };

        shared.apply(fx);
        result
    }

    /// Pause playback
    ///
    /// While `Downloading` the pause is deferred: the entry starts paused
    /// once ready and `pause` is emitted then.
    pub async fn pause(&self) -> Result<PauseOutcome> {
        let shared = &self.shared;
        let mut fx = Effects::default();
        let outcome = {
            let mut core = shared.core.lock().await;
            if core.detached {
                return Err(StateError::Detached.into());
            }

            match (core.state, core.current.clone()) {
                (PlayerState::Playing, Some(entry)) => {
                    shared.sink.pause();
                    core.state = PlayerState::Paused;
                    info!("Paused '{}'", entry.title());
                    fx.events.push(PlayerEvent::pause(&entry));
                    PauseOutcome::Paused
                }
                (PlayerState::Downloading, Some(_)) => {
                    core.pause_requested = true;
                    info!("Pause deferred until download completes");
                    PauseOutcome::Deferred
                }
                _ => return Err(StateError::NotPlaying.into()),
            }
        };

        shared.apply(fx);
        Ok(outcome)
    }

    /// Resume a paused entry
    pub async fn resume(&self) -> Result<()> {
        let shared = &self.shared;
        let mut fx = Effects::default();
        let result = {
            let mut core = shared.core.lock().await;
            if core.detached {
                return Err(StateError::Detached.into());
            }
            if core.state != PlayerState::Paused {
                return Err(StateError::NotPaused.into());
            }
            shared.resume_locked(&mut core, &mut fx)
        };

        shared.apply(fx);
        result
    }

    /// Abandon the current entry and advance
    ///
    /// Stops the sink (resuming it first if paused) or cancels the
    /// in-flight preparation. Emits `finished-playing` only for an entry
    /// that reached the sink. Returns the skipped entry.
    pub async fn skip(&self) -> Result<Arc<Entry>> {
        let shared = &self.shared;
        let mut fx = Effects::default();
        let skipped = {
            let mut core = shared.core.lock().await;
            if core.detached {
                return Err(StateError::Detached.into());
            }

            let entry = match core.state {
                PlayerState::Playing | PlayerState::Paused => {
                    let started = core.sink_started;
                    if started {
                        // Sink can only be stopped while active
                        if core.state == PlayerState::Paused {
                            shared.sink.resume();
                        }
                        shared.sink.stop();
                    }
                    let entry = shared
                        .end_current(&mut core)
                        .ok_or(StateError::NothingToSkip)?;
                    if started {
                        fx.events.push(PlayerEvent::finished(&entry));
                    }
                    info!("Skipped '{}'", entry.title());
                    entry
                }
                PlayerState::Downloading => {
                    if let Some(download) = core.download.take() {
                        download.waiter.cancel();
                        download.handle.cancel();
                    }
                    let entry = shared
                        .end_current(&mut core)
                        .ok_or(StateError::NothingToSkip)?;
                    info!("Skipped '{}' while downloading", entry.title());
                    entry
                }
                PlayerState::Idle | PlayerState::Waiting => {
                    return Err(StateError::NothingToSkip.into())
                }
            };
            core.pause_requested = false;

            fx.retired.push(Arc::clone(&entry));
            shared.advance(&mut core, &mut fx);
            entry
        };

        shared.apply(fx);
        Ok(skipped)
    }

    /// Change volume on the live stream
    pub async fn set_volume(&self, volume: f32) -> Result<()> {
        if !volume.is_finite() || !(0.0..=1.0).contains(&volume) {
            return Err(StateError::InvalidVolume(volume).into());
        }

        let mut core = self.shared.core.lock().await;
        core.volume = volume;
        if core.sink_started {
            self.shared.sink.set_volume(volume);
        }
        debug!("Volume set to {:.2}", volume);
        Ok(())
    }

    /// Time until `entry` starts playing
    ///
    /// For the current entry this is its remaining time. While the current
    /// entry is still downloading the estimate waits for the download, so
    /// the current entry's real duration is known. Fails if `entry` is
    /// neither current nor queued in the active playlist.
    pub async fn estimate_time_until_entry(&self, entry: &Entry) -> Result<Estimate> {
        let pending = {
            let core = self.shared.core.lock().await;
            match (&core.state, &core.download) {
                (PlayerState::Downloading, Some(download)) => Some(download.handle.clone()),
                _ => None,
            }
        };
        if let Some(handle) = pending {
            // Outcome is irrelevant; only the resolved duration matters
            let _ = handle.wait().await;
        }

        let (current, position) = {
            let core = self.shared.core.lock().await;
            (core.current.clone(), self.shared.position(&core))
        };

        let remaining = match &current {
            Some(current) => match current.duration() {
                Some(total) => Estimate {
                    duration: total.saturating_sub(position),
                    exact: true,
                },
                None => Estimate {
                    duration: Duration::ZERO,
                    exact: false,
                },
            },
            None => Estimate::ZERO,
        };

        if current.as_ref().is_some_and(|c| c.id() == entry.id()) {
            return Ok(remaining);
        }

        let playlist = self.shared.playlist();
        let index = playlist.position_of(entry.id()).ok_or_else(|| {
            Error::Queue(format!(
                "entry {} is not queued in '{}'",
                entry.id(),
                playlist.name()
            ))
        })?;
        let ahead = playlist.estimate_time_until(index + 1);

        Ok(Estimate {
            duration: remaining.duration.saturating_add(ahead.duration),
            exact: remaining.exact && ahead.exact,
        })
    }

    /// Capture playlist order, current entry and progress
    pub async fn snapshot(&self) -> PlayerSnapshot {
        let core = self.shared.core.lock().await;
        let current = core
            .current
            .as_ref()
            .or(core.restored.as_ref().map(|r| &r.entry))
            .map(|entry| entry.snapshot());

        PlayerSnapshot {
            playlist: self.shared.playlist().to_snapshot(),
            current,
            progress_seconds: self.shared.position(&core).as_secs_f64(),
            volume: core.volume,
        }
    }
}

impl Shared {
    /// Resume a `Paused` current entry
    ///
    /// An entry paused before it ever reached the sink is started now,
    /// emitting `play` then `resume`. A sink that refuses to start is
    /// reported to the caller and the loop moves on.
    fn resume_locked(&self, core: &mut Core, fx: &mut Effects) -> Result<()> {
        let Some(entry) = core.current.clone() else {
            return Err(StateError::NotPaused.into());
        };

        if core.sink_started {
            self.sink.resume();
            core.state = PlayerState::Playing;
            info!("Resumed '{}'", entry.title());
            fx.events.push(PlayerEvent::resume(&entry));
            return Ok(());
        }

        match self.start_sink(core, &entry) {
            Ok(()) => {
                core.state = PlayerState::Playing;
                info!("Playing '{}' after deferred pause", entry.title());
                fx.events.push(PlayerEvent::play(&entry));
                fx.events.push(PlayerEvent::resume(&entry));
                Ok(())
            }
            Err(e) => {
                if let Some(entry) = self.end_current(core) {
                    entry.invalidate();
                    fx.retired.push(entry);
                }
                self.advance(core, fx);
                Err(Error::Playback(e.0))
            }
        }
    }
}

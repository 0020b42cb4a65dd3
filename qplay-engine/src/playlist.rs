//! Playlist
//!
//! Ordered queue of entries with look-ahead pre-caching.
//!
//! **Locking:** one mutex guards the entry sequence and the precache window.
//! Every read or write takes it, does its bookkeeping and releases it; no
//! I/O happens while it is held (preparations are spawned onto the cache's
//! worker pool, file deletion is spawned too). Events are emitted after the
//! lock is released so handlers may call back into the playlist.
//!
//! **Precache window:** after every mutation the first
//! `min(precache_depth, len)` entries each hold a prepare-handle. Handles of
//! entries that left the queue are cancelled; entries merely pushed past the
//! window keep preparing.

use crate::cache::MediaCache;
use crate::entry::{Entry, EntrySnapshot, PrepareHandle};
use crate::error::{Error, Result};
use crate::events::{PlayerEvent, SessionBus};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Time estimate that may be a lower bound
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub duration: Duration,
    /// False if some contributing entry had an unknown duration
    pub exact: bool,
}

impl Estimate {
    pub const ZERO: Estimate = Estimate {
        duration: Duration::ZERO,
        exact: true,
    };

    /// Add one entry's contribution; unknown durations count as zero
    pub fn add(self, duration: Option<Duration>) -> Estimate {
        match duration {
            Some(d) => Estimate {
                duration: self.duration.saturating_add(d),
                exact: self.exact,
            },
            None => Estimate {
                duration: self.duration,
                exact: false,
            },
        }
    }

    /// Human-readable form, prefixed with ">= " when not exact
    pub fn display(&self) -> String {
        qplay_common::human_time::format_eta(self.duration, self.exact)
    }
}

/// Serializable playlist contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistSnapshot {
    pub name: String,
    pub entries: Vec<EntrySnapshot>,
    pub precache_depth: usize,
    #[serde(default)]
    pub karaoke_mode: bool,
}

struct PlaylistInner {
    entries: VecDeque<Arc<Entry>>,
    /// Prepare-handles aligned with the leading queue slots
    window: VecDeque<PrepareHandle>,
    precache_depth: usize,
    karaoke_mode: bool,
    closed: bool,
}

/// Ordered, mutable queue of entries owned by one session
pub struct Playlist {
    name: String,
    inner: Mutex<PlaylistInner>,
    cache: Arc<MediaCache>,
    events: Arc<SessionBus>,
}

impl Playlist {
    /// Create an empty playlist
    ///
    /// `name` identifies the playlist in `entry-added` events and should be
    /// unique within a session.
    pub fn new(
        name: impl Into<String>,
        precache_depth: usize,
        cache: Arc<MediaCache>,
        events: Arc<SessionBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            inner: Mutex::new(PlaylistInner {
                entries: VecDeque::new(),
                window: VecDeque::new(),
                precache_depth: precache_depth.max(1),
                karaoke_mode: false,
                closed: false,
            }),
            cache,
            events,
        })
    }

    /// Rebuild a playlist from a snapshot
    ///
    /// Entries come back `Unprepared`; the precache window is filled
    /// immediately. No `entry-added` events are emitted.
    pub fn restore(
        snapshot: &PlaylistSnapshot,
        cache: Arc<MediaCache>,
        events: Arc<SessionBus>,
    ) -> Arc<Self> {
        let playlist = Self::new(snapshot.name.clone(), snapshot.precache_depth, cache, events);
        {
            let mut inner = playlist.lock();
            inner.karaoke_mode = snapshot.karaoke_mode;
            inner
                .entries
                .extend(snapshot.entries.iter().map(Entry::from_snapshot));
            playlist.refresh_precache(&mut inner);
        }
        info!(
            "Restored playlist '{}' with {} entries",
            snapshot.name,
            snapshot.entries.len()
        );
        playlist
    }

    fn lock(&self) -> MutexGuard<'_, PlaylistInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, PlaylistInner>> {
        let inner = self.lock();
        if inner.closed {
            return Err(Error::Queue(format!("playlist '{}' is closed", self.name)));
        }
        Ok(inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `entry`, at the head if `at_head`
    ///
    /// Returns the entry's 1-based position.
    pub fn add_entry(&self, entry: Arc<Entry>, at_head: bool) -> Result<usize> {
        let position = {
            let mut inner = self.lock_open()?;
            let position = if at_head {
                inner.entries.push_front(Arc::clone(&entry));
                1
            } else {
                inner.entries.push_back(Arc::clone(&entry));
                inner.entries.len()
            };
            self.refresh_precache(&mut inner);
            position
        };

        debug!(
            "Queued {} in '{}' at position {}",
            entry.source_ref(),
            self.name,
            position
        );
        self.events
            .emit(PlayerEvent::entry_added(&self.name, &entry, position));
        Ok(position)
    }

    /// Append several entries with one window re-evaluation
    ///
    /// Returns the 1-based position of the last entry (the queue length).
    pub fn add_entries(&self, entries: Vec<Arc<Entry>>) -> Result<usize> {
        let (first, len) = {
            let mut inner = self.lock_open()?;
            let first = inner.entries.len() + 1;
            inner.entries.extend(entries.iter().cloned());
            self.refresh_precache(&mut inner);
            (first, inner.entries.len())
        };

        debug!("Queued {} entries in '{}'", entries.len(), self.name);
        for (offset, entry) in entries.iter().enumerate() {
            self.events
                .emit(PlayerEvent::entry_added(&self.name, entry, first + offset));
        }
        Ok(len)
    }

    /// Pop the head entry
    ///
    /// The popped entry's preparation keeps running; callers await its own
    /// prepare-handle before playing it. The next entry's preparation is
    /// scheduled before this returns. Fails only if the playlist is closed.
    pub fn get_next_entry(&self) -> Result<Option<Arc<Entry>>> {
        let mut inner = self.lock_open()?;
        let Some(entry) = inner.entries.pop_front() else {
            return Ok(None);
        };

        if let Some(slot) = inner
            .window
            .iter()
            .position(|h| Arc::ptr_eq(h.entry(), &entry))
        {
            inner.window.remove(slot);
        }
        self.refresh_precache(&mut inner);
        Ok(Some(entry))
    }

    /// Remove the entry at 0-based `index`
    ///
    /// A still-preparing entry is cancelled; its file is retired unless the
    /// same source is still queued here.
    pub fn remove_at(&self, index: usize) -> Result<Arc<Entry>> {
        let (entry, still_queued) = {
            let mut inner = self.lock_open()?;
            let len = inner.entries.len();
            let entry = inner.entries.remove(index).ok_or_else(|| {
                Error::Queue(format!("index {} out of range (queue length {})", index, len))
            })?;
            self.refresh_precache(&mut inner);
            let still_queued = Self::source_queued(&inner, &entry);
            (entry, still_queued)
        };

        debug!("Removed {} from '{}'", entry.source_ref(), self.name);
        self.release(&entry, still_queued);
        Ok(entry)
    }

    /// Remove every entry queued by `queuer_id`
    pub fn remove_by_queuer(&self, queuer_id: &str) -> Result<Vec<Arc<Entry>>> {
        let removed = {
            let mut inner = self.lock_open()?;
            let (removed, kept): (Vec<_>, Vec<_>) = inner
                .entries
                .drain(..)
                .partition(|e| e.queuer_id() == Some(queuer_id));
            inner.entries = kept.into();
            self.refresh_precache(&mut inner);
            removed
                .into_iter()
                .map(|e| {
                    let still_queued = Self::source_queued(&inner, &e);
                    (e, still_queued)
                })
                .collect::<Vec<_>>()
        };

        debug!(
            "Removed {} entries queued by {} from '{}'",
            removed.len(),
            queuer_id,
            self.name
        );
        Ok(removed
            .into_iter()
            .map(|(entry, still_queued)| {
                self.release(&entry, still_queued);
                entry
            })
            .collect())
    }

    /// Number of entries queued by `queuer_id`
    pub fn count_for_queuer(&self, queuer_id: &str) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.queuer_id() == Some(queuer_id))
            .count()
    }

    /// Move the entry at 0-based `from` to 0-based `to`
    pub fn move_entry(&self, from: usize, to: usize) -> Result<()> {
        let mut inner = self.lock_open()?;
        let len = inner.entries.len();
        if from >= len || to >= len {
            return Err(Error::Queue(format!(
                "move {} -> {} out of range (queue length {})",
                from, to, len
            )));
        }
        if let Some(entry) = inner.entries.remove(from) {
            inner.entries.insert(to, entry);
        }
        self.refresh_precache(&mut inner);
        Ok(())
    }

    /// Randomize queue order
    pub fn shuffle(&self) -> Result<()> {
        let mut inner = self.lock_open()?;
        inner.entries.make_contiguous().shuffle(&mut rand::thread_rng());
        self.refresh_precache(&mut inner);
        debug!("Shuffled '{}'", self.name);
        Ok(())
    }

    /// Remove every entry, cancelling their preparations
    pub fn clear(&self) -> Result<Vec<Arc<Entry>>> {
        let removed: Vec<Arc<Entry>> = {
            let mut inner = self.lock_open()?;
            let removed = inner.entries.drain(..).collect();
            self.refresh_precache(&mut inner);
            removed
        };

        info!("Cleared {} entries from '{}'", removed.len(), self.name);
        for entry in &removed {
            self.release(entry, false);
        }
        Ok(removed)
    }

    /// Tear the playlist down
    ///
    /// Cancels every outstanding preparation; afterwards mutations fail and
    /// a player pulling from this playlist stops with a fatal error.
    pub fn close(&self) {
        let entries: Vec<Arc<Entry>> = {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.window.clear();
            inner.entries.iter().cloned().collect()
        };

        for entry in &entries {
            entry.cancel_preparation();
        }
        info!("Closed playlist '{}'", self.name);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Copy of the queue, in playback order
    pub fn snapshot(&self) -> Vec<Arc<Entry>> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Entry at 0-based `index`
    pub fn get(&self, index: usize) -> Option<Arc<Entry>> {
        self.lock().entries.get(index).cloned()
    }

    /// Entries in the 0-based `range`, clipped to the queue
    pub fn slice(&self, range: Range<usize>) -> Vec<Arc<Entry>> {
        let inner = self.lock();
        let end = range.end.min(inner.entries.len());
        let start = range.start.min(end);
        inner.entries.range(start..end).cloned().collect()
    }

    /// 0-based index of the entry with `id`
    pub fn position_of(&self, id: Uuid) -> Option<usize> {
        self.lock().entries.iter().position(|e| e.id() == id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// True if an entry with the same source is queued
    pub fn contains_source(&self, source_ref: &str) -> bool {
        self.lock()
            .entries
            .iter()
            .any(|e| e.source_ref() == source_ref)
    }

    /// Sum of the durations of entries strictly before 1-based `position`
    pub fn estimate_time_until(&self, position: usize) -> Estimate {
        let inner = self.lock();
        let before = position.saturating_sub(1).min(inner.entries.len());
        inner
            .entries
            .iter()
            .take(before)
            .fold(Estimate::ZERO, |acc, e| acc.add(e.duration()))
    }

    pub fn precache_depth(&self) -> usize {
        self.lock().precache_depth
    }

    /// Change the look-ahead depth and re-fill the window
    pub fn set_precache_depth(&self, depth: usize) {
        let mut inner = self.lock();
        inner.precache_depth = depth.max(1);
        if !inner.closed {
            self.refresh_precache(&mut inner);
        }
    }

    /// Ids of entries currently holding a precache slot, in queue order
    pub fn precache_window(&self) -> Vec<Uuid> {
        self.lock().window.iter().map(|h| h.entry().id()).collect()
    }

    pub fn karaoke_mode(&self) -> bool {
        self.lock().karaoke_mode
    }

    pub fn set_karaoke_mode(&self, enabled: bool) {
        self.lock().karaoke_mode = enabled;
    }

    pub fn to_snapshot(&self) -> PlaylistSnapshot {
        let inner = self.lock();
        PlaylistSnapshot {
            name: self.name.clone(),
            entries: inner.entries.iter().map(|e| e.snapshot()).collect(),
            precache_depth: inner.precache_depth,
            karaoke_mode: inner.karaoke_mode,
        }
    }

    fn source_queued(inner: &PlaylistInner, entry: &Entry) -> bool {
        inner
            .entries
            .iter()
            .any(|e| e.source_ref() == entry.source_ref())
    }

    /// Dispose of an entry that left the queue
    fn release(&self, entry: &Arc<Entry>, source_still_queued: bool) {
        if source_still_queued {
            // Shared file stays; only this entry's own work stops
            if !self.lock().entries.iter().any(|e| Arc::ptr_eq(e, entry)) {
                entry.cancel_preparation();
            }
        } else {
            self.cache.retire(entry);
        }
    }

    /// Restore the precache window invariant
    fn refresh_precache(&self, inner: &mut PlaylistInner) {
        let mut previous: Vec<PrepareHandle> = inner.window.drain(..).collect();

        previous.retain(|handle| {
            let queued = inner
                .entries
                .iter()
                .any(|e| Arc::ptr_eq(e, handle.entry()));
            if !queued {
                handle.cancel();
            }
            queued
        });

        let depth = inner.precache_depth.min(inner.entries.len());
        for entry in inner.entries.iter().take(depth) {
            let handle = match previous
                .iter()
                .position(|h| Arc::ptr_eq(h.entry(), entry))
            {
                Some(i) => previous.swap_remove(i),
                None => entry.request_prepare(&self.cache),
            };
            inner.window.push_back(handle);
        }
    }
}

impl Drop for Playlist {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        inner.window.clear();
        for entry in &inner.entries {
            entry.cancel_preparation();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_add() {
        let estimate = Estimate::ZERO
            .add(Some(Duration::from_secs(100)))
            .add(Some(Duration::from_secs(20)));
        assert_eq!(estimate.duration, Duration::from_secs(120));
        assert!(estimate.exact);

        let estimate = estimate.add(None);
        assert_eq!(estimate.duration, Duration::from_secs(120));
        assert!(!estimate.exact);
        assert!(estimate.display().starts_with(">= "));
    }

    #[test]
    fn test_estimate_add_saturates() {
        let huge = qplay_common::time::seconds_to_duration(1e20);
        let estimate = Estimate::ZERO
            .add(Some(huge))
            .add(Some(Duration::from_secs(60)));
        assert_eq!(estimate.duration, Duration::MAX);
        assert!(estimate.exact);
        assert!(!estimate.display().is_empty());
    }

    #[test]
    fn test_snapshot_serialization_defaults_karaoke() {
        let json = r#"{"name":"main","entries":[],"precache_depth":2}"#;
        let snapshot: PlaylistSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.precache_depth, 2);
        assert!(!snapshot.karaoke_mode);
    }
}

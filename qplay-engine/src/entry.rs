//! Queue entries and their cache lifecycle
//!
//! An [`Entry`] is one queued media reference. Its cache state moves
//! `Unprepared -> Preparing -> Cached | Failed`. A released, cancelled or
//! invalidated entry may be prepared again. A resolution or download failure
//! is sticky: later requests see the same error until [`Entry::retry_prepare`].
//!
//! Preparation is coalesced: while one is in flight, every
//! [`Entry::request_prepare`] call attaches to it and receives the same
//! outcome through a `watch` channel. The resolve+download work runs on the
//! [`MediaCache`] worker pool, never on the caller's task.

use crate::cache::MediaCache;
use crate::collaborators::ResolvedMedia;
use crate::error::PrepareError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Cache state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Unprepared,
    Preparing,
    Cached,
    Failed,
}

#[derive(Debug, Clone)]
enum PrepareStatus {
    Pending,
    Ready,
    Failed(PrepareError),
}

/// One in-flight preparation, shared by every attached handle
#[derive(Debug)]
struct Preparation {
    status: watch::Sender<PrepareStatus>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct EntryState {
    title: String,
    duration_seconds: Option<f64>,
    /// Set iff `cache_state == Cached`
    local_path: Option<PathBuf>,
    /// Path of a file that was invalidated; removed on the next successful download
    stale_path: Option<PathBuf>,
    cache_state: CacheState,
    last_error: Option<PrepareError>,
    preparation: Option<Arc<Preparation>>,
}

/// A queued media reference plus its cache state
#[derive(Debug)]
pub struct Entry {
    id: Uuid,
    source_ref: String,
    queuer_id: Option<String>,
    state: Mutex<EntryState>,
}

/// Serializable view of an entry
///
/// Carried by events and stored in snapshots. Restoring one yields an
/// `Unprepared` entry with the same id and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub id: Uuid,
    pub source_ref: String,
    pub title: String,
    pub duration_seconds: Option<f64>,
    /// `None` for system (autoplaylist) entries
    pub queuer_id: Option<String>,
    pub cache_state: CacheState,
}

impl Entry {
    /// New unprepared entry; `queuer_id` is `None` for system entries
    pub fn new(source_ref: impl Into<String>, queuer_id: Option<String>) -> Arc<Self> {
        let source_ref = source_ref.into();
        Self::build(Uuid::new_v4(), source_ref.clone(), queuer_id, source_ref, None)
    }

    /// New unprepared entry with metadata already known to the producer
    pub fn with_metadata(
        source_ref: impl Into<String>,
        queuer_id: Option<String>,
        title: impl Into<String>,
        duration_seconds: Option<f64>,
    ) -> Arc<Self> {
        Self::build(
            Uuid::new_v4(),
            source_ref.into(),
            queuer_id,
            title.into(),
            duration_seconds,
        )
    }

    /// Rebuild an entry from a snapshot; cache state always starts `Unprepared`
    pub fn from_snapshot(snapshot: &EntrySnapshot) -> Arc<Self> {
        Self::build(
            snapshot.id,
            snapshot.source_ref.clone(),
            snapshot.queuer_id.clone(),
            snapshot.title.clone(),
            snapshot.duration_seconds,
        )
    }

    fn build(
        id: Uuid,
        source_ref: String,
        queuer_id: Option<String>,
        title: String,
        duration_seconds: Option<f64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            source_ref,
            queuer_id,
            state: Mutex::new(EntryState {
                title,
                duration_seconds,
                local_path: None,
                stale_path: None,
                cache_state: CacheState::Unprepared,
                last_error: None,
                preparation: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source_ref(&self) -> &str {
        &self.source_ref
    }

    pub fn queuer_id(&self) -> Option<&str> {
        self.queuer_id.as_deref()
    }

    /// True for entries queued by the system rather than a user
    pub fn is_system(&self) -> bool {
        self.queuer_id.is_none()
    }

    pub fn title(&self) -> String {
        self.lock().title.clone()
    }

    /// Length in seconds, `None` until known
    pub fn duration_seconds(&self) -> Option<f64> {
        self.lock().duration_seconds
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_seconds()
            .map(qplay_common::time::seconds_to_duration)
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        self.lock().local_path.clone()
    }

    pub fn cache_state(&self) -> CacheState {
        self.lock().cache_state
    }

    pub fn is_cached(&self) -> bool {
        self.cache_state() == CacheState::Cached
    }

    pub fn is_preparing(&self) -> bool {
        self.cache_state() == CacheState::Preparing
    }

    /// Failure of the most recent preparation, if it failed
    pub fn last_error(&self) -> Option<PrepareError> {
        self.lock().last_error.clone()
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        let state = self.lock();
        EntrySnapshot {
            id: self.id,
            source_ref: self.source_ref.clone(),
            title: state.title.clone(),
            duration_seconds: state.duration_seconds,
            queuer_id: self.queuer_id.clone(),
            cache_state: state.cache_state,
        }
    }

    /// Start (or join) preparation of this entry
    ///
    /// - `Cached`: returns an already-satisfied handle
    /// - `Preparing`: returns a handle to the in-flight operation
    /// - `Failed` by resolution or download: returns a handle already settled
    ///   with that error
    /// - `Unprepared`, or `Failed` by cancellation or invalidation: spawns
    ///   resolve+download on `cache`'s pool
    pub fn request_prepare(self: &Arc<Self>, cache: &Arc<MediaCache>) -> PrepareHandle {
        let mut state = self.lock();

        match state.cache_state {
            CacheState::Cached => return PrepareHandle::ready(Arc::clone(self)),
            CacheState::Preparing => {
                if let Some(preparation) = &state.preparation {
                    return PrepareHandle::attach(Arc::clone(self), preparation);
                }
            }
            CacheState::Failed => match &state.last_error {
                Some(err) if *err != PrepareError::Cancelled => {
                    return PrepareHandle::failed(Arc::clone(self), err.clone());
                }
                _ => {}
            },
            CacheState::Unprepared => {}
        }
        self.start_preparation(state, cache)
    }

    /// Prepare again after a resolution or download failure
    ///
    /// Behaves like [`Entry::request_prepare`] except that a sticky failure is
    /// cleared first.
    pub fn retry_prepare(self: &Arc<Self>, cache: &Arc<MediaCache>) -> PrepareHandle {
        let mut state = self.lock();
        if state.cache_state == CacheState::Failed {
            debug!("Retrying preparation of {} ({})", self.source_ref, self.id);
            state.last_error = None;
        }
        drop(state);
        self.request_prepare(cache)
    }

    fn start_preparation(
        self: &Arc<Self>,
        mut state: MutexGuard<'_, EntryState>,
        cache: &Arc<MediaCache>,
    ) -> PrepareHandle {
        let (status, _) = watch::channel(PrepareStatus::Pending);
        let preparation = Arc::new(Preparation {
            status,
            cancel: CancellationToken::new(),
        });
        state.cache_state = CacheState::Preparing;
        state.last_error = None;
        state.preparation = Some(Arc::clone(&preparation));
        let handle = PrepareHandle::attach(Arc::clone(self), &preparation);
        drop(state);

        debug!("Preparing {} ({})", self.source_ref, self.id);
        let entry = Arc::clone(self);
        let pool = Arc::clone(cache);
        cache.spawn(async move { entry.run_preparation(pool, preparation).await });

        handle
    }

    async fn run_preparation(self: Arc<Self>, cache: Arc<MediaCache>, preparation: Arc<Preparation>) {
        let outcome = tokio::select! {
            biased;
            _ = preparation.cancel.cancelled() => Err(PrepareError::Cancelled),
            result = cache.fetch(&self) => result,
        };

        let mut state = self.lock();
        let current = state
            .preparation
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, &preparation));
        if !current {
            // Cancelled out from under us; the canceller already settled state
            return;
        }
        state.preparation = None;

        let status = match outcome {
            Ok(path) => {
                if let Some(stale) = state.stale_path.take().filter(|p| *p != path) {
                    cache.remove_file(stale);
                }
                debug!("Cached {} at {}", self.id, path.display());
                state.local_path = Some(path);
                state.cache_state = CacheState::Cached;
                PrepareStatus::Ready
            }
            Err(err) => {
                warn!("Preparation of {} ({}) failed: {}", self.source_ref, self.id, err);
                state.local_path = None;
                state.cache_state = CacheState::Failed;
                state.last_error = Some(err.clone());
                PrepareStatus::Failed(err)
            }
        };
        drop(state);

        preparation.status.send_replace(status);
    }

    /// Cancel the in-flight preparation, if any
    ///
    /// The entry is left `Failed` with [`PrepareError::Cancelled`] and every
    /// attached handle resolves with that error. Returns false if nothing was
    /// in flight.
    pub fn cancel_preparation(&self) -> bool {
        self.cancel_matching(None)
    }

    fn cancel_matching(&self, only: Option<&Arc<Preparation>>) -> bool {
        let mut state = self.lock();
        let preparation = match (&state.preparation, only) {
            (Some(current), Some(wanted)) if !Arc::ptr_eq(current, wanted) => return false,
            (Some(_), _) => state.preparation.take(),
            (None, _) => None,
        };
        let Some(preparation) = preparation else {
            return false;
        };

        state.cache_state = CacheState::Failed;
        state.local_path = None;
        state.last_error = Some(PrepareError::Cancelled);
        drop(state);

        debug!("Cancelled preparation of {}", self.id);
        preparation.cancel.cancel();
        preparation
            .status
            .send_replace(PrepareStatus::Failed(PrepareError::Cancelled));
        true
    }

    pub(crate) fn apply_metadata(&self, media: &ResolvedMedia) {
        let mut state = self.lock();
        if !media.title.is_empty() {
            state.title = media.title.clone();
        }
        if media.duration_seconds.is_some() {
            state.duration_seconds = media.duration_seconds;
        }
    }

    /// Mark a cached file unusable (the sink could not play it)
    ///
    /// The entry becomes `Failed`; the file is removed by the next successful
    /// download of this entry.
    pub(crate) fn invalidate(&self) {
        let mut state = self.lock();
        if let Some(path) = state.local_path.take() {
            state.stale_path = Some(path);
        }
        if state.cache_state == CacheState::Cached {
            state.cache_state = CacheState::Failed;
        }
    }

    /// Drop the cached file reference, returning the path to delete
    pub(crate) fn release_local_path(&self) -> Option<PathBuf> {
        let mut state = self.lock();
        if state.cache_state != CacheState::Cached {
            return state.stale_path.take();
        }
        state.cache_state = CacheState::Unprepared;
        state.local_path.take()
    }
}

/// Waitable handle on an entry's preparation
///
/// Cloning a handle shares the same preparation. Dropping a handle does not
/// cancel anything; use [`PrepareHandle::cancel`].
#[derive(Debug, Clone)]
pub struct PrepareHandle {
    entry: Arc<Entry>,
    status: watch::Receiver<PrepareStatus>,
    preparation: Option<Arc<Preparation>>,
}

impl PrepareHandle {
    fn ready(entry: Arc<Entry>) -> Self {
        let (_, status) = watch::channel(PrepareStatus::Ready);
        Self {
            entry,
            status,
            preparation: None,
        }
    }

    fn failed(entry: Arc<Entry>, err: PrepareError) -> Self {
        let (_, status) = watch::channel(PrepareStatus::Failed(err));
        Self {
            entry,
            status,
            preparation: None,
        }
    }

    fn attach(entry: Arc<Entry>, preparation: &Arc<Preparation>) -> Self {
        Self {
            entry,
            status: preparation.status.subscribe(),
            preparation: Some(Arc::clone(preparation)),
        }
    }

    pub fn entry(&self) -> &Arc<Entry> {
        &self.entry
    }

    /// True once the preparation has succeeded or failed
    pub fn is_finished(&self) -> bool {
        !matches!(*self.status.borrow(), PrepareStatus::Pending)
    }

    /// Wait for the preparation outcome
    pub async fn wait(&self) -> Result<Arc<Entry>, PrepareError> {
        let mut status = self.status.clone();
        let outcome = match status
            .wait_for(|s| !matches!(s, PrepareStatus::Pending))
            .await
        {
            Ok(settled) => match &*settled {
                PrepareStatus::Ready => Ok(()),
                PrepareStatus::Failed(err) => Err(err.clone()),
                PrepareStatus::Pending => Err(PrepareError::Cancelled),
            },
            // Sender gone without settling: the preparation task was dropped
            Err(_) => Err(PrepareError::Cancelled),
        };
        outcome.map(|()| Arc::clone(&self.entry))
    }

    /// Cancel the preparation this handle is attached to
    ///
    /// No-op (returns false) for an already-settled or already-cached handle.
    pub fn cancel(&self) -> bool {
        match &self.preparation {
            Some(preparation) => self.entry.cancel_matching(Some(preparation)),
            None => false,
        }
    }
}

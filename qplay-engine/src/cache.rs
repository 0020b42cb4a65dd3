//! Media cache
//!
//! Owns the download worker pool and the retention policy for cached files.
//!
//! - Preparations run as tasks on the runtime captured at construction, so
//!   they can be started from any thread (including synchronous playlist
//!   calls) and never run on the caller's critical path.
//! - A semaphore bounds how many resolve+download sequences run at once.
//! - Cache file names are the SHA-256 of the source reference, so entries
//!   with identical sources share one file.
//! - Concurrent fetches of one source share a single resolve+download; it is
//!   cancelled once no fetch is waiting on it.
//! - A player pins the source it is playing; pinned files are never deleted.

use crate::collaborators::{NoExternalReferences, ReferenceCheck, ResolvedMedia, Resolver};
use crate::config::EngineConfig;
use crate::entry::Entry;
use crate::error::PrepareError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Fetched = Result<(ResolvedMedia, PathBuf), PrepareError>;

/// One resolve+download shared by every fetch of the same source
struct Flight {
    outcome: watch::Receiver<Option<Fetched>>,
    cancel: CancellationToken,
}

impl Drop for Flight {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Download pool + retention policy for one engine instance
pub struct MediaCache {
    resolver: Arc<dyn Resolver>,
    cache_dir: PathBuf,
    permits: Arc<Semaphore>,
    pool_size: usize,
    keep_downloads: bool,
    references: Arc<dyn ReferenceCheck>,
    runtime: Handle,
    /// Source refs in use by a player, with pin counts
    pinned: Mutex<HashMap<String, usize>>,
    /// In-flight downloads by source ref
    flights: Mutex<HashMap<String, Weak<Flight>>>,
    /// Resolve+download sequences started (diagnostics)
    fetches_started: AtomicU64,
}

impl MediaCache {
    /// Create the cache for `resolver` using `config`'s cache settings
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; the runtime handle is
    /// captured here so preparations can be spawned from synchronous code.
    pub fn new(resolver: Arc<dyn Resolver>, config: &EngineConfig) -> Self {
        let pool_size = config.max_concurrent_downloads.max(1);
        info!(
            "Media cache at {} ({} download workers, keep_downloads={})",
            config.cache_dir.display(),
            pool_size,
            config.keep_downloads
        );

        Self {
            resolver,
            cache_dir: config.cache_dir.clone(),
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            keep_downloads: config.keep_downloads,
            references: Arc::new(NoExternalReferences),
            runtime: Handle::current(),
            pinned: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            fetches_started: AtomicU64::new(0),
        }
    }

    /// Install the host's cross-session reference check
    pub fn with_reference_check(mut self, references: Arc<dyn ReferenceCheck>) -> Self {
        self.references = references;
        self
    }

    /// Folder files are cached in
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Width of the download worker pool
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of resolve+download sequences started so far
    pub fn fetches_started(&self) -> u64 {
        self.fetches_started.load(Ordering::Relaxed)
    }

    /// Preferred cache path for `source_ref`
    pub fn destination_for(&self, source_ref: &str) -> PathBuf {
        let digest = Sha256::digest(source_ref.as_bytes());
        let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.cache_dir.join(name)
    }

    pub(crate) fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(task)
    }

    /// Resolve and download `entry`'s source
    ///
    /// Joins the download already running for the same source, if any.
    /// Callers cancel by dropping the future; the shared download stops once
    /// its last waiter is gone.
    pub(crate) async fn fetch(self: &Arc<Self>, entry: &Entry) -> Result<PathBuf, PrepareError> {
        let flight = self.join_flight(entry.source_ref());
        let mut outcome = flight.outcome.clone();
        let settled = match outcome.wait_for(Option::is_some).await {
            Ok(settled) => (*settled).clone(),
            Err(_) => None,
        };

        let (media, path) = settled.unwrap_or(Err(PrepareError::Cancelled))?;
        entry.apply_metadata(&media);
        debug!(
            "Downloaded '{}' to {} ({})",
            media.title,
            path.display(),
            entry.id()
        );
        Ok(path)
    }

    fn join_flight(self: &Arc<Self>, source_ref: &str) -> Arc<Flight> {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = flights.get(source_ref).and_then(Weak::upgrade) {
            let pending = flight.outcome.borrow().is_none();
            if pending {
                debug!("Joining in-flight download of {}", source_ref);
                return flight;
            }
        }

        let (sender, outcome) = watch::channel(None);
        let cancel = CancellationToken::new();
        let flight = Arc::new(Flight {
            outcome,
            cancel: cancel.clone(),
        });
        let weak = Arc::downgrade(&flight);
        flights.insert(source_ref.to_string(), weak.clone());
        drop(flights);

        let cache = Arc::clone(self);
        let source_ref = source_ref.to_string();
        self.runtime.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PrepareError::Cancelled),
                result = cache.resolve_and_download(&source_ref) => result,
            };
            sender.send_replace(Some(result));

            let mut flights = cache.flights.lock().unwrap_or_else(PoisonError::into_inner);
            if flights.get(&source_ref).is_some_and(|w| w.ptr_eq(&weak)) {
                flights.remove(&source_ref);
            }
        });

        flight
    }

    /// Waits for a worker slot first
    async fn resolve_and_download(&self, source_ref: &str) -> Fetched {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PrepareError::Download("download pool closed".to_string()))?;

        self.fetches_started.fetch_add(1, Ordering::Relaxed);
        debug!("Resolving {}", source_ref);

        let media = self.resolver.resolve(source_ref).await?;

        tokio::fs::create_dir_all(&self.cache_dir).await.map_err(|e| {
            PrepareError::Download(format!(
                "cannot create cache dir {}: {}",
                self.cache_dir.display(),
                e
            ))
        })?;

        let hint = self.destination_for(source_ref);
        let path = self
            .resolver
            .download(&media.locator, &hint)
            .await
            .map_err(|e| PrepareError::Download(format!("{:#}", e)))?;
        Ok((media, path))
    }

    /// Retire an entry that left its playlist for good
    ///
    /// Deletes the backing file unless downloads are kept or the reference
    /// check says another live entry still needs it. Callers check their own
    /// playlist for duplicates before calling this.
    pub fn retire(&self, entry: &Entry) {
        entry.cancel_preparation();

        if self.keep_downloads {
            debug!("Keeping download for retired entry {}", entry.id());
            return;
        }
        if self.is_pinned(entry.source_ref()) {
            debug!("Backing file of {} is playing, not deleting", entry.id());
            return;
        }
        if self.references.is_referenced_elsewhere(entry) {
            debug!(
                "Backing file of {} referenced elsewhere, not deleting",
                entry.id()
            );
            return;
        }

        if let Some(path) = entry.release_local_path() {
            self.remove_file(path);
        }
    }

    /// Protect `source_ref`'s file from retirement until the pin drops
    pub(crate) fn pin(self: &Arc<Self>, source_ref: &str) -> CachePin {
        let mut pinned = self.pinned.lock().unwrap_or_else(PoisonError::into_inner);
        *pinned.entry(source_ref.to_string()).or_insert(0) += 1;
        CachePin {
            cache: Arc::clone(self),
            source_ref: source_ref.to_string(),
        }
    }

    pub fn is_pinned(&self, source_ref: &str) -> bool {
        self.pinned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(source_ref)
    }

    /// Delete a cached file in the background
    pub(crate) fn remove_file(&self, path: PathBuf) {
        self.runtime.spawn(async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Deleted cached file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to delete cached file {}: {}", path.display(), e),
            }
        });
    }
}

/// Keeps a source's cached file alive while held
pub(crate) struct CachePin {
    cache: Arc<MediaCache>,
    source_ref: String,
}

impl Drop for CachePin {
    fn drop(&mut self) {
        let mut pinned = self
            .cache
            .pinned
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = pinned.get_mut(&self.source_ref) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&self.source_ref);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ResolveError, ResolvedMedia};
    use async_trait::async_trait;

    struct FixedResolver;

    #[async_trait]
    impl Resolver for FixedResolver {
        async fn resolve(&self, source_ref: &str) -> Result<ResolvedMedia, ResolveError> {
            if source_ref.starts_with("missing") {
                return Err(ResolveError::NotFound(source_ref.to_string()));
            }
            Ok(ResolvedMedia {
                title: format!("Title of {}", source_ref),
                duration_seconds: Some(42.0),
                locator: source_ref.to_string(),
            })
        }

        async fn download(&self, locator: &str, hint: &Path) -> anyhow::Result<PathBuf> {
            tokio::fs::write(hint, locator.as_bytes()).await?;
            Ok(hint.to_path_buf())
        }
    }

    /// Resolver whose downloads wait for `gate` and count themselves
    #[derive(Default)]
    struct SlowResolver {
        downloads: std::sync::atomic::AtomicUsize,
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl Resolver for SlowResolver {
        async fn resolve(&self, source_ref: &str) -> Result<ResolvedMedia, ResolveError> {
            FixedResolver.resolve(source_ref).await
        }

        async fn download(&self, locator: &str, hint: &Path) -> anyhow::Result<PathBuf> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            tokio::fs::write(hint, locator.as_bytes()).await?;
            Ok(hint.to_path_buf())
        }
    }

    async fn wait_for_downloads(resolver: &SlowResolver, n: usize) {
        for _ in 0..200 {
            if resolver.downloads.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("download never started");
    }

    fn test_cache(dir: &tempfile::TempDir, keep: bool) -> MediaCache {
        let config = EngineConfig {
            cache_dir: dir.path().join("cache"),
            keep_downloads: keep,
            ..Default::default()
        };
        MediaCache::new(Arc::new(FixedResolver), &config)
    }

    #[tokio::test]
    async fn test_destination_is_stable_per_source() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, false);

        let a = cache.destination_for("https://example.com/a");
        let b = cache.destination_for("https://example.com/b");
        assert_eq!(a, cache.destination_for("https://example.com/a"));
        assert_ne!(a, b);
        assert!(a.starts_with(cache.cache_dir()));
        assert_eq!(a.file_name().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_fetch_applies_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(test_cache(&dir, false));
        let entry = Entry::new("track-1", None);

        let path = cache.fetch(&entry).await.unwrap();
        assert!(path.exists());
        assert_eq!(entry.title(), "Title of track-1");
        assert_eq!(entry.duration_seconds(), Some(42.0));
        assert_eq!(cache.fetches_started(), 1);
    }

    #[tokio::test]
    async fn test_fetch_maps_resolver_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(test_cache(&dir, false));
        let entry = Entry::new("missing-track", None);

        let err = cache.fetch(&entry).await.unwrap_err();
        assert!(matches!(err, PrepareError::Resolution(ResolveError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_same_source_shares_one_download() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Arc::new(SlowResolver::default());
        let config = EngineConfig {
            cache_dir: dir.path().join("cache"),
            ..Default::default()
        };
        let cache = Arc::new(MediaCache::new(resolver.clone(), &config));
        let first = Entry::new("shared", None);
        let second = Entry::new("shared", None);

        let a = first.request_prepare(&cache);
        let b = second.request_prepare(&cache);
        wait_for_downloads(&resolver, 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        resolver.gate.notify_waiters();

        let (a, b) = tokio::join!(a.wait(), b.wait());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.local_path(), b.local_path());
        assert!(a.local_path().unwrap().exists());
        assert_eq!(b.title(), "Title of shared");
        assert_eq!(resolver.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.fetches_started(), 1);
    }

    #[tokio::test]
    async fn test_shared_download_survives_one_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Arc::new(SlowResolver::default());
        let config = EngineConfig {
            cache_dir: dir.path().join("cache"),
            ..Default::default()
        };
        let cache = Arc::new(MediaCache::new(resolver.clone(), &config));
        let first = Entry::new("shared", None);
        let second = Entry::new("shared", None);

        let a = first.request_prepare(&cache);
        let b = second.request_prepare(&cache);
        wait_for_downloads(&resolver, 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(a.cancel());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        resolver.gate.notify_waiters();

        assert_eq!(a.wait().await.unwrap_err(), PrepareError::Cancelled);
        assert!(b.wait().await.unwrap().local_path().unwrap().exists());
        assert_eq!(resolver.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retire_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(test_cache(&dir, false));
        let entry = Entry::new("track-2", None);

        let ready = entry.request_prepare(&cache).wait().await.unwrap();
        let path = ready.local_path().unwrap();
        assert!(path.exists());

        cache.retire(&entry);
        assert!(!entry.is_cached());
        assert!(entry.local_path().is_none());

        for _ in 0..50 {
            if !path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_retire_keeps_file_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(test_cache(&dir, true));
        let entry = Entry::new("track-3", None);

        entry.request_prepare(&cache).wait().await.unwrap();
        cache.retire(&entry);

        assert!(entry.is_cached());
        assert!(entry.local_path().unwrap().exists());
    }

    #[tokio::test]
    async fn test_pinned_source_survives_retire() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(test_cache(&dir, false));
        let entry = Entry::new("track-5", None);

        entry.request_prepare(&cache).wait().await.unwrap();
        let pin = cache.pin("track-5");
        let second = cache.pin("track-5");
        drop(second);
        cache.retire(&entry);
        assert!(entry.is_cached());

        drop(pin);
        assert!(!cache.is_pinned("track-5"));
        cache.retire(&entry);
        assert!(!entry.is_cached());
    }

    #[tokio::test]
    async fn test_retire_respects_reference_check() {
        struct AlwaysReferenced;
        impl ReferenceCheck for AlwaysReferenced {
            fn is_referenced_elsewhere(&self, _entry: &Entry) -> bool {
                true
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let cache =
            Arc::new(test_cache(&dir, false).with_reference_check(Arc::new(AlwaysReferenced)));
        let entry = Entry::new("track-4", None);

        entry.request_prepare(&cache).wait().await.unwrap();
        cache.retire(&entry);
        assert!(entry.local_path().unwrap().exists());
    }
}

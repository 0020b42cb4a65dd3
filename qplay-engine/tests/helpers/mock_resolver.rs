//! Scripted resolver

use async_trait::async_trait;
use qplay_engine::collaborators::{ResolveError, ResolvedMedia, Resolver};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Outcome scripted for one source reference
#[derive(Debug, Clone)]
pub enum Script {
    Ok {
        title: String,
        duration_seconds: Option<f64>,
    },
    ResolveFails(ResolveError),
    DownloadFails(String),
}

/// Resolver with per-source outcomes and optional download gates
///
/// Unscripted sources resolve with their own name as title and an unknown
/// duration.
#[derive(Default)]
pub struct MockResolver {
    scripts: Mutex<HashMap<String, Script>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    resolves: Mutex<HashMap<String, usize>>,
    downloads: Mutex<HashMap<String, usize>>,
    total_downloads: AtomicUsize,
}

impl MockResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, source: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(source.to_string(), script);
    }

    /// Script a successful source with a known duration
    pub fn track(&self, source: &str, duration_seconds: f64) {
        self.script(
            source,
            Script::Ok {
                title: format!("Track {}", source),
                duration_seconds: Some(duration_seconds),
            },
        );
    }

    /// Block downloads of `source` until [`MockResolver::release`]
    pub fn hold(&self, source: &str) {
        self.gates
            .lock()
            .unwrap()
            .insert(source.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, source: &str) {
        if let Some(gate) = self.gates.lock().unwrap().get(source) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Resolve calls made for `source`
    pub fn resolves_of(&self, source: &str) -> usize {
        self.resolves
            .lock()
            .unwrap()
            .get(source)
            .copied()
            .unwrap_or(0)
    }

    /// Downloads started for `source`
    pub fn downloads_of(&self, source: &str) -> usize {
        self.downloads
            .lock()
            .unwrap()
            .get(source)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_downloads(&self) -> usize {
        self.total_downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for MockResolver {
    async fn resolve(&self, source_ref: &str) -> Result<ResolvedMedia, ResolveError> {
        *self
            .resolves
            .lock()
            .unwrap()
            .entry(source_ref.to_string())
            .or_insert(0) += 1;

        let script = self.scripts.lock().unwrap().get(source_ref).cloned();
        match script {
            Some(Script::ResolveFails(err)) => Err(err),
            Some(Script::Ok {
                title,
                duration_seconds,
            }) => Ok(ResolvedMedia {
                title,
                duration_seconds,
                locator: source_ref.to_string(),
            }),
            Some(Script::DownloadFails(_)) | None => Ok(ResolvedMedia {
                title: source_ref.to_string(),
                duration_seconds: None,
                locator: source_ref.to_string(),
            }),
        }
    }

    async fn download(&self, locator: &str, destination_hint: &Path) -> anyhow::Result<PathBuf> {
        *self
            .downloads
            .lock()
            .unwrap()
            .entry(locator.to_string())
            .or_insert(0) += 1;
        self.total_downloads.fetch_add(1, Ordering::SeqCst);

        let gate = self.gates.lock().unwrap().get(locator).cloned();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }

        let script = self.scripts.lock().unwrap().get(locator).cloned();
        if let Some(Script::DownloadFails(message)) = script {
            anyhow::bail!("{}", message);
        }

        tokio::fs::write(destination_hint, locator.as_bytes()).await?;
        Ok(destination_hint.to_path_buf())
    }
}

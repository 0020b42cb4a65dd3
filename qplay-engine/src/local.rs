//! Local collaborators used by the `qplay` binary
//!
//! - [`LocalFileResolver`]: source references are file paths; downloading
//!   copies the file into the cache
//! - [`ClockSink`]: headless voice sink that "plays" by letting a clock run
//!   for the entry's length and then reports completion from its own thread

use crate::collaborators::{
    CompletionCallback, PlayRequest, ResolveError, ResolvedMedia, Resolver, SinkError, VoiceSink,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Length assumed for entries with neither a known duration nor a clip limit
pub const UNKNOWN_LENGTH: Duration = Duration::from_secs(180);

/// Resolver for files on the local filesystem
#[derive(Debug, Clone, Default)]
pub struct LocalFileResolver {
    /// Base for relative source references
    root: Option<PathBuf>,
}

impl LocalFileResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative references against `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn locate(&self, source_ref: &str) -> PathBuf {
        let path = PathBuf::from(source_ref);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        }
    }
}

#[async_trait]
impl Resolver for LocalFileResolver {
    async fn resolve(&self, source_ref: &str) -> Result<ResolvedMedia, ResolveError> {
        if source_ref.contains("://") {
            return Err(ResolveError::Unsupported(source_ref.to_string()));
        }

        let path = self.locate(source_ref);
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ResolveError::NotFound(path.display().to_string()),
            _ => ResolveError::Network(format!("{}: {}", path.display(), e)),
        })?;
        if !metadata.is_file() {
            return Err(ResolveError::Unsupported(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| source_ref.to_string());

        Ok(ResolvedMedia {
            title,
            duration_seconds: None,
            locator: path.to_string_lossy().into_owned(),
        })
    }

    async fn download(&self, locator: &str, destination_hint: &Path) -> anyhow::Result<PathBuf> {
        let source = Path::new(locator);
        let destination = match source.extension() {
            Some(ext) => destination_hint.with_extension(ext),
            None => destination_hint.to_path_buf(),
        };

        // Partial copies never sit at the final path; each copy gets its own
        let partial = destination.with_extension(format!("{}.part", Uuid::new_v4().simple()));
        tokio::fs::copy(source, &partial).await?;
        tokio::fs::rename(&partial, &destination).await?;

        debug!("Copied {} to {}", source.display(), destination.display());
        Ok(destination)
    }
}

enum Control {
    Pause,
    Resume,
    Stop,
}

#[derive(Debug)]
struct Clock {
    start_at: Duration,
    played: Duration,
    running_since: Option<Instant>,
}

impl Clock {
    fn elapsed(&self) -> Duration {
        self.played + self.running_since.map_or(Duration::ZERO, |t| t.elapsed())
    }

    fn pause(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.played += since.elapsed();
        }
    }

    fn resume(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }
}

struct Stream {
    control: mpsc::Sender<Control>,
    clock: Arc<Mutex<Clock>>,
}

/// Headless sink driven by wall-clock time
pub struct ClockSink {
    /// Upper bound on how long any entry plays
    clip: Option<Duration>,
    stream: Mutex<Option<Stream>>,
    volume: Mutex<f32>,
}

impl ClockSink {
    pub fn new(clip: Option<Duration>) -> Self {
        Self {
            clip,
            stream: Mutex::new(None),
            volume: Mutex::new(0.0),
        }
    }

    fn stream(&self) -> MutexGuard<'_, Option<Stream>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, control: Control) {
        if let Some(stream) = self.stream().as_ref() {
            let _ = stream.control.send(control);
        }
    }

    /// Volume of the last stream
    pub fn volume(&self) -> f32 {
        *self.volume.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn length_of(&self, request: &PlayRequest) -> Duration {
        let remaining = request
            .duration
            .map(|d| d.saturating_sub(request.start_at));
        match (remaining, self.clip) {
            (Some(remaining), Some(clip)) => remaining.min(clip),
            (Some(remaining), None) => remaining,
            (None, Some(clip)) => clip,
            (None, None) => UNKNOWN_LENGTH,
        }
    }
}

fn lock_clock(clock: &Mutex<Clock>) -> MutexGuard<'_, Clock> {
    clock.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_clock(
    length: Duration,
    clock: Arc<Mutex<Clock>>,
    control: mpsc::Receiver<Control>,
    on_complete: CompletionCallback,
) {
    loop {
        let (running, remaining) = {
            let clock = lock_clock(&clock);
            (clock.running_since.is_some(), length.saturating_sub(clock.elapsed()))
        };

        let received = if running {
            if remaining.is_zero() {
                break;
            }
            match control.recv_timeout(remaining) {
                Ok(c) => c,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match control.recv() {
                Ok(c) => c,
                Err(_) => break,
            }
        };

        match received {
            Control::Pause => lock_clock(&clock).pause(),
            Control::Resume => lock_clock(&clock).resume(),
            Control::Stop => break,
        }
    }

    {
        let mut clock = lock_clock(&clock);
        clock.pause();
        clock.played = clock.played.min(length);
    }
    on_complete(None);
}

impl VoiceSink for ClockSink {
    fn play(&self, request: PlayRequest, on_complete: CompletionCallback) -> Result<(), SinkError> {
        if !request.path.is_file() {
            return Err(SinkError(format!(
                "cannot open {}",
                request.path.display()
            )));
        }

        let length = self.length_of(&request);
        let clock = Arc::new(Mutex::new(Clock {
            start_at: request.start_at,
            played: Duration::ZERO,
            running_since: Some(Instant::now()),
        }));
        let (control, receiver) = mpsc::channel();

        let thread_clock = Arc::clone(&clock);
        thread::Builder::new()
            .name(format!("qplay-clock-{}", request.entry_id))
            .spawn(move || run_clock(length, thread_clock, receiver, on_complete))
            .map_err(|e| SinkError(format!("cannot start clock thread: {}", e)))?;

        *self.volume.lock().unwrap_or_else(PoisonError::into_inner) = request.volume;
        info!(
            "Clock sink playing {} for {:?} from {:?}",
            request.path.display(),
            length,
            request.start_at
        );

        if let Some(previous) = self.stream().replace(Stream { control, clock }) {
            let _ = previous.control.send(Control::Stop);
        }
        Ok(())
    }

    fn pause(&self) {
        self.send(Control::Pause);
    }

    fn resume(&self) {
        self.send(Control::Resume);
    }

    fn stop(&self) {
        self.send(Control::Stop);
    }

    fn set_volume(&self, volume: f32) {
        *self.volume.lock().unwrap_or_else(PoisonError::into_inner) = volume;
        debug!("Clock sink volume {:.2}", volume);
    }

    fn progress(&self) -> Duration {
        match self.stream().as_ref() {
            Some(stream) => {
                let clock = lock_clock(&stream.clock);
                clock.start_at + clock.elapsed()
            }
            None => Duration::ZERO,
        }
    }
}

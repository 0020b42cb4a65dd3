//! Recording voice sink

use qplay_engine::collaborators::{CompletionCallback, PlayRequest, SinkError, VoiceSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Play(PlayRequest),
    Pause,
    Resume,
    Stop,
    SetVolume(f32),
}

/// Sink that never produces audio
///
/// The test decides when a stream ends ([`MockSink::finish`],
/// [`MockSink::fail`]); the completion callback is then invoked from a
/// freshly spawned OS thread, like a real audio backend would.
#[derive(Default)]
pub struct MockSink {
    calls: Mutex<Vec<SinkCall>>,
    pending: Mutex<Option<CompletionCallback>>,
    progress: Mutex<Duration>,
    refuse_next_play: AtomicBool,
}

impl MockSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn plays(&self) -> Vec<PlayRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Play(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn set_progress(&self, progress: Duration) {
        *self.progress.lock().unwrap() = progress;
    }

    /// Make the next `play` call fail synchronously
    pub fn refuse_next_play(&self) {
        self.refuse_next_play.store(true, Ordering::SeqCst);
    }

    /// True while a stream's completion is outstanding
    pub fn is_streaming(&self) -> bool {
        self.pending.lock().unwrap().is_some()
    }

    /// End the active stream naturally
    pub fn finish(&self) {
        self.complete(None);
    }

    /// Fail the active stream mid-way
    pub fn fail(&self, message: &str) {
        self.complete(Some(SinkError(message.to_string())));
    }

    fn complete(&self, error: Option<SinkError>) {
        let callback = self.pending.lock().unwrap().take();
        if let Some(callback) = callback {
            thread::spawn(move || callback(error)).join().unwrap();
        }
    }
}

impl VoiceSink for MockSink {
    fn play(&self, request: PlayRequest, on_complete: CompletionCallback) -> Result<(), SinkError> {
        if self.refuse_next_play.swap(false, Ordering::SeqCst) {
            return Err(SinkError("device unavailable".to_string()));
        }
        *self.progress.lock().unwrap() = request.start_at;
        self.calls.lock().unwrap().push(SinkCall::Play(request));
        *self.pending.lock().unwrap() = Some(on_complete);
        Ok(())
    }

    fn pause(&self) {
        self.calls.lock().unwrap().push(SinkCall::Pause);
    }

    fn resume(&self) {
        self.calls.lock().unwrap().push(SinkCall::Resume);
    }

    fn stop(&self) {
        self.calls.lock().unwrap().push(SinkCall::Stop);
        self.complete(None);
    }

    fn set_volume(&self, volume: f32) {
        self.calls.lock().unwrap().push(SinkCall::SetVolume(volume));
    }

    fn progress(&self) -> Duration {
        *self.progress.lock().unwrap()
    }
}

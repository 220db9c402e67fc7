//! Recognition session: the long-lived frame loop.
//!
//! The loop runs on a dedicated OS thread and owns the frame source and both
//! models. Control arrives as [`SessionCommand`]s over a channel; progress is
//! published through a `watch` channel of [`SessionStatus`].

use rollcall_core::alignment;
use rollcall_core::attendance::{AttendanceEvent, AttendanceSink};
use rollcall_core::tracker::{AttendanceTracker, Decision, TrackerPolicy};
use rollcall_core::{BoundingBox, CosineMatcher, EmbeddingExtractor, EmbeddingRecord, FaceDetector, MatchResult, Matcher};
use rollcall_hw::{open_with_retry, CameraError, FrameSource, RetryPolicy};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn session thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("session thread exited")]
    ChannelClosed,
    #[error("session thread panicked")]
    Panicked,
}

/// Loop tuning, usually derived from the daemon config.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Matcher distance threshold.
    pub rejection_threshold: f32,
    pub policy: TrackerPolicy,
    /// Classify every Nth frame.
    pub decimation: u32,
    /// Pause between frame reads.
    pub frame_interval: Duration,
    pub retry: RetryPolicy,
    /// Consecutive read failures before the source is reacquired.
    pub max_read_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rejection_threshold: 0.55,
            policy: TrackerPolicy::default(),
            decimation: 10,
            frame_interval: Duration::from_millis(30),
            retry: RetryPolicy::default(),
            max_read_failures: 5,
        }
    }
}

/// The collaborators a session owns.
pub struct SessionParts {
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn FaceDetector + Send>,
    pub extractor: Box<dyn EmbeddingExtractor + Send>,
    pub sink: Arc<dyn AttendanceSink>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Running,
    Paused,
    Failed(String),
    Stopped,
}

/// Snapshot of the session published after every frame.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    #[serde(flatten)]
    pub state: SessionState,
    pub gallery_size: usize,
    pub recognized: Option<String>,
    /// Milliseconds since `recognized` was last matched.
    pub seen_ago_ms: Option<u64>,
    pub events_logged: u64,
    /// Non-dark frames processed since start or the last resume.
    pub frames: u64,
    pub dark_frames: u64,
    pub last_faces: Vec<BoundingBox>,
    pub last_results: Vec<MatchResult>,
}

impl SessionStatus {
    fn new(gallery_size: usize) -> Self {
        Self {
            state: SessionState::Starting,
            gallery_size,
            recognized: None,
            seen_ago_ms: None,
            events_logged: 0,
            frames: 0,
            dark_frames: 0,
            last_faces: Vec::new(),
            last_results: Vec::new(),
        }
    }
}

enum SessionCommand {
    Pause,
    Resume,
    Reload(Arc<Vec<EmbeddingRecord>>),
    Stop,
}

/// Clone-safe handle to the session thread.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) -> Result<(), EngineError> {
        self.tx.send(command).map_err(|_| EngineError::ChannelClosed)
    }

    /// Release the frame source and idle until resumed.
    pub fn pause(&self) -> Result<(), EngineError> {
        self.send(SessionCommand::Pause)
    }

    /// Reacquire the frame source and reset per-session counters.
    pub fn resume(&self) -> Result<(), EngineError> {
        self.send(SessionCommand::Resume)
    }

    /// Swap in a new gallery between two frames.
    pub fn reload(&self, gallery: Vec<EmbeddingRecord>) -> Result<(), EngineError> {
        self.send(SessionCommand::Reload(Arc::new(gallery)))
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Stop the loop and wait until the frame source has been released.
    /// Blocks; call from a blocking context.
    pub fn stop(&self) -> Result<(), EngineError> {
        let _ = self.tx.send(SessionCommand::Stop);
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match worker {
            Some(handle) => handle.join().map_err(|_| EngineError::Panicked),
            None => Ok(()),
        }
    }
}

/// Spawn a recognition session on a dedicated OS thread.
///
/// The frame source is opened here, with retry, so that an unavailable camera
/// fails the call instead of a background thread.
pub fn spawn_session(
    mut parts: SessionParts,
    gallery: Vec<EmbeddingRecord>,
    config: SessionConfig,
) -> Result<SessionHandle, EngineError> {
    open_with_retry(parts.source.as_mut(), &config.retry)?;
    tracing::info!(
        source = %parts.source.describe(),
        gallery = gallery.len(),
        decimation = config.decimation,
        "frame source acquired"
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SessionStatus::new(gallery.len()));

    let worker = SessionWorker {
        tracker: AttendanceTracker::new(config.policy.clone()),
        parts,
        gallery: Arc::new(gallery),
        matcher: CosineMatcher,
        config,
        commands: rx,
        status: status_tx,
        frame_count: 0,
        read_failures: 0,
    };

    let handle = std::thread::Builder::new()
        .name("rollcall-session".into())
        .spawn(move || worker.run())
        .map_err(EngineError::Spawn)?;

    Ok(SessionHandle {
        tx,
        status: status_rx,
        worker: Arc::new(Mutex::new(Some(handle))),
    })
}

enum Flow {
    Continue,
    Stop,
}

struct SessionWorker {
    parts: SessionParts,
    gallery: Arc<Vec<EmbeddingRecord>>,
    matcher: CosineMatcher,
    tracker: AttendanceTracker,
    config: SessionConfig,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    status: watch::Sender<SessionStatus>,
    /// Frames processed since start or the last resume; drives decimation.
    frame_count: u64,
    read_failures: u32,
}

impl SessionWorker {
    fn run(mut self) {
        tracing::info!("session thread started");
        self.status.send_modify(|s| s.state = SessionState::Running);

        let outcome = loop {
            if let Flow::Stop = self.poll_commands() {
                break Ok(());
            }
            if let Err(e) = self.step() {
                break Err(e);
            }
            std::thread::sleep(self.config.frame_interval);
        };

        self.parts.source.close();
        let state = match outcome {
            Ok(()) => SessionState::Stopped,
            Err(e) => {
                tracing::error!(error = %e, "session failed");
                SessionState::Failed(e.to_string())
            }
        };
        self.status.send_modify(|s| {
            s.state = state;
            s.recognized = None;
            s.seen_ago_ms = None;
        });
        tracing::info!("session thread exiting");
    }

    /// Apply pending commands without blocking.
    fn poll_commands(&mut self) -> Flow {
        loop {
            match self.commands.try_recv() {
                Ok(SessionCommand::Pause) => return self.paused(),
                Ok(SessionCommand::Resume) => {}
                Ok(SessionCommand::Reload(gallery)) => self.swap_gallery(gallery),
                Ok(SessionCommand::Stop) | Err(TryRecvError::Disconnected) => return Flow::Stop,
                Err(TryRecvError::Empty) => return Flow::Continue,
            }
        }
    }

    /// Release the source and block until resumed or stopped.
    fn paused(&mut self) -> Flow {
        self.parts.source.close();
        self.status.send_modify(|s| s.state = SessionState::Paused);
        tracing::info!("session paused");

        while let Some(command) = self.commands.blocking_recv() {
            match command {
                SessionCommand::Pause => {}
                SessionCommand::Reload(gallery) => self.swap_gallery(gallery),
                SessionCommand::Stop => return Flow::Stop,
                SessionCommand::Resume => {
                    if let Err(e) = open_with_retry(self.parts.source.as_mut(), &self.config.retry) {
                        self.status.send_modify(|s| s.state = SessionState::Failed(e.to_string()));
                        tracing::error!(error = %e, "could not reacquire frame source on resume");
                        // Stay paused; a later resume may succeed.
                        continue;
                    }
                    self.read_failures = 0;
                    self.frame_count = 0;
                    self.status.send_modify(|s| {
                        s.state = SessionState::Running;
                        s.frames = 0;
                        s.last_faces.clear();
                        s.last_results.clear();
                    });
                    tracing::info!("session resumed");
                    return Flow::Continue;
                }
            }
        }
        Flow::Stop
    }

    fn swap_gallery(&mut self, gallery: Arc<Vec<EmbeddingRecord>>) {
        tracing::info!(records = gallery.len(), "gallery reloaded");
        self.status.send_modify(|s| s.gallery_size = gallery.len());
        self.gallery = gallery;
    }

    /// Process one frame. Errors are fatal to the session.
    fn step(&mut self) -> Result<(), EngineError> {
        let frame = match self.parts.source.next_frame() {
            Ok(frame) => {
                self.read_failures = 0;
                frame
            }
            Err(e) => {
                self.read_failures += 1;
                tracing::warn!(error = %e, failures = self.read_failures, "frame read failed");
                if self.read_failures >= self.config.max_read_failures {
                    self.reacquire()?;
                }
                return Ok(());
            }
        };

        if frame.is_dark {
            tracing::trace!(seq = frame.sequence, "skipping dark frame");
            self.status.send_modify(|s| s.dark_frames += 1);
            return Ok(());
        }

        let now = frame.timestamp;
        let image = match frame.into_image() {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(error = %e, "malformed frame");
                return Ok(());
            }
        };

        let faces = match self.parts.detector.detect(&image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed");
                return Ok(());
            }
        };

        if self.tracker.observe_faces(faces.len(), now) {
            tracing::info!("subject left the frame");
        }

        let classify = self.frame_count % u64::from(self.config.decimation.max(1)) == 0;
        self.frame_count += 1;
        let results = if classify && !faces.is_empty() {
            Some(self.classify_faces(&image, &faces, now))
        } else {
            None
        };

        let recognized = self.tracker.current().map(str::to_string);
        let seen_ago_ms = self
            .tracker
            .last_seen()
            .map(|seen| now.saturating_duration_since(seen).as_millis() as u64);
        let frames = self.frame_count;
        self.status.send_modify(|s| {
            s.frames = frames;
            s.recognized = recognized;
            s.seen_ago_ms = seen_ago_ms;
            s.last_faces = faces;
            if let Some(results) = results {
                s.last_results = results;
            }
        });
        Ok(())
    }

    fn classify_faces(&mut self, image: &image::GrayImage, faces: &[BoundingBox], now: Instant) -> Vec<MatchResult> {
        let mut results = Vec::with_capacity(faces.len());
        for face in faces {
            let Some(chip) = alignment::face_chip(image, face) else {
                continue;
            };
            let embedding = match self.parts.extractor.extract(&chip, false) {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::debug!(error = %e, "embedding failed for face");
                    continue;
                }
            };
            let result = self
                .matcher
                .classify(&embedding, &self.gallery, self.config.rejection_threshold);
            tracing::debug!(identity = result.label(), confidence = result.confidence, "classified face");

            match self.tracker.observe_match(&result, now) {
                Decision::Log { identity, confidence } => self.emit(identity, confidence),
                Decision::Held { candidate } => {
                    tracing::debug!(%candidate, current = ?self.tracker.current(), "holding current identity")
                }
                Decision::CoolingDown | Decision::StillPresent | Decision::Rejected => {}
            }
            results.push(result);
        }
        results
    }

    fn emit(&mut self, identity: String, confidence: f32) {
        let event = AttendanceEvent::new(identity, confidence);
        tracing::info!(identity = %event.identity, confidence, "attendance logged");
        match self.parts.sink.log_event(&event) {
            Ok(()) => self.status.send_modify(|s| s.events_logged += 1),
            Err(e) => tracing::warn!(identity = %event.identity, error = %e, "attendance sink failed"),
        }
    }

    fn reacquire(&mut self) -> Result<(), EngineError> {
        tracing::warn!(source = %self.parts.source.describe(), "reacquiring frame source");
        self.parts.source.close();
        open_with_retry(self.parts.source.as_mut(), &self.config.retry)?;
        self.read_failures = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::attendance::AttendanceError;
    use rollcall_core::ExtractError;
    use rollcall_hw::Frame;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    const FACE: u8 = 200;
    const EMPTY: u8 = 100;
    const DARK: u8 = 0;

    /// Serves frames of a single gray level; the level can be changed mid-run.
    #[derive(Clone, Default)]
    struct Probe {
        open: Arc<AtomicBool>,
        opens: Arc<AtomicU32>,
        level: Arc<AtomicU32>,
        fail_reads: Arc<AtomicBool>,
        refuse_opens: Arc<AtomicBool>,
        detections: Arc<AtomicUsize>,
        extractions: Arc<AtomicUsize>,
    }

    struct FakeSource(Probe);

    impl FrameSource for FakeSource {
        fn open(&mut self) -> Result<(), CameraError> {
            self.0.opens.fetch_add(1, Ordering::SeqCst);
            if self.0.refuse_opens.load(Ordering::SeqCst) {
                return Err(CameraError::DeviceBusy);
            }
            self.0.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) {
            self.0.open.store(false, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.0.open.load(Ordering::SeqCst)
        }

        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            if !self.is_open() {
                return Err(CameraError::NotOpen);
            }
            if self.0.fail_reads.load(Ordering::SeqCst) {
                return Err(CameraError::CaptureFailed("unplugged".into()));
            }
            let level = self.0.level.load(Ordering::SeqCst) as u8;
            Ok(Frame::from_gray(vec![level; 64], 8, 8, 0))
        }
    }

    /// One face covering the frame whenever the frame is at `FACE` level.
    struct FakeDetector(Probe);

    impl FaceDetector for FakeDetector {
        fn detect(&mut self, image: &image::GrayImage) -> Result<Vec<BoundingBox>, ExtractError> {
            self.0.detections.fetch_add(1, Ordering::SeqCst);
            if image.get_pixel(0, 0).0[0] != FACE {
                return Ok(Vec::new());
            }
            Ok(vec![BoundingBox {
                x: 0.0,
                y: 0.0,
                width: image.width() as f32,
                height: image.height() as f32,
                confidence: 0.99,
                landmarks: None,
            }])
        }
    }

    /// Every face embeds to the same vector.
    struct FixedExtractor(Vec<f32>, Probe);

    impl EmbeddingExtractor for FixedExtractor {
        fn extract(&mut self, _image: &image::GrayImage, _detect: bool) -> Result<Vec<f32>, ExtractError> {
            self.1.extractions.fetch_add(1, Ordering::SeqCst);
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<AttendanceEvent>>,
        fail: bool,
    }

    impl AttendanceSink for RecordingSink {
        fn log_event(&self, event: &AttendanceEvent) -> Result<(), AttendanceError> {
            if self.fail {
                return Err(AttendanceError::Poisoned);
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    impl RecordingSink {
        fn identities(&self) -> Vec<String> {
            self.events.lock().unwrap().iter().map(|e| e.identity.clone()).collect()
        }
    }

    fn gallery() -> Vec<EmbeddingRecord> {
        vec![
            EmbeddingRecord::new("Bob", vec![1.0, 0.0]),
            EmbeddingRecord::new("Alice", vec![0.0, 1.0]),
        ]
    }

    fn quick_config() -> SessionConfig {
        SessionConfig {
            decimation: 2,
            frame_interval: Duration::from_millis(1),
            retry: RetryPolicy {
                attempts: 2,
                backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
            },
            max_read_failures: 3,
            policy: TrackerPolicy {
                cooldown: Duration::from_secs(60),
                ..TrackerPolicy::default()
            },
            ..SessionConfig::default()
        }
    }

    fn start(
        probe: &Probe,
        sink: Arc<RecordingSink>,
        gallery: Vec<EmbeddingRecord>,
        config: SessionConfig,
    ) -> Result<SessionHandle, EngineError> {
        let parts = SessionParts {
            source: Box::new(FakeSource(probe.clone())),
            detector: Box::new(FakeDetector(probe.clone())),
            extractor: Box::new(FixedExtractor(vec![1.0, 0.0], probe.clone())),
            sink,
        };
        spawn_session(parts, gallery, config)
    }

    fn wait_for(handle: &SessionHandle, what: &str, pred: impl Fn(&SessionStatus) -> bool) -> SessionStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = handle.status();
            if pred(&status) {
                return status;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {what}: {status:?}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn probe_at(level: u8) -> Probe {
        let probe = Probe::default();
        probe.level.store(level as u32, Ordering::SeqCst);
        probe
    }

    #[test]
    fn test_continuous_presence_logs_once() {
        let probe = probe_at(FACE);
        let sink = Arc::new(RecordingSink::default());
        let handle = start(&probe, sink.clone(), gallery(), quick_config()).unwrap();

        let status = wait_for(&handle, "frames", |s| s.frames >= 30);
        assert_eq!(status.recognized.as_deref(), Some("Bob"));
        assert!(status.seen_ago_ms.is_some());
        assert_eq!(status.last_faces.len(), 1);
        assert_eq!(status.last_results[0].label(), "Bob");
        handle.stop().unwrap();

        assert_eq!(sink.identities(), vec!["Bob".to_string()]);
        assert_eq!(handle.status().events_logged, 1);
    }

    #[test]
    fn test_empty_gallery_logs_nothing_until_reload() {
        let probe = probe_at(FACE);
        let sink = Arc::new(RecordingSink::default());
        let handle = start(&probe, sink.clone(), Vec::new(), quick_config()).unwrap();

        let status = wait_for(&handle, "frames", |s| s.frames >= 10);
        assert!(status.recognized.is_none());
        assert_eq!(status.last_results[0].label(), "Unknown");
        assert!(sink.identities().is_empty());

        handle.reload(gallery()).unwrap();
        wait_for(&handle, "event after reload", |s| s.events_logged == 1);
        assert_eq!(handle.status().gallery_size, 2);
        handle.stop().unwrap();
    }

    #[test]
    fn test_pause_releases_source_and_resume_resets_counters() {
        let probe = probe_at(FACE);
        let sink = Arc::new(RecordingSink::default());
        let handle = start(&probe, sink.clone(), gallery(), quick_config()).unwrap();
        wait_for(&handle, "frames", |s| s.frames >= 10);

        handle.pause().unwrap();
        wait_for(&handle, "paused", |s| s.state == SessionState::Paused);
        assert!(!probe.open.load(Ordering::SeqCst));
        let frames_while_paused = probe.detections.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(probe.detections.load(Ordering::SeqCst), frames_while_paused);

        handle.resume().unwrap();
        wait_for(&handle, "running", |s| s.state == SessionState::Running);
        assert!(probe.open.load(Ordering::SeqCst));
        assert_eq!(probe.opens.load(Ordering::SeqCst), 2);

        wait_for(&handle, "frames after resume", |s| s.frames >= 10);
        handle.stop().unwrap();
        // Cooldown survives the pause: still a single event.
        assert_eq!(sink.identities().len(), 1);
    }

    fn counts(probe: &Probe) -> (usize, usize) {
        (
            probe.detections.load(Ordering::SeqCst),
            probe.extractions.load(Ordering::SeqCst),
        )
    }

    #[test]
    fn test_detects_every_frame_and_classifies_every_nth() {
        let probe = probe_at(FACE);
        let config = SessionConfig {
            decimation: 3,
            ..quick_config()
        };
        let handle = start(&probe, Arc::new(RecordingSink::default()), gallery(), config).unwrap();
        wait_for(&handle, "frames", |s| s.frames >= 10);

        // Paused, the loop is idle and the counters are final.
        handle.pause().unwrap();
        let status = wait_for(&handle, "paused", |s| s.state == SessionState::Paused);
        let frames = status.frames as usize;
        let (detections, extractions) = counts(&probe);
        assert_eq!(detections, frames);
        assert_eq!(extractions, frames.div_ceil(3));
        handle.stop().unwrap();
    }

    #[test]
    fn test_first_frame_after_resume_is_classified() {
        let probe = probe_at(FACE);
        let config = SessionConfig {
            decimation: 1_000,
            ..quick_config()
        };
        let handle = start(&probe, Arc::new(RecordingSink::default()), gallery(), config).unwrap();
        wait_for(&handle, "frames", |s| s.frames >= 5);
        handle.pause().unwrap();
        wait_for(&handle, "paused", |s| s.state == SessionState::Paused);
        let (detections, extractions) = counts(&probe);
        assert!(detections >= 5);
        assert_eq!(extractions, 1);

        handle.resume().unwrap();
        wait_for(&handle, "frames after resume", |s| s.state == SessionState::Running && s.frames >= 5);
        handle.pause().unwrap();
        wait_for(&handle, "paused again", |s| s.state == SessionState::Paused);
        let (_, extractions) = counts(&probe);
        assert_eq!(extractions, 2);
        handle.stop().unwrap();
    }

    #[test]
    fn test_stop_releases_source() {
        let probe = probe_at(EMPTY);
        let handle = start(&probe, Arc::new(RecordingSink::default()), gallery(), quick_config()).unwrap();
        wait_for(&handle, "frames", |s| s.frames >= 3);

        handle.stop().unwrap();
        assert!(!probe.open.load(Ordering::SeqCst));
        assert_eq!(handle.status().state, SessionState::Stopped);
        // Second stop is a no-op.
        handle.stop().unwrap();
        assert!(matches!(handle.pause(), Err(EngineError::ChannelClosed)));
    }

    #[test]
    fn test_spawn_fails_when_source_never_opens() {
        let probe = Probe::default();
        probe.refuse_opens.store(true, Ordering::SeqCst);

        let err = start(&probe, Arc::new(RecordingSink::default()), gallery(), quick_config()).unwrap_err();
        assert!(matches!(err, EngineError::Camera(CameraError::RetriesExhausted { attempts: 2, .. })));
        assert_eq!(probe.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_read_failures_reacquire_then_fail() {
        let probe = probe_at(EMPTY);
        let handle = start(&probe, Arc::new(RecordingSink::default()), gallery(), quick_config()).unwrap();
        wait_for(&handle, "frames", |s| s.frames >= 3);

        // Reads fail and the device cannot be reopened.
        probe.refuse_opens.store(true, Ordering::SeqCst);
        probe.fail_reads.store(true, Ordering::SeqCst);

        let status = wait_for(&handle, "failed", |s| matches!(s.state, SessionState::Failed(_)));
        assert!(matches!(status.state, SessionState::Failed(ref reason) if reason.contains("gave up")));
        assert!(!probe.open.load(Ordering::SeqCst));
        handle.stop().unwrap();
    }

    #[test]
    fn test_read_failures_recover_after_reacquire() {
        let probe = probe_at(EMPTY);
        let handle = start(&probe, Arc::new(RecordingSink::default()), gallery(), quick_config()).unwrap();
        wait_for(&handle, "frames", |s| s.frames >= 3);

        probe.fail_reads.store(true, Ordering::SeqCst);
        let opens_before = probe.opens.load(Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(5);
        while probe.opens.load(Ordering::SeqCst) == opens_before {
            assert!(Instant::now() < deadline, "source was never reacquired");
            std::thread::sleep(Duration::from_millis(2));
        }
        probe.fail_reads.store(false, Ordering::SeqCst);

        let frames = handle.status().frames;
        wait_for(&handle, "frames after recovery", |s| s.frames > frames + 3);
        assert_eq!(handle.status().state, SessionState::Running);
        handle.stop().unwrap();
    }

    #[test]
    fn test_dark_frames_are_not_processed() {
        let probe = probe_at(DARK);
        let handle = start(&probe, Arc::new(RecordingSink::default()), gallery(), quick_config()).unwrap();
        wait_for(&handle, "dark frames", |s| s.dark_frames >= 5);

        assert_eq!(probe.detections.load(Ordering::SeqCst), 0);
        assert_eq!(handle.status().frames, 0);
        handle.stop().unwrap();
    }

    #[test]
    fn test_sink_failure_does_not_stop_loop() {
        let probe = probe_at(FACE);
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let handle = start(&probe, sink, gallery(), quick_config()).unwrap();

        let status = wait_for(&handle, "frames", |s| s.frames >= 20);
        assert_eq!(status.state, SessionState::Running);
        assert_eq!(status.events_logged, 0);
        assert_eq!(status.recognized.as_deref(), Some("Bob"));
        handle.stop().unwrap();
    }

    #[test]
    fn test_leaving_frame_resets_after_cooldown() {
        let probe = probe_at(FACE);
        let sink = Arc::new(RecordingSink::default());
        let config = SessionConfig {
            policy: TrackerPolicy {
                cooldown: Duration::from_millis(50),
                ..TrackerPolicy::default()
            },
            ..quick_config()
        };
        let handle = start(&probe, sink.clone(), gallery(), config).unwrap();
        wait_for(&handle, "first event", |s| s.events_logged >= 1);

        probe.level.store(EMPTY as u32, Ordering::SeqCst);
        let away = wait_for(&handle, "waiting", |s| s.recognized.is_none());
        assert_eq!(away.seen_ago_ms, None);

        probe.level.store(FACE as u32, Ordering::SeqCst);
        wait_for(&handle, "event on return", |s| s.events_logged > away.events_logged);
        handle.stop().unwrap();

        let events = sink.events.lock().unwrap();
        assert!(events.iter().all(|e| e.identity == "Bob"));
        for pair in events.windows(2) {
            let gap = pair[1].timestamp - pair[0].timestamp;
            assert!(gap.num_milliseconds() >= 50, "events {gap} apart");
        }
    }

    #[test]
    fn test_status_serializes_state_tag() {
        let mut status = SessionStatus::new(3);
        status.state = SessionState::Failed("camera gone".into());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "camera gone");
        assert_eq!(json["gallery_size"], 3);
    }
}

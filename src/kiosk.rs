use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;

use crate::annotate::Annotator;
use crate::cache::{DetectionCache, SessionId};
use crate::detector::RegionDetector;
use crate::error::{DeviceError, KioskError};
use crate::frame::{largest_region, Frame, Region, DEFAULT_JPEG_QUALITY};
use crate::recognition::{Detection, RecognitionClient, RecognitionResult};
use crate::sink::PreviewSink;
use crate::source::FrameSource;

/// Consecutive empty reads after which the loop stops warning on every one.
const EMPTY_READ_WARN_EVERY: u64 = 30;

#[derive(Debug, Clone)]
pub struct KioskConfig {
    pub enable_recognition: bool,
    pub jpeg_quality: u8,
    /// Log loop statistics every this many frames.
    pub stats_interval: u64,
    /// Pause after the second and later consecutive empty reads, so a
    /// camera that went away does not spin the loop.
    pub empty_read_backoff: Duration,
}

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            enable_recognition: true,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            stats_interval: 30,
            empty_read_backoff: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KioskState {
    Idle,
    Capturing,
    Recognizing(SessionId),
    Annotating,
    Publishing,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    pub sequence: u64,
    pub recognition_dispatched: bool,
    pub captions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Published(FrameReport),
    /// Camera returned nothing this time.
    Empty,
    /// Frame was captured but could not be shown.
    Dropped { sequence: u64 },
    Shutdown,
}

/// Most recent raw capture, shared with the lookup endpoint.
#[derive(Clone, Default)]
pub struct LatestFrame(Arc<Mutex<Option<Frame>>>);

impl LatestFrame {
    pub fn store(&self, frame: Frame) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(frame);
    }

    pub fn load(&self) -> Option<Frame> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Holds the per-session in-flight flag until dropped.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn claim(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct LoopStats {
    frames: u64,
    empty_reads: u64,
    consecutive_empty: u64,
    recognitions: u64,
    busy: Duration,
}

/// Capture, recognize, annotate, publish.
///
/// Recognition runs on the tokio runtime and writes into the detection
/// cache when it completes; the loop itself only ever reads the cache, so a
/// slow recognition service never holds back the preview.
pub struct KioskLoop<S, R, P> {
    source: S,
    recognizer: Arc<R>,
    sink: P,
    detector: Option<Box<dyn RegionDetector>>,
    annotator: Annotator,
    cache: DetectionCache,
    session: SessionId,
    in_flight: Arc<AtomicBool>,
    runtime: Handle,
    latest: LatestFrame,
    config: KioskConfig,
    state: KioskState,
    failure: Option<DeviceError>,
    stats: LoopStats,
}

impl<S, R, P> KioskLoop<S, R, P>
where
    S: FrameSource,
    R: RecognitionClient,
    P: PreviewSink,
{
    pub fn new(
        source: S,
        recognizer: Arc<R>,
        sink: P,
        annotator: Annotator,
        runtime: Handle,
        config: KioskConfig,
    ) -> Self {
        let cache = DetectionCache::new();
        let session = SessionId::next();
        cache.open(session);
        Self {
            source,
            recognizer,
            sink,
            detector: None,
            annotator,
            cache,
            session,
            in_flight: Arc::new(AtomicBool::new(false)),
            runtime,
            latest: LatestFrame::default(),
            config,
            state: KioskState::Idle,
            failure: None,
            stats: LoopStats::default(),
        }
    }

    pub fn with_detector(mut self, detector: Box<dyn RegionDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Share raw captures through `latest` instead of a private slot.
    pub fn with_latest_frame(mut self, latest: LatestFrame) -> Self {
        self.latest = latest;
        self
    }

    pub fn state(&self) -> KioskState {
        self.state
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn cache(&self) -> &DetectionCache {
        &self.cache
    }

    pub fn sink(&self) -> &P {
        &self.sink
    }

    pub fn latest_frame(&self) -> LatestFrame {
        self.latest.clone()
    }

    pub fn recognition_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one capture to publish iteration.
    pub fn step(&mut self) -> StepOutcome {
        if self.state == KioskState::Shutdown {
            return StepOutcome::Shutdown;
        }
        let started = Instant::now();

        self.state = KioskState::Capturing;
        let frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                self.empty_read();
                return StepOutcome::Empty;
            }
            Err(err) => {
                tracing::error!("Camera failed: {}", err);
                self.failure = Some(err);
                self.shutdown();
                return StepOutcome::Shutdown;
            }
        };
        if self.stats.consecutive_empty > 0 {
            tracing::info!(
                "Camera recovered after {} empty reads",
                self.stats.consecutive_empty
            );
            self.stats.consecutive_empty = 0;
        }
        let sequence = frame.sequence();
        self.latest.store(frame.clone());

        let faces = self.detect_faces(&frame);
        let recognition_dispatched = self.dispatch_recognition(&frame, &faces);

        self.state = KioskState::Annotating;
        let detections = self.current_detections(&frame, &faces);
        let captions = self.annotator.captions(&detections);
        let annotated = self.annotator.annotate(&frame, &detections);

        self.state = KioskState::Publishing;
        if let Err(err) = self.sink.present(&annotated) {
            match err {
                KioskError::Encode(err) => {
                    tracing::warn!("Unable to encode frame {}: {}", sequence, err)
                }
                err => tracing::warn!("Unable to publish frame {}: {}", sequence, err),
            }
            return StepOutcome::Dropped { sequence };
        }

        self.record_stats(started.elapsed(), recognition_dispatched);
        StepOutcome::Published(FrameReport {
            sequence,
            recognition_dispatched,
            captions,
        })
    }

    /// Loop until `stop` is raised or the camera fails.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), KioskError> {
        tracing::info!(
            "Starting kiosk loop ({}, recognition {})",
            self.session,
            if self.config.enable_recognition {
                "on"
            } else {
                "off"
            }
        );
        while !stop.load(Ordering::Relaxed) {
            if self.step() == StepOutcome::Shutdown {
                break;
            }
        }
        self.shutdown();
        match self.failure.take() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Ends the session. A recognition call still running is abandoned and
    /// its result discarded.
    pub fn shutdown(&mut self) {
        if self.state != KioskState::Shutdown {
            tracing::info!("Kiosk loop {} shutting down", self.session);
        }
        self.state = KioskState::Shutdown;
        self.cache.close(self.session);
    }

    fn empty_read(&mut self) {
        self.stats.empty_reads += 1;
        self.stats.consecutive_empty += 1;
        let streak = self.stats.consecutive_empty;
        if streak == 1 || streak % EMPTY_READ_WARN_EVERY == 0 {
            tracing::warn!("Cannot read frame from camera ({} in a row)", streak);
        } else {
            tracing::trace!("Empty read {} in a row", streak);
        }
        if streak > 1 && !self.config.empty_read_backoff.is_zero() {
            std::thread::sleep(self.config.empty_read_backoff);
        }
    }

    pub fn consecutive_empty_reads(&self) -> u64 {
        self.stats.consecutive_empty
    }

    fn detect_faces(&mut self, frame: &Frame) -> Vec<Region> {
        let Some(detector) = self.detector.as_mut() else {
            return Vec::new();
        };
        match detector.detect(frame) {
            Ok(faces) => faces,
            Err(err) => {
                tracing::warn!("Face detection failed on frame {}: {}", frame.sequence(), err);
                Vec::new()
            }
        }
    }

    fn dispatch_recognition(&mut self, frame: &Frame, faces: &[Region]) -> bool {
        if !self.config.enable_recognition {
            return false;
        }
        // with a local detector only frames that contain a face are worth a round trip
        if self.detector.is_some() && faces.is_empty() {
            return false;
        }
        let Some(in_flight) = InFlight::claim(&self.in_flight) else {
            tracing::trace!("Recognition in flight, skipping frame {}", frame.sequence());
            return false;
        };
        let jpeg = match frame.encode_jpeg(self.config.jpeg_quality) {
            Ok(encoded) => encoded.jpeg,
            Err(err) => {
                tracing::warn!("Unable to encode frame {} for recognition: {}", frame.sequence(), err);
                return false;
            }
        };

        self.state = KioskState::Recognizing(self.session);
        let recognizer = self.recognizer.clone();
        let cache = self.cache.clone();
        let session = self.session;
        let issued_for = frame.sequence();
        self.runtime.spawn(async move {
            let _in_flight = in_flight;
            let detections = match recognizer.check(jpeg).await {
                Ok(detections) => detections,
                Err(err) => {
                    tracing::warn!("Unable to recognize face in frame {}: {}", issued_for, err);
                    Vec::new()
                }
            };
            let names: Vec<&str> = detections.iter().map(|d| d.name.as_str()).collect();
            tracing::debug!("Frame {} recognized as {:?}", issued_for, names);
            let result = RecognitionResult {
                issued_for,
                detections,
            };
            if !cache.update(session, result) {
                tracing::debug!("Discarding recognition for frame {} of ended {}", issued_for, session);
            }
        });
        true
    }

    /// The cached result is always shown; a detector that misses a face for
    /// a frame must not blank the caption. Local faces only place
    /// detections without a region and add unknown boxes.
    fn current_detections(&self, frame: &Frame, faces: &[Region]) -> Vec<Detection> {
        let mut detections: Vec<Detection> = self
            .cache
            .read(self.session)
            .filter(|result| result.issued_for <= frame.sequence())
            .map(|result| result.detections.clone())
            .unwrap_or_default();

        if let Some(largest) = largest_region(faces) {
            if let Some(unplaced) = detections.iter_mut().find(|d| d.region.is_none()) {
                unplaced.region = Some(largest);
            }
        }
        for face in faces {
            let covered = detections
                .iter()
                .any(|d| d.region.is_some_and(|region| region.overlaps(face)));
            if !covered {
                detections.push(Detection::unknown(*face));
            }
        }
        detections
    }

    fn record_stats(&mut self, elapsed: Duration, dispatched: bool) {
        let stats = &mut self.stats;
        stats.frames += 1;
        stats.busy += elapsed;
        if dispatched {
            stats.recognitions += 1;
        }
        if self.config.stats_interval > 0 && stats.frames % self.config.stats_interval == 0 {
            let avg_ms = stats.busy.as_secs_f64() * 1000.0 / stats.frames as f64;
            tracing::info!(
                "Frame {}: step={:.1}ms, recognitions={}, empty reads={}",
                stats.frames,
                avg_ms,
                stats.recognitions,
                stats.empty_reads
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecognitionError;
    use crate::label::LabelPolicy;
    use crate::sink::MemorySink;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    struct ScriptedSource {
        reads: VecDeque<Result<Option<Frame>, DeviceError>>,
    }

    impl ScriptedSource {
        fn frames(count: u64) -> Self {
            Self {
                reads: (1..=count)
                    .map(|sequence| Ok(Some(Frame::filled(48, 32, sequence, [40, 40, 40]))))
                    .collect(),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, DeviceError> {
            self.reads
                .pop_front()
                .unwrap_or_else(|| Err(DeviceError::Unavailable("script finished".to_owned())))
        }

        fn resolution(&self) -> (u32, u32) {
            (48, 32)
        }
    }

    /// Recognizer whose calls block until the test releases them.
    struct GatedRecognizer {
        gate: Semaphore,
        reply: Vec<Detection>,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl GatedRecognizer {
        fn new(reply: Vec<Detection>) -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                reply,
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            })
        }

        fn release(&self) {
            self.gate.add_permits(1);
        }
    }

    impl RecognitionClient for GatedRecognizer {
        async fn check(&self, jpeg: Bytes) -> Result<Vec<Detection>, RecognitionError> {
            assert!(!jpeg.is_empty());
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            let permit = self.gate.acquire().await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            permit
                .map_err(|_| RecognitionError::Unavailable("gate closed".to_owned()))?
                .forget();
            Ok(self.reply.clone())
        }
    }

    struct FailingRecognizer;

    impl RecognitionClient for FailingRecognizer {
        async fn check(&self, _jpeg: Bytes) -> Result<Vec<Detection>, RecognitionError> {
            Err(RecognitionError::Timeout)
        }
    }

    struct FixedDetector(Vec<Region>);

    impl RegionDetector for FixedDetector {
        fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<Region>> {
            Ok(self.0.clone())
        }
    }

    /// Finds `face` on every other frame, starting with the first.
    struct BlinkingDetector {
        face: Region,
        calls: usize,
    }

    impl RegionDetector for BlinkingDetector {
        fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<Region>> {
            self.calls += 1;
            if self.calls % 2 == 1 {
                Ok(vec![self.face])
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn amy() -> Detection {
        Detection::named("Amy").with_region(Region {
            x: 10,
            y: 12,
            width: 16,
            height: 16,
        })
    }

    fn kiosk<S: FrameSource, R: RecognitionClient>(
        source: S,
        recognizer: Arc<R>,
    ) -> KioskLoop<S, R, MemorySink> {
        KioskLoop::new(
            source,
            recognizer,
            MemorySink::default(),
            Annotator::new(LabelPolicy::default()),
            Handle::current(),
            KioskConfig::default(),
        )
    }

    fn report(outcome: StepOutcome) -> FrameReport {
        match outcome {
            StepOutcome::Published(report) => report,
            other => panic!("expected a published frame, got {other:?}"),
        }
    }

    async fn wait_until_idle<S: FrameSource, R: RecognitionClient, P: PreviewSink>(
        kiosk: &KioskLoop<S, R, P>,
    ) {
        for _ in 0..400 {
            if !kiosk.recognition_in_flight() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("recognition never completed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_recognition_does_not_stall_frames() {
        let recognizer = GatedRecognizer::new(vec![amy()]);
        let mut kiosk = kiosk(ScriptedSource::frames(3), recognizer.clone());

        let first = report(kiosk.step());
        assert!(first.recognition_dispatched);
        assert!(first.captions.is_empty());
        assert!(kiosk.recognition_in_flight());

        // still waiting on the first request
        let second = report(kiosk.step());
        assert!(!second.recognition_dispatched);
        assert!(second.captions.is_empty());

        recognizer.release();
        wait_until_idle(&kiosk).await;

        let third = report(kiosk.step());
        assert_eq!(third.captions, vec!["Amy".to_owned()]);
        assert!(third.recognition_dispatched);

        let sequences: Vec<u64> = kiosk.sink().frames.iter().map(Frame::sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(recognizer.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(kiosk.cache().read(kiosk.session()).unwrap().issued_for, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn at_most_one_request_in_flight() {
        let recognizer = GatedRecognizer::new(vec![amy()]);
        let mut kiosk = kiosk(ScriptedSource::frames(40), recognizer.clone());

        for round in 0..40 {
            kiosk.step();
            if round % 5 == 4 {
                recognizer.release();
                wait_until_idle(&kiosk).await;
            }
        }

        assert_eq!(recognizer.max_active.load(Ordering::SeqCst), 1);
        assert!(recognizer.calls.load(Ordering::SeqCst) >= 8);
        let sequences: Vec<u64> = kiosk.sink().frames.iter().map(Frame::sequence).collect();
        assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_recognition_means_no_detections() {
        let mut kiosk = kiosk(ScriptedSource::frames(2), Arc::new(FailingRecognizer));

        assert!(report(kiosk.step()).recognition_dispatched);
        wait_until_idle(&kiosk).await;

        let cached = kiosk.cache().read(kiosk.session()).unwrap();
        assert!(cached.detections.is_empty());
        assert!(report(kiosk.step()).captions.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn result_after_shutdown_is_discarded() {
        let recognizer = GatedRecognizer::new(vec![amy()]);
        let mut kiosk = kiosk(ScriptedSource::frames(1), recognizer.clone());

        assert!(report(kiosk.step()).recognition_dispatched);
        kiosk.shutdown();
        assert_eq!(kiosk.state(), KioskState::Shutdown);

        recognizer.release();
        wait_until_idle(&kiosk).await;
        assert!(kiosk.cache().read(kiosk.session()).is_none());
        assert_eq!(kiosk.step(), StepOutcome::Shutdown);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_reads_are_skipped_and_device_errors_stop_the_loop() {
        let source = ScriptedSource {
            reads: VecDeque::from(vec![
                Ok(None),
                Ok(Some(Frame::filled(48, 32, 1, [0, 0, 0]))),
                Err(DeviceError::ReadFailed("unplugged".to_owned())),
            ]),
        };
        let mut kiosk = kiosk(source, GatedRecognizer::new(Vec::new()));

        assert_eq!(kiosk.step(), StepOutcome::Empty);
        assert_eq!(report(kiosk.step()).sequence, 1);
        assert_eq!(kiosk.latest_frame().load().unwrap().sequence(), 1);

        let stop = AtomicBool::new(false);
        let result = kiosk.run(&stop);
        assert!(matches!(result, Err(KioskError::Device(_))));
        assert_eq!(kiosk.state(), KioskState::Shutdown);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recognition_can_be_disabled() {
        let recognizer = GatedRecognizer::new(vec![amy()]);
        let mut kiosk = KioskLoop::new(
            ScriptedSource::frames(2),
            recognizer.clone(),
            MemorySink::default(),
            Annotator::new(LabelPolicy::default()),
            Handle::current(),
            KioskConfig {
                enable_recognition: false,
                ..Default::default()
            },
        );

        assert!(!report(kiosk.step()).recognition_dispatched);
        assert!(!kiosk.recognition_in_flight());
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn local_faces_are_labelled_unknown_until_recognized() {
        let face = Region {
            x: 8,
            y: 14,
            width: 12,
            height: 12,
        };
        let recognizer = GatedRecognizer::new(vec![Detection::named("Zoe")]);
        let mut kiosk =
            kiosk(ScriptedSource::frames(2), recognizer.clone()).with_detector(Box::new(FixedDetector(vec![face])));

        let first = report(kiosk.step());
        assert!(first.recognition_dispatched);
        assert_eq!(first.captions, vec!["Who are you?".to_owned()]);

        recognizer.release();
        wait_until_idle(&kiosk).await;

        // the service gave no rectangle, so the local face is used
        let second = report(kiosk.step());
        assert_eq!(second.captions, vec!["Zoe".to_owned()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_face_no_request() {
        let recognizer = GatedRecognizer::new(vec![amy()]);
        let mut kiosk =
            kiosk(ScriptedSource::frames(1), recognizer.clone()).with_detector(Box::new(FixedDetector(Vec::new())));

        let only = report(kiosk.step());
        assert!(!only.recognition_dispatched);
        assert!(only.captions.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missed_detection_keeps_cached_caption() {
        let face = Region {
            x: 10,
            y: 12,
            width: 16,
            height: 16,
        };
        let recognizer = GatedRecognizer::new(vec![amy()]);
        let mut kiosk = kiosk(ScriptedSource::frames(3), recognizer.clone())
            .with_detector(Box::new(BlinkingDetector { face, calls: 0 }));

        assert!(report(kiosk.step()).recognition_dispatched);
        recognizer.release();
        wait_until_idle(&kiosk).await;

        // the cascade loses the face for one frame
        let second = report(kiosk.step());
        assert!(!second.recognition_dispatched);
        assert_eq!(second.captions, vec!["Amy".to_owned()]);

        let third = report(kiosk.step());
        assert_eq!(third.captions, vec!["Amy".to_owned()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn repeated_empty_reads_back_off() {
        let source = ScriptedSource {
            reads: VecDeque::from(vec![
                Ok(None),
                Ok(None),
                Ok(None),
                Ok(Some(Frame::filled(48, 32, 1, [0, 0, 0]))),
            ]),
        };
        let mut kiosk = KioskLoop::new(
            source,
            GatedRecognizer::new(Vec::new()),
            MemorySink::default(),
            Annotator::new(LabelPolicy::default()),
            Handle::current(),
            KioskConfig {
                enable_recognition: false,
                empty_read_backoff: Duration::from_millis(30),
                ..Default::default()
            },
        );

        let started = Instant::now();
        for _ in 0..3 {
            assert_eq!(kiosk.step(), StepOutcome::Empty);
        }
        // no pause after the first miss, one after each of the next two
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(kiosk.consecutive_empty_reads(), 3);

        assert_eq!(report(kiosk.step()).sequence, 1);
        assert_eq!(kiosk.consecutive_empty_reads(), 0);
    }
}

//! The engine actor.
//!
//! A single tokio task owns the overlay collection, the latest-capture slot
//! and the capture trigger. The analysis thread and the capture tasks talk
//! to it through [`EngineHandle`]; nothing else mutates that state.

use crate::presenter::Presenter;
use facecap_core::{
    map_detections, BoundingBox, CaptureEncoder, CapturePolicy, CaptureTrigger, EmptyFramePolicy,
    EncodeError, EncodedCapture, OverlayCollection,
};
use facecap_hw::{CameraError, Frame, StillSource};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const EVENT_QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine task exited")]
    ChannelClosed,
}

/// Why a still capture produced no result.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("encoding failed: {0}")]
    Encoding(#[from] EncodeError),
    #[error("encoder task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineSettings {
    pub empty_policy: EmptyFramePolicy,
    pub capture_policy: CapturePolicy,
    pub encoder: CaptureEncoder,
}

/// The latest encoded capture plus where it came from.
#[derive(Debug, Clone, Serialize)]
pub struct StoredCapture {
    pub capture: EncodedCapture,
    pub frame_sequence: u32,
    pub request_id: u64,
}

/// Single-value slot holding the most recent capture. Overwritten, never appended.
#[derive(Debug, Default)]
struct CaptureSlot {
    latest: Option<StoredCapture>,
}

impl CaptureSlot {
    fn store(&mut self, capture: StoredCapture) {
        self.latest = Some(capture);
    }

    fn get(&self) -> Option<&StoredCapture> {
        self.latest.as_ref()
    }
}

/// Point-in-time view of engine state.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub overlays: OverlayCollection,
    pub frames_analyzed: u64,
    pub captures_requested: u64,
    pub captures_skipped: u64,
    pub captures_in_flight: usize,
    pub captures_stored: u64,
    pub captures_failed: u64,
    /// Length of the stored base64 text, if any.
    pub latest_capture_len: Option<usize>,
}

/// Messages handled by the engine task.
enum EngineEvent {
    Analyzed {
        sequence: u32,
        boxes: Vec<BoundingBox>,
        done: oneshot::Sender<()>,
    },
    CaptureCompleted {
        request_id: u64,
        result: Result<(EncodedCapture, u32), CaptureError>,
    },
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    LatestCapture {
        reply: oneshot::Sender<Option<StoredCapture>>,
    },
}

/// Clone-safe handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineEvent>,
}

impl EngineHandle {
    /// Async form of [`blocking_analyzed`](Self::blocking_analyzed) for
    /// driving the engine from a test runtime.
    #[cfg(test)]
    pub async fn analyzed(
        &self,
        sequence: u32,
        boxes: Vec<BoundingBox>,
    ) -> Result<(), EngineError> {
        let (done, applied) = oneshot::channel();
        self.tx
            .send(EngineEvent::Analyzed {
                sequence,
                boxes,
                done,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        applied.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Deliver one analyzed frame's preview-space boxes and block until the
    /// engine has applied them. For the analysis thread; must not be called
    /// from inside the runtime.
    pub fn blocking_analyzed(
        &self,
        sequence: u32,
        boxes: Vec<BoundingBox>,
    ) -> Result<(), EngineError> {
        let (done, applied) = oneshot::channel();
        self.tx
            .blocking_send(EngineEvent::Analyzed {
                sequence,
                boxes,
                done,
            })
            .map_err(|_| EngineError::ChannelClosed)?;
        applied.blocking_recv().map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineEvent::Snapshot { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn latest_capture(&self) -> Result<Option<StoredCapture>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineEvent::LatestCapture { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

struct Engine<P> {
    settings: EngineSettings,
    overlays: OverlayCollection,
    slot: CaptureSlot,
    trigger: CaptureTrigger,
    still: Arc<dyn StillSource>,
    presenter: P,
    /// Weak so the engine does not keep its own queue alive.
    events: mpsc::WeakSender<EngineEvent>,
    next_request_id: u64,
    frames_analyzed: u64,
    captures_stored: u64,
    captures_failed: u64,
}

/// Spawn the engine task on the current runtime.
///
/// The task runs until every [`EngineHandle`] is dropped and every
/// in-flight capture has reported back.
pub fn spawn_engine<P: Presenter>(
    settings: EngineSettings,
    still: Arc<dyn StillSource>,
    presenter: P,
) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineEvent>(EVENT_QUEUE_DEPTH);

    let mut engine = Engine {
        settings,
        overlays: OverlayCollection::default(),
        slot: CaptureSlot::default(),
        trigger: CaptureTrigger::new(settings.capture_policy),
        still,
        presenter,
        events: tx.downgrade(),
        next_request_id: 0,
        frames_analyzed: 0,
        captures_stored: 0,
        captures_failed: 0,
    };

    tokio::spawn(async move {
        tracing::info!(
            empty_policy = ?settings.empty_policy,
            capture_policy = ?settings.capture_policy,
            quality = settings.encoder.quality(),
            "engine started"
        );
        while let Some(event) = rx.recv().await {
            engine.handle(event);
        }
        tracing::info!("engine exiting");
    });

    EngineHandle { tx }
}

impl<P: Presenter> Engine<P> {
    fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Analyzed {
                sequence,
                boxes,
                done,
            } => {
                self.on_analyzed(sequence, &boxes);
                let _ = done.send(());
            }
            EngineEvent::CaptureCompleted { request_id, result } => {
                self.on_capture_completed(request_id, result);
            }
            EngineEvent::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            EngineEvent::LatestCapture { reply } => {
                let _ = reply.send(self.slot.get().cloned());
            }
        }
    }

    fn on_analyzed(&mut self, sequence: u32, boxes: &[BoundingBox]) {
        self.frames_analyzed += 1;
        tracing::trace!(sequence, faces = boxes.len(), "frame analyzed");

        if boxes.is_empty() {
            if self.settings.empty_policy == EmptyFramePolicy::Clear && !self.overlays.is_empty() {
                self.overlays.clear(sequence);
                self.presenter.redraw(&self.overlays);
            }
            return;
        }

        self.overlays.replace(sequence, map_detections(boxes));
        self.presenter.redraw(&self.overlays);

        if self.trigger.on_frame(boxes.len()) {
            self.request_capture();
        } else {
            tracing::trace!(in_flight = self.trigger.in_flight(), "capture trigger skipped");
        }
    }

    /// Fire-and-forget: the analysis path never waits on the capture.
    fn request_capture(&mut self) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let Some(events) = self.events.upgrade() else {
            // Queue is shutting down; account for the request as failed.
            self.trigger.finish();
            self.captures_failed += 1;
            return;
        };

        tracing::debug!(request_id, "still capture requested");
        let pending = self.still.request();
        let encoder = self.settings.encoder;

        tokio::spawn(async move {
            let result = match pending.await {
                Ok(Ok(frame)) => encode_still(encoder, frame).await,
                Ok(Err(e)) => Err(CaptureError::Camera(e)),
                Err(_) => Err(CaptureError::Camera(CameraError::SourceClosed)),
            };
            let _ = events
                .send(EngineEvent::CaptureCompleted { request_id, result })
                .await;
        });
    }

    fn on_capture_completed(
        &mut self,
        request_id: u64,
        result: Result<(EncodedCapture, u32), CaptureError>,
    ) {
        self.trigger.finish();
        match result {
            Ok((capture, frame_sequence)) => {
                tracing::debug!(
                    request_id,
                    frame_sequence,
                    jpeg_bytes = capture.jpeg_len,
                    "capture stored"
                );
                self.captures_stored += 1;
                self.slot.store(StoredCapture {
                    capture,
                    frame_sequence,
                    request_id,
                });
                if let Some(stored) = self.slot.get() {
                    self.presenter.capture_stored(stored);
                }
            }
            Err(error) => {
                tracing::warn!(
                    request_id,
                    error = %error,
                    "capture failed; keeping previous result"
                );
                self.captures_failed += 1;
                self.presenter.capture_failed(&error);
            }
        }
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            overlays: self.overlays.clone(),
            frames_analyzed: self.frames_analyzed,
            captures_requested: self.trigger.requested(),
            captures_skipped: self.trigger.skipped(),
            captures_in_flight: self.trigger.in_flight(),
            captures_stored: self.captures_stored,
            captures_failed: self.captures_failed,
            latest_capture_len: self.slot.get().map(|s| s.capture.base64.len()),
        }
    }
}

/// JPEG + base64 on the blocking pool. The frame buffer is moved into the
/// encoder and released whichever way it returns.
async fn encode_still(
    encoder: CaptureEncoder,
    frame: Frame,
) -> Result<(EncodedCapture, u32), CaptureError> {
    let sequence = frame.sequence;
    let encoded = tokio::task::spawn_blocking(move || {
        encoder.encode_rgb(frame.data, frame.width, frame.height)
    })
    .await
    .map_err(|e| CaptureError::Task(e.to_string()))??;
    Ok((encoded, sequence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use facecap_core::{FaceOverlay, Point, Size};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Still source that counts requests and answers each with a fixed
    /// frame, or leaves them pending when `hold` is set.
    struct CountingStill {
        requests: AtomicUsize,
        hold: bool,
        held: Mutex<Vec<oneshot::Sender<Result<Frame, CameraError>>>>,
    }

    impl CountingStill {
        fn new(hold: bool) -> Arc<Self> {
            Arc::new(Self {
                requests: AtomicUsize::new(0),
                hold,
                held: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }

        fn release_all(&self, result: impl Fn() -> Result<Frame, CameraError>) {
            for tx in self.held.lock().unwrap().drain(..) {
                let _ = tx.send(result());
            }
        }
    }

    impl StillSource for CountingStill {
        fn request(&self) -> oneshot::Receiver<Result<Frame, CameraError>> {
            let n = self.requests.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            if self.hold {
                self.held.lock().unwrap().push(tx);
            } else {
                let _ = tx.send(Ok(test_frame(n as u32)));
            }
            rx
        }
    }

    fn test_frame(sequence: u32) -> Frame {
        Frame::new(vec![90; 32 * 24 * 3], 32, 24, sequence)
    }

    #[derive(Default)]
    struct Recorded {
        redraws: Vec<OverlayCollection>,
        stored: Vec<u64>,
        failed: usize,
    }

    #[derive(Clone, Default)]
    struct RecordingPresenter(Arc<Mutex<Recorded>>);

    impl Presenter for RecordingPresenter {
        fn redraw(&mut self, overlays: &OverlayCollection) {
            self.0.lock().unwrap().redraws.push(overlays.clone());
        }

        fn capture_stored(&mut self, capture: &StoredCapture) {
            self.0.lock().unwrap().stored.push(capture.request_id);
        }

        fn capture_failed(&mut self, _error: &CaptureError) {
            self.0.lock().unwrap().failed += 1;
        }
    }

    fn face(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox::new(x, y, w, h, 0.9)
    }

    fn settings(empty: EmptyFramePolicy, capture: CapturePolicy) -> EngineSettings {
        EngineSettings {
            empty_policy: empty,
            capture_policy: capture,
            encoder: CaptureEncoder::default(),
        }
    }

    /// Wait until every requested capture has reported back.
    async fn settle(handle: &EngineHandle) -> EngineSnapshot {
        for _ in 0..200 {
            let snap = handle.snapshot().await.unwrap();
            if snap.captures_in_flight == 0 {
                return snap;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("captures never settled");
    }

    #[tokio::test]
    async fn test_single_face_scenario() {
        let still = CountingStill::new(false);
        let presenter = RecordingPresenter::default();
        let handle = spawn_engine(EngineSettings::default(), still.clone(), presenter.clone());

        handle
            .analyzed(1, vec![face(100.0, 200.0, 50.0, 50.0)])
            .await
            .unwrap();

        let snap = settle(&handle).await;
        assert_eq!(
            snap.overlays.overlays(),
            &[FaceOverlay {
                origin: Point { x: 100.0, y: 200.0 },
                size: Size {
                    width: 50.0,
                    height: 50.0
                },
                landmarks: None,
            }]
        );
        assert_eq!(snap.captures_requested, 1);
        assert_eq!(still.count(), 1);
        assert_eq!(snap.captures_stored, 1);

        let latest = handle.latest_capture().await.unwrap().unwrap();
        assert_eq!((latest.capture.width, latest.capture.height), (32, 24));
        assert!(!latest.capture.base64.is_empty());
    }

    #[tokio::test]
    async fn test_overlay_matches_detections() {
        let still = CountingStill::new(true);
        let handle = spawn_engine(EngineSettings::default(), still, RecordingPresenter::default());

        let boxes = vec![
            face(10.0, 20.0, 30.0, 40.0),
            face(200.0, 100.0, 64.0, 64.0),
            face(5.5, 6.5, 7.0, 8.0),
        ];
        handle.analyzed(7, boxes.clone()).await.unwrap();

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.overlays.sequence, Some(7));
        assert_eq!(snap.overlays.len(), boxes.len());
        for (b, o) in boxes.iter().zip(snap.overlays.iter()) {
            assert_eq!((o.origin.x, o.origin.y), (b.x, b.y));
            assert_eq!((o.size.width, o.size.height), (b.width, b.height));
        }
    }

    #[tokio::test]
    async fn test_empty_frame_holds_previous_overlay() {
        let presenter = RecordingPresenter::default();
        let handle = spawn_engine(
            settings(EmptyFramePolicy::Hold, CapturePolicy::Unthrottled),
            CountingStill::new(true),
            presenter.clone(),
        );

        handle.analyzed(1, vec![face(1.0, 2.0, 3.0, 4.0)]).await.unwrap();
        handle.analyzed(2, vec![]).await.unwrap();

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.overlays.sequence, Some(1));
        assert_eq!(snap.overlays.len(), 1);
        assert_eq!(snap.frames_analyzed, 2);
        assert_eq!(snap.captures_requested, 1);
        assert_eq!(presenter.0.lock().unwrap().redraws.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_frame_clears_when_configured() {
        let presenter = RecordingPresenter::default();
        let handle = spawn_engine(
            settings(EmptyFramePolicy::Clear, CapturePolicy::Unthrottled),
            CountingStill::new(true),
            presenter.clone(),
        );

        handle.analyzed(1, vec![face(1.0, 2.0, 3.0, 4.0)]).await.unwrap();
        handle.analyzed(2, vec![]).await.unwrap();
        handle.analyzed(3, vec![]).await.unwrap();

        let snap = handle.snapshot().await.unwrap();
        assert!(snap.overlays.is_empty());
        assert_eq!(snap.overlays.sequence, Some(2));
        // One redraw for the faces, one for the clear, none for the repeat.
        assert_eq!(presenter.0.lock().unwrap().redraws.len(), 2);
    }

    #[tokio::test]
    async fn test_unthrottled_issues_one_capture_per_face_frame() {
        let still = CountingStill::new(true);
        let handle = spawn_engine(
            EngineSettings::default(),
            still.clone(),
            RecordingPresenter::default(),
        );

        for seq in 0..3 {
            handle.analyzed(seq, vec![face(0.0, 0.0, 10.0, 10.0)]).await.unwrap();
        }

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(still.count(), 3);
        assert_eq!(snap.captures_requested, 3);
        assert_eq!(snap.captures_in_flight, 3);
    }

    #[tokio::test]
    async fn test_single_policy_guards_in_flight_capture() {
        let still = CountingStill::new(true);
        let handle = spawn_engine(
            settings(EmptyFramePolicy::Hold, CapturePolicy::Single),
            still.clone(),
            RecordingPresenter::default(),
        );

        for seq in 0..3 {
            handle.analyzed(seq, vec![face(0.0, 0.0, 10.0, 10.0)]).await.unwrap();
        }
        assert_eq!(still.count(), 1);

        still.release_all(|| Ok(test_frame(99)));
        let snap = settle(&handle).await;
        assert_eq!(snap.captures_skipped, 2);
        assert_eq!(snap.captures_stored, 1);

        handle.analyzed(3, vec![face(0.0, 0.0, 10.0, 10.0)]).await.unwrap();
        assert_eq!(still.count(), 2);
    }

    #[tokio::test]
    async fn test_capture_failure_keeps_previous_result() {
        let still = CountingStill::new(true);
        let presenter = RecordingPresenter::default();
        let handle = spawn_engine(EngineSettings::default(), still.clone(), presenter.clone());

        handle.analyzed(1, vec![face(0.0, 0.0, 10.0, 10.0)]).await.unwrap();
        still.release_all(|| Ok(test_frame(1)));
        settle(&handle).await;
        let first = handle.latest_capture().await.unwrap().unwrap();

        handle.analyzed(2, vec![face(0.0, 0.0, 10.0, 10.0)]).await.unwrap();
        still.release_all(|| Err(CameraError::CaptureFailed("sensor timeout".into())));
        let snap = settle(&handle).await;

        assert_eq!(snap.captures_failed, 1);
        assert_eq!(presenter.0.lock().unwrap().failed, 1);
        let latest = handle.latest_capture().await.unwrap().unwrap();
        assert_eq!(latest.request_id, first.request_id);
    }

    #[tokio::test]
    async fn test_invalid_still_is_encoding_failure() {
        let still = CountingStill::new(true);
        let handle = spawn_engine(
            EngineSettings::default(),
            still.clone(),
            RecordingPresenter::default(),
        );

        handle.analyzed(1, vec![face(0.0, 0.0, 10.0, 10.0)]).await.unwrap();
        still.release_all(|| Ok(Frame::new(vec![0; 5], 32, 24, 1)));
        let snap = settle(&handle).await;

        assert_eq!(snap.captures_failed, 1);
        assert!(handle.latest_capture().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_capture_is_overwritten() {
        let still = CountingStill::new(true);
        let presenter = RecordingPresenter::default();
        let handle = spawn_engine(EngineSettings::default(), still.clone(), presenter.clone());

        handle.analyzed(1, vec![face(0.0, 0.0, 10.0, 10.0)]).await.unwrap();
        still.release_all(|| Ok(test_frame(10)));
        settle(&handle).await;

        handle.analyzed(2, vec![face(0.0, 0.0, 10.0, 10.0)]).await.unwrap();
        still.release_all(|| Ok(test_frame(20)));
        let snap = settle(&handle).await;

        assert_eq!(snap.captures_stored, 2);
        let latest = handle.latest_capture().await.unwrap().unwrap();
        assert_eq!(latest.frame_sequence, 20);
        assert_eq!(latest.request_id, 1);
        assert_eq!(presenter.0.lock().unwrap().stored, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_landmarks_reach_overlays_and_presenter() {
        let presenter = RecordingPresenter::default();
        let handle = spawn_engine(
            EngineSettings::default(),
            CountingStill::new(true),
            presenter.clone(),
        );

        let mut b = face(10.0, 10.0, 20.0, 20.0);
        b.landmarks = Some([(14.0, 16.0), (26.0, 16.0), (20.0, 21.0), (15.0, 26.0), (25.0, 26.0)]);
        handle.analyzed(1, vec![b]).await.unwrap();

        let snap = handle.snapshot().await.unwrap();
        let lms = snap.overlays.overlays()[0].landmarks.unwrap();
        assert_eq!(lms[2], Point { x: 20.0, y: 21.0 });
        assert_eq!(
            presenter.0.lock().unwrap().redraws[0].overlays()[0].landmarks,
            Some(lms)
        );

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["overlays"]["overlays"][0]["landmarks"][2]["x"], 20.0);
    }

    #[tokio::test]
    async fn test_cloned_handle_outlives_original() {
        let still = CountingStill::new(true);
        let handle = spawn_engine(EngineSettings::default(), still, RecordingPresenter::default());
        let second = handle.clone();
        drop(handle);
        second.analyzed(1, vec![]).await.unwrap();
        assert_eq!(second.snapshot().await.unwrap().frames_analyzed, 1);
    }
}

//! Frame analysis pump.
//!
//! One OS thread reads camera frames, publishes each to the still channel,
//! runs the detector and hands the preview-space boxes to the engine. The
//! engine acknowledges every frame before the next one is read, so at most
//! one frame is in analysis at a time and frames that arrive meanwhile are
//! left to the driver's queue.

use crate::engine::{EngineError, EngineHandle};
use facecap_core::{FaceDetector, PreviewTransform};
use facecap_hw::{CameraError, FramePublisher, FrameSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Consecutive capture errors tolerated before the pump gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Counters reported when the pump stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub frames: u64,
    pub detect_errors: u64,
    pub capture_errors: u64,
}

/// Where the preview is drawn and whether it is mirrored.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviewGeometry {
    /// View size; `None` uses each frame's own size.
    pub view: Option<(u32, u32)>,
    pub mirrored: bool,
}

impl PreviewGeometry {
    pub fn transform(&self, frame_width: u32, frame_height: u32) -> PreviewTransform {
        let (vw, vh) = self.view.unwrap_or((frame_width, frame_height));
        PreviewTransform::fill_center(frame_width, frame_height, vw, vh, self.mirrored)
    }
}

pub struct Pump<S, D> {
    pub source: S,
    pub detector: D,
    pub geometry: PreviewGeometry,
    pub publisher: FramePublisher,
    pub engine: EngineHandle,
}

/// Start the pump on a thread named `facecap-analysis`.
///
/// The thread stops when `stop` is set, when the source reports
/// [`CameraError::SourceClosed`], after too many consecutive capture errors,
/// or when the engine goes away.
pub fn spawn_analysis<S, D>(
    pump: Pump<S, D>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<PumpStats>>
where
    S: FrameSource + 'static,
    D: FaceDetector + 'static,
{
    std::thread::Builder::new()
        .name("facecap-analysis".into())
        .spawn(move || {
            tracing::info!("analysis thread started");
            let stats = pump.run(&stop);
            tracing::info!(
                frames = stats.frames,
                detect_errors = stats.detect_errors,
                capture_errors = stats.capture_errors,
                "analysis thread exiting"
            );
            stats
        })
}

impl<S: FrameSource, D: FaceDetector> Pump<S, D> {
    fn run(mut self, stop: &AtomicBool) -> PumpStats {
        let mut stats = PumpStats::default();
        let mut consecutive_errors = 0;

        while !stop.load(Ordering::Relaxed) {
            let frame = match self.source.next_frame() {
                Ok(frame) => frame,
                Err(CameraError::SourceClosed) => {
                    tracing::info!("frame source closed");
                    break;
                }
                Err(e) => {
                    stats.capture_errors += 1;
                    consecutive_errors += 1;
                    tracing::warn!(error = %e, consecutive_errors, "frame capture failed");
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        tracing::error!("too many consecutive capture errors; stopping analysis");
                        break;
                    }
                    continue;
                }
            };
            consecutive_errors = 0;
            stats.frames += 1;

            let frame = Arc::new(frame);
            self.publisher.publish(Arc::clone(&frame));

            let boxes = match self.detector.detect(&frame.data, frame.width, frame.height) {
                Ok(boxes) => boxes,
                Err(e) => {
                    // Skip the frame; overlays stay as they are.
                    stats.detect_errors += 1;
                    tracing::warn!(sequence = frame.sequence, error = %e, "detection failed");
                    continue;
                }
            };

            let transform = self.geometry.transform(frame.width, frame.height);
            let mapped = boxes.iter().map(|b| transform.map_box(b)).collect();
            let sequence = frame.sequence;
            // Release our reference before waiting so a pending still can take ownership.
            drop(frame);

            let applied = self.engine.blocking_analyzed(sequence, mapped);
            if let Err(EngineError::ChannelClosed) = applied {
                tracing::warn!("engine gone; stopping analysis");
                break;
            }
        }

        stats
    }
}

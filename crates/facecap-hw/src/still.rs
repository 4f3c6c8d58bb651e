//! Still capture from the live stream.
//!
//! The analysis loop publishes every full-resolution frame it reads; a
//! still request resolves with the first frame published after the
//! request was made.

use crate::camera::CameraError;
use crate::frame::Frame;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

/// Asynchronous single-shot capture. Requests never block the caller and
/// any number of them may be outstanding.
pub trait StillSource: Send + Sync {
    fn request(&self) -> oneshot::Receiver<Result<Frame, CameraError>>;
}

/// Writer half, owned by whoever reads the camera.
pub struct FramePublisher {
    tx: watch::Sender<Option<Arc<Frame>>>,
}

impl FramePublisher {
    pub fn publish(&self, frame: Arc<Frame>) {
        // send_replace never fails, even with no receivers left.
        self.tx.send_replace(Some(frame));
    }
}

/// [`StillSource`] backed by the latest published frame.
#[derive(Clone)]
pub struct LatestFrameStill {
    rx: watch::Receiver<Option<Arc<Frame>>>,
}

pub fn still_channel() -> (FramePublisher, LatestFrameStill) {
    let (tx, rx) = watch::channel(None);
    (FramePublisher { tx }, LatestFrameStill { rx })
}

impl StillSource for LatestFrameStill {
    /// Must be called from within a tokio runtime.
    fn request(&self) -> oneshot::Receiver<Result<Frame, CameraError>> {
        let (reply, result) = oneshot::channel();
        let mut rx = self.rx.clone();
        // Only frames published after this point count.
        rx.borrow_and_update();

        tokio::spawn(async move {
            let frame = match rx.changed().await {
                Ok(()) => rx.borrow_and_update().clone().ok_or(CameraError::SourceClosed),
                Err(_) => Err(CameraError::SourceClosed),
            };
            let frame =
                frame.map(|f| Arc::try_unwrap(f).unwrap_or_else(|shared| (*shared).clone()));
            let _ = reply.send(frame);
        });

        result
    }
}

//! Presentation layer.
//!
//! The engine pushes every visible change through [`Presenter`]. The
//! terminal presenter stands in for a GUI toolkit: one status line per
//! redraw, plus the permission call-to-action.

use crate::engine::{CaptureError, StoredCapture};
use facecap_core::{FaceOverlay, OverlayCollection, PermissionStatus};
use std::io::Write;
use std::sync::mpsc;
use std::thread::JoinHandle;

pub trait Presenter: Send + 'static {
    /// The overlay collection changed and must be redrawn.
    fn redraw(&mut self, overlays: &OverlayCollection);

    /// A capture was encoded and now occupies the latest-capture slot.
    fn capture_stored(&mut self, _capture: &StoredCapture) {}

    /// A capture request ended without a result.
    fn capture_failed(&mut self, _error: &CaptureError) {}

    /// Camera access is missing; show the call-to-action.
    fn permission_required(&mut self, _status: PermissionStatus) {}
}

/// Hands text to a writer thread, so presenting never blocks the caller
/// on the terminal.
#[derive(Debug, Clone)]
pub struct TerminalPresenter {
    out: mpsc::Sender<String>,
}

impl TerminalPresenter {
    /// Presenter writing to stdout.
    pub fn spawn() -> std::io::Result<(Self, JoinHandle<()>)> {
        Self::spawn_with(std::io::stdout())
    }

    /// Start the writer thread. It exits once every clone of the presenter
    /// has been dropped.
    pub fn spawn_with<W: Write + Send + 'static>(
        mut writer: W,
    ) -> std::io::Result<(Self, JoinHandle<()>)> {
        let (out, rx) = mpsc::channel::<String>();
        let handle = std::thread::Builder::new()
            .name("facecap-terminal".into())
            .spawn(move || {
                for text in rx {
                    let written = writer.write_all(text.as_bytes()).and_then(|_| writer.flush());
                    if written.is_err() {
                        break;
                    }
                }
            })?;
        Ok((Self { out }, handle))
    }

    /// Terminate the status line.
    pub fn end_line(&self) {
        self.print("\n".to_string());
    }

    fn print(&self, text: String) {
        // Writer gone means the terminal is gone; nothing left to show.
        let _ = self.out.send(text);
    }
}

/// One-line rendering of an overlay collection.
pub fn describe(overlays: &OverlayCollection) -> String {
    if overlays.is_empty() {
        return "no faces".to_string();
    }
    let boxes: Vec<String> = overlays.iter().map(describe_overlay).collect();
    format!("{} face(s): {}", overlays.len(), boxes.join(", "))
}

fn describe_overlay(o: &FaceOverlay) -> String {
    let mut text = format!(
        "({:.0},{:.0}) {:.0}x{:.0}",
        o.origin.x, o.origin.y, o.size.width, o.size.height
    );
    if let Some(lms) = &o.landmarks {
        let points: Vec<String> = lms
            .iter()
            .map(|p| format!("({:.0},{:.0})", p.x, p.y))
            .collect();
        text.push_str(&format!(" lm[{}]", points.join(" ")));
    }
    text
}

impl Presenter for TerminalPresenter {
    fn redraw(&mut self, overlays: &OverlayCollection) {
        let sequence = overlays.sequence.unwrap_or(0);
        self.print(format!("\r\x1b[2K[frame {sequence}] {}", describe(overlays)));
    }

    fn capture_stored(&mut self, capture: &StoredCapture) {
        self.print(format!(
            "\ncaptured {}x{} still from frame {} ({} base64 chars)\n",
            capture.capture.width,
            capture.capture.height,
            capture.frame_sequence,
            capture.capture.base64.len()
        ));
    }

    fn permission_required(&mut self, status: PermissionStatus) {
        let reason = match status {
            PermissionStatus::Denied => "Camera access was denied.",
            _ => "Camera access is required.",
        };
        self.print(format!(
            "{reason}\n[ Launch Camera ]  press Enter to request access, q to quit\n"
        ));
    }
}

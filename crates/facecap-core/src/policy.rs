//! Overlay and capture-trigger policies.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What a frame without faces does to the overlays on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyFramePolicy {
    /// Leave the previous overlays up until a frame with faces arrives.
    #[default]
    Hold,
    /// Clear the overlays as soon as a frame has no faces.
    Clear,
}

impl FromStr for EmptyFramePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hold" => Ok(Self::Hold),
            "clear" => Ok(Self::Clear),
            other => Err(format!("unknown empty-frame policy: {other} (expected hold or clear)")),
        }
    }
}

/// When a frame with faces requests a still capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapturePolicy {
    /// Every frame with at least one face requests a capture.
    #[default]
    Unthrottled,
    /// At most one capture in flight; triggers while busy are skipped.
    Single,
}

impl FromStr for CapturePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unthrottled" => Ok(Self::Unthrottled),
            "single" => Ok(Self::Single),
            other => Err(format!(
                "unknown capture policy: {other} (expected unthrottled or single)"
            )),
        }
    }
}

/// Capture trigger bookkeeping: decides per analyzed frame whether to
/// request a still, and tracks how many are in flight.
#[derive(Debug, Default)]
pub struct CaptureTrigger {
    policy: CapturePolicy,
    in_flight: usize,
    requested: u64,
    skipped: u64,
}

impl CaptureTrigger {
    pub fn new(policy: CapturePolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Called once per analyzed frame. Returns true when a capture should
    /// be requested; the caller must then report completion via [`finish`](Self::finish).
    pub fn on_frame(&mut self, faces: usize) -> bool {
        if faces == 0 {
            return false;
        }
        if self.policy == CapturePolicy::Single && self.in_flight > 0 {
            self.skipped += 1;
            return false;
        }
        self.in_flight += 1;
        self.requested += 1;
        true
    }

    pub fn finish(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn requested(&self) -> u64 {
        self.requested
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

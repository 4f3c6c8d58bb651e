use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates are in pixels. Whether they refer to the frame or the
/// preview depends on which side of [`PreviewTransform`](crate::PreviewTransform)
/// the box was taken from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Box without landmarks.
    pub fn new(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
            landmarks: None,
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

/// A rectangle drawn over the live preview for one detected face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceOverlay {
    pub origin: Point,
    pub size: Size,
    /// Landmarks in preview space, when the detector decodes them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[Point; 5]>,
}

/// The overlays of exactly one analyzed frame.
///
/// Only ever replaced as a whole; there is no API to push or remove a
/// single overlay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlayCollection {
    /// Sequence number of the frame the overlays were taken from.
    pub sequence: Option<u32>,
    overlays: Vec<FaceOverlay>,
}

impl OverlayCollection {
    pub fn new(sequence: u32, overlays: Vec<FaceOverlay>) -> Self {
        Self {
            sequence: Some(sequence),
            overlays,
        }
    }

    /// Atomically swap in the overlays of a newer frame.
    pub fn replace(&mut self, sequence: u32, overlays: Vec<FaceOverlay>) {
        *self = Self::new(sequence, overlays);
    }

    /// Drop all overlays, remembering which frame cleared them.
    pub fn clear(&mut self, sequence: u32) {
        self.replace(sequence, Vec::new());
    }

    pub fn overlays(&self) -> &[FaceOverlay] {
        &self.overlays
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FaceOverlay> {
        self.overlays.iter()
    }
}

impl<'a> IntoIterator for &'a OverlayCollection {
    type Item = &'a FaceOverlay;
    type IntoIter = std::slice::Iter<'a, FaceOverlay>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

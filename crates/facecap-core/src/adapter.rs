//! Detection adapter: frame-space boxes to preview-space overlays.

use crate::types::{BoundingBox, FaceOverlay, Point, Size};

/// Maps frame coordinates into the coordinate space of the displayed preview.
///
/// The preview fills its view and is centre-cropped ("fill-center"), so the
/// scale is the larger of the two axis ratios and the offset may be
/// negative. Front camera previews are mirrored horizontally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewTransform {
    scale: f32,
    offset_x: f32,
    offset_y: f32,
    view_width: f32,
    mirrored: bool,
}

impl PreviewTransform {
    /// Identity mapping for a preview that shows the frame as-is.
    pub fn identity(frame_width: u32) -> Self {
        Self {
            scale: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
            view_width: frame_width as f32,
            mirrored: false,
        }
    }

    pub fn fill_center(
        frame_width: u32,
        frame_height: u32,
        view_width: u32,
        view_height: u32,
        mirrored: bool,
    ) -> Self {
        if frame_width == 0 || frame_height == 0 {
            return Self {
                mirrored,
                ..Self::identity(view_width)
            };
        }

        let scale_w = view_width as f32 / frame_width as f32;
        let scale_h = view_height as f32 / frame_height as f32;
        let scale = scale_w.max(scale_h);

        Self {
            scale,
            offset_x: (view_width as f32 - frame_width as f32 * scale) / 2.0,
            offset_y: (view_height as f32 - frame_height as f32 * scale) / 2.0,
            view_width: view_width as f32,
            mirrored,
        }
    }

    /// Map one frame-space box into preview space. Confidence and landmarks
    /// are carried along; landmarks are mapped with the same transform.
    pub fn map_box(&self, b: &BoundingBox) -> BoundingBox {
        let width = b.width * self.scale;
        let height = b.height * self.scale;
        let mut x = b.x * self.scale + self.offset_x;
        let y = b.y * self.scale + self.offset_y;
        if self.mirrored {
            x = self.view_width - (x + width);
        }

        let landmarks = b.landmarks.map(|lms| lms.map(|(lx, ly)| self.map_point(lx, ly)));

        BoundingBox {
            x,
            y,
            width,
            height,
            confidence: b.confidence,
            landmarks,
        }
    }

    fn map_point(&self, x: f32, y: f32) -> (f32, f32) {
        let mx = x * self.scale + self.offset_x;
        let my = y * self.scale + self.offset_y;
        if self.mirrored {
            (self.view_width - mx, my)
        } else {
            (mx, my)
        }
    }
}

impl FaceOverlay {
    /// One overlay per box: origin at the top-left corner, size unchanged.
    ///
    /// Total: degenerate boxes (zero or negative extent) pass through as-is.
    /// Landmarks, if present, are carried over point for point.
    pub fn from_box(b: &BoundingBox) -> Self {
        Self {
            origin: Point { x: b.x, y: b.y },
            size: Size {
                width: b.width,
                height: b.height,
            },
            landmarks: b.landmarks.map(|lms| lms.map(|(x, y)| Point { x, y })),
        }
    }
}

impl From<&BoundingBox> for FaceOverlay {
    fn from(b: &BoundingBox) -> Self {
        Self::from_box(b)
    }
}

/// Map every preview-space box of one frame, preserving order.
pub fn map_detections(boxes: &[BoundingBox]) -> Vec<FaceOverlay> {
    boxes.iter().map(FaceOverlay::from_box).collect()
}

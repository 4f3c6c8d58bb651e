//! facecap-core: Face detection, overlay geometry and capture encoding.
//!
//! Everything here is free of camera and UI concerns: the detector runs
//! SCRFD via ONNX Runtime, the adapter turns detections into preview
//! overlays, and the encoder turns a still into base64 JPEG text.

pub mod adapter;
pub mod detector;
pub mod encoder;
pub mod permission;
pub mod policy;
pub mod types;

pub use adapter::{map_detections, PreviewTransform};
pub use detector::{DetectorOptions, FaceDetector, PerformanceMode, ScrfdDetector};
pub use encoder::{decode_capture, CaptureEncoder, EncodeError, EncodedCapture};
pub use permission::{PermissionGate, PermissionStatus, Transition};
pub use policy::{CapturePolicy, CaptureTrigger, EmptyFramePolicy};
pub use types::{BoundingBox, FaceOverlay, OverlayCollection, Point, Size};

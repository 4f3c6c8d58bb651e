//! facecap-hw: Camera frames, still capture and camera permission.
//!
//! Provides V4L2-based camera access with front/back selection, a
//! latest-frame still source, and permission brokers for the camera device.

pub mod camera;
pub mod frame;
pub mod permission;
pub mod still;

pub use camera::{Camera, CameraError, CameraFacing, CameraSelector, FrameSource, PixelFormat};
pub use frame::Frame;
pub use permission::{DeviceAccessBroker, PermissionBroker, PermissionError, PortalBroker};
pub use still::{still_channel, FramePublisher, LatestFrameStill, StillSource};

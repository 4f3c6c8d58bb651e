//! Camera permission brokers.
//!
//! On Linux the "permission store" for a V4L2 camera is the device node's
//! access mode. The prompt is either a plain re-check (the user fixed group
//! membership or udev rules) or the XDG Desktop Portal camera dialog.

use facecap_core::PermissionStatus;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::ffi::CString;
use std::future::Future;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

/// `org.freedesktop.portal.Request::Response` code for "user granted".
const PORTAL_RESPONSE_SUCCESS: u32 = 0;

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("portal unavailable: {0}")]
    Portal(#[from] zbus::Error),
    #[error("invalid request path: {0}")]
    RequestPath(String),
    #[error("portal closed the request without answering")]
    NoResponse,
}

/// Reads and requests camera access.
pub trait PermissionBroker {
    /// Current status, read from the platform without prompting.
    fn status(&self) -> PermissionStatus;

    /// Show the prompt. Resolves to whether access was granted.
    fn request(&self) -> impl Future<Output = Result<bool, PermissionError>> + Send;
}

/// Whether the current process can open `device` for capture.
pub fn device_accessible(device: &Path) -> bool {
    let Ok(path) = CString::new(device.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: `path` is a valid NUL-terminated string that outlives the call.
    unsafe { libc::access(path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
}

fn status_for(device: &Path) -> PermissionStatus {
    if device_accessible(device) {
        PermissionStatus::Granted
    } else {
        PermissionStatus::NotRequested
    }
}

/// Broker that consults the device node only.
#[derive(Debug, Clone)]
pub struct DeviceAccessBroker {
    device: PathBuf,
}

impl DeviceAccessBroker {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl PermissionBroker for DeviceAccessBroker {
    fn status(&self) -> PermissionStatus {
        status_for(&self.device)
    }

    async fn request(&self) -> Result<bool, PermissionError> {
        let granted = device_accessible(&self.device);
        tracing::info!(device = %self.device.display(), granted, "re-checked camera access");
        Ok(granted)
    }
}

#[zbus::proxy(
    interface = "org.freedesktop.portal.Camera",
    default_service = "org.freedesktop.portal.Desktop",
    default_path = "/org/freedesktop/portal/desktop"
)]
trait CameraPortal {
    fn access_camera(&self, options: HashMap<&str, Value<'_>>) -> zbus::Result<OwnedObjectPath>;

    #[zbus(property)]
    fn is_camera_present(&self) -> zbus::Result<bool>;
}

#[zbus::proxy(
    interface = "org.freedesktop.portal.Request",
    default_service = "org.freedesktop.portal.Desktop"
)]
trait PortalRequest {
    #[zbus(signal)]
    fn response(&self, response: u32, results: HashMap<String, OwnedValue>) -> zbus::Result<()>;
}

static REQUEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Broker that prompts through `org.freedesktop.portal.Camera.AccessCamera`.
#[derive(Debug, Clone)]
pub struct PortalBroker {
    device: PathBuf,
}

impl PortalBroker {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
        }
    }

    async fn access_camera(&self) -> Result<bool, PermissionError> {
        let conn = zbus::Connection::session().await?;
        let portal = CameraPortalProxy::new(&conn).await?;
        if !portal.is_camera_present().await.unwrap_or(true) {
            tracing::warn!("portal reports no camera present");
        }

        let token = format!(
            "facecap{}_{}",
            std::process::id(),
            REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let sender = conn
            .unique_name()
            .map(|n| n.as_str().trim_start_matches(':').replace('.', "_"))
            .unwrap_or_default();
        let path = request_path(&sender, &token);

        // Subscribe before calling so the response cannot be missed.
        let request = PortalRequestProxy::builder(&conn)
            .path(path.clone())
            .map_err(|_| PermissionError::RequestPath(path.clone()))?
            .build()
            .await?;
        let mut responses = request.receive_response().await?;

        let options = HashMap::from([("handle_token", Value::from(token.as_str()))]);
        let handle = portal.access_camera(options).await?;
        tracing::debug!(handle = %handle.as_str(), "camera portal request issued");

        let signal = responses.next().await.ok_or(PermissionError::NoResponse)?;
        let code = *signal.args()?.response();
        tracing::info!(code, "camera portal answered");
        Ok(code == PORTAL_RESPONSE_SUCCESS)
    }
}

fn request_path(sender: &str, token: &str) -> String {
    format!("/org/freedesktop/portal/desktop/request/{sender}/{token}")
}

impl PermissionBroker for PortalBroker {
    fn status(&self) -> PermissionStatus {
        status_for(&self.device)
    }

    async fn request(&self) -> Result<bool, PermissionError> {
        let granted = self.access_camera().await?;
        // The portal answer alone does not open the V4L2 node for us.
        Ok(granted && device_accessible(&self.device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device_not_accessible() {
        assert!(!device_accessible(Path::new("/dev/facecap-missing")));
        assert_eq!(
            DeviceAccessBroker::new("/dev/facecap-missing").status(),
            PermissionStatus::NotRequested
        );
    }

    #[test]
    fn test_interior_nul_not_accessible() {
        use std::ffi::OsStr;
        let path = Path::new(OsStr::from_bytes(b"/dev/vid\0eo0"));
        assert!(!device_accessible(path));
    }

    #[test]
    fn test_readable_file_is_accessible() {
        let dir = std::env::temp_dir().join(format!("facecap-perm-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("video-fake");
        std::fs::write(&file, b"").unwrap();

        assert!(device_accessible(&file));
        assert_eq!(DeviceAccessBroker::new(&file).status(), PermissionStatus::Granted);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_device_broker_request_rechecks() {
        let broker = DeviceAccessBroker::new("/dev/facecap-missing");
        assert!(!broker.request().await.unwrap());
    }

    #[test]
    fn test_request_path_format() {
        assert_eq!(
            request_path("1_42", "facecap7_0"),
            "/org/freedesktop/portal/desktop/request/1_42/facecap7_0"
        );
    }
}

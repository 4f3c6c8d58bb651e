use facecap_core::{CapturePolicy, DetectorOptions, EmptyFramePolicy, PerformanceMode};
use facecap_hw::{CameraFacing, CameraSelector};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Application configuration.
///
/// Layered: built-in defaults, then an optional TOML file, then `FACECAP_*`
/// environment variables, then command-line flags (applied by `main`).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Device node of the front camera (default: /dev/video0).
    pub front_device: String,
    /// Device node of the back camera (default: /dev/video1).
    pub back_device: String,
    pub facing: CameraFacing,
    /// Requested capture resolution.
    pub width: u32,
    pub height: u32,
    /// Size of the preview view; `None` shows frames at their native size.
    pub preview: Option<(u32, u32)>,
    /// Directory containing the SCRFD model.
    pub model_dir: PathBuf,
    pub detector: DetectorOptions,
    pub empty_policy: EmptyFramePolicy,
    pub capture_policy: CapturePolicy,
    pub jpeg_quality: u8,
    /// Prompt through the XDG camera portal instead of a plain re-check.
    pub portal: bool,
    /// Frames discarded at startup while auto-exposure settles.
    pub warmup_frames: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            front_device: "/dev/video0".to_string(),
            back_device: "/dev/video1".to_string(),
            facing: CameraFacing::Front,
            width: 640,
            height: 480,
            preview: None,
            model_dir: default_model_dir(),
            detector: DetectorOptions::default(),
            empty_policy: EmptyFramePolicy::Hold,
            capture_policy: CapturePolicy::Unthrottled,
            jpeg_quality: facecap_core::encoder::DEFAULT_JPEG_QUALITY,
            portal: true,
            warmup_frames: 4,
        }
    }
}

/// On-disk form: every key optional, unknown keys rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    front_device: Option<String>,
    back_device: Option<String>,
    facing: Option<CameraFacing>,
    width: Option<u32>,
    height: Option<u32>,
    preview_width: Option<u32>,
    preview_height: Option<u32>,
    model_dir: Option<PathBuf>,
    performance: Option<PerformanceMode>,
    empty_policy: Option<EmptyFramePolicy>,
    capture_policy: Option<CapturePolicy>,
    jpeg_quality: Option<u8>,
    portal: Option<bool>,
    warmup_frames: Option<usize>,
}

impl Config {
    /// Load from an optional TOML file (falling back to `FACECAP_CONFIG`),
    /// then apply the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let env_file = std::env::var("FACECAP_CONFIG").ok().map(PathBuf::from);
        if let Some(path) = file.map(Path::to_path_buf).or(env_file) {
            config.apply_toml(&path)?;
        }

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_toml(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        self.apply_file(file);
        Ok(())
    }

    fn apply_file(&mut self, f: FileConfig) {
        set(&mut self.front_device, f.front_device);
        set(&mut self.back_device, f.back_device);
        set(&mut self.facing, f.facing);
        set(&mut self.width, f.width);
        set(&mut self.height, f.height);
        set(&mut self.model_dir, f.model_dir);
        set(&mut self.detector.performance, f.performance);
        set(&mut self.empty_policy, f.empty_policy);
        set(&mut self.capture_policy, f.capture_policy);
        set(&mut self.jpeg_quality, f.jpeg_quality);
        set(&mut self.portal, f.portal);
        set(&mut self.warmup_frames, f.warmup_frames);
        if let Some(size) = preview_size(f.preview_width, f.preview_height) {
            self.preview = Some(size);
        }
    }

    /// Apply `FACECAP_*` variables looked up through `var`. Unparseable
    /// values are logged and ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        set(&mut self.front_device, var("FACECAP_FRONT_DEVICE"));
        set(&mut self.back_device, var("FACECAP_BACK_DEVICE"));
        set(&mut self.model_dir, var("FACECAP_MODEL_DIR").map(PathBuf::from));
        set(&mut self.facing, env_parse(&var, "FACECAP_FACING"));
        set(&mut self.width, env_parse(&var, "FACECAP_WIDTH"));
        set(&mut self.height, env_parse(&var, "FACECAP_HEIGHT"));
        set(&mut self.detector.performance, env_parse(&var, "FACECAP_PERFORMANCE"));
        set(&mut self.empty_policy, env_parse(&var, "FACECAP_EMPTY_POLICY"));
        set(&mut self.capture_policy, env_parse(&var, "FACECAP_CAPTURE_POLICY"));
        set(&mut self.jpeg_quality, env_parse(&var, "FACECAP_JPEG_QUALITY"));
        set(&mut self.warmup_frames, env_parse(&var, "FACECAP_WARMUP_FRAMES"));
        if let Some(v) = var("FACECAP_PORTAL") {
            self.portal = v != "0";
        }

        let preview_w = env_parse::<u32>(&var, "FACECAP_PREVIEW_WIDTH");
        let preview_h = env_parse::<u32>(&var, "FACECAP_PREVIEW_HEIGHT");
        if let Some(size) = preview_size(preview_w, preview_h) {
            self.preview = Some(size);
        }
    }

    pub fn selector(&self) -> CameraSelector {
        CameraSelector {
            front: self.front_device.clone(),
            back: self.back_device.clone(),
            facing: self.facing,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn env_parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment value");
            None
        }
    }
}

/// `$XDG_DATA_HOME/facecap/models`, or `~/.local/share/facecap/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facecap/models")
}

/// Both preview dimensions, when both are set and non-zero.
fn preview_size(width: Option<u32>, height: Option<u32>) -> Option<(u32, u32)> {
    let (w, h) = (width?, height?);
    if w == 0 || h == 0 {
        tracing::warn!(width = w, height = h, "ignoring preview size with a zero dimension");
        return None;
    }
    Some((w, h))
}

/// Parse `WIDTHxHEIGHT`. Both dimensions must be non-zero.
pub fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s}"))?;
    let w: u32 = w.trim().parse().map_err(|e| format!("bad width {w}: {e}"))?;
    let h: u32 = h.trim().parse().map_err(|e| format!("bad height {h}: {e}"))?;
    if w == 0 || h == 0 {
        return Err(format!("size must be non-zero, got {w}x{h}"));
    }
    Ok((w, h))
}

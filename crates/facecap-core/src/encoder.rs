//! Capture encoder: still image to base64 JPEG text.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbImage};
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Characters per line of the MIME-style base64 output.
pub const BASE64_LINE_LEN: usize = 76;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("invalid pixel buffer: expected {expected} bytes, got {actual}")]
    InvalidBuffer { expected: usize, actual: usize },
    #[error("jpeg encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
    #[error("jpeg encoder produced no output")]
    Empty,
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// One encoded still, as held in the latest-capture slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodedCapture {
    /// Base64 of the JPEG bytes, wrapped at 76 columns with a trailing newline.
    pub base64: String,
    pub width: u32,
    pub height: u32,
    pub jpeg_len: usize,
}

/// JPEG + base64 encoder for still captures.
#[derive(Debug, Clone, Copy)]
pub struct CaptureEncoder {
    quality: u8,
}

impl Default for CaptureEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl CaptureEncoder {
    /// Quality is clamped to 1..=100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Encode a packed RGB8 buffer. The buffer is consumed and freed on
    /// every return path.
    pub fn encode_rgb(
        &self,
        rgb: Vec<u8>,
        width: u32,
        height: u32,
    ) -> Result<EncodedCapture, EncodeError> {
        let expected = width as usize * height as usize * 3;
        let actual = rgb.len();
        let image = RgbImage::from_raw(width, height, rgb)
            .ok_or(EncodeError::InvalidBuffer { expected, actual })?;
        self.encode(image)
    }

    pub fn encode(&self, image: RgbImage) -> Result<EncodedCapture, EncodeError> {
        let (width, height) = image.dimensions();
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality).write_image(
            image.as_raw(),
            width,
            height,
            ExtendedColorType::Rgb8,
        )?;
        drop(image);

        if jpeg.is_empty() {
            return Err(EncodeError::Empty);
        }

        Ok(EncodedCapture {
            base64: wrap_lines(&STANDARD.encode(&jpeg), BASE64_LINE_LEN),
            width,
            height,
            jpeg_len: jpeg.len(),
        })
    }
}

/// Break `encoded` into `line_len`-column lines, each terminated by `\n`.
fn wrap_lines(encoded: &str, line_len: usize) -> String {
    let mut out = String::with_capacity(encoded.len() + encoded.len() / line_len + 1);
    for chunk in encoded.as_bytes().chunks(line_len) {
        // base64 output is ASCII, so any byte chunk is valid UTF-8.
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out
}

/// Decode capture text back into an image. Line breaks are ignored.
pub fn decode_capture(text: &str) -> Result<DynamicImage, EncodeError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let jpeg = STANDARD.decode(compact)?;
    Ok(image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 128])
        })
    }

    #[test]
    fn test_roundtrip_keeps_dimensions() {
        let encoded = CaptureEncoder::default().encode(gradient(64, 48)).unwrap();
        assert_eq!((encoded.width, encoded.height), (64, 48));

        let decoded = decode_capture(&encoded.base64).unwrap();
        assert_eq!(decoded.dimensions(), (64, 48));
    }

    #[test]
    fn test_output_is_jpeg() {
        let encoded = CaptureEncoder::default().encode(gradient(16, 16)).unwrap();
        let compact: String = encoded.base64.split('\n').collect();
        let bytes = STANDARD.decode(compact).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(bytes.len(), encoded.jpeg_len);
    }

    #[test]
    fn test_lines_wrapped_at_76() {
        let encoded = CaptureEncoder::default().encode(gradient(128, 128)).unwrap();
        assert!(encoded.base64.ends_with('\n'));
        let lines: Vec<&str> = encoded.base64.trim_end_matches('\n').split('\n').collect();
        assert!(lines.len() > 1);
        let (last, full) = lines.split_last().unwrap();
        assert!(full.iter().all(|l| l.len() == BASE64_LINE_LEN));
        assert!(!last.is_empty() && last.len() <= BASE64_LINE_LEN);
    }

    #[test]
    fn test_wrap_lines_exact_multiple() {
        let s = "A".repeat(152);
        let wrapped = wrap_lines(&s, 76);
        assert_eq!(wrapped, format!("{}\n{}\n", "A".repeat(76), "A".repeat(76)));
    }

    #[test]
    fn test_encode_rgb_rejects_short_buffer() {
        let err = CaptureEncoder::default().encode_rgb(vec![0; 10], 4, 4).unwrap_err();
        assert!(matches!(
            err,
            EncodeError::InvalidBuffer {
                expected: 48,
                actual: 10
            }
        ));
    }

    #[test]
    fn test_encode_rgb_roundtrip() {
        let encoded = CaptureEncoder::new(85)
            .encode_rgb(vec![200; 20 * 10 * 3], 20, 10)
            .unwrap();
        let decoded = decode_capture(&encoded.base64).unwrap();
        assert_eq!(decoded.dimensions(), (20, 10));
    }

    #[test]
    fn test_quality_clamped() {
        assert_eq!(CaptureEncoder::new(0).quality(), 1);
        assert_eq!(CaptureEncoder::new(255).quality(), 100);
        assert_eq!(CaptureEncoder::default().quality(), 85);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_capture("!!!"), Err(EncodeError::Base64(_))));
    }
}

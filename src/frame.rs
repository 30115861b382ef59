//! Captured frame container and encode-time transforms.
//!
//! - `VideoFrame`: RGB8 pixels grabbed from a live track at native resolution.
//! - `encode_data_url`: JPEG + base64 wrapping used for outbound frame messages.
//! - `decode_data_url`: the inverse, as the detection service performs it.
//!
//! Frames are transient: a frame is grabbed, optionally flipped, encoded and
//! dropped within a single scheduler tick.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use image::{codecs::jpeg::JpegEncoder, GenericImageView, RgbImage};
use std::time::Instant;

/// Prefix of every encoded frame, matching what a browser canvas produces.
pub const JPEG_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// A single captured frame (packed RGB8, row-major).
pub struct VideoFrame {
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Monotonic capture instant.
    pub captured_at: Instant,
}

impl VideoFrame {
    /// Wrap packed RGB8 pixels. Fails when the buffer does not match the dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * 3;
        if data.len() != expected {
            return Err(anyhow!(
                "rgb buffer is {} bytes, expected {} for {}x{}",
                data.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// RGB value at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y as usize) * (self.width as usize) + x as usize) * 3;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    /// Mirror the frame left-to-right in place.
    pub fn flip_horizontal(&mut self) {
        let row_len = self.width as usize * 3;
        if row_len == 0 {
            return;
        }
        for row in self.data.chunks_exact_mut(row_len) {
            let mut left = 0usize;
            let mut right = self.width as usize - 1;
            while left < right {
                for channel in 0..3 {
                    row.swap(left * 3 + channel, right * 3 + channel);
                }
                left += 1;
                right -= 1;
            }
        }
    }

    fn into_image(self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data)
            .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))
    }
}

/// Encode a frame as a `data:image/jpeg;base64,` URL.
pub fn encode_data_url(frame: VideoFrame, quality: u8) -> Result<String> {
    let image = frame.into_image()?;
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&image)
        .map_err(|err| anyhow!("jpeg encode failed: {err}"))?;

    let mut url = String::with_capacity(JPEG_DATA_URL_PREFIX.len() + buffer.len() * 4 / 3 + 4);
    url.push_str(JPEG_DATA_URL_PREFIX);
    BASE64_STANDARD.encode_string(&buffer, &mut url);
    Ok(url)
}

/// Decode an encoded image string back into a frame.
///
/// Accepts both a full data URL and a bare base64 payload; anything before the
/// first comma is treated as the data URL header.
pub fn decode_data_url(encoded: &str) -> Result<VideoFrame> {
    if encoded.is_empty() {
        return Err(anyhow!("no image data provided"));
    }
    let payload = match encoded.split_once(',') {
        Some((_, payload)) => payload,
        None => encoded,
    };
    let bytes = BASE64_STANDARD
        .decode(payload.trim())
        .context("decode base64 image")?;
    let image = image::load_from_memory(&bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    VideoFrame::from_rgb(image.into_rgb8().into_raw(), width, height)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Left half red, right half blue.
    fn split_frame(width: u32, height: u32) -> VideoFrame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _y in 0..height {
            for x in 0..width {
                if x < width / 2 {
                    data.extend_from_slice(&[250, 10, 10]);
                } else {
                    data.extend_from_slice(&[10, 10, 250]);
                }
            }
        }
        VideoFrame::from_rgb(data, width, height).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(VideoFrame::from_rgb(vec![0; 10], 4, 4).is_err());
    }

    #[test]
    fn flip_mirrors_rows() {
        let mut frame = VideoFrame::from_rgb(vec![1, 1, 1, 2, 2, 2, 3, 3, 3], 3, 1).unwrap();
        frame.flip_horizontal();
        assert_eq!(frame.pixels(), &[3, 3, 3, 2, 2, 2, 1, 1, 1]);
    }

    #[test]
    fn encoded_frame_is_a_jpeg_data_url() {
        let url = encode_data_url(split_frame(64, 32), 80).unwrap();
        assert!(url.starts_with(JPEG_DATA_URL_PREFIX));

        let decoded = decode_data_url(&url).unwrap();
        assert_eq!((decoded.width, decoded.height), (64, 32));
        let left = decoded.pixel(4, 16).unwrap();
        let right = decoded.pixel(60, 16).unwrap();
        assert!(left[0] > 200 && left[2] < 60, "left={left:?}");
        assert!(right[2] > 200 && right[0] < 60, "right={right:?}");
    }

    #[test]
    fn decode_accepts_bare_base64() {
        let url = encode_data_url(split_frame(16, 16), 90).unwrap();
        let bare = url.trim_start_matches(JPEG_DATA_URL_PREFIX);
        assert!(decode_data_url(bare).is_ok());
        assert!(decode_data_url("").is_err());
        assert!(decode_data_url("data:image/jpeg;base64,!!!").is_err());
    }
}

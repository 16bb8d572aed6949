use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, RgbImage};

use crate::error::EncodeError;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// A captured image. Pixels are stored row-major, BGR for three channels
/// and plain luminance for one. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    channels: u8,
    sequence: u64,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        channels: u8,
        sequence: u64,
        data: Vec<u8>,
    ) -> Result<Self, EncodeError> {
        let expected = width as usize * height as usize * channels as usize;
        if !matches!(channels, 1 | 3) || data.len() != expected || expected == 0 {
            return Err(EncodeError::UnsupportedLayout {
                width,
                height,
                channels,
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            sequence,
            data,
        })
    }

    /// Solid colour frame, mostly useful for tests and the test pattern.
    pub fn filled(width: u32, height: u32, sequence: u64, bgr: [u8; 3]) -> Self {
        let data = bgr
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            width,
            height,
            channels: 3,
            sequence,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Copy of the pixels for building a derived frame.
    pub(crate) fn to_pixels(&self) -> Vec<u8> {
        self.data.clone()
    }

    pub(crate) fn with_pixels(&self, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), self.data.len());
        Self {
            width: self.width,
            height: self.height,
            channels: self.channels,
            sequence: self.sequence,
            data,
        }
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<EncodedFrame, EncodeError> {
        let mut buffer = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
        match self.channels {
            3 => {
                let rgb: Vec<u8> = self
                    .data
                    .chunks_exact(3)
                    .flat_map(|bgr| [bgr[2], bgr[1], bgr[0]])
                    .collect();
                let image = RgbImage::from_raw(self.width, self.height, rgb).ok_or(
                    EncodeError::UnsupportedLayout {
                        width: self.width,
                        height: self.height,
                        channels: self.channels,
                    },
                )?;
                encoder.encode_image(&image)?;
            }
            _ => {
                let image = GrayImage::from_raw(self.width, self.height, self.data.clone())
                    .ok_or(EncodeError::UnsupportedLayout {
                        width: self.width,
                        height: self.height,
                        channels: self.channels,
                    })?;
                encoder.encode_image(&image)?;
            }
        }
        Ok(EncodedFrame {
            sequence: self.sequence,
            jpeg: Bytes::from(buffer),
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// JPEG bytes tagged with the sequence number of the frame they came from.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub sequence: u64,
    pub jpeg: Bytes,
}

/// Axis aligned rectangle fully inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// Intersect an arbitrary rectangle with the frame bounds.
    /// Returns `None` when nothing of it is visible.
    pub fn clamped(
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        frame_width: u32,
        frame_height: u32,
    ) -> Option<Self> {
        let left = x.max(0);
        let top = y.max(0);
        let right = (x + width).min(frame_width as i64);
        let bottom = (y + height).min(frame_height as i64);
        if right <= left || bottom <= top {
            return None;
        }
        Some(Self {
            x: left as u32,
            y: top as u32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        })
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center_x(&self) -> u32 {
        self.x + self.width / 2
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }
}

pub fn largest_region(regions: &[Region]) -> Option<Region> {
    regions.iter().copied().max_by_key(Region::area)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Frame::new(4, 4, 3, 1, vec![0; 47]).is_err());
        assert!(Frame::new(4, 4, 2, 1, vec![0; 32]).is_err());
        assert!(Frame::new(4, 4, 1, 1, vec![0; 16]).is_ok());
    }

    #[test]
    fn region_is_clamped_to_frame() {
        let region = Region::clamped(-10, 5, 30, 100, 64, 48).unwrap();
        assert_eq!(
            region,
            Region {
                x: 0,
                y: 5,
                width: 20,
                height: 43
            }
        );
        assert!(Region::clamped(70, 0, 10, 10, 64, 48).is_none());
        assert!(Region::clamped(0, 0, 0, 10, 64, 48).is_none());
    }

    #[test]
    fn picks_largest_region() {
        let small = Region {
            x: 0,
            y: 0,
            width: 10,
            height: 10,
        };
        let large = Region {
            x: 5,
            y: 5,
            width: 20,
            height: 30,
        };
        assert_eq!(largest_region(&[small, large]), Some(large));
        assert_eq!(largest_region(&[]), None);
        assert!(small.overlaps(&large));
        assert!(!small.overlaps(&Region {
            x: 10,
            y: 0,
            width: 5,
            height: 5
        }));
    }

    #[test]
    fn encodes_decodable_jpeg() {
        let frame = Frame::filled(32, 24, 7, [255, 0, 0]);
        let encoded = frame.encode_jpeg(DEFAULT_JPEG_QUALITY).unwrap();
        assert_eq!(encoded.sequence, 7);
        let decoded = image::load_from_memory(&encoded.jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (32, 24));
        // BGR blue ends up blue
        let pixel = decoded.get_pixel(16, 12);
        assert!(pixel[2] > 200 && pixel[0] < 50);
    }
}

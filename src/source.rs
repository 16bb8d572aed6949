use std::time::{Duration, Instant};

use crate::error::DeviceError;
use crate::frame::Frame;

/// Anything that produces frames on demand.
pub trait FrameSource: Send {
    /// `Ok(None)` is a transient empty read. Callers retry on the next
    /// iteration.
    fn next_frame(&mut self) -> Result<Option<Frame>, DeviceError>;

    fn resolution(&self) -> (u32, u32);
}

impl FrameSource for Box<dyn FrameSource> {
    fn next_frame(&mut self) -> Result<Option<Frame>, DeviceError> {
        (**self).next_frame()
    }

    fn resolution(&self) -> (u32, u32) {
        (**self).resolution()
    }
}

/// Synthetic moving gradient, paced like a camera.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame_interval: Duration,
    last_frame: Option<Instant>,
    next_sequence: u64,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Result<Self, DeviceError> {
        if width == 0 || height == 0 || fps == 0 {
            return Err(DeviceError::Unavailable(format!(
                "test pattern {width}x{height}@{fps}"
            )));
        }
        tracing::info!("Using {}x{} test pattern at {} fps", width, height, fps);
        Ok(Self {
            width,
            height,
            frame_interval: Duration::from_secs_f64(1.0 / fps as f64),
            last_frame: None,
            next_sequence: 1,
        })
    }

    fn render(&self, sequence: u64) -> Vec<u8> {
        // the pattern repeats every `width` pixels of drift
        let width = self.width as u64;
        let shift = sequence.wrapping_mul(4) % width;
        let r = (sequence.wrapping_mul(4) % 256) as u8;
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height as u64 {
            for x in 0..width {
                let b = ((x + shift) % width * 255 / width) as u8;
                let g = (y * 255 / self.height as u64) as u8;
                data.extend_from_slice(&[b, g, r]);
            }
        }
        data
    }
}

impl FrameSource for TestPatternSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, DeviceError> {
        if let Some(last) = self.last_frame {
            let elapsed = last.elapsed();
            if elapsed < self.frame_interval {
                std::thread::sleep(self.frame_interval - elapsed);
            }
        }
        self.last_frame = Some(Instant::now());

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let data = self.render(sequence);
        Frame::new(self.width, self.height, 3, sequence, data)
            .map(Some)
            .map_err(|err| DeviceError::ReadFailed(err.to_string()))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(feature = "opencv")]
pub use camera::CameraSource;

#[cfg(feature = "opencv")]
mod camera {
    use opencv::prelude::*;
    use opencv::videoio;

    use super::FrameSource;
    use crate::error::DeviceError;
    use crate::frame::Frame;

    pub struct CameraSource {
        cam: videoio::VideoCapture,
        device: i32,
        next_sequence: u64,
    }

    impl CameraSource {
        pub fn new(device: i32, resolution: Option<(u32, u32)>) -> Result<Self, DeviceError> {
            let unavailable = |err: opencv::Error| DeviceError::Unavailable(format!("{device}: {err}"));

            let mut cam = videoio::VideoCapture::new(device, videoio::CAP_ANY).map_err(unavailable)?;
            let opened = videoio::VideoCapture::is_opened(&cam).map_err(unavailable)?;
            if !opened {
                return Err(DeviceError::Unavailable(device.to_string()));
            }
            if let Some((width, height)) = resolution {
                cam.set(videoio::CAP_PROP_FRAME_WIDTH, width as f64)
                    .map_err(unavailable)?;
                cam.set(videoio::CAP_PROP_FRAME_HEIGHT, height as f64)
                    .map_err(unavailable)?;
            }
            tracing::info!("Opened camera {}", device);
            Ok(Self {
                cam,
                device,
                next_sequence: 1,
            })
        }
    }

    impl FrameSource for CameraSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, DeviceError> {
            let read_failed = |err: opencv::Error| DeviceError::ReadFailed(err.to_string());

            let mut mat = Mat::default();
            let ok = self.cam.read(&mut mat).map_err(read_failed)?;
            if !ok || mat.size().map_err(read_failed)?.width == 0 {
                return Ok(None);
            }
            let mat = if mat.is_continuous() {
                mat
            } else {
                mat.try_clone().map_err(read_failed)?
            };

            let sequence = self.next_sequence;
            self.next_sequence += 1;
            let data = mat.data_bytes().map_err(read_failed)?.to_vec();
            let frame = Frame::new(
                mat.cols() as u32,
                mat.rows() as u32,
                mat.channels() as u8,
                sequence,
                data,
            )
            .map_err(|err| DeviceError::ReadFailed(err.to_string()))?;
            Ok(Some(frame))
        }

        fn resolution(&self) -> (u32, u32) {
            let width = self.cam.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or_default();
            let height = self.cam.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or_default();
            (width as u32, height as u32)
        }
    }

    impl Drop for CameraSource {
        fn drop(&mut self) {
            if let Err(err) = self.cam.release() {
                tracing::warn!("Failed to release camera {}: {}", self.device, err);
            }
        }
    }
}

use crate::frame::{Frame, Region};

/// Local, synchronous face finder run on every frame.
pub trait RegionDetector: Send {
    fn detect(&mut self, frame: &Frame) -> anyhow::Result<Vec<Region>>;
}

#[cfg(feature = "opencv")]
pub use cascade::{frame_to_mat, jpeg_to_mat, CascadeDetector, DEFAULT_CASCADE};

#[cfg(feature = "opencv")]
mod cascade {
    use opencv::core::Vector;
    use opencv::prelude::*;
    use opencv::types::VectorOfRect;
    use opencv::{core, imgcodecs, imgproc, objdetect};

    use super::RegionDetector;
    use crate::frame::{Frame, Region};

    pub const DEFAULT_CASCADE: &str = "haarcascades/haarcascade_frontalface_default.xml";

    pub struct CascadeDetector {
        classifier: objdetect::CascadeClassifier,
    }

    impl CascadeDetector {
        /// `cascade` is either a path on disk or a name resolved through
        /// OpenCV's sample search path.
        pub fn new(cascade: &str) -> anyhow::Result<Self> {
            let xml = if std::path::Path::new(cascade).exists() {
                cascade.to_owned()
            } else {
                core::find_file_def(cascade)?
            };
            tracing::info!("Loading cascade classifier from {}", xml);
            let classifier = objdetect::CascadeClassifier::new(&xml)?;
            Ok(Self { classifier })
        }
    }

    impl RegionDetector for CascadeDetector {
        fn detect(&mut self, frame: &Frame) -> anyhow::Result<Vec<Region>> {
            let image = frame_to_mat(frame)?;
            let gray = if frame.channels() == 1 {
                image
            } else {
                convert_to_grayscale(&image)?
            };

            let mut faces = VectorOfRect::new();
            self.classifier.detect_multi_scale(
                &gray,
                &mut faces,
                1.1,
                2,
                objdetect::CASCADE_SCALE_IMAGE,
                core::Size {
                    width: 30,
                    height: 30,
                },
                core::Size {
                    width: 0,
                    height: 0,
                },
            )?;

            Ok(faces
                .iter()
                .filter_map(|face| {
                    Region::clamped(
                        face.x as i64,
                        face.y as i64,
                        face.width as i64,
                        face.height as i64,
                        frame.width(),
                        frame.height(),
                    )
                })
                .collect())
        }
    }

    pub fn convert_to_grayscale(image: &Mat) -> anyhow::Result<Mat> {
        let mut gray: Mat = Mat::default();
        imgproc::cvt_color_def(image, &mut gray, imgproc::COLOR_BGR2GRAY)?;
        Ok(gray)
    }

    /// Owned copy of the frame as an 8 bit OpenCV matrix.
    pub fn frame_to_mat(frame: &Frame) -> anyhow::Result<Mat> {
        let flat = Mat::from_slice(frame.data())?;
        let shaped = flat.reshape(frame.channels() as i32, frame.height() as i32)?;
        Ok(shaped.try_clone()?)
    }

    pub fn jpeg_to_mat(jpeg: &[u8]) -> anyhow::Result<Mat> {
        let buffer: Vector<u8> = Vector::from_slice(jpeg);
        let mat = imgcodecs::imdecode(&buffer, imgcodecs::IMREAD_COLOR)?;
        Ok(mat)
    }
}

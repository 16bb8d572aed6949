use crate::error::{KioskError, PublishError};
use crate::frame::Frame;
use crate::publish::PreviewPublisher;

/// Which sink the kiosk binary builds. The loop itself only sees a
/// `PreviewSink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PublishMode {
    /// MJPEG stream served over HTTP
    HttpStream,
    /// OpenCV window on the kiosk's own display
    LocalWindow,
    /// JPEG frames published over zenoh
    Zenoh,
}

/// Final stage of the kiosk loop: shows or ships an annotated frame.
pub trait PreviewSink: Send {
    fn present(&mut self, frame: &Frame) -> Result<(), KioskError>;
}

impl PreviewSink for Box<dyn PreviewSink> {
    fn present(&mut self, frame: &Frame) -> Result<(), KioskError> {
        (**self).present(frame)
    }
}

/// Encodes frames and hands them to the MJPEG publisher.
pub struct StreamSink {
    publisher: PreviewPublisher,
    quality: u8,
}

impl StreamSink {
    pub fn new(publisher: PreviewPublisher, quality: u8) -> Self {
        Self { publisher, quality }
    }
}

impl PreviewSink for StreamSink {
    fn present(&mut self, frame: &Frame) -> Result<(), KioskError> {
        let encoded = frame.encode_jpeg(self.quality)?;
        let report = self.publisher.publish(encoded)?;
        if report.dropped > 0 || report.evicted > 0 {
            tracing::debug!(
                "Frame {}: delivered={} dropped={} evicted={}",
                frame.sequence(),
                report.delivered,
                report.dropped,
                report.evicted
            );
        }
        Ok(())
    }
}

#[cfg(feature = "opencv")]
pub use window::LocalWindow;

#[cfg(feature = "opencv")]
mod window {
    use opencv::highgui;

    use super::PreviewSink;
    use crate::detector::frame_to_mat;
    use crate::error::{KioskError, PublishError};
    use crate::frame::Frame;

    pub struct LocalWindow {
        name: String,
    }

    impl LocalWindow {
        pub fn new(name: &str) -> anyhow::Result<Self> {
            highgui::named_window_def(name)?;
            Ok(Self {
                name: name.to_owned(),
            })
        }
    }

    impl PreviewSink for LocalWindow {
        fn present(&mut self, frame: &Frame) -> Result<(), KioskError> {
            let sink_error = |err: anyhow::Error| PublishError::Sink(err.to_string());
            let mat = frame_to_mat(frame).map_err(sink_error)?;
            highgui::imshow(&self.name, &mat).map_err(|err| sink_error(err.into()))?;
            _ = highgui::poll_key().map_err(|err| sink_error(err.into()))?;
            Ok(())
        }
    }
}

pub const DEFAULT_ZENOH_KEY: &str = "face-kiosk/preview";

#[cfg(feature = "zenoh")]
pub use zenoh_sink::{peer_config, ZenohSink};

#[cfg(feature = "zenoh")]
mod zenoh_sink {
    use std::sync::Arc;

    use zenoh::prelude::sync::*;
    use zenoh::publication::Publisher;
    use zenoh_config::EndPoint;

    use super::PreviewSink;
    use crate::error::{ErrorWrapper, KioskError, PublishError};
    use crate::frame::Frame;

    /// Peer config with optional explicit endpoints, shared by the kiosk and
    /// the preview viewer.
    pub fn peer_config(connect: &[EndPoint], listen: &[EndPoint]) -> Config {
        let mut config = Config::default();
        if !listen.is_empty() {
            config.listen.endpoints = listen.to_vec();
            tracing::info!("Configured listening endpoints {:?}", config.listen.endpoints);
        }
        if !connect.is_empty() {
            config.connect.endpoints = connect.to_vec();
            tracing::info!("Configured connect endpoints {:?}", config.connect.endpoints);
        }
        config
    }

    /// Publishes annotated JPEGs on a zenoh key expression.
    pub struct ZenohSink {
        publisher: Publisher<'static>,
        _session: Arc<Session>,
        quality: u8,
    }

    impl ZenohSink {
        pub fn new(zenoh_config: Config, key: &str, quality: u8) -> anyhow::Result<Self> {
            let session = zenoh::open(zenoh_config)
                .res()
                .map_err(ErrorWrapper::ZenohError)?
                .into_arc();

            let publisher = session
                .declare_publisher(key.to_owned())
                .congestion_control(CongestionControl::Drop)
                .priority(Priority::InteractiveHigh)
                .res()
                .map_err(ErrorWrapper::ZenohError)?;
            tracing::info!("Publishing preview frames on {}", key);

            Ok(Self {
                publisher,
                _session: session,
                quality,
            })
        }
    }

    impl PreviewSink for ZenohSink {
        fn present(&mut self, frame: &Frame) -> Result<(), KioskError> {
            let encoded = frame.encode_jpeg(self.quality)?;
            self.publisher
                .put(encoded.jpeg.to_vec())
                .res()
                .map_err(|err| PublishError::Sink(ErrorWrapper::ZenohError(err).to_string()))?;
            Ok(())
        }
    }
}

/// Keeps the frames it is given, for tests and headless runs.
#[derive(Default)]
pub struct MemorySink {
    pub frames: Vec<Frame>,
}

impl PreviewSink for MemorySink {
    fn present(&mut self, frame: &Frame) -> Result<(), KioskError> {
        if let Some(last) = self.frames.last() {
            if frame.sequence() <= last.sequence() {
                return Err(PublishError::OutOfOrder {
                    sequence: frame.sequence(),
                    last: last.sequence(),
                }
                .into());
            }
        }
        self.frames.push(frame.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_sink_publishes_jpeg() {
        let publisher = PreviewPublisher::default();
        let mut subscription = publisher.subscribe();
        let mut sink = StreamSink::new(publisher.clone(), 70);

        sink.present(&Frame::filled(16, 16, 4, [0, 128, 255])).unwrap();

        let frame = subscription.try_recv().unwrap();
        assert_eq!(frame.sequence, 4);
        assert_eq!(&frame.jpeg[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn publish_modes_parse_from_cli_names() {
        use clap::ValueEnum;
        assert_eq!(PublishMode::from_str("http-stream", false), Ok(PublishMode::HttpStream));
        assert_eq!(PublishMode::from_str("local-window", false), Ok(PublishMode::LocalWindow));
        assert_eq!(PublishMode::from_str("zenoh", false), Ok(PublishMode::Zenoh));
        assert!(PublishMode::from_str("window", false).is_err());
    }

    #[test]
    fn stream_sink_reports_out_of_order() {
        let mut sink = StreamSink::new(PreviewPublisher::default(), 70);
        sink.present(&Frame::filled(8, 8, 2, [0, 0, 0])).unwrap();
        let err = sink.present(&Frame::filled(8, 8, 1, [0, 0, 0])).unwrap_err();
        assert!(matches!(err, KioskError::Publish(PublishError::OutOfOrder { .. })));
    }
}

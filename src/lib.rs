pub mod annotate;
pub mod cache;
pub mod detector;
pub mod error;
pub mod frame;
pub mod kiosk;
pub mod label;
pub mod mjpeg;
pub mod publish;
pub mod recognition;
pub mod server;
pub mod sink;
pub mod source;
pub mod speech;

pub use annotate::Annotator;
pub use cache::{DetectionCache, SessionId};
pub use detector::RegionDetector;
pub use error::{
    DeviceError, EncodeError, KioskError, PublishError, RecognitionError, SpeechSynthesisError,
};
pub use frame::{EncodedFrame, Frame, Region};
pub use kiosk::{FrameReport, KioskConfig, KioskLoop, KioskState, LatestFrame, StepOutcome};
pub use label::{FaceLookup, LabelPolicy, LabelProfile};
pub use publish::{PreviewPublisher, PublisherConfig, Subscription};
pub use recognition::{Detection, FaceboxClient, RecognitionClient, RecognitionResult};
pub use sink::{MemorySink, PreviewSink, PublishMode, StreamSink};
pub use source::{FrameSource, TestPatternSource};
pub use speech::{
    HttpSpeechClient, PollySpeechClient, SpeechConfig, SpeechSynthesizer, SynthesizedSpeech,
};

#[cfg(feature = "opencv")]
pub use detector::CascadeDetector;
#[cfg(feature = "opencv")]
pub use sink::LocalWindow;
#[cfg(feature = "opencv")]
pub use source::CameraSource;
#[cfg(feature = "zenoh")]
pub use error::ErrorWrapper;
#[cfg(feature = "zenoh")]
pub use sink::ZenohSink;

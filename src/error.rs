use thiserror::Error;

/// Camera could not be opened or stopped producing frames.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Camera device {0} unavailable")]
    Unavailable(String),
    #[error("Camera read failed: {0}")]
    ReadFailed(String),
}

/// Frame could not be serialized to JPEG.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Unsupported frame layout {width}x{height} with {channels} channels")]
    UnsupportedLayout {
        width: u32,
        height: u32,
        channels: u8,
    },
    #[error("JPEG encode failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Remote recognition call failed. The kiosk loop treats all of these as
/// "no detections".
#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("Recognition service unavailable: {0}")]
    Unavailable(String),
    #[error("Recognition request timed out")]
    Timeout,
    #[error("Malformed recognition response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for RecognitionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RecognitionError::Timeout
        } else if err.is_decode() {
            RecognitionError::Malformed(err.to_string())
        } else {
            RecognitionError::Unavailable(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Subscriber {0} disconnected")]
    Disconnected(u64),
    #[error("Subscriber {id} stalled for {stalled_ms}ms")]
    Stalled { id: u64, stalled_ms: u128 },
    #[error("Frame {sequence} is not newer than last published frame {last}")]
    OutOfOrder { sequence: u64, last: u64 },
    #[error("Preview sink failed: {0}")]
    Sink(String),
}

#[derive(Error, Debug)]
pub enum SpeechSynthesisError {
    #[error("Speech service unavailable: {0}")]
    Unavailable(String),
    #[error("Speech service rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("Audio stream interrupted: {0}")]
    Stream(String),
}

impl From<reqwest::Error> for SpeechSynthesisError {
    fn from(err: reqwest::Error) -> Self {
        SpeechSynthesisError::Unavailable(err.to_string())
    }
}

/// Everything a single kiosk loop iteration can fail with.
#[derive(Error, Debug)]
pub enum KioskError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Recognition(#[from] RecognitionError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("{0} requires the `{1}` feature")]
    Unsupported(&'static str, &'static str),
}

#[cfg(feature = "zenoh")]
#[derive(Error, Debug)]
pub enum ErrorWrapper {
    #[error("Zenoh error {0:?}")]
    ZenohError(#[from] zenoh::Error),
}

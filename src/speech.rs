use std::future::Future;
use std::time::Duration;

use aws_sdk_polly::config::http::HttpResponse;
use aws_sdk_polly::error::{DisplayErrorContext, SdkError};
use aws_sdk_polly::operation::synthesize_speech::SynthesizeSpeechError;
use aws_sdk_polly::types::{OutputFormat, VoiceId};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;

use crate::error::SpeechSynthesisError;

pub const GREETING: &str = "welcome";

pub fn greeting(name: &str) -> String {
    format!("{GREETING} {name}")
}

/// Audio produced by a speech service, streamed as it arrives.
pub struct SynthesizedSpeech {
    pub content_type: String,
    pub audio: BoxStream<'static, Result<Bytes, SpeechSynthesisError>>,
}

pub trait SpeechSynthesizer: Send + Sync + 'static {
    fn synthesize(
        &self,
        text: String,
    ) -> impl Future<Output = Result<SynthesizedSpeech, SpeechSynthesisError>> + Send;
}

/// Voice settings shared by every backend. `endpoint` is only used by
/// `HttpSpeechClient`.
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub endpoint: String,
    pub voice: String,
    pub format: String,
    pub timeout: Duration,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:5002/synthesize".to_owned(),
            voice: "Nicole".to_owned(),
            format: "mp3".to_owned(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Amazon Polly, credentials and region from the shared AWS config.
#[derive(Clone)]
pub struct PollySpeechClient {
    client: aws_sdk_polly::Client,
    voice: VoiceId,
    format: OutputFormat,
}

impl PollySpeechClient {
    pub fn new(client: aws_sdk_polly::Client, config: &SpeechConfig) -> Self {
        Self {
            client,
            voice: VoiceId::from(config.voice.as_str()),
            format: OutputFormat::from(config.format.as_str()),
        }
    }

    /// Load credentials the usual way: environment, profile files, then
    /// instance metadata.
    pub async fn from_env(config: &SpeechConfig) -> Self {
        let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        tracing::info!(
            "Using Polly voice {} in region {:?}",
            config.voice,
            shared.region()
        );
        Self::new(aws_sdk_polly::Client::new(&shared), config)
    }
}

fn polly_error(err: SdkError<SynthesizeSpeechError, HttpResponse>) -> SpeechSynthesisError {
    match &err {
        SdkError::ServiceError(service) => SpeechSynthesisError::Rejected {
            status: service.raw().status().as_u16(),
            message: DisplayErrorContext(service.err()).to_string(),
        },
        _ => SpeechSynthesisError::Unavailable(DisplayErrorContext(&err).to_string()),
    }
}

impl SpeechSynthesizer for PollySpeechClient {
    async fn synthesize(&self, text: String) -> Result<SynthesizedSpeech, SpeechSynthesisError> {
        let output = self
            .client
            .synthesize_speech()
            .text(text)
            .voice_id(self.voice.clone())
            .output_format(self.format.clone())
            .send()
            .await
            .map_err(polly_error)?;

        let content_type = output
            .content_type()
            .map(str::to_owned)
            .unwrap_or_else(|| default_content_type(self.format.as_str()));
        let audio = futures::stream::unfold(output.audio_stream, |mut body| async move {
            let chunk = body.next().await?;
            Some((
                chunk.map_err(|err| SpeechSynthesisError::Stream(err.to_string())),
                body,
            ))
        })
        .boxed();

        Ok(SynthesizedSpeech {
            content_type,
            audio,
        })
    }
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice: &'a str,
    format: &'a str,
}

/// Text-to-speech over a JSON HTTP endpoint that answers with raw audio.
/// Stands in for Polly when testing against a local speech server.
#[derive(Clone)]
pub struct HttpSpeechClient {
    http: reqwest::Client,
    config: SpeechConfig,
}

impl HttpSpeechClient {
    pub fn new(config: SpeechConfig) -> Result<Self, SpeechSynthesisError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()?;
        Ok(Self { http, config })
    }
}

fn default_content_type(format: &str) -> String {
    match format {
        "mp3" => "audio/mpeg".to_owned(),
        "ogg_vorbis" | "ogg" => "audio/ogg".to_owned(),
        "pcm" => "audio/pcm".to_owned(),
        other => format!("audio/{other}"),
    }
}

impl SpeechSynthesizer for HttpSpeechClient {
    async fn synthesize(&self, text: String) -> Result<SynthesizedSpeech, SpeechSynthesisError> {
        let request = SynthesizeRequest {
            text: &text,
            voice: &self.config.voice,
            format: &self.config.format,
        };
        let response = self
            .http
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SpeechSynthesisError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| default_content_type(&self.config.format));
        let audio = response
            .bytes_stream()
            .map_err(|err| SpeechSynthesisError::Stream(err.to_string()))
            .boxed();

        Ok(SynthesizedSpeech {
            content_type,
            audio,
        })
    }
}

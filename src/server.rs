//! HTTP surface of the kiosk: live preview, face lookup and spoken greeting.
//!
//! Endpoints:
//! - GET /camera - MJPEG stream of annotated frames
//! - GET /camera.jpg - latest annotated frame
//! - GET /face - recognize whoever is in front of the camera right now
//! - GET /audio/name/:name - spoken "welcome <name>"
//! - GET /health - returns "ok"

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;

use crate::kiosk::LatestFrame;
use crate::label::LabelPolicy;
use crate::mjpeg;
use crate::publish::PreviewPublisher;
use crate::recognition::RecognitionClient;
use crate::speech::{greeting, SpeechSynthesizer};

/// Shared state behind every handler.
pub struct AppState<R, S> {
    pub publisher: PreviewPublisher,
    pub latest: LatestFrame,
    pub recognizer: Arc<R>,
    pub speech: Arc<S>,
    pub policy: Arc<LabelPolicy>,
    pub jpeg_quality: u8,
}

impl<R, S> Clone for AppState<R, S> {
    fn clone(&self) -> Self {
        Self {
            publisher: self.publisher.clone(),
            latest: self.latest.clone(),
            recognizer: self.recognizer.clone(),
            speech: self.speech.clone(),
            policy: self.policy.clone(),
            jpeg_quality: self.jpeg_quality,
        }
    }
}

pub fn router<R, S>(state: AppState<R, S>) -> Router
where
    R: RecognitionClient,
    S: SpeechSynthesizer,
{
    Router::new()
        .route("/camera", get(camera_stream::<R, S>))
        .route("/camera.jpg", get(camera_snapshot::<R, S>))
        .route("/face", get(face::<R, S>))
        .route("/audio/name/:name", get(audio_greeting::<R, S>))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve until `shutdown` resolves. Close the publisher first so open
/// preview streams end, otherwise the graceful shutdown waits on them.
pub async fn serve<R, S>(
    listener: TcpListener,
    state: AppState<R, S>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()>
where
    R: RecognitionClient,
    S: SpeechSynthesizer,
{
    tracing::info!("Serving kiosk on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn camera_stream<R, S>(State(state): State<AppState<R, S>>) -> Response
where
    R: RecognitionClient,
    S: SpeechSynthesizer,
{
    let subscription = state.publisher.subscribe();
    (
        [
            (header::CONTENT_TYPE, mjpeg::content_type()),
            (header::CACHE_CONTROL, "no-cache".to_owned()),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_owned()),
        ],
        Body::from_stream(mjpeg::stream(subscription)),
    )
        .into_response()
}

async fn camera_snapshot<R, S>(State(state): State<AppState<R, S>>) -> Response
where
    R: RecognitionClient,
    S: SpeechSynthesizer,
{
    match state.publisher.latest() {
        Some(frame) => ([(header::CONTENT_TYPE, "image/jpeg")], frame.jpeg).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn face<R, S>(State(state): State<AppState<R, S>>) -> Response
where
    R: RecognitionClient,
    S: SpeechSynthesizer,
{
    let Some(frame) = state.latest.load() else {
        tracing::warn!("Face lookup before the first frame was captured");
        return (StatusCode::SERVICE_UNAVAILABLE, "No frame captured yet").into_response();
    };
    let encoded = match frame.encode_jpeg(state.jpeg_quality) {
        Ok(encoded) => encoded,
        Err(err) => {
            tracing::error!("Unable to encode frame {}: {}", frame.sequence(), err);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error encoding frame").into_response();
        }
    };

    let name = match state.recognizer.check(encoded.jpeg).await {
        Ok(faces) => faces.into_iter().next().map(|face| face.name).unwrap_or_default(),
        Err(err) => {
            tracing::warn!("Unable to recognize face: {}", err);
            String::new()
        }
    };
    let lookup = state.policy.lookup(&name);
    tracing::info!("Frame {} is {:?}", frame.sequence(), lookup);

    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(lookup),
    )
        .into_response()
}

async fn audio_greeting<R, S>(
    State(state): State<AppState<R, S>>,
    Path(name): Path<String>,
) -> Response
where
    R: RecognitionClient,
    S: SpeechSynthesizer,
{
    tracing::info!("Generating text-to-speech for the name {}", name);
    match state.speech.synthesize(greeting(&name)).await {
        Ok(speech) => (
            [(header::CONTENT_TYPE, speech.content_type)],
            Body::from_stream(speech.audio),
        )
            .into_response(),
        Err(err) => {
            tracing::error!("Error calling speech synthesis: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!(
                    "Error synthesizing text {}",
                    StatusCode::INTERNAL_SERVER_ERROR
                        .canonical_reason()
                        .unwrap_or_default()
                ),
            )
                .into_response()
        }
    }
}

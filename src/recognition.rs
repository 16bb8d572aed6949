use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use crate::error::RecognitionError;
use crate::frame::Region;

/// One recognized (or unrecognized) face.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Empty when the service saw a face it does not know.
    pub name: String,
    pub id: String,
    pub region: Option<Region>,
}

impl Detection {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: String::new(),
            region: None,
        }
    }

    pub fn unknown(region: Region) -> Self {
        Self {
            name: String::new(),
            id: String::new(),
            region: Some(region),
        }
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    pub fn is_known(&self) -> bool {
        !self.name.is_empty()
    }
}

/// Outcome of a completed recognition request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionResult {
    /// Sequence number of the frame the request was issued for.
    pub issued_for: u64,
    pub detections: Vec<Detection>,
}

/// Remote face recognition service.
pub trait RecognitionClient: Send + Sync + 'static {
    fn check(
        &self,
        jpeg: Bytes,
    ) -> impl Future<Output = Result<Vec<Detection>, RecognitionError>> + Send;
}

pub const DEFAULT_FACEBOX_URL: &str = "http://localhost:8080";

/// Client for a Facebox compatible `/facebox/check` endpoint.
#[derive(Clone)]
pub struct FaceboxClient {
    http: reqwest::Client,
    check_url: String,
}

impl FaceboxClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RecognitionError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RecognitionError::Unavailable(err.to_string()))?;
        Ok(Self {
            http,
            check_url: format!("{}/facebox/check", base_url.trim_end_matches('/')),
        })
    }
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    faces: Vec<FaceboxFace>,
}

#[derive(Debug, Deserialize)]
struct FaceboxFace {
    rect: FaceboxRect,
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    matched: bool,
}

#[derive(Debug, Deserialize)]
struct FaceboxRect {
    top: i64,
    left: i64,
    width: i64,
    height: i64,
}

impl From<FaceboxFace> for Detection {
    fn from(face: FaceboxFace) -> Self {
        // the service may report faces cut by the image border
        let region = Region::clamped(
            face.rect.left,
            face.rect.top,
            face.rect.width,
            face.rect.height,
            u32::MAX,
            u32::MAX,
        );
        let name = if face.matched { face.name } else { String::new() };
        Detection {
            name,
            id: face.id,
            region,
        }
    }
}

fn parse_check_response(body: &[u8]) -> Result<Vec<Detection>, RecognitionError> {
    let response: CheckResponse = serde_json::from_slice(body)
        .map_err(|err| RecognitionError::Malformed(err.to_string()))?;
    if !response.success {
        return Err(RecognitionError::Unavailable(
            response.error.unwrap_or_else(|| "check was not successful".to_owned()),
        ));
    }
    Ok(response.faces.into_iter().map(Detection::from).collect())
}

impl RecognitionClient for FaceboxClient {
    async fn check(&self, jpeg: Bytes) -> Result<Vec<Detection>, RecognitionError> {
        let part = Part::stream(jpeg)
            .file_name("frame.jpg")
            .mime_str("image/jpeg")?;
        let form = Form::new().part("file", part);

        let response = self.http.post(&self.check_url).multipart(form).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(RecognitionError::Unavailable(format!(
                "{} returned {}",
                self.check_url, status
            )));
        }
        parse_check_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_matched_and_unmatched_faces() {
        let body = br#"{
            "success": true,
            "facesCount": 2,
            "faces": [
                {"rect": {"top": 10, "left": 20, "width": 30, "height": 40},
                 "id": "amy.jpg", "name": "Amy", "matched": true, "confidence": 0.9},
                {"rect": {"top": -5, "left": 0, "width": 10, "height": 10},
                 "id": "", "name": "", "matched": false}
            ]
        }"#;
        let detections = parse_check_response(body).unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].name, "Amy");
        assert_eq!(
            detections[0].region,
            Some(Region {
                x: 20,
                y: 10,
                width: 30,
                height: 40
            })
        );
        assert!(!detections[1].is_known());
        // only the visible part of a face cut by the top edge is kept
        assert_eq!(
            detections[1].region,
            Some(Region {
                x: 0,
                y: 0,
                width: 10,
                height: 5
            })
        );
    }

    #[test]
    fn unmatched_name_is_blanked() {
        let body = br#"{"success": true, "faces": [
            {"rect": {"top": 0, "left": 0, "width": 5, "height": 5}, "name": "guess", "matched": false}
        ]}"#;
        let detections = parse_check_response(body).unwrap();
        assert_eq!(detections[0].name, "");
    }

    #[test]
    fn failure_and_garbage_are_errors() {
        let failed = parse_check_response(br#"{"success": false, "error": "no key"}"#);
        assert!(matches!(failed, Err(RecognitionError::Unavailable(msg)) if msg == "no key"));
        let garbage = parse_check_response(b"<html>");
        assert!(matches!(garbage, Err(RecognitionError::Malformed(_))));
    }
}

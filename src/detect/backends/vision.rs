#![cfg(feature = "backend-vision")]

use std::io::{Cursor, ErrorKind};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use serde_json::{json, Value};

use crate::config::VisionSettings;
use crate::detect::backend::{DetectError, FrameDetector, FrameInput};
use crate::detect::vision_response::{parse_vision_report, SURFACE_PROMPT};
use crate::DetectedSurface;

const UPLOAD_JPEG_QUALITY: u8 = 85;
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Hosted vision-language model strategy (Gemini `generateContent` API).
///
/// Each frame is downscaled, JPEG-encoded and sent inline with a fixed prompt
/// that asks for JSON. HTTP failures are mapped onto `DetectError` so the
/// orchestrator's retry policy can tell transient from permanent ones.
pub struct VisionModelBackend {
    agent: ureq::Agent,
    url: String,
    api_key: String,
    max_dimension: u32,
}

impl VisionModelBackend {
    pub fn new(settings: &VisionSettings, api_key: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(anyhow!("vision API key is empty"));
        }
        let endpoint = url::Url::parse(&settings.endpoint)
            .with_context(|| format!("invalid vision endpoint '{}'", settings.endpoint))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(anyhow!(
                "vision endpoint must be http(s), got '{}'",
                endpoint.scheme()
            ));
        }
        let url = format!(
            "{}/{}:generateContent",
            settings.endpoint.trim_end_matches('/'),
            settings.model
        );
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        Ok(Self {
            agent,
            url,
            api_key: api_key.trim().to_string(),
            max_dimension: settings.max_dimension,
        })
    }

    fn call(&self, body: &Value) -> Result<Value, DetectError> {
        let response = self
            .agent
            .post(&self.url)
            .set("x-goog-api-key", &self.api_key)
            .send_json(body);
        match response {
            Ok(response) => response
                .into_json::<Value>()
                .map_err(|e| DetectError::Malformed(format!("response body: {}", e))),
            Err(ureq::Error::Status(status, response)) => {
                let message = response.into_string().unwrap_or_default();
                Err(status_error(status, &message))
            }
            Err(ureq::Error::Transport(transport)) => Err(transport_error(&transport)),
        }
    }
}

/// Downscale and encode a frame for upload.
pub fn encode_frame(path: &Path, max_dimension: u32) -> Result<String, DetectError> {
    let image = image::open(path)
        .map_err(|e| DetectError::Image(format!("{}: {}", path.display(), e)))?;
    let image = if image.width() > max_dimension || image.height() > max_dimension {
        image.thumbnail(max_dimension, max_dimension)
    } else {
        image
    };
    let rgb = image.to_rgb8();
    let mut jpeg = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut jpeg, UPLOAD_JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| DetectError::Image(format!("jpeg encode: {}", e)))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(jpeg.into_inner()))
}

pub fn request_body(jpeg_base64: &str) -> Value {
    json!({
        "contents": [{
            "parts": [
                {"text": SURFACE_PROMPT},
                {"inline_data": {"mime_type": "image/jpeg", "data": jpeg_base64}}
            ]
        }],
        "generationConfig": {
            "temperature": 0.1,
            "responseMimeType": "application/json"
        }
    })
}

/// Concatenated text parts of the first candidate.
pub fn response_text(body: &Value) -> Result<String, DetectError> {
    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            let reason = body
                .pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
                .unwrap_or("no candidates");
            DetectError::Malformed(format!("model returned no content ({})", reason))
        })?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.trim().is_empty() {
        return Err(DetectError::Malformed("model returned empty text".to_string()));
    }
    Ok(text)
}

pub fn status_error(status: u16, body: &str) -> DetectError {
    let message: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    match status {
        401 | 403 => DetectError::Unauthorized(message),
        408 => DetectError::Timeout,
        429 => DetectError::RateLimited(message),
        500..=599 => DetectError::Server { status, message },
        _ => DetectError::Rejected { status, message },
    }
}

fn transport_error(transport: &ureq::Transport) -> DetectError {
    let timed_out = std::error::Error::source(transport)
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .is_some_and(|io| matches!(io.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock));
    if timed_out {
        DetectError::Timeout
    } else {
        DetectError::Transport(transport.to_string())
    }
}

impl FrameDetector for VisionModelBackend {
    fn name(&self) -> &'static str {
        "vision"
    }

    fn detect(&mut self, frame: &FrameInput<'_>) -> Result<Vec<DetectedSurface>, DetectError> {
        let encoded = encode_frame(frame.path, self.max_dimension)?;
        let body = self.call(&request_body(&encoded))?;
        let report = parse_vision_report(&response_text(&body)?)?;
        Ok(report.into_surfaces(frame.video_id, frame.timestamp_secs))
    }
}

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::warn;

use crate::dispatch::failure::OperationFailure;
use crate::dispatch::runner::ExecutionOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
}

impl ImagePayload {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let mime = sniff_image_mime(bytes.as_slice());
        Self { bytes, mime }
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.bytes.as_slice())
    }
}

/// Successful result of an operation. Consumers match on all three variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    Image(ImagePayload),
    Text(String),
    /// Unstructured stdout, or the string under an `output` key, whose
    /// meaning depends on the operation.
    Raw(String),
}

impl OperationResult {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Image(_) => "image",
            Self::Text(_) => "text",
            Self::Raw(_) => "raw",
        }
    }
}

impl Serialize for OperationResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Image(payload) => {
                let mut state = serializer.serialize_struct("OperationResult", 3)?;
                state.serialize_field("kind", "image")?;
                state.serialize_field("image", payload.to_base64().as_str())?;
                state.serialize_field("mime", &payload.mime)?;
                state.end()
            }
            Self::Text(text) => {
                let mut state = serializer.serialize_struct("OperationResult", 2)?;
                state.serialize_field("kind", "text")?;
                state.serialize_field("text", text)?;
                state.end()
            }
            Self::Raw(output) => {
                let mut state = serializer.serialize_struct("OperationResult", 2)?;
                state.serialize_field("kind", "raw")?;
                state.serialize_field("output", output)?;
                state.end()
            }
        }
    }
}

pub fn normalize_outcome(outcome: ExecutionOutcome) -> Result<OperationResult, OperationFailure> {
    let ExecutionOutcome {
        exit_code,
        stdout,
        stderr,
    } = outcome;

    if exit_code != 0 {
        let stderr = String::from_utf8_lossy(stderr.as_slice());
        let stderr = stderr.trim();
        let message = if stderr.is_empty() {
            format!("process exited with code {exit_code}")
        } else {
            stderr.to_string()
        };
        return Err(OperationFailure::execution(exit_code, message));
    }

    let stdout = String::from_utf8_lossy(stdout.as_slice());
    let trimmed = stdout.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Ok(interpret_payload_map(&map, trimmed)),
        _ => Ok(OperationResult::Raw(trimmed.to_string())),
    }
}

/// Malformed structured output never fails the call; it degrades to `Raw`.
fn interpret_payload_map(map: &Map<String, Value>, trimmed_stdout: &str) -> OperationResult {
    if let Some(encoded) = map.get("image").and_then(Value::as_str) {
        return match BASE64_STANDARD.decode(strip_data_url(encoded)) {
            Ok(bytes) => OperationResult::Image(ImagePayload::from_bytes(bytes)),
            Err(error) => {
                warn!(error = %error, "image payload is not valid base64, returning raw output");
                OperationResult::Raw(trimmed_stdout.to_string())
            }
        };
    }
    if let Some(text) = map.get("text").and_then(Value::as_str) {
        return OperationResult::Text(text.to_string());
    }
    if let Some(output) = map.get("output").and_then(Value::as_str) {
        return OperationResult::Raw(output.to_string());
    }
    OperationResult::Raw(trimmed_stdout.to_string())
}

/// Bare base64 body of `data:<mime>;base64,<body>`; other input is returned
/// trimmed.
pub(crate) fn strip_data_url(encoded: &str) -> &str {
    let encoded = encoded.trim();
    match encoded.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest.trim(),
        _ => encoded,
    }
}

pub(crate) fn sniff_image_mime(bytes: &[u8]) -> Option<String> {
    image::guess_format(bytes)
        .ok()
        .map(|format| format.to_mime_type().to_string())
}

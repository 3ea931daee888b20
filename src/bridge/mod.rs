//! Narrow, allow-listed entry point for UI-originated operation calls.
//!
//! Callers name an operation the way the UI does (`resizeImage`, `removeBg`,
//! ...) and pass a flat JSON parameter object. Nothing outside the allow-list
//! reaches the dispatcher, and parameters are copied into owned request
//! values before any work starts.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::DispatchSettings;
use crate::dispatch::normalize::strip_data_url;
use crate::dispatch::registry::RegistryError;
use crate::dispatch::remote::HttpRemoteImageService;
use crate::dispatch::{
    Dispatcher, InputRef, OperationCommandRunner, OperationFailure, OperationName,
    OperationRegistry, OperationRequest, OperationResult, StdOperationCommandRunner,
};

const DEFAULT_UPSCALE_FACTOR: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOperation {
    ResizeImage,
    GenerativeFill,
    RemoveBg,
    Cleanup,
    Upscale,
    ExtractText,
}

impl BridgeOperation {
    pub const ALL: [Self; 6] = [
        Self::ResizeImage,
        Self::GenerativeFill,
        Self::RemoveBg,
        Self::Cleanup,
        Self::Upscale,
        Self::ExtractText,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResizeImage => "resizeImage",
            Self::GenerativeFill => "generativeFill",
            Self::RemoveBg => "removeBg",
            Self::Cleanup => "cleanup",
            Self::Upscale => "upscale",
            Self::ExtractText => "extractText",
        }
    }

    pub fn operation(self) -> OperationName {
        match self {
            Self::ResizeImage => OperationName::Resize,
            Self::GenerativeFill => OperationName::GenerativeFill,
            Self::RemoveBg => OperationName::RemoveBackground,
            Self::Cleanup => OperationName::Cleanup,
            Self::Upscale => OperationName::Upscale,
            Self::ExtractText => OperationName::ExtractText,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    #[error("invalid arguments for '{operation}': {message}")]
    InvalidArguments {
        operation: &'static str,
        message: String,
    },
    #[error(transparent)]
    Failed(#[from] OperationFailure),
    #[error("internal bridge error: {0}")]
    Internal(String),
}

impl BridgeError {
    fn invalid(operation: BridgeOperation, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            operation: operation.as_str(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ResizeParams {
    image_path: Option<String>,
    image_base64: Option<String>,
    #[serde(default, deserialize_with = "integer_or_string")]
    width: Option<i64>,
    #[serde(default, deserialize_with = "integer_or_string")]
    height: Option<i64>,
    #[serde(default)]
    expand: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GenerativeFillParams {
    image_path: Option<String>,
    image_base64: Option<String>,
    prompt: Option<String>,
    mask_path: Option<String>,
    mask_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CleanupParams {
    image_path: Option<String>,
    image_base64: Option<String>,
    mask_path: Option<String>,
    mask_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct UpscaleParams {
    image_path: Option<String>,
    image_base64: Option<String>,
    #[serde(default, deserialize_with = "integer_or_string")]
    scale: Option<i64>,
}

/// Shared by `removeBg` and `extractText`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ImageOnlyParams {
    image_path: Option<String>,
    image_base64: Option<String>,
}

/// Validates `params` for the named operation and turns them into an owned
/// dispatcher request.
pub fn build_request(name: &str, params: Value) -> Result<OperationRequest, BridgeError> {
    let op = BridgeOperation::parse(name)
        .ok_or_else(|| BridgeError::UnknownOperation(name.to_string()))?;
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };

    let request = match op {
        BridgeOperation::ResizeImage => {
            let p: ResizeParams = decode_params(op, params)?;
            let input = primary_input(op, p.image_path, p.image_base64)?;
            let width = positive(op, "width", p.width)?
                .ok_or_else(|| BridgeError::invalid(op, "width is required"))?;
            let height = positive(op, "height", p.height)?
                .ok_or_else(|| BridgeError::invalid(op, "height is required"))?;
            OperationRequest::new(op.operation(), input)
                .with_param("width", width)
                .with_param("height", height)
                .with_param("expand", p.expand)
        }
        BridgeOperation::GenerativeFill => {
            let p: GenerativeFillParams = decode_params(op, params)?;
            let input = primary_input(op, p.image_path, p.image_base64)?;
            let prompt = p
                .prompt
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| BridgeError::invalid(op, "prompt is required"))?;
            let request =
                OperationRequest::new(op.operation(), input).with_param("prompt", prompt);
            match mask_input(op, p.mask_path, p.mask_base64)? {
                Some(mask) => request.with_secondary_input(mask),
                None => request,
            }
        }
        BridgeOperation::Cleanup => {
            let p: CleanupParams = decode_params(op, params)?;
            let input = primary_input(op, p.image_path, p.image_base64)?;
            let mask = mask_input(op, p.mask_path, p.mask_base64)?
                .ok_or_else(|| BridgeError::invalid(op, "maskPath or maskBase64 is required"))?;
            OperationRequest::new(op.operation(), input).with_secondary_input(mask)
        }
        BridgeOperation::Upscale => {
            let p: UpscaleParams = decode_params(op, params)?;
            let input = primary_input(op, p.image_path, p.image_base64)?;
            let scale = positive(op, "scale", p.scale)?.unwrap_or(DEFAULT_UPSCALE_FACTOR);
            OperationRequest::new(op.operation(), input).with_param("scale", scale)
        }
        BridgeOperation::RemoveBg | BridgeOperation::ExtractText => {
            let p: ImageOnlyParams = decode_params(op, params)?;
            let input = primary_input(op, p.image_path, p.image_base64)?;
            OperationRequest::new(op.operation(), input)
        }
    };
    Ok(request)
}

fn decode_params<T>(op: BridgeOperation, params: Value) -> Result<T, BridgeError>
where
    T: DeserializeOwned,
{
    if !params.is_object() {
        return Err(BridgeError::invalid(op, "parameters must be a JSON object"));
    }
    serde_json::from_value(params).map_err(|e| BridgeError::invalid(op, e.to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntegerOrString {
    Integer(i64),
    Text(String),
}

/// UI form fields arrive as strings (`"640"`); an empty string counts as
/// absent.
fn integer_or_string<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<IntegerOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(IntegerOrString::Integer(value)) => Ok(Some(value)),
        Some(IntegerOrString::Text(raw)) => {
            let raw = raw.trim();
            if raw.is_empty() {
                return Ok(None);
            }
            raw.parse::<i64>()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("expected an integer, got \"{raw}\"")))
        }
    }
}

fn positive(
    op: BridgeOperation,
    field: &str,
    value: Option<i64>,
) -> Result<Option<i64>, BridgeError> {
    match value {
        Some(v) if v <= 0 => Err(BridgeError::invalid(
            op,
            format!("{field} must be a positive integer"),
        )),
        other => Ok(other),
    }
}

fn primary_input(
    op: BridgeOperation,
    image_path: Option<String>,
    image_base64: Option<String>,
) -> Result<InputRef, BridgeError> {
    exclusive_input(op, ("imagePath", image_path), ("imageBase64", image_base64))?
        .ok_or_else(|| BridgeError::invalid(op, "imagePath or imageBase64 is required"))
}

fn mask_input(
    op: BridgeOperation,
    mask_path: Option<String>,
    mask_base64: Option<String>,
) -> Result<Option<InputRef>, BridgeError> {
    exclusive_input(op, ("maskPath", mask_path), ("maskBase64", mask_base64))
}

/// At most one of a path field and its base64 twin.
fn exclusive_input(
    op: BridgeOperation,
    (path_field, path): (&str, Option<String>),
    (base64_field, encoded): (&str, Option<String>),
) -> Result<Option<InputRef>, BridgeError> {
    match (non_empty(path), non_empty(encoded)) {
        (Some(path), None) => Ok(Some(InputRef::path(path))),
        (None, Some(encoded)) => {
            let data = STANDARD
                .decode(strip_data_url(encoded.as_str()))
                .map_err(|e| {
                    BridgeError::invalid(op, format!("{base64_field} is not valid base64: {e}"))
                })?;
            let file_name = image::guess_format(data.as_slice())
                .ok()
                .and_then(|format| format.extensions_str().first().copied())
                .map(|ext| format!("image.{ext}"));
            Ok(Some(InputRef::bytes(data, file_name)))
        }
        (Some(_), Some(_)) => Err(BridgeError::invalid(
            op,
            format!("provide exactly one of {path_field} or {base64_field}"),
        )),
        (None, None) => Ok(None),
    }
}

/// Async facade over a shared [`Dispatcher`]. Work runs on the blocking pool;
/// dropping the returned future cancels the in-flight attempt.
pub struct OperationBridge<R> {
    dispatcher: Arc<Dispatcher<R>>,
}

impl<R> Clone for OperationBridge<R> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

impl<R> OperationBridge<R>
where
    R: OperationCommandRunner,
{
    pub fn new(dispatcher: Dispatcher<R>) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<R> {
        self.dispatcher.as_ref()
    }

    pub fn operations(&self) -> Vec<&'static str> {
        BridgeOperation::ALL
            .into_iter()
            .filter(|op| self.dispatcher.registry().get(op.operation()).is_some())
            .map(BridgeOperation::as_str)
            .collect()
    }

    pub async fn invoke(&self, name: &str, params: Value) -> Result<OperationResult, BridgeError> {
        let request = build_request(name, params)?;
        info!(
            bridge_operation = name,
            operation = request.operation.as_str(),
            "bridge invocation accepted"
        );

        let dispatcher = Arc::clone(&self.dispatcher);
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let joined = tokio::task::spawn_blocking(move || {
            dispatcher.execute_with_cancel(&request, &cancel)
        })
        .await;
        guard.disarm();

        match joined {
            Ok(result) => result.map_err(BridgeError::Failed),
            Err(join_error) => {
                error!(bridge_operation = name, error = %join_error, "operation worker panicked");
                Err(BridgeError::Internal(String::from("operation worker failed")))
            }
        }
    }

    pub async fn ping(&self) -> Result<String, BridgeError> {
        let Some(remote) = self.dispatcher.remote().cloned() else {
            return Err(BridgeError::Failed(OperationFailure::remote_transport(
                "remote image service is not configured",
            )));
        };
        match tokio::task::spawn_blocking(move || remote.ping()).await {
            Ok(result) => result.map_err(BridgeError::Failed),
            Err(join_error) => {
                error!(error = %join_error, "remote ping worker panicked");
                Err(BridgeError::Internal(String::from("remote ping worker failed")))
            }
        }
    }
}

impl OperationBridge<StdOperationCommandRunner> {
    /// Bundled python processors plus the HTTP image service when a remote
    /// base URL is configured.
    pub fn from_settings(settings: &DispatchSettings) -> Result<Self, RegistryError> {
        let registry = OperationRegistry::with_python_tools(
            settings.python_bin.as_str(),
            settings.tools_dir.as_path(),
        )?;
        let mut dispatcher = Dispatcher::new(
            registry,
            StdOperationCommandRunner,
            settings.app_root.clone(),
        );
        if let Some(base_url) = settings.remote_base_url.clone() {
            info!(remote = %base_url, "remote image service enabled");
            dispatcher = dispatcher.with_remote(Arc::new(HttpRemoteImageService::new(
                base_url,
                settings.remote_timeout,
            )));
        }
        Ok(Self::new(dispatcher))
    }
}

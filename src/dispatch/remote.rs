use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use reqwest::blocking::{multipart, Client};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::dispatch::failure::OperationFailure;
use crate::dispatch::normalize::{ImagePayload, OperationResult};
use crate::dispatch::registry::RemoteEndpoint;
use crate::dispatch::request::{InputRef, OperationRequest};

const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub trait RemoteImageService: Send + Sync + 'static {
    fn execute(
        &self,
        endpoint: &RemoteEndpoint,
        request: &OperationRequest,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, OperationFailure>;

    fn ping(&self) -> Result<String, OperationFailure>;
}

/// Client for the image service that accepts multipart uploads and answers
/// with raw image bytes.
#[derive(Debug, Clone)]
pub struct HttpRemoteImageService {
    base_url: Url,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RemoteErrorBody {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemotePingBody {
    #[serde(default)]
    message: Option<String>,
}

struct MultipartCall {
    url: String,
    timeout: Duration,
    image: UploadFile,
    mask: Option<UploadFile>,
    fields: Vec<(String, String)>,
}

struct UploadFile {
    bytes: Vec<u8>,
    file_name: String,
    mime: String,
}

impl HttpRemoteImageService {
    pub fn new(base_url: Url, timeout: Duration) -> Self {
        Self { base_url, timeout }
    }

    fn url_for(&self, path: &str) -> Result<String, OperationFailure> {
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(joined.as_str())
            .map(String::from)
            .map_err(|e| OperationFailure::remote_transport(format!("invalid remote URL: {e}")))
    }
}

impl RemoteImageService for HttpRemoteImageService {
    fn execute(
        &self,
        endpoint: &RemoteEndpoint,
        request: &OperationRequest,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, OperationFailure> {
        if cancel.is_cancelled() {
            return Err(OperationFailure::cancelled());
        }

        let call = MultipartCall {
            url: self.url_for(endpoint.path.as_str())?,
            timeout: self.timeout,
            image: upload_file(&request.input)?,
            mask: request.secondary_input.as_ref().map(upload_file).transpose()?,
            fields: request
                .params
                .iter()
                .map(|(key, value)| (key.clone(), value.to_arg()))
                .collect(),
        };
        debug!(
            url = %call.url,
            operation = request.operation.as_str(),
            "sending remote image request"
        );

        // The blocking client cannot be interrupted. On cancel the caller returns
        // at once, but the detached worker keeps its connection until the
        // response or the client timeout arrives, then discards the result.
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(send_multipart(call));
        });

        loop {
            if cancel.is_cancelled() {
                return Err(OperationFailure::cancelled());
            }
            match rx.recv_timeout(RESPONSE_POLL_INTERVAL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(OperationFailure::remote_transport(
                        "remote request worker exited without a response",
                    ))
                }
            }
        }
    }

    fn ping(&self) -> Result<String, OperationFailure> {
        let url = self.url_for("/ping")?;
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| OperationFailure::remote_transport(format!("http client init failed: {e}")))?;
        let resp = client
            .get(url.as_str())
            .send()
            .map_err(|e| OperationFailure::remote_transport(format!("HTTP request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(OperationFailure::remote_status(
                status.as_u16(),
                format!("HTTP error! status: {}", status.as_u16()),
            ));
        }
        let body: RemotePingBody = resp
            .json()
            .map_err(|e| OperationFailure::remote_transport(format!("ping JSON decode failed: {e}")))?;
        Ok(body.message.unwrap_or_default())
    }
}

fn upload_file(input: &InputRef) -> Result<UploadFile, OperationFailure> {
    let bytes = input
        .read_bytes()
        .map_err(|e| OperationFailure::remote_transport(format!("failed to read input image: {e}")))?;
    let file_name = input.file_name();
    let mime = mime_for_file_name(file_name.as_str());
    Ok(UploadFile {
        bytes,
        file_name,
        mime,
    })
}

fn mime_for_file_name(file_name: &str) -> String {
    image::ImageFormat::from_path(Path::new(file_name))
        .map(|format| format.to_mime_type().to_string())
        .unwrap_or_else(|_| String::from("application/octet-stream"))
}

fn file_part(file: UploadFile) -> Result<multipart::Part, OperationFailure> {
    let UploadFile {
        bytes,
        file_name,
        mime,
    } = file;
    multipart::Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(mime.as_str())
        .map_err(|e| OperationFailure::remote_transport(format!("invalid mime '{mime}': {e}")))
}

fn send_multipart(call: MultipartCall) -> Result<OperationResult, OperationFailure> {
    let MultipartCall {
        url,
        timeout,
        image,
        mask,
        fields,
    } = call;

    let mut form = multipart::Form::new().part("image", file_part(image)?);
    if let Some(mask) = mask {
        form = form.part("mask", file_part(mask)?);
    }
    for (key, value) in fields {
        form = form.text(key, value);
    }

    let client = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| OperationFailure::remote_transport(format!("http client init failed: {e}")))?;
    let resp = client
        .post(url.as_str())
        .multipart(form)
        .send()
        .map_err(|e| OperationFailure::remote_transport(format!("HTTP request failed: {e}")))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().unwrap_or_default();
        return Err(OperationFailure::remote_status(
            status.as_u16(),
            remote_error_message(status.as_u16(), body.as_str()),
        ));
    }

    let body = resp
        .bytes()
        .map_err(|e| OperationFailure::remote_transport(format!("HTTP body read failed: {e}")))?;
    if image::guess_format(body.as_ref()).is_err() {
        return Err(OperationFailure::remote_transport(
            "remote response body is not a recognizable image",
        ));
    }
    Ok(OperationResult::Image(ImagePayload::from_bytes(body.to_vec())))
}

fn remote_error_message(status: u16, body: &str) -> String {
    serde_json::from_str::<RemoteErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error)
        .map(|message| message.trim().to_string())
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| format!("HTTP error! status: {status}"))
}

//! Client side: build requests, send them, decode the answers.
//!
//! The [`Dispatcher`] is transport agnostic. [`HttpTransport`] talks to a running
//! server, [`LocalTransport`] hands the encoded payload to an in-process
//! [`InferenceService`]; both see exactly the same bytes.
use crate::codec::WireFormat;
use crate::error::{BackendError, ErrorBody};
use crate::request::{InferenceOptions, InferenceRequest, InferenceResponse, Operation};
use crate::server::INFER_PATH;
use crate::service::InferenceService;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an encoded request, return the encoded response.
    async fn send(&self, format: WireFormat, body: Vec<u8>) -> Result<Vec<u8>, BackendError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:8080`.
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}{}", base_url.trim_end_matches('/'), INFER_PATH),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, format: WireFormat, body: Vec<u8>) -> Result<Vec<u8>, BackendError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, format.content_type())
            .body(body)
            .send()
            .await
            .map_err(|e| BackendError::unavailable(format!("cannot reach {}: {e}", self.url)))?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| {
            BackendError::unavailable(format!("connection to {} dropped: {e}", self.url))
        })?;
        if status.is_success() {
            return Ok(bytes.to_vec());
        }

        match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(body) => Err(body.error),
            Err(_) => Err(error_from_status(status, &String::from_utf8_lossy(&bytes))),
        }
    }
}

/// Best effort for error responses without an [`ErrorBody`], such as a body
/// rejected by the server's size limit.
fn error_from_status(status: StatusCode, text: &str) -> BackendError {
    let reason = format!("{status}: {}", text.trim());
    match status {
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => BackendError::unavailable(reason),
        s if s.is_client_error() => BackendError::invalid_input("body", reason),
        _ => BackendError::internal("request", reason),
    }
}

pub struct LocalTransport {
    service: Arc<InferenceService>,
}

impl LocalTransport {
    pub fn new(service: Arc<InferenceService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, format: WireFormat, body: Vec<u8>) -> Result<Vec<u8>, BackendError> {
        self.service.handle(format, &body).await
    }
}

pub struct Dispatcher<T> {
    transport: T,
    format: WireFormat,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T, format: WireFormat) -> Self {
        Self { transport, format }
    }

    /// Run `operation` over `sequences`, one row per sequence in order.
    pub async fn dispatch<S: AsRef<str>>(
        &self,
        operation: Operation,
        sequences: &[S],
        options: InferenceOptions,
    ) -> Result<InferenceResponse, BackendError> {
        let request = InferenceRequest::from_sequences(operation, sequences, options)?;
        self.dispatch_request(&request).await
    }

    pub async fn dispatch_request(
        &self,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, BackendError> {
        let body = self.format.encode(&request.to_envelope())?;
        tracing::debug!(
            operation = %request.operation,
            wire = %self.format,
            bytes = body.len(),
            "sending request"
        );
        let reply = self.transport.send(self.format, body).await?;
        let response = InferenceResponse::from_envelope(self.format.decode(&reply)?)?;
        tracing::debug!(outputs = ?response.names(), "received response");
        Ok(response)
    }

    /// Dispatch, then write the outputs to `results` when given.
    ///
    /// A [`BackendError`] stays reachable through `downcast_ref` on the returned error.
    pub async fn dispatch_and_persist(
        &self,
        request: &InferenceRequest,
        results: Option<&Path>,
    ) -> anyhow::Result<InferenceResponse> {
        let response = self.dispatch_request(request).await?;
        if let Some(path) = results {
            response.save(path)?;
        }
        Ok(response)
    }
}

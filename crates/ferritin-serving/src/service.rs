//! The serving façade: router, adapter and codec wired together.
use crate::adapter::BackendAdapter;
use crate::backend::ModelBackend;
use crate::codec::WireFormat;
use crate::config::{ConfigError, ServingConfig};
use crate::error::BackendError;
use crate::request::{InferenceRequest, InferenceResponse};
use crate::router::{RequestRouter, RoutedRequest};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

pub struct InferenceService {
    router: RequestRouter,
    adapter: BackendAdapter,
    next_id: AtomicU64,
}

impl InferenceService {
    /// The config is validated here; see [`BackendAdapter::new`].
    pub fn new(backend: Arc<dyn ModelBackend>, config: &ServingConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            adapter: BackendAdapter::new(backend, config)?,
            router: RequestRouter::new(config),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn backend_name(&self) -> &str {
        self.adapter.backend_name()
    }

    pub fn is_ready(&self) -> bool {
        self.adapter.is_open()
    }

    /// Route and run a decoded request.
    pub async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, BackendError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("request", id, operation = %request.operation);
        let routed = span.in_scope(|| self.router.route(request));
        self.run(routed).instrument(span).await
    }

    /// Decode a wire payload, run it and encode the response in the same binding.
    pub async fn handle(&self, format: WireFormat, body: &[u8]) -> Result<Vec<u8>, BackendError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("request", id, wire = %format);
        let routed = span.in_scope(|| {
            let envelope = format.decode(body)?;
            self.router.route_envelope(envelope)
        });
        let response = self.run(routed).instrument(span).await?;
        format.encode(&response.to_envelope())
    }

    async fn run(
        &self,
        routed: Result<RoutedRequest, BackendError>,
    ) -> Result<InferenceResponse, BackendError> {
        let started = Instant::now();
        let result = match routed {
            Ok(routed) => {
                tracing::debug!(
                    operation = %routed.operation,
                    batch_size = routed.batch_size,
                    "routed request"
                );
                self.adapter.invoke(routed).await
            }
            Err(e) => Err(e),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(response) => {
                tracing::info!(elapsed_ms, outputs = ?response.names(), "request finished")
            }
            Err(e) => tracing::info!(elapsed_ms, kind = %e.kind(), error = %e, "request failed"),
        }
        result
    }

    pub async fn shutdown(&self) {
        self.adapter.shutdown().await;
        tracing::info!(backend = %self.backend_name(), "service shut down");
    }
}

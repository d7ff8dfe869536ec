//! Backend invocation
//!
//! [`BackendAdapter`] owns the calls into a [`ModelBackend`]:
//!
//! - batches above the micro-batch limit are split into sequential sub-batches
//!   whose results are stitched back together in row order, or rejected with
//!   `BatchTooLarge`, depending on [`BatchPolicy`]
//! - every backend call holds a permit of the in-flight semaphore and runs under
//!   the configured deadline
//! - backend faults become [`BackendError`]s, and only the outputs the request
//!   asked for are returned
//!
//! There are no retries. A failed sub-batch fails the whole request and the
//! partial results are dropped with it.
//!
//! The permit is released when the deadline expires, even if the backend keeps
//! working on a detached task. A backend doing blocking work off the runtime
//! must bound that work itself, see [`crate::backend::CandleBackend`].
use crate::backend::{BackendFault, ModelBackend};
use crate::config::{BatchPolicy, ConfigError, ServingConfig};
use crate::error::BackendError;
use crate::request::{InferenceResponse, Operation, ResolvedOptions};
use crate::router::RoutedRequest;
use crate::tensor::{NamedTensor, TensorMap};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use validator::Validate;

pub struct BackendAdapter {
    backend: Arc<dyn ModelBackend>,
    max_micro_batch_size: usize,
    batch_policy: BatchPolicy,
    timeout: Duration,
    in_flight: Arc<Semaphore>,
}

impl BackendAdapter {
    /// Fails on a config outside its documented ranges, e.g. a zero batch or
    /// in-flight limit.
    pub fn new(backend: Arc<dyn ModelBackend>, config: &ServingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            backend,
            max_micro_batch_size: config.max_micro_batch_size,
            batch_policy: config.batch_policy,
            timeout: config.backend_timeout(),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight)),
        })
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// True while new calls can still get a permit.
    pub fn is_open(&self) -> bool {
        !self.in_flight.is_closed()
    }

    /// Rows per backend call for a batch of `batch_size` rows.
    pub fn micro_batch_size(
        &self,
        batch_size: usize,
        options: &ResolvedOptions,
    ) -> Result<usize, BackendError> {
        if self.batch_policy == BatchPolicy::Reject && batch_size > self.max_micro_batch_size {
            return Err(BackendError::BatchTooLarge {
                size: batch_size,
                limit: self.max_micro_batch_size,
            });
        }
        let requested = options
            .micro_batch_size
            .unwrap_or(self.max_micro_batch_size);
        Ok(requested.clamp(1, self.max_micro_batch_size))
    }

    pub async fn invoke(&self, request: RoutedRequest) -> Result<InferenceResponse, BackendError> {
        let RoutedRequest {
            operation,
            inputs,
            options,
            batch_size,
        } = request;
        let chunk = self.micro_batch_size(batch_size, &options)?;
        let requested = options.requested_outputs(operation);

        if chunk >= batch_size {
            let outputs = self.call(operation, inputs, &options).await?;
            let outputs = retain_requested(operation, &requested, outputs, batch_size)?;
            return Ok(InferenceResponse { operation, outputs });
        }

        let ranges = micro_batches(batch_size, chunk);
        tracing::debug!(
            operation = %operation,
            batch_size,
            micro_batch_size = chunk,
            calls = ranges.len(),
            "splitting batch"
        );

        let mut parts: BTreeMap<String, Vec<NamedTensor>> = BTreeMap::new();
        for range in ranges {
            let rows = range.len();
            let sub_inputs = slice_inputs(&inputs, range)?;
            let outputs = self.call(operation, sub_inputs, &options).await?;
            for (name, tensor) in retain_requested(operation, &requested, outputs, rows)? {
                parts.entry(name).or_default().push(tensor);
            }
        }

        let mut outputs = TensorMap::new();
        for (name, tensors) in parts {
            let tensor = NamedTensor::concat_rows(tensors)
                .map_err(|reason| BackendError::internal(operation.to_string(), reason))?;
            outputs.insert(name, tensor);
        }
        Ok(InferenceResponse { operation, outputs })
    }

    /// One backend call under a permit and the deadline.
    async fn call(
        &self,
        operation: Operation,
        inputs: TensorMap,
        options: &ResolvedOptions,
    ) -> Result<TensorMap, BackendError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| BackendError::unavailable("backend is shutting down"))?;

        let started = Instant::now();
        let result =
            tokio::time::timeout(self.timeout, self.backend.invoke(operation, inputs, options)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(outputs)) => {
                tracing::debug!(operation = %operation, elapsed_ms, "backend call finished");
                Ok(outputs)
            }
            Ok(Err(fault)) => {
                tracing::warn!(operation = %operation, elapsed_ms, error = %fault, "backend call failed");
                Err(normalize(operation, fault))
            }
            Err(_) => {
                let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(operation = %operation, timeout_ms, "backend call timed out");
                Err(BackendError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Stop handing out permits and release the model.
    pub async fn shutdown(&self) {
        self.in_flight.close();
        self.backend.shutdown().await;
    }
}

fn micro_batches(batch_size: usize, chunk: usize) -> Vec<Range<usize>> {
    (0..batch_size)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(batch_size))
        .collect()
}

fn slice_inputs(inputs: &TensorMap, range: Range<usize>) -> Result<TensorMap, BackendError> {
    inputs
        .iter()
        .map(|(name, tensor)| Ok((name.clone(), tensor.slice_rows(range.clone())?)))
        .collect()
}

/// Keep exactly the requested outputs, each with `rows` rows.
fn retain_requested(
    operation: Operation,
    requested: &[&str],
    mut outputs: TensorMap,
    rows: usize,
) -> Result<TensorMap, BackendError> {
    let mut kept = TensorMap::new();
    for name in requested {
        let tensor = outputs.remove(*name).ok_or_else(|| {
            BackendError::internal(
                operation.to_string(),
                format!("backend produced no `{name}` output"),
            )
        })?;
        if tensor.rows() != rows {
            return Err(BackendError::internal(
                operation.to_string(),
                format!(
                    "backend returned {} rows of `{name}` for {rows} inputs",
                    tensor.rows()
                ),
            ));
        }
        kept.insert(name.to_string(), tensor);
    }
    if !outputs.is_empty() {
        tracing::trace!(dropped = ?outputs.keys().collect::<Vec<_>>(), "dropping unrequested outputs");
    }
    Ok(kept)
}

fn normalize(operation: Operation, fault: BackendFault) -> BackendError {
    match fault {
        BackendFault::Unavailable(reason) => BackendError::unavailable(reason),
        BackendFault::Rejected { field, reason } => BackendError::invalid_input(field, reason),
        BackendFault::Candle(e) => BackendError::internal(operation.to_string(), e.to_string()),
        BackendFault::Internal(reason) => BackendError::internal(operation.to_string(), reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::request::{EMBEDDINGS, SEQUENCES, TOKEN_LOGITS};
    use crate::tensor::TensorData;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes one embedding row per sequence, holding the sequence length.
    #[derive(Default)]
    struct LengthBackend {
        calls: AtomicUsize,
        emit_logits: bool,
    }

    #[async_trait]
    impl ModelBackend for LengthBackend {
        fn name(&self) -> &str {
            "length"
        }

        async fn invoke(
            &self,
            _operation: Operation,
            inputs: TensorMap,
            _options: &ResolvedOptions,
        ) -> Result<TensorMap, BackendFault> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let seqs = inputs[SEQUENCES]
                .to_sequences()
                .map_err(|e| BackendFault::Internal(e.to_string()))?;
            let lengths: Vec<f32> = seqs.iter().map(|s| s.len() as f32).collect();
            let mut out = TensorMap::new();
            out.insert(
                EMBEDDINGS.to_string(),
                NamedTensor::new(EMBEDDINGS, vec![seqs.len(), 1], TensorData::Float32(lengths))
                    .map_err(|e| BackendFault::Internal(e.to_string()))?,
            );
            if self.emit_logits {
                out.insert(
                    TOKEN_LOGITS.to_string(),
                    NamedTensor::new(TOKEN_LOGITS, vec![seqs.len()], TensorData::Float32(vec![0.0; seqs.len()]))
                        .map_err(|e| BackendFault::Internal(e.to_string()))?,
                );
            }
            Ok(out)
        }
    }

    fn routed(seqs: &[&str], options: ResolvedOptions) -> RoutedRequest {
        let t = NamedTensor::from_sequences(SEQUENCES, seqs).unwrap();
        RoutedRequest {
            operation: Operation::Embed,
            batch_size: seqs.len(),
            inputs: [(SEQUENCES.to_string(), t)].into(),
            options,
        }
    }

    fn embed_only() -> ResolvedOptions {
        ResolvedOptions {
            micro_batch_size: None,
            include_hiddens: false,
            include_embeddings: true,
            include_logits: false,
        }
    }

    fn adapter(backend: Arc<LengthBackend>, limit: usize, policy: BatchPolicy) -> BackendAdapter {
        let config = ServingConfig {
            max_micro_batch_size: limit,
            batch_policy: policy,
            ..Default::default()
        };
        BackendAdapter::new(backend, &config).unwrap()
    }

    #[test]
    fn test_zero_limits_rejected() {
        for config in [
            ServingConfig {
                max_micro_batch_size: 0,
                ..Default::default()
            },
            ServingConfig {
                max_in_flight: 0,
                ..Default::default()
            },
        ] {
            let backend = Arc::new(LengthBackend::default());
            assert!(matches!(
                BackendAdapter::new(backend, &config),
                Err(ConfigError::Invalid(_))
            ));
        }
    }

    #[test]
    fn test_micro_batches() {
        assert_eq!(micro_batches(5, 2), vec![0..2, 2..4, 4..5]);
        assert_eq!(micro_batches(2, 8), vec![0..2]);
    }

    #[tokio::test]
    async fn test_split_keeps_row_order() {
        let backend = Arc::new(LengthBackend::default());
        let adapter = adapter(backend.clone(), 2, BatchPolicy::Split);
        let response = adapter
            .invoke(routed(&["A", "CC", "DDD", "EEEE", "FFFFF"], embed_only()))
            .await
            .unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            response.get(EMBEDDINGS).unwrap().data(),
            &TensorData::Float32(vec![1.0, 2.0, 3.0, 4.0, 5.0])
        );
    }

    #[tokio::test]
    async fn test_request_micro_batch_size_is_capped() {
        let backend = Arc::new(LengthBackend::default());
        let adapter = adapter(backend.clone(), 2, BatchPolicy::Split);
        let options = ResolvedOptions {
            micro_batch_size: Some(64),
            ..embed_only()
        };
        assert_eq!(adapter.micro_batch_size(5, &options).unwrap(), 2);
        let options = ResolvedOptions {
            micro_batch_size: Some(1),
            ..embed_only()
        };
        adapter.invoke(routed(&["A", "C"], options)).await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reject_policy() {
        let backend = Arc::new(LengthBackend::default());
        let adapter = adapter(backend.clone(), 2, BatchPolicy::Reject);
        let err = adapter
            .invoke(routed(&["A", "C", "D"], embed_only()))
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::BatchTooLarge { size: 3, limit: 2 });
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unrequested_outputs_dropped() {
        let backend = Arc::new(LengthBackend {
            emit_logits: true,
            ..Default::default()
        });
        let adapter = adapter(backend, 8, BatchPolicy::Split);
        let response = adapter.invoke(routed(&["ACDE"], embed_only())).await.unwrap();
        assert_eq!(response.names(), vec![EMBEDDINGS]);
    }

    #[tokio::test]
    async fn test_missing_requested_output() {
        let backend = Arc::new(LengthBackend::default());
        let adapter = adapter(backend, 8, BatchPolicy::Split);
        let options = ResolvedOptions {
            include_logits: true,
            ..embed_only()
        };
        let err = adapter.invoke(routed(&["ACDE"], options)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalFailure);
        assert!(err.to_string().contains(TOKEN_LOGITS));
    }

    #[tokio::test]
    async fn test_closed_after_shutdown() {
        let backend = Arc::new(LengthBackend::default());
        let adapter = adapter(backend, 8, BatchPolicy::Split);
        adapter.shutdown().await;
        assert!(!adapter.is_open());
        let err = adapter.invoke(routed(&["ACDE"], embed_only())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    }

    #[test]
    fn test_normalize() {
        let err = normalize(
            Operation::Hidden,
            BackendFault::Rejected {
                field: "hidden_states".into(),
                reason: "bad".into(),
            },
        );
        assert_eq!(err.field(), Some("hidden_states"));
        let err = normalize(Operation::Hidden, BackendFault::Internal("oom".into()));
        assert_eq!(err, BackendError::internal("hidden", "oom"));
    }
}

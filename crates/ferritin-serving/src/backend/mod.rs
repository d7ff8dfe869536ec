//! Model backends
//!
//! The adapter talks to a model through [`ModelBackend`] and nothing else, so the
//! reference [`CandleBackend`] and the fakes used in tests are interchangeable.
//! A backend receives one micro-batch at a time and returns every output it can
//! produce for it; picking the requested outputs is the adapter's job.
mod candle;
mod tokenizer;

pub use self::candle::{device, init_checkpoint, CandleBackend, ResidueModel, ResidueModelConfig};
pub use self::tokenizer::ResidueTokenizer;

use crate::request::{Operation, ResolvedOptions};
use crate::tensor::TensorMap;
use async_trait::async_trait;
use thiserror::Error;

/// What a backend may fail with. The adapter turns these into
/// [`crate::error::BackendError`]s.
#[derive(Error, Debug)]
pub enum BackendFault {
    /// Not loaded, shut down, or unreachable.
    #[error("{0}")]
    Unavailable(String),

    /// The backend refused an input.
    #[error("{field}: {reason}")]
    Rejected { field: String, reason: String },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("{0}")]
    Internal(String),
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Run `operation` on one micro-batch. Every input shares the same leading
    /// dimension and every output must keep it, row for row.
    async fn invoke(
        &self,
        operation: Operation,
        inputs: TensorMap,
        options: &ResolvedOptions,
    ) -> Result<TensorMap, BackendFault>;

    /// Release the model. Calls after shutdown fail with
    /// [`BackendFault::Unavailable`].
    async fn shutdown(&self) {}
}

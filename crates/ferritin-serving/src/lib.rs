//! ferritin-serving
//!
//! Serve protein language models behind a small request/response façade.
//!
//! - [`codec`]: named tensors to bytes and back (JSON or safetensors)
//! - [`router`]: picks the operation and validates its inputs
//! - [`adapter`]: calls the model backend under batch, timeout and concurrency limits
//! - [`client`]: builds requests from sequences, sends them, persists the results
//!
//! ```shell
//! ferritin-serving infer embed --data seqs.fasta --checkpoint model/ --results out.safetensors
//! ferritin-serving serve --checkpoint model/ --listen 127.0.0.1:8080
//! ferritin-serving query hidden --data seqs.fasta --url http://127.0.0.1:8080
//! ```
pub mod adapter;
pub mod backend;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod request;
pub mod router;
pub mod server;
pub mod service;
pub mod tensor;

pub use adapter::BackendAdapter;
pub use backend::{BackendFault, CandleBackend, ModelBackend};
pub use client::{Dispatcher, HttpTransport, LocalTransport, Transport};
pub use codec::{Envelope, WireFormat};
pub use config::{BatchPolicy, ServingConfig};
pub use error::{BackendError, ErrorKind};
pub use request::{InferenceOptions, InferenceRequest, InferenceResponse, Operation};
pub use router::{RequestRouter, RoutedRequest};
pub use service::InferenceService;
pub use tensor::{DType, NamedTensor, TensorData, TensorMap};

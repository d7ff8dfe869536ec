//! Requests and responses
//!
//! An [`InferenceRequest`] names an [`Operation`], carries its input tensors and
//! the caller's [`InferenceOptions`]. On the wire the operation and options
//! travel as string metadata next to the tensors, see [`crate::codec::Envelope`].
use crate::codec::{Envelope, WireFormat};
use crate::error::BackendError;
use crate::tensor::{NamedTensor, TensorMap};
use anyhow::{Context, Result};
use bon::Builder;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use strum::{Display, EnumString};

// Tensor names
pub const SEQUENCES: &str = "sequences";
pub const HIDDEN_STATES: &str = "hidden_states";
pub const MASK: &str = "mask";
pub const EMBEDDINGS: &str = "embeddings";
pub const TOKEN_LOGITS: &str = "token_logits";

// Metadata keys
pub const OPERATION_KEY: &str = "operation";
pub const MICRO_BATCH_SIZE_KEY: &str = "micro_batch_size";
pub const INCLUDE_HIDDENS_KEY: &str = "include_hiddens";
pub const INCLUDE_EMBEDDINGS_KEY: &str = "include_embeddings";
pub const INCLUDE_LOGITS_KEY: &str = "include_logits";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    /// Per-sequence embeddings.
    Embed,
    /// Per-token hidden states and their mask.
    Hidden,
    /// Decode hidden states back into sequences.
    #[strum(to_string = "sample", serialize = "decode")]
    #[serde(alias = "decode")]
    #[value(alias = "decode")]
    Sample,
}

impl Operation {
    /// Input tensors the operation cannot run without.
    pub fn required_inputs(self) -> &'static [&'static str] {
        match self {
            Operation::Embed | Operation::Hidden => &[SEQUENCES],
            Operation::Sample => &[HIDDEN_STATES],
        }
    }

    /// Inputs the operation reads. Anything else in a request is rejected.
    pub fn accepted_inputs(self) -> &'static [&'static str] {
        match self {
            Operation::Embed | Operation::Hidden => &[SEQUENCES],
            Operation::Sample => &[HIDDEN_STATES, MASK],
        }
    }
}

/// Caller supplied options. Unset flags take the operation's defaults, see
/// [`InferenceOptions::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Builder, Serialize, Deserialize)]
pub struct InferenceOptions {
    pub micro_batch_size: Option<usize>,
    pub include_hiddens: Option<bool>,
    pub include_embeddings: Option<bool>,
    pub include_logits: Option<bool>,
}

/// Options with every flag decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub micro_batch_size: Option<usize>,
    pub include_hiddens: bool,
    pub include_embeddings: bool,
    pub include_logits: bool,
}

impl InferenceOptions {
    /// `embed` includes embeddings and `hidden` includes hidden states unless told
    /// otherwise. Every other flag defaults to off.
    pub fn resolve(&self, operation: Operation) -> ResolvedOptions {
        ResolvedOptions {
            micro_batch_size: self.micro_batch_size,
            include_hiddens: self
                .include_hiddens
                .unwrap_or(operation == Operation::Hidden),
            include_embeddings: self
                .include_embeddings
                .unwrap_or(operation == Operation::Embed),
            include_logits: self.include_logits.unwrap_or(false),
        }
    }

    fn to_metadata(&self, metadata: &mut BTreeMap<String, String>) {
        let entries = [
            (MICRO_BATCH_SIZE_KEY, self.micro_batch_size.map(|v| v.to_string())),
            (INCLUDE_HIDDENS_KEY, self.include_hiddens.map(|v| v.to_string())),
            (INCLUDE_EMBEDDINGS_KEY, self.include_embeddings.map(|v| v.to_string())),
            (INCLUDE_LOGITS_KEY, self.include_logits.map(|v| v.to_string())),
        ];
        for (key, value) in entries {
            if let Some(value) = value {
                metadata.insert(key.to_string(), value);
            }
        }
    }
}

impl ResolvedOptions {
    /// Output names the response must carry, given these flags.
    pub fn requested_outputs(&self, operation: Operation) -> Vec<&'static str> {
        let mut outputs = Vec::new();
        if operation == Operation::Sample {
            outputs.push(SEQUENCES);
        }
        if self.include_embeddings {
            outputs.push(EMBEDDINGS);
        }
        if self.include_hiddens {
            outputs.push(HIDDEN_STATES);
            outputs.push(MASK);
        }
        if self.include_logits {
            outputs.push(TOKEN_LOGITS);
        }
        outputs
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub operation: Operation,
    pub inputs: TensorMap,
    pub options: InferenceOptions,
}

impl InferenceRequest {
    pub fn new(operation: Operation, options: InferenceOptions) -> Self {
        Self {
            operation,
            inputs: TensorMap::new(),
            options,
        }
    }

    /// A request over protein sequences, one row per sequence in the given order.
    pub fn from_sequences<S: AsRef<str>>(
        operation: Operation,
        sequences: &[S],
        options: InferenceOptions,
    ) -> Result<Self, BackendError> {
        let tensor = NamedTensor::from_sequences(SEQUENCES, sequences)?;
        Ok(Self::new(operation, options).with_input(tensor))
    }

    pub fn with_input(mut self, tensor: NamedTensor) -> Self {
        self.inputs.insert(tensor.name().to_string(), tensor);
        self
    }

    pub fn to_envelope(&self) -> Envelope {
        let mut metadata = BTreeMap::new();
        metadata.insert(OPERATION_KEY.to_string(), self.operation.to_string());
        self.options.to_metadata(&mut metadata);
        Envelope::new(metadata, self.inputs.clone())
    }

    /// Rebuild a request from its wire envelope.
    ///
    /// Unknown metadata keys fail with `InvalidInput` when `reject_unknown` is set
    /// and are logged and ignored otherwise.
    pub fn from_envelope(envelope: Envelope, reject_unknown: bool) -> Result<Self, BackendError> {
        let Envelope { metadata, tensors } = envelope;
        let mut options = InferenceOptions::default();
        let mut operation = None;

        for (key, value) in &metadata {
            match key.as_str() {
                OPERATION_KEY => {
                    operation = Some(value.parse::<Operation>().map_err(|_| {
                        BackendError::invalid_input(
                            OPERATION_KEY,
                            format!("unknown operation `{value}`"),
                        )
                    })?)
                }
                MICRO_BATCH_SIZE_KEY => {
                    options.micro_batch_size = Some(value.parse().map_err(|_| {
                        BackendError::invalid_input(key, format!("`{value}` is not a batch size"))
                    })?)
                }
                INCLUDE_HIDDENS_KEY => options.include_hiddens = Some(parse_flag(key, value)?),
                INCLUDE_EMBEDDINGS_KEY => {
                    options.include_embeddings = Some(parse_flag(key, value)?)
                }
                INCLUDE_LOGITS_KEY => options.include_logits = Some(parse_flag(key, value)?),
                _ if reject_unknown => {
                    return Err(BackendError::invalid_input(key, "unknown option"));
                }
                _ => tracing::warn!(option = %key, "ignoring unknown option"),
            }
        }

        let operation = operation
            .ok_or_else(|| BackendError::invalid_input(OPERATION_KEY, "no operation given"))?;
        Ok(Self {
            operation,
            inputs: tensors,
            options,
        })
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, BackendError> {
    value
        .parse()
        .map_err(|_| BackendError::invalid_input(key, format!("`{value}` is not true or false")))
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResponse {
    pub operation: Operation,
    pub outputs: TensorMap,
}

impl InferenceResponse {
    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.outputs.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.outputs.keys().map(String::as_str).collect()
    }

    pub fn to_envelope(&self) -> Envelope {
        let mut metadata = BTreeMap::new();
        metadata.insert(OPERATION_KEY.to_string(), self.operation.to_string());
        Envelope::new(metadata, self.outputs.clone())
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, BackendError> {
        let operation = envelope
            .metadata
            .get(OPERATION_KEY)
            .ok_or_else(|| BackendError::invalid_input(OPERATION_KEY, "response names no operation"))?;
        let operation = operation.parse::<Operation>().map_err(|_| {
            BackendError::invalid_input(OPERATION_KEY, format!("unknown operation `{operation}`"))
        })?;
        Ok(Self {
            operation,
            outputs: envelope.tensors,
        })
    }

    /// Write every output into one safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let bytes = WireFormat::Binary.encode(&self.to_envelope())?;
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write results to {}", path.display()))?;
        tracing::info!(path = %path.display(), outputs = ?self.names(), "saved results");
        Ok(())
    }

    /// Read back a file written by [`InferenceResponse::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read results from {}", path.display()))?;
        let envelope = WireFormat::Binary.decode(&bytes)?;
        Ok(Self::from_envelope(envelope)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tensor::TensorData;

    #[test]
    fn test_decode_is_sample() {
        assert_eq!("decode".parse::<Operation>().unwrap(), Operation::Sample);
        assert_eq!("sample".parse::<Operation>().unwrap(), Operation::Sample);
        assert_eq!(Operation::Sample.to_string(), "sample");
        assert!("fold".parse::<Operation>().is_err());
    }

    #[test]
    fn test_flag_defaults() {
        let none = InferenceOptions::default();
        assert_eq!(none.resolve(Operation::Embed).requested_outputs(Operation::Embed), vec![EMBEDDINGS]);
        assert_eq!(
            none.resolve(Operation::Hidden).requested_outputs(Operation::Hidden),
            vec![HIDDEN_STATES, MASK]
        );
        assert_eq!(none.resolve(Operation::Sample).requested_outputs(Operation::Sample), vec![SEQUENCES]);

        let opts = InferenceOptions::builder()
            .include_embeddings(false)
            .include_logits(true)
            .build();
        assert_eq!(opts.resolve(Operation::Embed).requested_outputs(Operation::Embed), vec![TOKEN_LOGITS]);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let opts = InferenceOptions::builder()
            .micro_batch_size(4)
            .include_logits(true)
            .build();
        let request = InferenceRequest::from_sequences(Operation::Embed, &["ACDE"], opts).unwrap();
        let envelope = request.to_envelope();
        assert_eq!(envelope.metadata[MICRO_BATCH_SIZE_KEY], "4");
        assert!(!envelope.metadata.contains_key(INCLUDE_HIDDENS_KEY));
        assert_eq!(InferenceRequest::from_envelope(envelope, true).unwrap(), request);
    }

    #[test]
    fn test_unknown_option() {
        let request =
            InferenceRequest::from_sequences(Operation::Embed, &["ACDE"], InferenceOptions::default())
                .unwrap();
        let mut envelope = request.to_envelope();
        envelope.metadata.insert("temperature".into(), "0.7".into());

        let err = InferenceRequest::from_envelope(envelope.clone(), true).unwrap_err();
        assert_eq!(err.field(), Some("temperature"));
        assert_eq!(InferenceRequest::from_envelope(envelope, false).unwrap(), request);
    }

    #[test]
    fn test_bad_metadata_values() {
        let mut envelope = Envelope::default();
        let err = InferenceRequest::from_envelope(envelope.clone(), true).unwrap_err();
        assert_eq!(err.field(), Some(OPERATION_KEY));

        envelope.metadata.insert(OPERATION_KEY.into(), "fold".into());
        let err = InferenceRequest::from_envelope(envelope.clone(), true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        envelope.metadata.insert(OPERATION_KEY.into(), "embed".into());
        envelope.metadata.insert(INCLUDE_LOGITS_KEY.into(), "yes".into());
        let err = InferenceRequest::from_envelope(envelope, true).unwrap_err();
        assert_eq!(err.field(), Some(INCLUDE_LOGITS_KEY));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.safetensors");
        let embeddings =
            NamedTensor::new(EMBEDDINGS, vec![2, 2], TensorData::Float32(vec![1.0, 2.0, 3.0, 4.0]))
                .unwrap();
        let response = InferenceResponse {
            operation: Operation::Embed,
            outputs: [(EMBEDDINGS.to_string(), embeddings)].into(),
        };
        response.save(&path).unwrap();
        assert_eq!(InferenceResponse::load(&path).unwrap(), response);
    }
}

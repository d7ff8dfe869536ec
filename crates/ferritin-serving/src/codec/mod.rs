//! Named-tensor codec
//!
//! Turns a mapping of named tensors (plus a small string metadata map carrying
//! the operation and options) into bytes and back. Two bindings exist:
//!
//! - [`WireFormat::Json`]: `{"metadata": {..}, "tensors": [{name, dtype, shape, data}]}`
//! - [`WireFormat::Binary`]: a safetensors buffer, metadata in `__metadata__`
//!
//! Both decode to identical [`TensorMap`]s for the same logical payload.
//! Decoding validates every tensor: unique non-empty names, supported dtype,
//! positive dimensions and a buffer matching the declared shape.

mod binary;
mod json;

use crate::error::BackendError;
use crate::tensor::TensorMap;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// A whole request or response as it crosses the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub metadata: BTreeMap<String, String>,
    pub tensors: TensorMap,
}

impl Envelope {
    pub fn new(metadata: BTreeMap<String, String>, tensors: TensorMap) -> Self {
        Self { metadata, tensors }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WireFormat {
    Json,
    #[default]
    Binary,
}

impl WireFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            WireFormat::Json => JSON_CONTENT_TYPE,
            WireFormat::Binary => BINARY_CONTENT_TYPE,
        }
    }

    /// Pick the binding from a `Content-Type` header value, ignoring parameters
    /// such as `; charset=utf-8`.
    pub fn from_content_type(value: &str) -> Option<Self> {
        let mime = value.split(';').next().unwrap_or_default().trim();
        if mime.eq_ignore_ascii_case(JSON_CONTENT_TYPE) {
            Some(WireFormat::Json)
        } else if mime.eq_ignore_ascii_case(BINARY_CONTENT_TYPE) {
            Some(WireFormat::Binary)
        } else {
            None
        }
    }

    pub fn encode(self, envelope: &Envelope) -> Result<Vec<u8>, BackendError> {
        match self {
            WireFormat::Json => json::encode(envelope),
            WireFormat::Binary => binary::encode(envelope),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<Envelope, BackendError> {
        match self {
            WireFormat::Json => json::decode(bytes),
            WireFormat::Binary => binary::decode(bytes),
        }
    }
}

/// Encode a bare tensor mapping without metadata.
pub fn encode(format: WireFormat, tensors: &TensorMap) -> Result<Vec<u8>, BackendError> {
    format.encode(&Envelope::new(BTreeMap::new(), tensors.clone()))
}

/// Decode a payload into its tensor mapping, dropping any metadata.
pub fn decode(format: WireFormat, bytes: &[u8]) -> Result<TensorMap, BackendError> {
    Ok(format.decode(bytes)?.tensors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{NamedTensor, TensorData};
    use half::f16;

    fn mixed_mapping() -> TensorMap {
        let tensors = vec![
            NamedTensor::from_sequences("sequences", &["ACDE", "GGH"]).unwrap(),
            NamedTensor::new("mask", vec![2, 6], TensorData::Int64(vec![1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0]))
                .unwrap(),
            NamedTensor::new(
                "embeddings",
                vec![2, 3],
                TensorData::Float32(vec![0.1, -2.5, 3.0e-7, 1.0e12, 0.0, -0.0]),
            )
            .unwrap(),
            NamedTensor::new(
                "token_logits",
                vec![1, 2, 2],
                TensorData::Float16(
                    [0.5f32, -1.25, 65504.0, 0.000061]
                        .iter()
                        .map(|&x| f16::from_f32(x))
                        .collect(),
                ),
            )
            .unwrap(),
        ];
        tensors
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect()
    }

    #[test]
    fn test_roundtrip_both_bindings() {
        let mapping = mixed_mapping();
        for format in [WireFormat::Json, WireFormat::Binary] {
            let bytes = encode(format, &mapping).unwrap();
            assert_eq!(decode(format, &bytes).unwrap(), mapping, "{format}");
        }
    }

    #[test]
    fn test_bindings_agree() {
        let mut metadata = BTreeMap::new();
        metadata.insert("operation".to_string(), "embed".to_string());
        let envelope = Envelope::new(metadata, mixed_mapping());

        let json = WireFormat::Json.encode(&envelope).unwrap();
        let binary = WireFormat::Binary.encode(&envelope).unwrap();
        assert_eq!(
            WireFormat::Json.decode(&json).unwrap(),
            WireFormat::Binary.decode(&binary).unwrap()
        );
    }

    #[test]
    fn test_content_type() {
        assert_eq!(
            WireFormat::from_content_type("application/json; charset=utf-8"),
            Some(WireFormat::Json)
        );
        assert_eq!(
            WireFormat::from_content_type(WireFormat::Binary.content_type()),
            Some(WireFormat::Binary)
        );
        assert_eq!(WireFormat::from_content_type("text/plain"), None);
    }
}

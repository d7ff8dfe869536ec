use super::Envelope;
use crate::error::BackendError;
use crate::tensor::{DType, NamedTensor, TensorData, TensorMap};
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use serde::de::{Deserializer, IgnoredAny, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

const METADATA_KEY: &str = "__metadata__";

fn to_safetensors_dtype(dtype: DType) -> Dtype {
    match dtype {
        DType::Int32 => Dtype::I32,
        DType::Int64 => Dtype::I64,
        DType::Float32 => Dtype::F32,
        DType::Float16 => Dtype::F16,
    }
}

fn from_safetensors_dtype(name: &str, dtype: Dtype) -> Result<DType, BackendError> {
    match dtype {
        Dtype::I32 => Ok(DType::Int32),
        Dtype::I64 => Ok(DType::Int64),
        Dtype::F32 => Ok(DType::Float32),
        Dtype::F16 => Ok(DType::Float16),
        other => Err(BackendError::invalid_input(
            name,
            format!("unsupported dtype {other:?}"),
        )),
    }
}

pub(super) fn encode(envelope: &Envelope) -> Result<Vec<u8>, BackendError> {
    let buffers: Vec<(&str, Dtype, Vec<usize>, Vec<u8>)> = envelope
        .tensors
        .values()
        .map(|t| {
            (
                t.name(),
                to_safetensors_dtype(t.dtype()),
                t.shape().to_vec(),
                t.data().to_le_bytes(),
            )
        })
        .collect();

    let views = buffers
        .iter()
        .map(|(name, dtype, shape, bytes)| {
            TensorView::new(*dtype, shape.clone(), bytes).map(|view| (*name, view))
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BackendError::internal("encode", e.to_string()))?;

    let metadata: Option<HashMap<String, String>> = if envelope.metadata.is_empty() {
        None
    } else {
        Some(envelope.metadata.clone().into_iter().collect())
    };
    safetensors::serialize(views, &metadata)
        .map_err(|e| BackendError::internal("encode", e.to_string()))
}

pub(super) fn decode(bytes: &[u8]) -> Result<Envelope, BackendError> {
    // The safetensors reader collapses repeated header keys, so check names first.
    check_header_names(bytes)?;

    let malformed =
        |e: safetensors::SafeTensorError| BackendError::invalid_input("body", format!("malformed safetensors payload: {e}"));
    let (_, header) = SafeTensors::read_metadata(bytes).map_err(malformed)?;
    let st = SafeTensors::deserialize(bytes).map_err(malformed)?;

    let metadata: BTreeMap<String, String> = header
        .metadata()
        .clone()
        .map(|m| m.into_iter().collect())
        .unwrap_or_default();

    let mut tensors = TensorMap::new();
    for (name, view) in st.tensors() {
        let dtype = from_safetensors_dtype(&name, view.dtype())?;
        let data = TensorData::from_le_bytes(dtype, view.data())
            .map_err(|reason| BackendError::invalid_input(&name, reason))?;
        let tensor = NamedTensor::new(name, view.shape().to_vec(), data)?;
        tensors.insert(tensor.name().to_string(), tensor);
    }
    Ok(Envelope::new(metadata, tensors))
}

fn check_header_names(bytes: &[u8]) -> Result<(), BackendError> {
    let malformed = |reason: String| BackendError::invalid_input("body", reason);
    let len_bytes: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| malformed("payload shorter than a safetensors header".into()))?;
    let header_len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| malformed("header length does not fit in memory".into()))?;
    let header = bytes
        .get(8..8usize.saturating_add(header_len))
        .ok_or_else(|| malformed(format!("header of {header_len} bytes runs past the payload")))?;

    let HeaderKeys(keys) = serde_json::from_slice(header)
        .map_err(|e| malformed(format!("malformed safetensors header: {e}")))?;

    let mut seen = HashSet::new();
    for key in keys {
        if key == METADATA_KEY {
            continue;
        }
        if key.is_empty() {
            return Err(BackendError::invalid_input("name", "tensor name is empty"));
        }
        if !seen.insert(key.clone()) {
            return Err(BackendError::invalid_input(
                key,
                "tensor name appears more than once",
            ));
        }
    }
    Ok(())
}

/// Top-level keys of a safetensors header in file order, duplicates kept.
struct HeaderKeys(Vec<String>);

impl<'de> Deserialize<'de> for HeaderKeys {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeysVisitor;

        impl<'de> Visitor<'de> for KeysVisitor {
            type Value = HeaderKeys;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a safetensors header object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<HeaderKeys, A::Error> {
                let mut keys = Vec::new();
                while let Some(key) = map.next_key::<String>()? {
                    map.next_value::<IgnoredAny>()?;
                    keys.push(key);
                }
                Ok(HeaderKeys(keys))
            }
        }

        deserializer.deserialize_map(KeysVisitor)
    }
}

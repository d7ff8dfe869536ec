use super::Envelope;
use crate::error::BackendError;
use crate::tensor::{DType, NamedTensor, TensorData, TensorMap};
use half::f16;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    tensors: Vec<WireTensor>,
}

#[derive(Serialize, Deserialize)]
struct WireTensor {
    name: String,
    dtype: String,
    shape: Vec<usize>,
    data: Value,
}

pub(super) fn encode(envelope: &Envelope) -> Result<Vec<u8>, BackendError> {
    let tensors = envelope
        .tensors
        .values()
        .map(to_wire)
        .collect::<Result<Vec<_>, _>>()?;
    let wire = WireEnvelope {
        metadata: envelope.metadata.clone(),
        tensors,
    };
    serde_json::to_vec(&wire).map_err(|e| BackendError::internal("encode", e.to_string()))
}

pub(super) fn decode(bytes: &[u8]) -> Result<Envelope, BackendError> {
    let wire: WireEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| BackendError::invalid_input("body", format!("malformed JSON payload: {e}")))?;

    let mut seen = HashSet::new();
    let mut tensors = TensorMap::new();
    for tensor in wire.tensors {
        if !seen.insert(tensor.name.clone()) {
            return Err(BackendError::invalid_input(
                tensor.name,
                "tensor name appears more than once",
            ));
        }
        let tensor = from_wire(tensor)?;
        tensors.insert(tensor.name().to_string(), tensor);
    }
    Ok(Envelope::new(wire.metadata, tensors))
}

fn to_wire(tensor: &NamedTensor) -> Result<WireTensor, BackendError> {
    // JSON has no NaN or infinity
    if !tensor.data().is_finite() {
        return Err(BackendError::invalid_input(
            tensor.name(),
            "non-finite values cannot be carried by the JSON binding",
        ));
    }
    let data = match tensor.data() {
        TensorData::Int32(v) => serde_json::to_value(v),
        TensorData::Int64(v) => serde_json::to_value(v),
        TensorData::Float32(v) => serde_json::to_value(v),
        TensorData::Float16(v) => {
            serde_json::to_value(v.iter().map(|x| x.to_f32()).collect::<Vec<_>>())
        }
    }
    .map_err(|e| BackendError::internal("encode", e.to_string()))?;

    Ok(WireTensor {
        name: tensor.name().to_string(),
        dtype: tensor.dtype().to_string(),
        shape: tensor.shape().to_vec(),
        data,
    })
}

fn from_wire(tensor: WireTensor) -> Result<NamedTensor, BackendError> {
    let WireTensor {
        name,
        dtype,
        shape,
        data,
    } = tensor;
    let dtype = DType::from_str(&dtype)
        .map_err(|_| BackendError::invalid_input(&name, format!("unsupported dtype `{dtype}`")))?;
    let bad_data =
        |e: serde_json::Error| BackendError::invalid_input(&name, format!("data is not {dtype}: {e}"));
    let data = match dtype {
        DType::Int32 => TensorData::Int32(serde_json::from_value(data).map_err(bad_data)?),
        DType::Int64 => TensorData::Int64(serde_json::from_value(data).map_err(bad_data)?),
        DType::Float32 => TensorData::Float32(serde_json::from_value(data).map_err(bad_data)?),
        DType::Float16 => {
            let values: Vec<f32> = serde_json::from_value(data).map_err(bad_data)?;
            let halves: Vec<f16> = values.into_iter().map(f16::from_f32).collect();
            if let Some(i) = halves.iter().position(|h| !h.is_finite()) {
                return Err(BackendError::invalid_input(
                    &name,
                    format!("value {i} is out of range for float16"),
                ));
            }
            TensorData::Float16(halves)
        }
    };
    NamedTensor::new(name, shape, data)
}

//! Request routing
//!
//! Maps an inbound request onto its operation and checks, before any backend
//! work happens, that the inputs the operation needs are present and shaped the
//! way the backend expects. The router holds no state besides its limits.
use crate::codec::Envelope;
use crate::config::ServingConfig;
use crate::error::BackendError;
use crate::request::{
    InferenceRequest, Operation, ResolvedOptions, HIDDEN_STATES, INCLUDE_HIDDENS_KEY, MASK,
    MICRO_BATCH_SIZE_KEY, SEQUENCES,
};
use crate::tensor::{DType, NamedTensor, TensorData, TensorMap};

/// A request that passed validation, ready for the adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedRequest {
    pub operation: Operation,
    pub inputs: TensorMap,
    pub options: ResolvedOptions,
    /// Rows along the shared leading dimension of every input.
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct RequestRouter {
    max_sequence_length: usize,
    reject_unknown_options: bool,
}

impl RequestRouter {
    pub fn new(config: &ServingConfig) -> Self {
        Self {
            max_sequence_length: config.max_sequence_length,
            reject_unknown_options: config.reject_unknown_options,
        }
    }

    /// Parse the envelope metadata, then [`RequestRouter::route`].
    pub fn route_envelope(&self, envelope: Envelope) -> Result<RoutedRequest, BackendError> {
        let request = InferenceRequest::from_envelope(envelope, self.reject_unknown_options)?;
        self.route(request)
    }

    pub fn route(&self, request: InferenceRequest) -> Result<RoutedRequest, BackendError> {
        let InferenceRequest {
            operation,
            inputs,
            options,
        } = request;

        for name in operation.required_inputs() {
            if !inputs.contains_key(*name) {
                return Err(BackendError::invalid_input(
                    *name,
                    format!("`{operation}` requires input `{name}`"),
                ));
            }
        }
        for name in inputs.keys() {
            if !operation.accepted_inputs().contains(&name.as_str()) {
                return Err(BackendError::invalid_input(
                    name,
                    format!("`{operation}` does not take input `{name}`"),
                ));
            }
        }

        if options.micro_batch_size == Some(0) {
            return Err(BackendError::invalid_input(
                MICRO_BATCH_SIZE_KEY,
                "micro batch size must be positive",
            ));
        }
        if operation == Operation::Sample && options.include_hiddens == Some(true) {
            return Err(BackendError::invalid_input(
                INCLUDE_HIDDENS_KEY,
                "`sample` produces no hidden states",
            ));
        }

        match operation {
            Operation::Embed | Operation::Hidden => {
                self.check_sequences(&inputs[SEQUENCES])?;
            }
            Operation::Sample => {
                check_hidden_states(&inputs[HIDDEN_STATES], inputs.get(MASK))?;
            }
        }

        let batch_size = shared_batch_size(&inputs)?;
        Ok(RoutedRequest {
            operation,
            options: options.resolve(operation),
            inputs,
            batch_size,
        })
    }

    fn check_sequences(&self, tensor: &NamedTensor) -> Result<(), BackendError> {
        let TensorData::Int32(codes) = tensor.data() else {
            return Err(BackendError::invalid_input(
                SEQUENCES,
                format!("expected int32 residue codes, found {}", tensor.dtype()),
            ));
        };
        if tensor.shape().len() != 2 {
            return Err(BackendError::invalid_input(
                SEQUENCES,
                format!("expected shape [batch, width], found {:?}", tensor.shape()),
            ));
        }
        for (row, chunk) in codes.chunks(tensor.shape()[1]).enumerate() {
            let len = chunk.iter().take_while(|&&c| c != 0).count();
            if len == 0 {
                return Err(BackendError::invalid_input(
                    SEQUENCES,
                    format!("sequence {row} is empty"),
                ));
            }
            if let Some(code) = chunk[..len].iter().find(|&&c| !(33..127).contains(&c)) {
                return Err(BackendError::invalid_input(
                    SEQUENCES,
                    format!("sequence {row} holds unsupported code {code}"),
                ));
            }
            if len > self.max_sequence_length {
                return Err(BackendError::invalid_input(
                    SEQUENCES,
                    format!(
                        "sequence {row} has {len} residues, longer than the maximum of {}",
                        self.max_sequence_length
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn check_hidden_states(
    hidden: &NamedTensor,
    mask: Option<&NamedTensor>,
) -> Result<(), BackendError> {
    if !matches!(hidden.dtype(), DType::Float32 | DType::Float16) || hidden.shape().len() != 3 {
        return Err(BackendError::invalid_input(
            HIDDEN_STATES,
            format!(
                "expected float [batch, tokens, hidden], found {} {:?}",
                hidden.dtype(),
                hidden.shape()
            ),
        ));
    }
    if let Some(mask) = mask {
        if !matches!(mask.dtype(), DType::Int32 | DType::Int64) || mask.shape() != &hidden.shape()[..2]
        {
            return Err(BackendError::invalid_input(
                MASK,
                format!(
                    "expected int {:?} to match `{}`, found {} {:?}",
                    &hidden.shape()[..2],
                    HIDDEN_STATES,
                    mask.dtype(),
                    mask.shape()
                ),
            ));
        }
    }
    Ok(())
}

fn shared_batch_size(inputs: &TensorMap) -> Result<usize, BackendError> {
    let mut tensors = inputs.values();
    let first = tensors
        .next()
        .ok_or_else(|| BackendError::invalid_input("inputs", "request has no inputs"))?;
    for tensor in tensors {
        if tensor.rows() != first.rows() {
            return Err(BackendError::invalid_input(
                tensor.name(),
                format!(
                    "{} rows, but `{}` has {}",
                    tensor.rows(),
                    first.name(),
                    first.rows()
                ),
            ));
        }
    }
    Ok(first.rows())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::request::InferenceOptions;

    fn router() -> RequestRouter {
        RequestRouter::new(&ServingConfig {
            max_sequence_length: 6,
            ..Default::default()
        })
    }

    fn hidden(rows: usize, tokens: usize) -> NamedTensor {
        NamedTensor::new(
            HIDDEN_STATES,
            vec![rows, tokens, 2],
            TensorData::Float32(vec![0.5; rows * tokens * 2]),
        )
        .unwrap()
    }

    #[test]
    fn test_routes_embed() {
        let request =
            InferenceRequest::from_sequences(Operation::Embed, &["ACDE", "GGHH"], InferenceOptions::default())
                .unwrap();
        let routed = router().route(request).unwrap();
        assert_eq!(routed.batch_size, 2);
        assert!(routed.options.include_embeddings);
        assert!(!routed.options.include_logits);
    }

    #[test]
    fn test_missing_input_names_it() {
        let request = InferenceRequest::new(Operation::Embed, InferenceOptions::default());
        let err = router().route(request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.field(), Some(SEQUENCES));

        let request = InferenceRequest::new(Operation::Sample, InferenceOptions::default());
        assert_eq!(router().route(request).unwrap_err().field(), Some(HIDDEN_STATES));
    }

    #[test]
    fn test_unexpected_input() {
        let request = InferenceRequest::new(Operation::Embed, InferenceOptions::default())
            .with_input(NamedTensor::from_sequences(SEQUENCES, &["ACDE"]).unwrap())
            .with_input(hidden(1, 3));
        assert_eq!(router().route(request).unwrap_err().field(), Some(HIDDEN_STATES));
    }

    #[test]
    fn test_sequence_checks() {
        let too_long = InferenceRequest::from_sequences(
            Operation::Hidden,
            &["ACDEFGH"],
            InferenceOptions::default(),
        )
        .unwrap();
        let err = router().route(too_long).unwrap_err();
        assert!(err.to_string().contains("longer than the maximum of 6"));

        let wrong_dtype = InferenceRequest::new(Operation::Embed, InferenceOptions::default())
            .with_input(NamedTensor::new(SEQUENCES, vec![1, 2], TensorData::Int64(vec![65, 65])).unwrap());
        assert_eq!(router().route(wrong_dtype).unwrap_err().field(), Some(SEQUENCES));

        let padded_row = InferenceRequest::new(Operation::Embed, InferenceOptions::default())
            .with_input(NamedTensor::new(SEQUENCES, vec![2, 2], TensorData::Int32(vec![65, 65, 0, 0])).unwrap());
        assert!(router().route(padded_row).unwrap_err().to_string().contains("sequence 1 is empty"));
    }

    #[test]
    fn test_option_checks() {
        let zero = InferenceOptions::builder().micro_batch_size(0).build();
        let request = InferenceRequest::from_sequences(Operation::Embed, &["ACDE"], zero).unwrap();
        assert_eq!(router().route(request).unwrap_err().field(), Some(MICRO_BATCH_SIZE_KEY));

        let hiddens = InferenceOptions::builder().include_hiddens(true).build();
        let request = InferenceRequest::new(Operation::Sample, hiddens).with_input(hidden(1, 3));
        assert_eq!(router().route(request).unwrap_err().field(), Some(INCLUDE_HIDDENS_KEY));
    }

    #[test]
    fn test_sample_mask_must_match() {
        let good_mask = NamedTensor::new(MASK, vec![2, 3], TensorData::Int64(vec![1; 6])).unwrap();
        let request = InferenceRequest::new(Operation::Sample, InferenceOptions::default())
            .with_input(hidden(2, 3))
            .with_input(good_mask);
        let routed = router().route(request).unwrap();
        assert_eq!(routed.batch_size, 2);
        assert_eq!(routed.options.requested_outputs(Operation::Sample), vec![SEQUENCES]);

        let bad_mask = NamedTensor::new(MASK, vec![2, 4], TensorData::Int64(vec![1; 8])).unwrap();
        let request = InferenceRequest::new(Operation::Sample, InferenceOptions::default())
            .with_input(hidden(2, 3))
            .with_input(bad_mask);
        assert_eq!(router().route(request).unwrap_err().field(), Some(MASK));
    }
}

pub mod infer;
pub mod query;
pub mod serve;

use crate::cli::RequestArgs;
use anyhow::Result;
use ferritin_io::read_sequences;
use ferritin_serving::client::{Dispatcher, Transport};
use ferritin_serving::request::{HIDDEN_STATES, MASK, SEQUENCES};
use ferritin_serving::{BackendError, InferenceRequest, InferenceResponse, Operation};
use itertools::Itertools;

/// Build the request described by `args`, dispatch it and report the outputs.
pub async fn run<T: Transport>(dispatcher: &Dispatcher<T>, args: &RequestArgs) -> Result<()> {
    let request = build_request(args)?;
    let response = dispatcher
        .dispatch_and_persist(&request, args.results.as_deref())
        .await?;
    print_summary(&response)?;
    Ok(())
}

fn build_request(args: &RequestArgs) -> Result<InferenceRequest> {
    let options = args.options();
    if args.operation == Operation::Sample {
        let previous = InferenceResponse::load(&args.data)?;
        let hidden = previous.get(HIDDEN_STATES).cloned().ok_or_else(|| {
            BackendError::invalid_input(
                HIDDEN_STATES,
                format!("{} holds no `{HIDDEN_STATES}`", args.data.display()),
            )
        })?;
        let mut request = InferenceRequest::new(Operation::Sample, options).with_input(hidden);
        if let Some(mask) = previous.get(MASK).cloned() {
            request = request.with_input(mask);
        }
        return Ok(request);
    }

    let records = read_sequences(&args.data, args.max_sequences)?;
    tracing::info!(
        path = %args.data.display(),
        sequences = records.len(),
        "read sequences"
    );
    let sequences = records.iter().map(|r| r.sequence.as_str()).collect_vec();
    Ok(InferenceRequest::from_sequences(
        args.operation,
        &sequences,
        options,
    )?)
}

fn print_summary(response: &InferenceResponse) -> Result<()> {
    for (name, tensor) in &response.outputs {
        println!(
            "{}\t{}\t[{}]",
            name,
            tensor.dtype(),
            tensor.shape().iter().join(", ")
        );
    }
    if response.operation == Operation::Sample {
        if let Some(sequences) = response.get(SEQUENCES) {
            for sequence in sequences.to_sequences()? {
                println!("{sequence}");
            }
        }
    }
    Ok(())
}

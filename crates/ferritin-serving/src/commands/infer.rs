use crate::cli::RequestArgs;
use anyhow::Result;
use ferritin_serving::backend::{device, CandleBackend};
use ferritin_serving::client::{Dispatcher, LocalTransport};
use ferritin_serving::{InferenceService, ServingConfig};
use std::path::Path;
use std::sync::Arc;

pub async fn execute(config: &ServingConfig, args: RequestArgs, checkpoint: &Path) -> Result<()> {
    let backend = CandleBackend::load(checkpoint, device(config.cpu)?)?
        .with_max_in_flight(config.max_in_flight);
    let service = Arc::new(InferenceService::new(Arc::new(backend), config)?);
    let dispatcher = Dispatcher::new(LocalTransport::new(service.clone()), args.wire);

    let result = super::run(&dispatcher, &args).await;
    service.shutdown().await;
    result
}

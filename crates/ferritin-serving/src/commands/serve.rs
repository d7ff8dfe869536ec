use anyhow::{Context, Result};
use ferritin_serving::backend::{device, CandleBackend};
use ferritin_serving::server::{serve, shutdown_signal};
use ferritin_serving::{InferenceService, ServingConfig};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;

pub async fn execute(config: &ServingConfig, checkpoint: &Path) -> Result<()> {
    let backend = CandleBackend::load(checkpoint, device(config.cpu)?)?
        .with_max_in_flight(config.max_in_flight);
    let service = Arc::new(InferenceService::new(Arc::new(backend), config)?);
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    let result = serve(
        service.clone(),
        listener,
        config.max_body_bytes,
        shutdown_signal(),
    )
    .await;
    service.shutdown().await;
    result
}

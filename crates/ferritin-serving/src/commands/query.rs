use crate::cli::RequestArgs;
use anyhow::Result;
use ferritin_serving::client::{Dispatcher, HttpTransport};

pub async fn execute(args: RequestArgs, url: &str) -> Result<()> {
    let transport = HttpTransport::new(url);
    tracing::debug!(url = %transport.url(), "querying server");
    let dispatcher = Dispatcher::new(transport, args.wire);
    super::run(&dispatcher, &args).await
}

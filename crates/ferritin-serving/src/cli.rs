use super::commands;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use ferritin_serving::config::{BatchPolicy, ServingConfig};
use ferritin_serving::logging::init_logging;
use ferritin_serving::{InferenceOptions, Operation, WireFormat};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON config file. Flags given on the command line take precedence.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log JSON lines instead of text.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a request in-process against a local checkpoint.
    Infer {
        #[command(flatten)]
        request: RequestArgs,

        /// Checkpoint directory holding `config.json` and `model.safetensors`.
        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(long)]
        cpu: bool,

        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Load a checkpoint and serve it over HTTP.
    Serve {
        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(long)]
        listen: Option<SocketAddr>,

        #[arg(long)]
        cpu: bool,

        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Send a request to a running server.
    Query {
        #[command(flatten)]
        request: RequestArgs,

        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,
    },
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// embed | hidden | sample (alias: decode)
    #[arg(value_enum)]
    pub operation: Operation,

    /// Sequences as FASTA, CSV with a `sequence` column, or one per line.
    /// For `sample`, a results file holding `hidden_states`.
    #[arg(long)]
    pub data: PathBuf,

    /// Write the outputs here as safetensors.
    #[arg(long)]
    pub results: Option<PathBuf>,

    #[arg(long)]
    pub micro_batch_size: Option<usize>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub include_hiddens: Option<bool>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub include_embeddings: Option<bool>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub include_logits: Option<bool>,

    /// Wire binding for the request.
    #[arg(long, value_enum, default_value_t = WireFormat::Binary)]
    pub wire: WireFormat,

    /// Only read the first N sequences.
    #[arg(long)]
    pub max_sequences: Option<usize>,
}

impl RequestArgs {
    pub fn options(&self) -> InferenceOptions {
        InferenceOptions::builder()
            .maybe_micro_batch_size(self.micro_batch_size)
            .maybe_include_hiddens(self.include_hiddens)
            .maybe_include_embeddings(self.include_embeddings)
            .maybe_include_logits(self.include_logits)
            .build()
    }
}

#[derive(Args, Debug)]
struct LimitArgs {
    #[arg(long)]
    max_micro_batch_size: Option<usize>,

    #[arg(long, value_enum)]
    batch_policy: Option<BatchPolicy>,

    #[arg(long)]
    backend_timeout_ms: Option<u64>,
}

impl LimitArgs {
    fn apply(&self, config: &mut ServingConfig) {
        if let Some(size) = self.max_micro_batch_size {
            config.max_micro_batch_size = size;
        }
        if let Some(policy) = self.batch_policy {
            config.batch_policy = policy;
        }
        if let Some(timeout) = self.backend_timeout_ms {
            config.backend_timeout_ms = timeout;
        }
    }
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let mut config = ServingConfig::load(self.config.as_deref())?;
        config.json_logs |= self.json_logs;
        match &self.command {
            Commands::Infer { cpu, limits, .. } | Commands::Serve { cpu, limits, .. } => {
                config.cpu |= *cpu;
                limits.apply(&mut config);
            }
            Commands::Query { .. } => {}
        }
        if let Commands::Serve {
            listen: Some(listen),
            ..
        } = &self.command
        {
            config.listen = *listen;
        }
        let config = config.validated()?;
        init_logging(&config.log_level, config.json_logs);

        match self.command {
            Commands::Infer {
                request,
                checkpoint,
                ..
            } => commands::infer::execute(&config, request, &checkpoint).await,
            Commands::Serve { checkpoint, .. } => {
                commands::serve::execute(&config, &checkpoint).await
            }
            Commands::Query { request, url } => commands::query::execute(request, &url).await,
        }
    }
}

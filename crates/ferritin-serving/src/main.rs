use clap::Parser;
use ferritin_serving::BackendError;
use std::process::ExitCode;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    match cli.execute().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<BackendError>() {
            Some(err) => {
                eprintln!("error[{}]: {err}", err.kind());
                ExitCode::from(err.exit_code())
            }
            None => {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

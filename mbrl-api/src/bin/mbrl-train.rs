use anyhow::Result;
use clap::Parser;
use mbrl_api::run_job_file;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mbrl-train", about = "Model accelerated policy optimization")]
struct Cli {
    /// Location to store results
    #[arg(long)]
    output: PathBuf,

    /// JSON file with the experiment parameters
    #[arg(long)]
    config: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    run_job_file(&cli.output, &cli.config)
}

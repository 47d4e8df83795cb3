use anyhow::Result;
use clap::Parser;
use grbalance::{app, config};
use std::path::PathBuf;

/// Payment reconciliation web service
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Settings file (defaults to ./grbalance.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Address to listen on, overriding the settings
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = config::load_settings(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }

    app::run(settings).await
}

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use davmirror::config::{self, ClientType};
use davmirror::store;
use davmirror::sync::OneWaySync;

#[derive(Debug, Parser)]
#[command(
    name = "davmirror",
    version,
    about = "One-way tree synchronization between local, WebDAV and cloud-disk stores"
)]
struct Args {
    /// Input base directory
    #[arg(short = 'i', long = "input", default_value = "./")]
    input: String,

    /// Output base directory
    #[arg(short = 'o', long = "output", default_value = "/")]
    output: String,

    /// Input client config (JSON)
    #[arg(long = "input-conf")]
    input_conf: Option<PathBuf>,

    /// Output client config (JSON)
    #[arg(long = "output-conf")]
    output_conf: Option<PathBuf>,

    /// Worker count per phase (default 4)
    #[arg(long)]
    threads: Option<usize>,

    /// Max attempts per transfer (default 3)
    #[arg(long)]
    attempts: Option<u32>,

    /// Sync type
    #[arg(long = "sync", default_value = "OneWay")]
    sync: String,

    /// Sync config (JSON)
    #[arg(long = "sync-conf")]
    sync_conf: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.sync != "OneWay" {
        bail!("unsupported sync type '{}'", args.sync);
    }

    let input_config =
        config::load_client_config(args.input_conf.as_deref(), &args.input, ClientType::Local)
            .context("input client config")?;
    let output_config =
        config::load_client_config(args.output_conf.as_deref(), &args.output, ClientType::Webdav)
            .context("output client config")?;
    // the config enum only knows OneWay; parsing rejects anything else
    let sync_config = config::load_sync_config(args.sync_conf.as_deref(), args.threads, args.attempts)
        .context("sync config")?;

    let input = store::create_store(&input_config).context("input client")?;
    let output = store::create_store(&output_config).context("output client")?;

    let options = sync_config.one_way.to_options();
    let (errors_tx, mut errors_rx) = mpsc::channel(options.thread_count + 1);
    let listener = tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(err) = errors_rx.recv().await {
            error!("sync error: {err}");
            count += 1;
        }
        count
    });

    info!(
        input = %input_config.base_dir,
        output = %output_config.base_dir,
        "one-way sync started"
    );
    let engine = OneWaySync::new(input, output, options, errors_tx);
    engine.run().await;
    drop(engine);

    let failures = listener.await.unwrap_or(0);
    if failures > 0 {
        error!(failures, "sync finished with errors");
        return Ok(ExitCode::FAILURE);
    }
    info!("done");
    Ok(ExitCode::SUCCESS)
}

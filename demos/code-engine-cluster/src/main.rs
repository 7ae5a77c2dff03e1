//! Start a cluster on IBM Cloud Code Engine, print the scheduler address, and tear the cluster
//! down again on Ctrl-C.
//!
//! Anything not given on the command line is read from the `[cloudprovider.ibm]` table of the
//! configuration file. The API key is only read from configuration, for example through the
//! `STRATUS_CLOUDPROVIDER__IBM__API_KEY` environment variable.

use std::path::PathBuf;

use clap::Parser;
use error_stack::Report;
use stratus_ibm_code_engine::{CodeEngineCluster, IbmConfig};
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
pub struct Cli {
    /// Read configuration from this file instead of the default location.
    #[clap(long)]
    config: Option<PathBuf>,

    /// The container image for the scheduler and workers.
    #[clap(long)]
    image: Option<String>,

    /// The IBM Cloud region, e.g. us-south.
    #[clap(long)]
    region: Option<String>,

    /// The Code Engine project to create the apps in.
    #[clap(long)]
    project_id: Option<String>,

    /// The cluster name. A random name is generated if omitted.
    #[clap(long)]
    name: Option<String>,

    /// The number of workers to start.
    #[clap(long)]
    workers: Option<usize>,

    /// Log cluster lifecycle messages at INFO.
    #[clap(long)]
    debug: bool,
}

fn to_eyre<C>(report: Report<C>) -> eyre::Report {
    eyre::eyre!("{report:?}")
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();
    let config = IbmConfig::load(args.config.as_deref()).map_err(to_eyre)?;

    let mut builder = CodeEngineCluster::builder(config).debug(args.debug);
    if let Some(name) = args.name {
        builder = builder.name(name);
    }
    if let Some(image) = args.image {
        builder = builder.image(image);
    }
    if let Some(region) = args.region {
        builder = builder.region(region);
    }
    if let Some(project_id) = args.project_id {
        builder = builder.project_id(project_id);
    }
    if let Some(workers) = args.workers {
        builder = builder.n_workers(workers);
    }

    let mut cluster = builder.build().map_err(to_eyre)?;
    event!(Level::INFO, cluster = %cluster.name(), "Starting cluster");

    let cancel = cluster.cancel_handle();
    let shutdown = tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel.cancel();
    });

    if let Err(e) = cluster.start().await {
        event!(Level::ERROR, "Cluster failed to start, cleaning up");
        if let Err(close_err) = cluster.close().await {
            event!(Level::ERROR, error = ?close_err, "Failed to clean up cluster");
        }
        return Err(to_eyre(e));
    }

    match cluster.scheduler_address() {
        Some(address) => println!("Scheduler running at {address}"),
        None => println!("Scheduler running"),
    }
    println!("Press Ctrl-C to shut down the cluster");

    shutdown.await.ok();
    event!(Level::INFO, "Shutting down cluster");
    cluster.close().await.map_err(to_eyre)?;

    Ok(())
}

use anyhow::Context;
use clap::Parser;
use logdevice::{NodeConfigFile, Server};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "logdeviced", about = "LogDevice storage/sequencer node", version)]
struct Args {
    /// Path to the node's JSON config file.
    #[arg(long)]
    config: PathBuf,

    /// Log at debug level regardless of RUST_LOG.
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logd_o11y::init_subscriber(args.verbose);

    let config = NodeConfigFile::load(&args.config).context("loading config")?;
    tracing::info!(
        cluster = %config.server.cluster_name,
        node = config.my_node_index,
        "starting logdeviced"
    );

    let server = Server::start(config).context("starting server")?;

    wait_for_shutdown_signal()?;

    // Exit nonzero when the shutdown sequence could not finish in time;
    // the supervisor escalates to a kill.
    if server.shutdown() {
        tracing::info!("shutdown complete");
        Ok(())
    } else {
        anyhow::bail!("shutdown timed out");
    }
}

fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the signal runtime")?;
    runtime.block_on(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term =
                signal(SignalKind::terminate()).context("installing the SIGTERM handler")?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        tracing::info!("received shutdown signal");
        Ok(())
    })
}

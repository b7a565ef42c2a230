mod monitor;
mod roster;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tether_core::{Runtime, RuntimeConfig};

use crate::monitor::Monitor;
use crate::server::{ChatServer, Mode};

/// Tether chat server options
#[derive(Parser)]
struct Opts {
    /// Port to listen on
    #[arg(short, long, default_value = "6969")]
    port: u16,

    /// Echo every message back to its sender instead of relaying it
    #[arg(long)]
    echo: bool,

    /// Seconds between connected-client reports
    #[arg(long, default_value = "1")]
    monitor_interval: u64,

    /// Runtime configuration file (TOML); TETHER_* variables are used otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    tether_core::init_logging("info");

    let config = match &opts.config {
        Some(path) => RuntimeConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RuntimeConfig::from_env().context("reading TETHER_* environment")?,
    };
    let rt = Arc::new(Runtime::new(config).context("starting runtime")?);

    let listener = rt
        .listen(&format!(":{}", opts.port))
        .with_context(|| format!("failed to listen on :{}", opts.port))?;
    let mode = if opts.echo { Mode::Echo } else { Mode::Chat };
    tracing::info!(port = opts.port, ?mode, "server listening");

    // Ctrl-C closes the listener, which ends the accept loop below.
    let interrupt = {
        let rt_task = rt.clone();
        rt.tasks().launch_detached(move || {
            if let Err(e) = rt_task.block_on(tokio::signal::ctrl_c()) {
                tracing::error!(error = %e, "cannot listen for ctrl-c");
                return;
            }
            tracing::info!("interrupt received, shutting down");
            let _ = rt_task.close_listener(listener);
        })
    };

    let server = ChatServer::new(rt.clone(), mode);
    let monitor = Monitor::start(
        &rt,
        server.roster().clone(),
        Duration::from_secs(opts.monitor_interval.max(1)),
    );

    server.serve(listener);

    if !monitor.stop(&rt) {
        tracing::warn!("monitor did not stop in time");
    }
    rt.tasks().wait(interrupt)?;
    drop(server);

    match Arc::try_unwrap(rt) {
        Ok(rt) => rt.shutdown(),
        Err(_) => tracing::warn!("runtime still referenced by running tasks, exiting without shutdown"),
    }
    Ok(())
}

use tracing_subscriber::EnvFilter;

use std::process;
use std::time::Duration;

use dynvpn_lib::config;

mod cli;
mod http;
mod node;
mod peer;

use node::Node;

#[tokio::main]
async fn main() {
    let args = cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        site_id = %args.site_id,
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let exit = run(args).await;

    if exit != exitcode::OK {
        tracing::warn!("abnormal exit");
    }

    process::exit(exit)
}

async fn run(args: cli::Cli) -> exitcode::ExitCode {
    let local = match config::read_local(&args.local_config).await {
        Ok(local) => local,
        Err(e) => {
            tracing::error!(path = %args.local_config.display(), error = %e, "failed reading local configuration");
            return exitcode::CONFIG;
        }
    };

    let global = match config::read_global(&args.global_config).await {
        Ok(global) => global,
        Err(e) => {
            tracing::error!(path = %args.global_config.display(), error = %e, "failed reading global configuration");
            return exitcode::CONFIG;
        }
    };

    let node = match Node::new(args.site_id, local, global) {
        Ok(node) => node,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return exitcode::CONFIG;
        }
    };

    if let Err(e) = node.start().await {
        tracing::error!(error = %e, "failed to start coordinator");
        return exitcode::IOERR;
    }

    let shutdown = node.shutdown_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("initiate shutdown");
            node.begin_shutdown();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("force shutdown immediately");
                }
                _ = shutdown.cancelled() => {}
            }
        }
        _ = shutdown.cancelled() => {
            tracing::info!("shutdown requested via control api");
        }
    }

    // let in-flight control responses drain before tearing the tasks down
    tokio::time::sleep(Duration::from_millis(100)).await;
    node.abort_tasks();
    exitcode::OK
}

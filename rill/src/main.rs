//! rill: a single-threaded live streaming media server.

use clap::Parser;
use log::{error, info};
use rill::config::Config;
use rill::server::Server;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rill", version, about = "live streaming media server")]
struct Args {
    /// Config file path.
    #[arg(short = 'c', long = "conf")]
    config: Option<PathBuf>,

    /// Check the config file and exit.
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Override the graceful-quit grace interval, seconds.
    #[arg(short = 'g', long = "grace")]
    grace: Option<u64>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                error!("config {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if args.test {
        info!("config check ok");
        return;
    }
    if let Some(grace) = args.grace {
        config.grace_secs = grace;
    }

    // one OS thread; every connection is a cooperative coroutine on the
    // local set
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");
    let local = tokio::task::LocalSet::new();
    let result = local.block_on(&runtime, async move {
        let server = Server::new(config, args.config.clone());
        server.run().await
    });

    if let Err(e) = result {
        error!("server failed: {e}");
        std::process::exit(1);
    }
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_std::task;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::{console::spawn_stdin_reader, host::Host};

mod console;
mod host;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_SHA: &str = env!("GIT_SHA");

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(short, long, help = "Path of a YAML configuration file.")]
    conf: Option<PathBuf>,
    #[arg(short, long, help = "Port on which remote connections are accepted.")]
    port: Option<u16>,
    #[arg(short, long, help = "Maximum number of remote clients.")]
    max_clients: Option<u8>,
    #[arg(short, long, help = "Run without a local client.")]
    dedicated: bool,
    #[arg(long, help = "Accept remote connections right after start.")]
    listen: bool,
    #[arg(short, long, help = "Log every datagram.")]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.verbose {
            Level::TRACE
        } else {
            Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install the log subscriber")?;

    info!("Starting Arena version: {CARGO_PKG_VERSION}, git SHA: {GIT_SHA}");

    let result = start(args);
    if let Err(error) = result.as_ref() {
        error!("{error:?}");
    }
    result
}

fn start(args: Args) -> Result<()> {
    let path = match args.conf {
        Some(path) => Some(path),
        None => ar_conf::default_conf_path().map(Into::into),
    };
    let conf = match path {
        Some(path) => task::block_on(ar_conf::load_conf(path.as_path().into()))?,
        None => ar_conf::Configuration::default(),
    };

    let mut network = conf.network().clone();
    if let Some(port) = args.port {
        network.set_host_port(port)?;
    }
    if let Some(max_clients) = args.max_clients {
        network.set_max_clients(max_clients)?;
    }
    if args.dedicated {
        network.set_dedicated(true);
    }
    if args.listen {
        network.set_listen(true);
    }

    let commands = spawn_stdin_reader();
    Host::new(&network).run(commands);
    info!("Bye");
    Ok(())
}

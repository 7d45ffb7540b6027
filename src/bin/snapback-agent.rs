use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

use snapback::agent::{self, AgentConfig, DEFAULT_AGENT_CONFIG_PATH};
use snapback::util::{self, CancelToken};

#[derive(Parser, Debug)]
#[command(author, version, about = "Pull snapshots from backup hosts and enforce the storage budget", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_AGENT_CONFIG_PATH)]
    config: PathBuf,

    /// Increase verbosity
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = match AgentConfig::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    let log_level = if args.verbose || cfg.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cancel = CancelToken::new();
    util::install_signal_handler(&cancel);

    if let Err(e) = agent::run(&cancel, &cfg) {
        error!("{e}");
        process::exit(1);
    }
    Ok(())
}

use std::io::Write;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::Zeroize;

use snapback::config::{Config, DEFAULT_CONFIG_PATH};
use snapback::crypt::keyfile;
use snapback::engine;
use snapback::restore;
use snapback::util::{self, CancelToken};
use snapback::{Result, SnapbackError};

#[derive(Parser, Debug)]
#[command(author, version, about = "Incremental encrypted deduplicating backups", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Increase verbosity
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Suppress non-error messages
    #[arg(short, long, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Produce one incremental snapshot of the configured paths
    Backup,
    /// Rebuild a tree from the most recent generation
    Restore {
        /// Destination directory
        dest: PathBuf,
        /// Only restore paths matching this regular expression
        filename_regex: Option<String>,
        /// Highest increment to apply (default: all)
        increment: Option<u16>,
    },
    /// Dump one snapshot file record by record to stdout
    Cat {
        /// Snapshot file (`<timestamp>-<host>-<inc>.gz.enc`)
        snapshot: PathBuf,
    },
    /// Generate a recipient keypair
    Keygen {
        /// Directory that receives snapback.pub and snapback.key
        dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // keygen runs without a config file; everything else loads it first so
    // `debug` can raise the log level.
    let cfg = match &args.command {
        Command::Keygen { .. } => None,
        _ => match Config::load(&args.config) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        },
    };

    let log_level = if args.quiet {
        Level::ERROR
    } else if args.verbose || cfg.as_ref().map(|c| c.debug).unwrap_or(false) {
        Level::DEBUG
    } else {
        Level::INFO
    };

    // stdout belongs to `cat`; all logging goes to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cancel = CancelToken::new();
    util::install_signal_handler(&cancel);

    if cfg.as_ref().map(|c| c.profile).unwrap_or(false) {
        spawn_profile_listener();
    }

    if let Err(e) = run(&args, cfg.as_ref(), &cancel) {
        error!("{e}");
        process::exit(1);
    }
    Ok(())
}

fn run(args: &Args, cfg: Option<&Config>, cancel: &CancelToken) -> Result<()> {
    match &args.command {
        Command::Backup => {
            let cfg = cfg.expect("config loaded for backup");
            cfg.check_backup()?;
            let pubkey = keyfile::read_public_key(&cfg.backup.pubkeyfile)?;
            engine::backup(cancel, &pubkey, cfg)
        }
        Command::Restore {
            dest,
            filename_regex,
            increment,
        } => {
            let cfg = cfg.expect("config loaded for restore");
            cfg.check_restore()?;
            if cfg.backuppath.as_os_str().is_empty() {
                return Err(SnapbackError::Config("backuppath not set".into()));
            }
            let pattern = filename_regex
                .as_deref()
                .map(regex::bytes::Regex::new)
                .transpose()?;
            let secret = read_secret(cfg)?;
            restore::restore(
                cancel,
                &secret,
                &cfg.backuppath,
                dest,
                pattern.as_ref(),
                *increment,
            )
        }
        Command::Cat { snapshot } => {
            let cfg = cfg.expect("config loaded for cat");
            cfg.check_restore()?;
            let secret = read_secret(cfg)?;
            restore::cat(cancel, &secret, snapshot)
        }
        Command::Keygen { dir } => keygen(dir),
    }
}

/// Prompt for the secret file's passphrase on the controlling terminal and
/// open it. The passphrase is wiped once used.
fn read_secret(cfg: &Config) -> Result<keyfile::SecretKey> {
    let prompt = format!("{:?} secret: ", cfg.restore.secretfile);
    let mut passphrase = rpassword::prompt_password(prompt)?;
    let secret = keyfile::read_secret_key(&cfg.restore.secretfile, passphrase.as_bytes());
    passphrase.zeroize();
    secret
}

fn keygen(dir: &PathBuf) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let mut passphrase = rpassword::prompt_password("new secret key passphrase: ")?;
    let mut confirm = rpassword::prompt_password("repeat passphrase: ")?;
    if passphrase != confirm {
        passphrase.zeroize();
        confirm.zeroize();
        return Err(SnapbackError::Config("passphrases do not match".into()));
    }

    let pair = keyfile::generate();
    let pub_path = dir.join("snapback.pub");
    let key_path = dir.join("snapback.key");
    keyfile::write_public_key(&pub_path, &pair.public)?;
    let sealed = keyfile::write_secret_key(&key_path, &pair.secret, passphrase.as_bytes());
    passphrase.zeroize();
    confirm.zeroize();
    sealed?;

    info!("wrote {:?} and {:?}", pub_path, key_path);
    println!("public key:  {}", pub_path.display());
    println!("secret key:  {}", key_path.display());
    Ok(())
}

/// Minimal status endpoint, enabled by the `profile` config key.
fn spawn_profile_listener() {
    std::thread::spawn(|| {
        let listener = match std::net::TcpListener::bind("127.0.0.1:45454") {
            Ok(listener) => listener,
            Err(e) => {
                error!("profile listener: {e}");
                return;
            }
        };
        info!("profile listener on 127.0.0.1:45454");
        let started = std::time::Instant::now();
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let body = format!(
                "snapback {}\nuptime: {:?}\n",
                env!("CARGO_PKG_VERSION"),
                started.elapsed()
            );
            let _ = write!(
                stream,
                "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
        }
    });
}

//! Pull-based aggregator: fetches snapshot files from many hosts with the
//! external `rsync` program and keeps total storage under a size budget by
//! evicting oldest backup groups.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Deserialize;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::generation::{parse_snapshot_name, SNAPSHOT_SUFFIX};
use crate::util::CancelToken;
use crate::{Result, SnapbackError};

pub const DEFAULT_AGENT_CONFIG_PATH: &str = "/etc/snapback-agent.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub debug: bool,
    pub dryrun: bool,
    /// Local root; each host gets a subdirectory.
    pub storagepath: PathBuf,
    /// ssh login used for every host.
    pub login: String,
    /// Per-transfer timeout in seconds (`rsync --timeout`).
    pub timeout: u32,
    /// `rsync --bwlimit` value.
    pub bwlimit: String,
    /// Total storage budget in bytes.
    pub maxsize: u64,
    pub rsyncpath: String,
    /// Override the default include/exclude filter set.
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub hostname: String,
    pub backuppath: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            debug: false,
            dryrun: false,
            storagepath: PathBuf::new(),
            login: String::new(),
            timeout: 300,
            bwlimit: "0".into(),
            maxsize: 0,
            rsyncpath: "/usr/local/bin/rsync".into(),
            includes: Vec::new(),
            excludes: Vec::new(),
            hosts: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| SnapbackError::Config(format!("{}: {e}", path.display())))?;
        let cfg: AgentConfig = toml::from_str(&text)
            .map_err(|e| SnapbackError::Config(format!("{}: {e}", path.display())))?;
        if cfg.storagepath.as_os_str().is_empty() {
            return Err(SnapbackError::Config("storagepath not set".into()));
        }
        if cfg.login.is_empty() {
            return Err(SnapbackError::Config("login not set".into()));
        }
        if cfg.maxsize == 0 {
            return Err(SnapbackError::Config("maxsize not set".into()));
        }
        Ok(cfg)
    }
}

/// One aggregator pass: pull every host, then sweep to the size budget.
/// Per-host failures are logged and do not stop the pass.
pub fn run(cancel: &CancelToken, cfg: &AgentConfig) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder.create(&cfg.storagepath)?;

    for host in &cfg.hosts {
        if cancel.is_cancelled() {
            return Err(SnapbackError::Cancelled);
        }
        if let Err(e) = pull_host(cfg, host) {
            error!("{}: {e} -- skipping", host.hostname);
        }
    }

    sweep(cancel, &cfg.storagepath, cfg.maxsize, cfg.dryrun)
}

fn filter_args(cfg: &AgentConfig) -> Vec<String> {
    let mut args = Vec::new();
    if cfg.includes.is_empty() && cfg.excludes.is_empty() {
        for inc in ["**.gz.enc", "sig.cache"] {
            args.push("--include".into());
            args.push(inc.into());
        }
        args.push("--exclude".into());
        args.push("*".into());
    } else {
        for inc in &cfg.includes {
            args.push("--include".into());
            args.push(inc.clone());
        }
        for exc in &cfg.excludes {
            args.push("--exclude".into());
            args.push(exc.clone());
        }
    }
    args
}

fn pull_host(cfg: &AgentConfig, host: &HostConfig) -> Result<()> {
    info!("syncing {}", host.hostname);

    let storage = cfg.storagepath.join(&host.hostname);
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder.create(&storage)?;

    let source = format!(
        "{}@{}:{}/",
        cfg.login,
        host.hostname,
        host.backuppath.display()
    );

    let status = Command::new(&cfg.rsyncpath)
        .arg("--timeout")
        .arg(cfg.timeout.to_string())
        .arg("--bwlimit")
        .arg(&cfg.bwlimit)
        .arg("-a")
        .arg("-e")
        .arg("ssh")
        .args(filter_args(cfg))
        .arg(&source)
        .arg(&storage)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;

    match status.code() {
        Some(0) => {
            info!("syncing {} successful", host.hostname);
            Ok(())
        }
        Some(12) => Err(SnapbackError::Config("rsync datastream error".into())),
        Some(23) => Err(SnapbackError::Config("rsync partial transfer error".into())),
        Some(127) => Err(SnapbackError::Config("rsync not found".into())),
        Some(255) => Err(SnapbackError::Config("rsync ssh error".into())),
        Some(code) => Err(SnapbackError::Config(format!("rsync exit code {code}"))),
        None => Err(SnapbackError::Config("rsync killed by signal".into())),
    }
}

struct SweepFile {
    path: PathBuf,
    size: u64,
    timestamp: String,
}

/// Evict oldest whole timestamp groups until total storage fits the
/// budget. The budget is only re-checked at group boundaries, so a backup
/// group is never left half-deleted.
pub fn sweep(cancel: &CancelToken, storage: &Path, maxsize: u64, dryrun: bool) -> Result<()> {
    let mut total: u64 = 0;
    let mut files = Vec::new();

    for entry in WalkDir::new(storage) {
        if cancel.is_cancelled() {
            return Err(SnapbackError::Cancelled);
        }
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if !file_type.is_file() {
            warn!("{:?}: unknown file -- skipping", entry.path());
            continue;
        }
        let size = entry.metadata()?.len();
        total += size;

        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(SNAPSHOT_SUFFIX) {
            if name != "sig.cache" {
                warn!("{:?}: unknown file -- skipping", entry.path());
            }
            continue;
        }
        let Some(parsed) = parse_snapshot_name(&name) else {
            warn!("{:?}: invalid file -- skipping", entry.path());
            continue;
        };
        files.push(SweepFile {
            path: entry.path().to_path_buf(),
            size,
            timestamp: parsed.timestamp,
        });
    }

    info!("total size: {total} bytes, max size: {maxsize} bytes");
    if total <= maxsize || files.is_empty() {
        return Ok(());
    }

    files.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    let mut deleted: u64 = 0;
    let mut current = files[0].timestamp.clone();
    for file in &files {
        if cancel.is_cancelled() {
            break;
        }
        if current != file.timestamp {
            if total <= maxsize {
                break;
            }
            current = file.timestamp.clone();
        }
        if dryrun {
            debug!("deleting {:?} ({}) (dryrun)", file.path, file.size);
        } else {
            debug!("deleting {:?} ({})", file.path, file.size);
            if let Err(e) = fs::remove_file(&file.path) {
                error!("removing {:?}: {e}", file.path);
                continue;
            }
        }
        total -= file.size;
        deleted += file.size;
    }
    info!("deleted {deleted} bytes");
    Ok(())
}

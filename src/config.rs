//! Configuration file loading.
//!
//! A TOML file, `/etc/snapback.toml` by default. Keys the subcommands need
//! are checked at dispatch time, not at load time, so `restore` works with
//! a config that only carries `restore.secretfile`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Result, SnapbackError};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/snapback.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Debug-level logging.
    pub debug: bool,
    /// Serve a status endpoint on localhost while running.
    pub profile: bool,
    /// Log deletions of old snapshots without performing them.
    pub dryrun: bool,
    /// Directory holding the snapshots and the signature cache.
    pub backuppath: PathBuf,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    /// POSIX group name that owns everything under `backuppath`.
    pub group: String,
    /// Source roots to walk, in order.
    pub paths: Vec<PathBuf>,
    /// Regular expressions over absolute paths; matches are skipped and
    /// their subtrees pruned.
    pub excludes: Vec<String>,
    /// Recipient public key file.
    pub pubkeyfile: PathBuf,
    /// Increment ceiling per generation; exceeding it starts a fresh
    /// generation and discards prior snapshots.
    pub maxintervals: u16,
    /// gzip level for the snapshot stream.
    pub gzlevel: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            group: String::new(),
            paths: Vec::new(),
            excludes: Vec::new(),
            pubkeyfile: PathBuf::new(),
            maxintervals: 7,
            gzlevel: 6,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestoreConfig {
    /// Recipient secret key file; its passphrase is prompted for.
    pub secretfile: PathBuf,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| SnapbackError::Config(format!("{}: {e}", path.display())))?;
        let cfg: Config = toml::from_str(&text)
            .map_err(|e| SnapbackError::Config(format!("{}: {e}", path.display())))?;
        if cfg.backup.gzlevel > 9 {
            return Err(SnapbackError::Config(format!(
                "gzlevel {} out of range (0-9)",
                cfg.backup.gzlevel
            )));
        }
        Ok(cfg)
    }

    /// Everything `backup` needs, checked up front before any I/O.
    pub fn check_backup(&self) -> Result<()> {
        if self.backuppath.as_os_str().is_empty() {
            return Err(SnapbackError::Config("backuppath not set".into()));
        }
        if self.backup.group.is_empty() {
            return Err(SnapbackError::Config("backup group not set".into()));
        }
        if self.backup.paths.is_empty() {
            return Err(SnapbackError::Config("no paths to backup".into()));
        }
        if self.backup.pubkeyfile.as_os_str().is_empty() {
            return Err(SnapbackError::Config("pubkeyfile not set".into()));
        }
        Ok(())
    }

    pub fn check_restore(&self) -> Result<()> {
        if self.restore.secretfile.as_os_str().is_empty() {
            return Err(SnapbackError::Config("secretfile not set".into()));
        }
        Ok(())
    }
}

impl BackupConfig {
    /// Exclude patterns are byte regexes: paths are byte strings, not
    /// necessarily UTF-8.
    pub fn compiled_excludes(&self) -> Result<Vec<regex::bytes::Regex>> {
        self.excludes
            .iter()
            .map(|pattern| regex::bytes::Regex::new(pattern).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let text = r#"
            debug = true
            dryrun = false
            backuppath = "/var/backups/snap"

            [backup]
            group = "backup"
            paths = ["/etc", "/home"]
            excludes = ["/home/[^/]+/\\.cache/", "\\.tmp$"]
            pubkeyfile = "/etc/snapback.pub"
            maxintervals = 14
            gzlevel = 9

            [restore]
            secretfile = "/root/snapback.key"
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert!(cfg.debug);
        assert_eq!(cfg.backup.paths.len(), 2);
        assert_eq!(cfg.backup.maxintervals, 14);
        assert_eq!(cfg.backup.gzlevel, 9);
        cfg.check_backup().unwrap();
        cfg.check_restore().unwrap();
        assert_eq!(cfg.backup.compiled_excludes().unwrap().len(), 2);
    }

    #[test]
    fn defaults_fill_in() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.backup.maxintervals, 7);
        assert_eq!(cfg.backup.gzlevel, 6);
        assert!(!cfg.debug);
        assert!(cfg.check_backup().is_err());
        assert!(cfg.check_restore().is_err());
    }

    #[test]
    fn bad_exclude_is_an_error() {
        let cfg = Config {
            backup: BackupConfig {
                excludes: vec!["[unclosed".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.backup.compiled_excludes().is_err());
    }
}

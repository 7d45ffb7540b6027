//! Restore and inspection: the inverse of the snapshot writer.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use rustix::fs::{FileType, Mode, CWD};
use tracing::{debug, error, info, warn};

use crate::crypt::SecretKey;
use crate::delta::apply_delta;
use crate::generation::parse_snapshot_name;
use crate::meta::{kind_of, EntryKind, Metadata};
use crate::snapshot::{RecordKind, SnapshotReader};
use crate::util::{self, CancelToken};
use crate::{Result, SnapbackError};

/// Restore the most recent generation in `backup_path` into `dest_dir`,
/// applying increments `0..=ceiling` in order. Records whose path does not
/// match `pattern` (when given) are skipped.
pub fn restore(
    cancel: &CancelToken,
    secret: &SecretKey,
    backup_path: &Path,
    dest_dir: &Path,
    pattern: Option<&regex::bytes::Regex>,
    ceiling: Option<u16>,
) -> Result<()> {
    let chain = select_chain(backup_path, ceiling)?;
    info!("restoring {} snapshot(s) into {:?}", chain.len(), dest_dir);
    fs::create_dir_all(dest_dir)?;

    for snapshot in &chain {
        apply_snapshot(cancel, secret, snapshot, dest_dir, pattern)?;
    }
    info!("restore complete");
    Ok(())
}

/// Pick the newest generation and verify its chain is whole from increment
/// 0 up. A chain whose base was discarded by a generation rollover is
/// unrecoverable and must not silently produce a truncated tree.
fn select_chain(backup_path: &Path, ceiling: Option<u16>) -> Result<Vec<PathBuf>> {
    let mut generations: BTreeMap<(String, String), BTreeMap<u16, PathBuf>> = BTreeMap::new();

    for entry in fs::read_dir(backup_path)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(parsed) = name.to_str().and_then(parse_snapshot_name) else {
            continue;
        };
        generations
            .entry((parsed.timestamp, parsed.hostname))
            .or_default()
            .insert(parsed.increment, entry.path());
    }

    // BTreeMap order: the lexically greatest timestamp is the most recent.
    let ((timestamp, hostname), members) = generations
        .into_iter()
        .next_back()
        .ok_or_else(|| {
            SnapbackError::ChainCorrupt(format!("no snapshots in {}", backup_path.display()))
        })?;

    let limit = ceiling.unwrap_or(u16::MAX);
    let mut chain = Vec::new();
    for (expected, (increment, path)) in members.range(..=limit).enumerate() {
        if *increment != expected as u16 {
            return Err(SnapbackError::ChainCorrupt(format!(
                "generation {timestamp}-{hostname} is missing increment {expected}"
            )));
        }
        chain.push(path.clone());
    }
    if chain.is_empty() {
        return Err(SnapbackError::ChainCorrupt(format!(
            "generation {timestamp}-{hostname} has no increment 0"
        )));
    }
    Ok(chain)
}

fn apply_snapshot(
    cancel: &CancelToken,
    secret: &SecretKey,
    snapshot: &Path,
    dest_dir: &Path,
    pattern: Option<&regex::bytes::Regex>,
) -> Result<()> {
    info!("applying {:?}", snapshot.file_name().unwrap_or_default());
    let mut reader = SnapshotReader::open(snapshot, secret)?;

    while let Some(record) = reader.next_record()? {
        if cancel.is_cancelled() {
            return Err(SnapbackError::Cancelled);
        }
        if let Some(pattern) = pattern {
            use std::os::unix::ffi::OsStrExt;
            if !pattern.is_match(record.meta.path.as_os_str().as_bytes()) {
                continue;
            }
        }

        let dest = dest_path(dest_dir, &record.meta.path);
        let outcome = match record.kind {
            RecordKind::Full => restore_full(&mut reader, &record.meta, &dest),
            RecordKind::Delta => restore_delta(&mut reader, &record.meta, &dest),
            RecordKind::Meta => restore_meta(&record.meta, &dest),
            RecordKind::Tombstone => remove_path(&dest),
        };
        if let Err(e) = outcome {
            // Per-path damage is reported and restore moves on.
            match e {
                SnapbackError::ChainCorrupt(detail) => error!("{detail}"),
                other => return Err(other),
            }
        }
    }
    Ok(())
}

/// Recorded paths are absolute; they re-root under the destination.
fn dest_path(dest_dir: &Path, recorded: &Path) -> PathBuf {
    dest_dir.join(recorded.strip_prefix("/").unwrap_or(recorded))
}

fn ensure_parent(dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        // Created permissive; the directory's own record fixes attributes.
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn restore_full(
    reader: &mut SnapshotReader<io::BufReader<fs::File>>,
    meta: &Metadata,
    dest: &Path,
) -> Result<()> {
    ensure_parent(dest)?;
    if kind_of(meta.mode) == EntryKind::Symlink {
        let target = reader.read_payload()?;
        replace_symlink(dest, &target, meta)
    } else {
        debug!("{:?}: writing {} bytes", dest, meta.size);
        let mut file = fs::File::create(dest)?;
        reader.copy_payload(&mut file)?;
        file.sync_all()?;
        drop(file);
        apply_attrs(dest, meta);
        Ok(())
    }
}

fn restore_delta(
    reader: &mut SnapshotReader<io::BufReader<fs::File>>,
    meta: &Metadata,
    dest: &Path,
) -> Result<()> {
    let delta = reader.read_payload()?;

    if kind_of(meta.mode) == EntryKind::Symlink {
        let prev = match fs::read_link(dest) {
            Ok(target) => target.into_os_string().into_vec(),
            Err(_) => {
                return Err(SnapbackError::ChainCorrupt(format!(
                    "{}: delta for a symlink with no predecessor",
                    dest.display()
                )));
            }
        };
        let mut target = Vec::new();
        apply_delta(&prev, &mut delta.as_slice(), &mut target)?;
        return replace_symlink(dest, &target, meta);
    }

    let prev = match fs::read(dest) {
        Ok(prev) => prev,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SnapbackError::ChainCorrupt(format!(
                "{}: delta record with no predecessor content",
                dest.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };

    debug!("{:?}: applying {} byte delta", dest, delta.len());
    let staged = dest.with_extension("snapback.partial");
    let mut out = fs::File::create(&staged)?;
    if let Err(e) = apply_delta(&prev, &mut delta.as_slice(), &mut out) {
        drop(out);
        let _ = fs::remove_file(&staged);
        return Err(e.into());
    }
    out.sync_all()?;
    drop(out);
    fs::rename(&staged, dest)?;
    apply_attrs(dest, meta);
    Ok(())
}

fn restore_meta(meta: &Metadata, dest: &Path) -> Result<()> {
    match kind_of(meta.mode) {
        EntryKind::Dir => {
            if !dest.is_dir() {
                fs::create_dir_all(dest)?;
            }
            apply_attrs(dest, meta);
        }
        EntryKind::Fifo => {
            if fs::symlink_metadata(dest).is_err() {
                ensure_parent(dest)?;
                if let Err(e) = rustix::fs::mknodat(
                    CWD,
                    dest,
                    FileType::Fifo,
                    Mode::from_raw_mode(meta.permissions()),
                    0,
                ) {
                    warn!("{:?}: cannot create fifo: {e}", dest);
                    return Ok(());
                }
            }
            apply_attrs(dest, meta);
        }
        EntryKind::CharDevice | EntryKind::BlockDevice => {
            // Device numbers are not recorded, so nodes cannot be recreated.
            if fs::symlink_metadata(dest).is_ok() {
                apply_attrs(dest, meta);
            } else {
                warn!("{:?}: skipping device node (no device numbers recorded)", dest);
            }
        }
        other => {
            warn!("{:?}: unexpected metadata record for {:?}", dest, other);
        }
    }
    Ok(())
}

fn remove_path(dest: &Path) -> Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(st) if st.is_dir() => {
            debug!("{:?}: removing directory", dest);
            fs::remove_dir_all(dest)?;
        }
        Ok(_) => {
            debug!("{:?}: removing", dest);
            fs::remove_file(dest)?;
        }
        Err(_) => {}
    }
    Ok(())
}

fn replace_symlink(dest: &Path, target: &[u8], meta: &Metadata) -> Result<()> {
    ensure_parent(dest)?;
    if fs::symlink_metadata(dest).is_ok() {
        fs::remove_file(dest)?;
    }
    let target = PathBuf::from(OsString::from_vec(target.to_vec()));
    std::os::unix::fs::symlink(&target, dest)?;
    if let Err(e) = util::lchown(dest, meta.uid, meta.gid) {
        warn!("{:?}: chown: {e}", dest);
    }
    let mtime = FileTime::from_unix_time(meta.mtime, 0);
    if let Err(e) = filetime::set_symlink_file_times(dest, mtime, mtime) {
        warn!("{:?}: set mtime: {e}", dest);
    }
    Ok(())
}

/// Mode, owner, mtime. Ownership failures are warnings so non-root
/// restores still produce content.
fn apply_attrs(dest: &Path, meta: &Metadata) {
    let perms = fs::Permissions::from_mode(meta.permissions());
    if let Err(e) = fs::set_permissions(dest, perms) {
        warn!("{:?}: set permissions: {e}", dest);
    }
    if let Err(e) = util::chown(dest, meta.uid, meta.gid) {
        warn!("{:?}: chown: {e}", dest);
    }
    let mtime = FileTime::from_unix_time(meta.mtime, 0);
    if let Err(e) = filetime::set_file_mtime(dest, mtime) {
        warn!("{:?}: set mtime: {e}", dest);
    }
}

/// Dump one snapshot record by record to stdout.
pub fn cat(cancel: &CancelToken, secret: &SecretKey, snapshot: &Path) -> Result<()> {
    let mut reader = SnapshotReader::open(snapshot, secret)?;
    let generation = reader.generation().clone();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(
        out,
        "snapshot host={} timestamp={} increment={} version={}",
        generation.hostname,
        generation.timestamp_label(),
        generation.increment,
        generation.version
    )?;

    while let Some(record) = reader.next_record()? {
        if cancel.is_cancelled() {
            return Err(SnapbackError::Cancelled);
        }
        writeln!(
            out,
            "{} mode={:o} uid={} gid={} mtime={} size={} kind={} payload={}",
            record.meta.path.display(),
            record.meta.mode,
            record.meta.uid,
            record.meta.gid,
            record.meta.mtime,
            record.meta.size,
            record.kind as u8,
            record.payload_len
        )?;
        if record.payload_len > 0 {
            reader.copy_payload(&mut out)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

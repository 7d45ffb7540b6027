//! Walk & reconcile driver: walks the configured roots, decides
//! new/changed/unchanged/deleted against the previous signature cache, and
//! streams records into the snapshot writer.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Cursor, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::crypt::keyfile::PublicKey;
use crate::delta::{generate_delta, generate_signature, Signature};
use crate::generation::{Generation, SNAPSHOT_SUFFIX};
use crate::meta::{EntryKind, Metadata};
use crate::sigcache::{SigCache, SigCacheWriter};
use crate::snapshot::{RecordKind, SnapshotWriter};
use crate::util::{self, CancelToken};
use crate::{Result, SnapbackError};

/// Per-file buffers above this size are spilled to disk instead of held in
/// memory; deltas spill at ten times this.
pub const MEMORY_LIMIT: u64 = 10 * 1024 * 1024;

pub const SIG_CACHE_NAME: &str = "sig.cache";
pub const SIG_CACHE_INPROGRESS: &str = "sig.cache.inprogress";

/// One full backup run. Produces one snapshot file and replaces the
/// signature cache, or leaves both untouched on failure.
pub fn backup(cancel: &CancelToken, recipient: &PublicKey, cfg: &Config) -> Result<()> {
    info!("starting backup");
    let started = Instant::now();
    let run_start = SystemTime::now();

    let gid = util::lookup_group_by_name(&cfg.backup.group)?
        .ok_or_else(|| SnapbackError::GroupNotFound(cfg.backup.group.clone()))?;
    let uid = util::effective_uid();

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(0o750);
    builder.create(&cfg.backuppath)?;
    util::chown(&cfg.backuppath, uid, gid)?;
    let dest_dir = fs::canonicalize(&cfg.backuppath)?;

    sweep_stale_deltas(&dest_dir, run_start);

    let excludes = cfg.backup.compiled_excludes()?;

    let sig_file = dest_dir.join(SIG_CACHE_NAME);
    let existing = SigCache::load(&sig_file)?;

    // Continue the generation while the increment fits, otherwise start a
    // fresh one and void the previous cache so everything is resent.
    let (generation, existing) = match existing {
        Some(prev)
            if (prev.generation().increment as u32) + 1 <= cfg.backup.maxintervals as u32 =>
        {
            let g = prev.generation();
            let next = Generation::new(g.hostname.clone(), g.base_timestamp, g.increment + 1);
            (next, Some(prev))
        }
        _ => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            (Generation::new(util::hostname()?, now, 0), None)
        }
    };

    if generation.increment == 0 {
        remove_old(&dest_dir, cfg.dryrun);
    }

    debug!(
        "running level {} ({})",
        generation.increment,
        generation.timestamp_label()
    );

    let mut cache = SigCacheWriter::create(&dest_dir.join(SIG_CACHE_INPROGRESS), generation.clone())?;
    let mut snap = SnapshotWriter::create(
        &dest_dir,
        &generation,
        recipient,
        uid,
        gid,
        cfg.backup.gzlevel,
    )?;
    let snap_path = snap.name().to_path_buf();

    let mut remaining = existing.as_ref().map(SigCache::paths).unwrap_or_default();
    let excluded = Cell::new(0u64);

    let mut run = Run {
        cancel,
        dest_dir: &dest_dir,
        excludes: &excludes,
        excluded: &excluded,
        existing: existing.as_ref(),
        cache: &mut cache,
        snap: &mut snap,
        remaining: &mut remaining,
    };

    let outcome = (|| -> Result<()> {
        for root in &cfg.backup.paths {
            run.walk_root(root)?;
        }
        run.tombstones()
    })();

    if let Err(e) = outcome {
        drop(snap);
        let _ = fs::remove_file(&snap_path);
        return Err(e);
    }

    let (snap_path, bytes_written) = match snap.close() {
        Ok(done) => done,
        Err(e) => {
            let _ = fs::remove_file(&snap_path);
            return Err(e);
        }
    };

    cache.commit(&sig_file)?;
    if let Err(e) = util::chown(&sig_file, uid, gid) {
        error!("failed to chown signature cache {:?}: {e}", sig_file);
    }

    info!(
        "completed: duration:{:.1?} bytes written:{} files excluded:{} snapshot:{:?}",
        started.elapsed(),
        bytes_written,
        excluded.get(),
        snap_path.file_name().unwrap_or_default()
    );
    Ok(())
}

/// Fresh generation: every prior snapshot in the output directory goes away.
fn remove_old(dest_dir: &Path, dry_run: bool) {
    let entries = match fs::read_dir(dest_dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!("failed to list {:?}: {e}", dest_dir);
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().ends_with(SNAPSHOT_SUFFIX) {
            continue;
        }
        let path = entry.path();
        if dry_run {
            debug!("deleting {:?} (dryrun)", path);
        } else {
            debug!("deleting {:?}", path);
            if let Err(e) = fs::remove_file(&path) {
                error!("failed to delete {:?}: {e}", path);
            }
        }
    }
}

/// Delete stray delta spill files a crashed or cancelled run left behind.
fn sweep_stale_deltas(dest_dir: &Path, run_start: SystemTime) {
    let entries = match fs::read_dir(dest_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with("delta") {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|m| m < run_start)
            .unwrap_or(false);
        if stale {
            debug!("removing stale delta file {:?}", entry.path());
            let _ = fs::remove_file(entry.path());
        }
    }
}

struct Run<'a> {
    cancel: &'a CancelToken,
    dest_dir: &'a Path,
    excludes: &'a [regex::bytes::Regex],
    excluded: &'a Cell<u64>,
    existing: Option<&'a SigCache>,
    cache: &'a mut SigCacheWriter,
    snap: &'a mut SnapshotWriter,
    remaining: &'a mut BTreeSet<PathBuf>,
}

impl Run<'_> {
    fn walk_root(&mut self, root: &Path) -> Result<()> {
        let root = match fs::canonicalize(root) {
            Ok(root) => root,
            Err(e) => {
                error!("walk {:?}: {e}", root);
                return Ok(());
            }
        };

        let dest_dir = self.dest_dir.to_path_buf();
        let excludes = self.excludes;
        let excluded = self.excluded;

        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                let path = entry.path();
                // never back up the backup directory
                if path.starts_with(&dest_dir) {
                    return false;
                }
                let raw = path.as_os_str().as_bytes();
                for exclude in excludes {
                    if exclude.is_match(raw) {
                        excluded.set(excluded.get() + 1);
                        debug!("{:?}: excluding", path);
                        return false;
                    }
                }
                true
            });

        for entry in walker {
            if self.cancel.is_cancelled() {
                return Err(SnapbackError::Cancelled);
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    error!("walk: {e}");
                    continue;
                }
            };
            self.process_entry(entry.path())?;
        }
        Ok(())
    }

    fn tombstones(&mut self) -> Result<()> {
        for path in self.remaining.iter() {
            if self.cancel.is_cancelled() {
                return Err(SnapbackError::Cancelled);
            }
            debug!("{:?}: deleted", path);
            self.snap
                .add(&Metadata::tombstone(path.clone()), RecordKind::Tombstone, None, 0)?;
        }
        Ok(())
    }

    fn process_entry(&mut self, path: &Path) -> Result<()> {
        let md = match Metadata::from_path(path) {
            Ok(md) => md,
            Err(e) => {
                // Stays in `remaining`: an unreadable path is tombstoned.
                error!("{:?}: stat: {e}", path);
                return Ok(());
            }
        };

        match md.kind() {
            EntryKind::Socket => {
                debug!("{:?}: skipping socket", path);
                Ok(())
            }
            EntryKind::Dir
            | EntryKind::CharDevice
            | EntryKind::BlockDevice
            | EntryKind::Fifo => self.add_metadata_only(&md),
            EntryKind::Symlink => self.add_symlink(&md),
            EntryKind::Regular => self.add_regular(&md),
            EntryKind::Unknown => {
                warn!("{:?}: unknown file mode {:o}, treating as regular", path, md.mode);
                self.add_regular(&md)
            }
        }
    }

    /// Duplicate paths are a per-file structural error: logged, run
    /// continues.
    fn record_signature(&mut self, path: &Path, sig: &[u8]) -> Result<()> {
        match self.cache.add(path, sig) {
            Err(SnapbackError::DuplicatePath(p)) => {
                error!("{:?}: already recorded in this run", p);
                Ok(())
            }
            other => other,
        }
    }

    fn add_metadata_only(&mut self, md: &Metadata) -> Result<()> {
        let sig = Signature::metadata_only(md.attr_hash(None)).encode();
        let prev = self.existing.and_then(|c| c.get(&md.path));
        if prev != Some(sig.as_slice()) {
            if prev.is_some() {
                debug!("{:?}: changed", md.path);
            } else {
                debug!("{:?}: new", md.path);
            }
            self.snap.add(md, RecordKind::Meta, None, 0)?;
        } else {
            debug!("{:?}: no change", md.path);
        }
        self.record_signature(&md.path, &sig)?;
        self.remaining.remove(&md.path);
        Ok(())
    }

    fn add_symlink(&mut self, md: &Metadata) -> Result<()> {
        let target = match fs::read_link(&md.path) {
            Ok(target) => target,
            Err(e) => {
                error!("{:?}: readlink: {e}", md.path);
                return Ok(());
            }
        };
        let target = target.as_os_str().as_bytes().to_vec();
        let len = target.len() as u64;

        let mut sig = generate_signature(&mut Cursor::new(&target), len)?;
        sig.attr_hash = md.attr_hash(Some(&target));
        let encoded = sig.encode();

        match self.existing.and_then(|c| c.get(&md.path)) {
            Some(prev) if prev == encoded.as_slice() => {
                debug!("{:?}: no change", md.path);
            }
            Some(prev) => {
                debug!("{:?}: changed", md.path);
                match Signature::parse(prev) {
                    Ok(prev_sig) => {
                        let mut delta = Vec::new();
                        generate_delta(&prev_sig, &mut Cursor::new(&target), len, &mut delta)?;
                        let delta_len = delta.len() as u64;
                        self.snap.add(
                            md,
                            RecordKind::Delta,
                            Some(&mut Cursor::new(&delta)),
                            delta_len,
                        )?;
                    }
                    Err(e) => {
                        error!("{:?}: cached signature unreadable ({e}), sending full target", md.path);
                        self.snap
                            .add(md, RecordKind::Full, Some(&mut Cursor::new(&target)), len)?;
                    }
                }
            }
            None => {
                debug!("{:?}: new file", md.path);
                self.snap
                    .add(md, RecordKind::Full, Some(&mut Cursor::new(&target)), len)?;
            }
        }

        self.record_signature(&md.path, &encoded)?;
        self.remaining.remove(&md.path);
        Ok(())
    }

    fn add_regular(&mut self, md: &Metadata) -> Result<()> {
        let mut file = match File::open(&md.path) {
            Ok(file) => file,
            Err(e) => {
                // Not recorded and not removed from `remaining`, so the
                // path is tombstoned below and re-sent in full once it is
                // readable again.
                error!("{:?}: open: {e}", md.path);
                return Ok(());
            }
        };

        let sig = {
            let mut reader = BufReader::new(&file);
            generate_signature(&mut reader, md.size)
        };
        let mut sig = match sig {
            Ok(sig) => sig,
            Err(e) => {
                error!("{:?}: read: {e}", md.path);
                return Ok(());
            }
        };
        sig.attr_hash = md.attr_hash(None);
        let encoded = sig.encode();

        match self.existing.and_then(|c| c.get(&md.path)) {
            Some(prev) if prev == encoded.as_slice() => {
                debug!("{:?}: no change", md.path);
            }
            Some(prev) => {
                debug!("{:?}: changed", md.path);
                match Signature::parse(prev) {
                    Ok(prev_sig) => self.add_file_delta(md, &prev_sig, &mut file)?,
                    Err(e) => {
                        error!("{:?}: cached signature unreadable ({e}), sending full content", md.path);
                        file.seek(SeekFrom::Start(0))?;
                        let mut reader = BufReader::new(&file);
                        self.snap.add(md, RecordKind::Full, Some(&mut reader), md.size)?;
                    }
                }
            }
            None => {
                debug!("{:?}: new file", md.path);
                file.seek(SeekFrom::Start(0))?;
                let mut reader = BufReader::new(&file);
                self.snap.add(md, RecordKind::Full, Some(&mut reader), md.size)?;
            }
        }

        self.record_signature(&md.path, &encoded)?;
        self.remaining.remove(&md.path);
        Ok(())
    }

    /// Large deltas are staged in a temp file inside the backup directory
    /// (same filesystem); the drop guard removes it on every exit path.
    fn add_file_delta(
        &mut self,
        md: &Metadata,
        prev_sig: &Signature,
        file: &mut File,
    ) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;

        if md.size > MEMORY_LIMIT * 10 {
            let mut spill = tempfile::Builder::new()
                .prefix("delta")
                .tempfile_in(self.dest_dir)?;
            {
                let mut out = BufWriter::new(spill.as_file_mut());
                let mut reader = BufReader::new(&*file);
                generate_delta(prev_sig, &mut reader, md.size, &mut out)?;
                out.flush()?;
            }
            let delta_len = spill.as_file().metadata()?.len();
            spill.as_file_mut().seek(SeekFrom::Start(0))?;
            self.snap
                .add(md, RecordKind::Delta, Some(spill.as_file_mut()), delta_len)?;
        } else {
            let mut delta = Vec::new();
            let mut reader = BufReader::new(&*file);
            generate_delta(prev_sig, &mut reader, md.size, &mut delta)?;
            let delta_len = delta.len() as u64;
            self.snap
                .add(md, RecordKind::Delta, Some(&mut Cursor::new(&delta)), delta_len)?;
        }
        Ok(())
    }
}

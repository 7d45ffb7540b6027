//! Persistent path → signature mapping gating change detection.
//!
//! The cache from the previous run is read-only; the new one is written to
//! `sig.cache.inprogress` record by record and renamed over `sig.cache`
//! only when the run succeeds, so a crashed run never mixes generations.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use crate::generation::{Generation, CACHE_MAGIC};
use crate::wire;
use crate::{Result, SnapbackError};

/// A committed cache from a previous run, fully indexed.
pub struct SigCache {
    generation: Generation,
    entries: BTreeMap<PathBuf, Vec<u8>>,
}

impl SigCache {
    /// `Ok(None)` when the file does not exist; parse failures are errors
    /// (a corrupt cache aborts the run rather than silently resending
    /// everything).
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut r = BufReader::new(file);
        let generation = Generation::read_header(&mut r, &CACHE_MAGIC)
            .map_err(|e| SnapbackError::corrupt(path, e.to_string()))?;

        let mut entries = BTreeMap::new();
        loop {
            let path_len = match wire::read_u32(&mut r) {
                Ok(n) => n as usize,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(SnapbackError::corrupt(path, e.to_string())),
            };
            let record = (|| -> io::Result<(PathBuf, Vec<u8>)> {
                let raw_path = wire::read_vec(&mut r, path_len)?;
                let sig_len = wire::read_u32(&mut r)? as usize;
                let sig = wire::read_vec(&mut r, sig_len)?;
                Ok((PathBuf::from(OsString::from_vec(raw_path)), sig))
            })()
            .map_err(|e| SnapbackError::corrupt(path, e.to_string()))?;
            entries.insert(record.0, record.1);
        }

        Ok(Some(Self { generation, entries }))
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn get(&self, path: &Path) -> Option<&[u8]> {
        self.entries.get(path).map(Vec::as_slice)
    }

    /// Paths seen by the previous run; the engine's deletion seed.
    pub fn paths(&self) -> BTreeSet<PathBuf> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Append-only writer for the next run's cache.
pub struct SigCacheWriter {
    path: PathBuf,
    file: BufWriter<File>,
    generation: Generation,
    seen: BTreeSet<PathBuf>,
    committed: bool,
}

impl SigCacheWriter {
    pub fn create(path: &Path, generation: Generation) -> Result<Self> {
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);
        generation.write_header(&mut w, &CACHE_MAGIC)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: w,
            generation,
            seen: BTreeSet::new(),
            committed: false,
        })
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    /// Record a path for the next run. Each path at most once.
    pub fn add(&mut self, path: &Path, signature: &[u8]) -> Result<()> {
        if !self.seen.insert(path.to_path_buf()) {
            return Err(SnapbackError::DuplicatePath(path.to_path_buf()));
        }
        let raw = path.as_os_str().as_bytes();
        self.file.write_all(&(raw.len() as u32).to_le_bytes())?;
        self.file.write_all(raw)?;
        self.file.write_all(&(signature.len() as u32).to_le_bytes())?;
        self.file.write_all(signature)?;
        Ok(())
    }

    /// Flush, fsync, and atomically rename over `dest`.
    pub fn commit(mut self, dest: &Path) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        fs::rename(&self.path, dest)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for SigCacheWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gen() -> Generation {
        Generation::new("testhost", 1_700_000_000, 2)
    }

    #[test]
    fn write_commit_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let inprogress = dir.path().join("sig.cache.inprogress");
        let dest = dir.path().join("sig.cache");

        let mut w = SigCacheWriter::create(&inprogress, gen()).unwrap();
        w.add(Path::new("/a/b"), b"sig-one").unwrap();
        w.add(Path::new("/a/c"), b"sig-two").unwrap();
        w.commit(&dest).unwrap();
        assert!(!inprogress.exists());

        let cache = SigCache::load(&dest).unwrap().unwrap();
        assert_eq!(cache.generation(), &gen());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(Path::new("/a/b")), Some(&b"sig-one"[..]));
        assert_eq!(cache.get(Path::new("/missing")), None);
        assert_eq!(cache.paths().len(), 2);
    }

    #[test]
    fn duplicate_add_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SigCacheWriter::create(&dir.path().join("c"), gen()).unwrap();
        w.add(Path::new("/p"), b"s").unwrap();
        let err = w.add(Path::new("/p"), b"s").unwrap_err();
        assert!(matches!(err, SnapbackError::DuplicatePath(_)));
    }

    #[test]
    fn missing_cache_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SigCache::load(&dir.path().join("sig.cache")).unwrap().is_none());
    }

    #[test]
    fn corrupt_cache_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sig.cache");
        fs::write(&path, b"not a cache at all").unwrap();
        assert!(matches!(
            SigCache::load(&path),
            Err(SnapbackError::Corrupt { .. })
        ));
    }

    #[test]
    fn uncommitted_writer_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let inprogress = dir.path().join("sig.cache.inprogress");
        {
            let mut w = SigCacheWriter::create(&inprogress, gen()).unwrap();
            w.add(Path::new("/p"), b"s").unwrap();
            assert!(inprogress.exists());
        }
        assert!(!inprogress.exists());
    }
}

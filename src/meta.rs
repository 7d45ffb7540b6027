//! Per-path metadata: the attribute tuple recorded for every touched path
//! and the file-type classification that drives the reconcile loop.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Attributes carried by every snapshot record. `mode` is the full `st_mode`
/// (type bits + permissions). All fields zero with size 0 marks a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub path: PathBuf,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Dir,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Unknown,
}

/// File type from `st_mode` type bits.
pub fn kind_of(mode: u32) -> EntryKind {
    match mode & (libc::S_IFMT as u32) {
        m if m == libc::S_IFREG as u32 => EntryKind::Regular,
        m if m == libc::S_IFDIR as u32 => EntryKind::Dir,
        m if m == libc::S_IFLNK as u32 => EntryKind::Symlink,
        m if m == libc::S_IFCHR as u32 => EntryKind::CharDevice,
        m if m == libc::S_IFBLK as u32 => EntryKind::BlockDevice,
        m if m == libc::S_IFIFO as u32 => EntryKind::Fifo,
        m if m == libc::S_IFSOCK as u32 => EntryKind::Socket,
        _ => EntryKind::Unknown,
    }
}

impl Metadata {
    /// lstat: symlinks are described, not followed.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let st = fs::symlink_metadata(path)?;
        let mode = st.mode();
        // Unknown modes go down the regular-file path, so they keep their
        // size; all other non-regular entries record 0.
        let size = match kind_of(mode) {
            EntryKind::Regular | EntryKind::Unknown => st.len(),
            _ => 0,
        };
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            uid: st.uid(),
            gid: st.gid(),
            mtime: st.mtime(),
            size,
        })
    }

    pub fn tombstone(path: PathBuf) -> Self {
        Self {
            path,
            mode: 0,
            uid: 0,
            gid: 0,
            mtime: 0,
            size: 0,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.mode == 0 && self.uid == 0 && self.gid == 0 && self.mtime == 0 && self.size == 0
    }

    pub fn kind(&self) -> EntryKind {
        kind_of(self.mode)
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// BLAKE3 over the attribute tuple, plus `extra` (the symlink target)
    /// when given. Stamped into signature headers so attribute-only changes
    /// are detected.
    pub fn attr_hash(&self, extra: Option<&[u8]>) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.mode.to_le_bytes());
        hasher.update(&self.uid.to_le_bytes());
        hasher.update(&self.gid.to_le_bytes());
        hasher.update(&self.mtime.to_le_bytes());
        hasher.update(&self.size.to_le_bytes());
        if let Some(extra) = extra {
            hasher.update(extra);
        }
        *hasher.finalize().as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md(mode: u32) -> Metadata {
        Metadata {
            path: PathBuf::from("/x"),
            mode,
            uid: 1,
            gid: 2,
            mtime: 3,
            size: 4,
        }
    }

    #[test]
    fn classification_follows_type_bits() {
        assert_eq!(md(libc::S_IFREG as u32 | 0o644).kind(), EntryKind::Regular);
        assert_eq!(md(libc::S_IFDIR as u32 | 0o755).kind(), EntryKind::Dir);
        assert_eq!(md(libc::S_IFLNK as u32 | 0o777).kind(), EntryKind::Symlink);
        assert_eq!(md(libc::S_IFIFO as u32).kind(), EntryKind::Fifo);
        assert_eq!(md(libc::S_IFSOCK as u32).kind(), EntryKind::Socket);
        assert_eq!(md(libc::S_IFCHR as u32).kind(), EntryKind::CharDevice);
        assert_eq!(md(libc::S_IFBLK as u32).kind(), EntryKind::BlockDevice);
        assert_eq!(md(0).kind(), EntryKind::Unknown);
    }

    #[test]
    fn tombstone_is_all_zero() {
        let t = Metadata::tombstone(PathBuf::from("/gone"));
        assert!(t.is_tombstone());
        assert!(!md(libc::S_IFREG as u32).is_tombstone());
    }

    #[test]
    fn attr_hash_tracks_attributes_and_extra() {
        let a = md(libc::S_IFLNK as u32);
        let mut b = a.clone();
        assert_eq!(a.attr_hash(None), b.attr_hash(None));
        b.mtime += 1;
        assert_ne!(a.attr_hash(None), b.attr_hash(None));
        assert_ne!(a.attr_hash(Some(b"t1")), a.attr_hash(Some(b"t2")));
    }

    #[test]
    fn from_path_reports_symlinks_without_following() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file");
        fs::write(&target, b"data").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let got = Metadata::from_path(&link).unwrap();
        assert_eq!(got.kind(), EntryKind::Symlink);
        assert_eq!(got.size, 0);

        let file = Metadata::from_path(&target).unwrap();
        assert_eq!(file.kind(), EntryKind::Regular);
        assert_eq!(file.size, 4);
    }
}

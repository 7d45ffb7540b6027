//! Snapshot record stream: kinds and record framing.
//!
//! Each record is `path_len: u32 | path | mode: u32 | uid: u32 | gid: u32 |
//! mtime: i64 | size: u64 | kind: u8 | payload_len: u64 | payload`, all
//! integers little-endian, streamed inside gzip inside the encryption
//! envelope.

pub mod reader;
pub mod writer;

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use crate::meta::Metadata;
use crate::wire;

pub use reader::SnapshotReader;
pub use writer::SnapshotWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Metadata only: directory, device, fifo.
    Meta = 0,
    /// Full content: new regular file or new symlink target.
    Full = 1,
    /// Delta against the previous generation's content.
    Delta = 2,
    /// Path deleted since the last generation.
    Tombstone = 3,
}

impl RecordKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RecordKind::Meta),
            1 => Some(RecordKind::Full),
            2 => Some(RecordKind::Delta),
            3 => Some(RecordKind::Tombstone),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub meta: Metadata,
    pub kind: RecordKind,
    pub payload_len: u64,
}

pub(crate) fn write_record_header<W: Write>(
    w: &mut W,
    meta: &Metadata,
    kind: RecordKind,
    payload_len: u64,
) -> io::Result<()> {
    let raw_path = meta.path.as_os_str().as_bytes();
    w.write_all(&(raw_path.len() as u32).to_le_bytes())?;
    w.write_all(raw_path)?;
    w.write_all(&meta.mode.to_le_bytes())?;
    w.write_all(&meta.uid.to_le_bytes())?;
    w.write_all(&meta.gid.to_le_bytes())?;
    w.write_all(&meta.mtime.to_le_bytes())?;
    w.write_all(&meta.size.to_le_bytes())?;
    w.write_all(&[kind as u8])?;
    w.write_all(&payload_len.to_le_bytes())?;
    Ok(())
}

/// `Ok(None)` at a clean end of stream (EOF exactly at a record boundary).
pub(crate) fn read_record_header<R: Read>(r: &mut R) -> io::Result<Option<RecordHeader>> {
    let path_len = match wire::read_u32(r) {
        Ok(n) => n as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let raw_path = wire::read_vec(r, path_len)?;
    let path = PathBuf::from(OsString::from_vec(raw_path));
    let mode = wire::read_u32(r)?;
    let uid = wire::read_u32(r)?;
    let gid = wire::read_u32(r)?;
    let mtime = wire::read_i64(r)?;
    let size = wire::read_u64(r)?;
    let kind = wire::read_u8(r)?;
    let payload_len = wire::read_u64(r)?;
    let kind = RecordKind::from_u8(kind)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("bad record kind {kind}")))?;
    Ok(Some(RecordHeader {
        meta: Metadata {
            path,
            mode,
            uid,
            gid,
            mtime,
            size,
        },
        kind,
        payload_len,
    }))
}

//! Append-only snapshot builder: file → encryption envelope → gzip →
//! generation header → record stream.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::crypt::keyfile::PublicKey;
use crate::crypt::EncryptWriter;
use crate::generation::{Generation, SNAPSHOT_MAGIC};
use crate::meta::Metadata;
use crate::snapshot::{write_record_header, RecordKind};
use crate::util;
use crate::Result;

pub struct SnapshotWriter {
    out: GzEncoder<EncryptWriter<File>>,
    path: PathBuf,
}

impl SnapshotWriter {
    /// Opens `dir/<name>` with mode 0640 owned by `uid:gid` and writes the
    /// stream header. The file is not committed until [`close`]; on any
    /// failure the caller deletes it.
    ///
    /// [`close`]: SnapshotWriter::close
    pub fn create(
        dir: &Path,
        generation: &Generation,
        recipient: &PublicKey,
        uid: u32,
        gid: u32,
        gzip_level: u32,
    ) -> Result<Self> {
        let path = dir.join(generation.snapshot_file_name());
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o640)
            .open(&path)?;
        util::chown(&path, uid, gid)?;

        let envelope = EncryptWriter::new(file, recipient)?;
        let mut gz = GzEncoder::new(envelope, Compression::new(gzip_level.min(9)));
        generation.write_header(&mut gz, &SNAPSHOT_MAGIC)?;

        Ok(Self { out: gz, path })
    }

    pub fn name(&self) -> &Path {
        &self.path
    }

    /// Appends one record: header, then exactly `payload_len` bytes from
    /// `payload`. Records emerge in call order.
    pub fn add(
        &mut self,
        meta: &Metadata,
        kind: RecordKind,
        payload: Option<&mut dyn Read>,
        payload_len: u64,
    ) -> Result<()> {
        write_record_header(&mut self.out, meta, kind, payload_len)?;
        if payload_len > 0 {
            let src = payload.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "record payload missing")
            })?;
            let copied = io::copy(&mut src.take(payload_len), &mut self.out)?;
            if copied != payload_len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "{}: payload ended after {copied} of {payload_len} bytes",
                        meta.path.display()
                    ),
                )
                .into());
            }
        }
        Ok(())
    }

    /// Finish gzip, seal the envelope, fsync. Returns the final path and
    /// the encrypted size on disk.
    pub fn close(self) -> Result<(PathBuf, u64)> {
        let envelope = self.out.finish()?;
        let file = envelope.finish()?;
        file.sync_all()?;
        let bytes = file.metadata()?.len();
        Ok((self.path, bytes))
    }
}

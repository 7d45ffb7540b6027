//! Snapshot reading: decrypt → decompress → iterate records.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::crypt::{DecryptReader, SecretKey};
use crate::generation::{Generation, SNAPSHOT_MAGIC};
use crate::snapshot::{read_record_header, RecordHeader};
use crate::{Result, SnapbackError};

pub struct SnapshotReader<R: Read> {
    src: GzDecoder<DecryptReader<R>>,
    generation: Generation,
    origin: PathBuf,
    /// Unconsumed payload bytes of the record last returned by `next`.
    pending: u64,
}

impl SnapshotReader<BufReader<File>> {
    pub fn open(path: &Path, secret: &SecretKey) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file), secret, path)
    }
}

impl<R: Read> SnapshotReader<R> {
    pub fn new(inner: R, secret: &SecretKey, origin: &Path) -> Result<Self> {
        let corrupt = |e: io::Error| SnapbackError::corrupt(origin, e.to_string());
        let envelope = DecryptReader::new(inner, secret).map_err(corrupt)?;
        let mut gz = GzDecoder::new(envelope);
        let generation =
            Generation::read_header(&mut gz, &SNAPSHOT_MAGIC).map_err(corrupt)?;
        Ok(Self {
            src: gz,
            generation,
            origin: origin.to_path_buf(),
            pending: 0,
        })
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    fn corrupt(&self, detail: impl ToString) -> SnapbackError {
        SnapbackError::corrupt(&self.origin, detail.to_string())
    }

    /// Next record header, or `None` at end of stream. Any unread payload
    /// from the previous record is skipped first.
    pub fn next_record(&mut self) -> Result<Option<RecordHeader>> {
        if self.pending > 0 {
            self.skip_payload()?;
        }
        let header = read_record_header(&mut self.src).map_err(|e| self.corrupt(e))?;
        if let Some(h) = &header {
            self.pending = h.payload_len;
        }
        Ok(header)
    }

    /// Stream the current record's payload into `out`.
    pub fn copy_payload<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let want = self.pending;
        let copied = io::copy(&mut (&mut self.src).take(want), out)?;
        self.pending = 0;
        if copied != want {
            return Err(self.corrupt(format!("payload truncated ({copied} of {want} bytes)")));
        }
        Ok(())
    }

    /// Collect the current record's payload in memory (delta records).
    pub fn read_payload(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.pending.min(1 << 20) as usize);
        self.copy_payload(&mut buf)?;
        Ok(buf)
    }

    pub fn skip_payload(&mut self) -> Result<()> {
        self.copy_payload(&mut io::sink())
    }
}

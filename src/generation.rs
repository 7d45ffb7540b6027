//! Generation headers and snapshot file naming.
//!
//! A generation is a `(base_timestamp, increment)` family. The same header
//! layout opens both the signature cache and the snapshot record stream,
//! distinguished only by the magic.

use std::io::{self, Read, Write};

use chrono::{Local, TimeZone};

use crate::wire;

pub const FORMAT_VERSION: u16 = 1;
pub const CACHE_MAGIC: [u8; 4] = *b"SBSC";
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"SBSN";
pub const SNAPSHOT_SUFFIX: &str = ".gz.enc";

/// Header shared by the signature cache and snapshot files:
/// `magic[4] | version: u16 | hostname_len: u16 | hostname |
/// base_timestamp: i64 | increment: u16`, integers little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub version: u16,
    pub hostname: String,
    pub base_timestamp: i64,
    pub increment: u16,
}

impl Generation {
    pub fn new(hostname: impl Into<String>, base_timestamp: i64, increment: u16) -> Self {
        Self {
            version: FORMAT_VERSION,
            hostname: hostname.into(),
            base_timestamp,
            increment,
        }
    }

    pub fn write_header<W: Write>(&self, w: &mut W, magic: &[u8; 4]) -> io::Result<()> {
        let name = self.hostname.as_bytes();
        if name.len() > u16::MAX as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "hostname too long"));
        }
        w.write_all(magic)?;
        w.write_all(&self.version.to_le_bytes())?;
        w.write_all(&(name.len() as u16).to_le_bytes())?;
        w.write_all(name)?;
        w.write_all(&self.base_timestamp.to_le_bytes())?;
        w.write_all(&self.increment.to_le_bytes())?;
        Ok(())
    }

    pub fn read_header<R: Read>(r: &mut R, magic: &[u8; 4]) -> io::Result<Self> {
        let mut got = [0u8; 4];
        r.read_exact(&mut got)?;
        if &got != magic {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
        }
        let version = wire::read_u16(r)?;
        if version != FORMAT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported format version {version}"),
            ));
        }
        let name_len = wire::read_u16(r)? as usize;
        let name = wire::read_vec(r, name_len)?;
        let hostname = String::from_utf8(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "hostname not utf-8"))?;
        let base_timestamp = wire::read_i64(r)?;
        let increment = wire::read_u16(r)?;
        Ok(Self {
            version,
            hostname,
            base_timestamp,
            increment,
        })
    }

    /// `YYYYMMDDhhmm` rendering of the base timestamp in local time.
    pub fn timestamp_label(&self) -> String {
        match Local.timestamp_opt(self.base_timestamp, 0).single() {
            Some(t) => t.format("%Y%m%d%H%M").to_string(),
            None => "000000000000".to_string(),
        }
    }

    pub fn snapshot_file_name(&self) -> String {
        format!(
            "{}-{}-{}{}",
            self.timestamp_label(),
            self.hostname,
            self.increment,
            SNAPSHOT_SUFFIX
        )
    }
}

/// The parts of a snapshot file name: `<YYYYMMDDhhmm>-<hostname>-<inc>.gz.enc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotName {
    pub timestamp: String,
    pub hostname: String,
    pub increment: u16,
}

/// Parses a snapshot file name. Hostnames may contain `-`, so the timestamp
/// is taken from the front and the increment from the back.
pub fn parse_snapshot_name(name: &str) -> Option<SnapshotName> {
    let stem = name.strip_suffix(SNAPSHOT_SUFFIX)?;
    let (timestamp, rest) = stem.split_at_checked(12)?;
    if !timestamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let rest = rest.strip_prefix('-')?;
    let (hostname, inc) = rest.rsplit_once('-')?;
    if hostname.is_empty() {
        return None;
    }
    let increment = inc.parse().ok()?;
    Some(SnapshotName {
        timestamp: timestamp.to_string(),
        hostname: hostname.to_string(),
        increment,
    })
}

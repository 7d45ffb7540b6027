//! Signature and delta wire codec.
//!
//! Signature: `block_size: u32 | block_count: u32 | attr_hash: [32]` then
//! `block_count` descriptors of `weak: u32 | strong: [16]`.
//!
//! Delta: `block_size: u32` then ops until end of stream:
//! `0x00 | len: u32 | literal bytes` or `0x01 | block_index: u32 | len: u32`.
//!
//! All integers little-endian. The attr_hash field belongs to the caller;
//! the codec carries it opaquely so attribute-only changes flip signature
//! equality.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use crate::wire;

pub const BLOCK_SIZE: usize = 2048;
pub const STRONG_LEN: usize = 16;

/// Flush literal runs at this size so delta generation stays bounded.
const LITERAL_FLUSH: usize = 64 * 1024;

const OP_LITERAL: u8 = 0;
const OP_COPY: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSum {
    pub weak: u32,
    pub strong: [u8; STRONG_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub block_size: u32,
    pub attr_hash: [u8; 32],
    pub blocks: Vec<BlockSum>,
}

impl Signature {
    /// Signature for entries whose identity is attributes only
    /// (directories, devices, fifos).
    pub fn metadata_only(attr_hash: [u8; 32]) -> Self {
        Self {
            block_size: BLOCK_SIZE as u32,
            attr_hash,
            blocks: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(40 + self.blocks.len() * (4 + STRONG_LEN));
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.attr_hash);
        for block in &self.blocks {
            buf.extend_from_slice(&block.weak.to_le_bytes());
            buf.extend_from_slice(&block.strong);
        }
        buf
    }

    pub fn parse(bytes: &[u8]) -> io::Result<Self> {
        let mut r = bytes;
        let block_size = wire::read_u32(&mut r)?;
        let block_count = wire::read_u32(&mut r)? as usize;
        if block_size == 0 && block_count != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "signature with zero block size",
            ));
        }
        let mut attr_hash = [0u8; 32];
        r.read_exact(&mut attr_hash)?;
        if r.len() != block_count * (4 + STRONG_LEN) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "signature length does not match block count",
            ));
        }
        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let weak = wire::read_u32(&mut r)?;
            let mut strong = [0u8; STRONG_LEN];
            r.read_exact(&mut strong)?;
            blocks.push(BlockSum { weak, strong });
        }
        Ok(Self {
            block_size,
            attr_hash,
            blocks,
        })
    }
}

/// Weak rolling checksum over a fixed window, rsync's two-part sum with
/// zero-based seeds: `s1` accumulates the window's bytes, `s2` accumulates
/// the running `s1` prefixes, and sliding the window one byte adjusts both
/// in O(1). The 16-bit halves pack into the `u32` stored in signatures.
#[derive(Clone, Copy)]
struct WeakSum {
    s1: u32,
    s2: u32,
    window: u32,
}

impl WeakSum {
    fn seed(block: &[u8]) -> Self {
        let mut s1 = 0u32;
        let mut s2 = 0u32;
        for &byte in block {
            s1 = s1.wrapping_add(byte as u32);
            s2 = s2.wrapping_add(s1);
        }
        Self {
            s1,
            s2,
            window: block.len() as u32,
        }
    }

    /// Drop `out` from the front of the window, admit `inn` at the back.
    #[inline]
    fn slide(&mut self, out: u8, inn: u8) {
        self.s1 = self.s1.wrapping_sub(out as u32).wrapping_add(inn as u32);
        self.s2 = self
            .s2
            .wrapping_sub(self.window.wrapping_mul(out as u32))
            .wrapping_add(self.s1);
    }

    fn value(&self) -> u32 {
        ((self.s2 & 0xffff) << 16) | (self.s1 & 0xffff)
    }
}

fn strong_sum(parts: &[&[u8]]) -> [u8; STRONG_LEN] {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; STRONG_LEN];
    out.copy_from_slice(&hasher.finalize().as_bytes()[..STRONG_LEN]);
    out
}

/// Reads until `buf` is full or the stream ends; returns bytes read.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_byte<R: Read>(r: &mut R) -> io::Result<Option<u8>> {
    let mut b = [0u8; 1];
    loop {
        match r.read(&mut b) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(b[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Consume up to `size` bytes of `reader` and describe them block by block.
/// The caller stamps `attr_hash` afterwards. Deterministic for a given
/// stream.
pub fn generate_signature<R: Read>(reader: &mut R, size: u64) -> io::Result<Signature> {
    let mut src = reader.take(size);
    let mut blocks = Vec::new();
    let mut buf = vec![0u8; BLOCK_SIZE];

    loop {
        let n = read_full(&mut src, &mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        blocks.push(BlockSum {
            weak: WeakSum::seed(chunk).value(),
            strong: strong_sum(&[chunk]),
        });
        if n < BLOCK_SIZE {
            break;
        }
    }

    Ok(Signature {
        block_size: BLOCK_SIZE as u32,
        attr_hash: [0u8; 32],
        blocks,
    })
}

struct DeltaSink<'a, W: Write> {
    out: &'a mut W,
    literal: Vec<u8>,
}

impl<'a, W: Write> DeltaSink<'a, W> {
    fn new(out: &'a mut W) -> Self {
        Self {
            out,
            literal: Vec::new(),
        }
    }

    fn push_literal(&mut self, byte: u8) -> io::Result<()> {
        self.literal.push(byte);
        if self.literal.len() >= LITERAL_FLUSH {
            self.flush_literal()?;
        }
        Ok(())
    }

    fn extend_literal(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.literal.extend_from_slice(bytes);
        if self.literal.len() >= LITERAL_FLUSH {
            self.flush_literal()?;
        }
        Ok(())
    }

    fn flush_literal(&mut self) -> io::Result<()> {
        if self.literal.is_empty() {
            return Ok(());
        }
        self.out.write_all(&[OP_LITERAL])?;
        self.out.write_all(&(self.literal.len() as u32).to_le_bytes())?;
        self.out.write_all(&self.literal)?;
        self.literal.clear();
        Ok(())
    }

    fn copy(&mut self, index: u32, len: u32) -> io::Result<()> {
        self.flush_literal()?;
        self.out.write_all(&[OP_COPY])?;
        self.out.write_all(&index.to_le_bytes())?;
        self.out.write_all(&len.to_le_bytes())?;
        Ok(())
    }
}

/// Stream `size` bytes of `reader` against `prev`, emitting copy references
/// for blocks the previous version already has and literal runs for the
/// rest.
pub fn generate_delta<R: Read, W: Write>(
    prev: &Signature,
    reader: &mut R,
    size: u64,
    out: &mut W,
) -> io::Result<()> {
    let bs = prev.block_size as usize;
    if bs == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "previous signature has zero block size",
        ));
    }
    out.write_all(&prev.block_size.to_le_bytes())?;

    let mut lookup: HashMap<u32, Vec<u32>> = HashMap::new();
    for (i, block) in prev.blocks.iter().enumerate() {
        lookup.entry(block.weak).or_default().push(i as u32);
    }

    let mut src = reader.take(size);
    let mut sink = DeltaSink::new(out);
    let mut win = vec![0u8; bs];

    'refill: loop {
        let n = read_full(&mut src, &mut win)?;
        if n < bs {
            // Short tail can never match a full block.
            sink.extend_literal(&win[..n])?;
            break;
        }
        let mut head = 0usize;
        let mut weak = WeakSum::seed(&win);

        loop {
            let mut matched = None;
            if let Some(candidates) = lookup.get(&weak.value()) {
                let strong = strong_sum(&[&win[head..], &win[..head]]);
                matched = candidates
                    .iter()
                    .copied()
                    .find(|&i| prev.blocks[i as usize].strong == strong);
            }

            if let Some(index) = matched {
                sink.copy(index, bs as u32)?;
                continue 'refill;
            }

            match read_byte(&mut src)? {
                Some(byte) => {
                    let old = win[head];
                    sink.push_literal(old)?;
                    weak.slide(old, byte);
                    win[head] = byte;
                    head = (head + 1) % bs;
                }
                None => {
                    // Stream ended mid-window; the window is the tail.
                    let (back, front) = (win[head..].to_vec(), win[..head].to_vec());
                    sink.extend_literal(&back)?;
                    sink.extend_literal(&front)?;
                    break 'refill;
                }
            }
        }
    }

    sink.flush_literal()
}

/// Deterministic reconstruction: replay the delta ops against the previous
/// version's bytes.
pub fn apply_delta<R: Read, W: Write>(
    prev: &[u8],
    delta: &mut R,
    out: &mut W,
) -> io::Result<()> {
    let bs = wire::read_u32(delta)? as usize;

    loop {
        let op = match wire::read_u8(delta) {
            Ok(op) => op,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match op {
            OP_LITERAL => {
                let len = wire::read_u32(delta)? as u64;
                let copied = io::copy(&mut delta.take(len), out)?;
                if copied != len {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "literal run truncated",
                    ));
                }
            }
            OP_COPY => {
                let index = wire::read_u32(delta)? as usize;
                let len = wire::read_u32(delta)? as usize;
                let start = index
                    .checked_mul(bs)
                    .filter(|&s| s <= prev.len())
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidData, "copy offset out of range")
                    })?;
                let end = start.checked_add(len).filter(|&e| e <= prev.len()).ok_or_else(
                    || io::Error::new(io::ErrorKind::InvalidData, "copy length out of range"),
                )?;
                out.write_all(&prev[start..end])?;
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown delta op {other}"),
                ));
            }
        }
    }
}

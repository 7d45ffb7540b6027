//! Public-key streaming envelope.
//!
//! X25519 with an ephemeral sender key agrees on a shared secret with the
//! recipient's public key; HKDF-SHA256 turns it into a stream key; the
//! payload travels as length-framed XChaCha20-Poly1305 chunks. The producing
//! host holds no secret — only the recipient's public key.
//!
//! Layout: `magic "SBX1" | ephemeral_pub: [32] | nonce_prefix: [15]` then
//! `( clen: u32 | ciphertext )*`. Per-chunk nonce is
//! `nonce_prefix || counter: u64 LE || final_flag: u8`; the high bit of
//! `clen` marks the final (possibly empty) chunk. A stream without a final
//! chunk is truncated and fails authentication.

pub mod keyfile;

use std::io::{self, Read, Write};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

pub use keyfile::SecretKey;

pub const ENVELOPE_MAGIC: [u8; 4] = *b"SBX1";

const CHUNK_SIZE: usize = 64 * 1024;
const TAG_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 15;
const FINAL_FLAG: u32 = 1 << 31;

fn crypto_err(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("envelope: {detail}"))
}

fn stream_key(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> io::Result<[u8; 32]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; 32];
    hk.expand(b"snapback stream v1", &mut key)
        .map_err(|_| crypto_err("key derivation failed"))?;
    Ok(key)
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u64, last: bool) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..23].copy_from_slice(&counter.to_le_bytes());
    nonce[23] = last as u8;
    nonce
}

/// Encrypting sink. Data is chunked at 64 KiB; `finish` seals the final
/// chunk and hands back the inner writer.
pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: XChaCha20Poly1305,
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    counter: u64,
    pending: Vec<u8>,
}

impl<W: Write> EncryptWriter<W> {
    pub fn new(mut inner: W, recipient: &PublicKey) -> io::Result<Self> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(recipient);
        if !shared.was_contributory() {
            return Err(crypto_err("weak recipient key"));
        }
        let key = stream_key(shared.as_bytes(), &ephemeral_pub, recipient)?;

        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        OsRng.fill_bytes(&mut nonce_prefix);

        inner.write_all(&ENVELOPE_MAGIC)?;
        inner.write_all(ephemeral_pub.as_bytes())?;
        inner.write_all(&nonce_prefix)?;

        Ok(Self {
            inner,
            cipher: XChaCha20Poly1305::new(&key.into()),
            nonce_prefix,
            counter: 0,
            pending: Vec::with_capacity(CHUNK_SIZE),
        })
    }

    fn seal(&mut self, plaintext: &[u8], last: bool) -> io::Result<()> {
        let nonce = chunk_nonce(&self.nonce_prefix, self.counter, last);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| crypto_err("encryption failed"))?;
        let mut clen = ciphertext.len() as u32;
        if last {
            clen |= FINAL_FLAG;
        }
        self.inner.write_all(&clen.to_le_bytes())?;
        self.inner.write_all(&ciphertext)?;
        self.counter += 1;
        Ok(())
    }

    /// Seal the final chunk, flush, and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        let pending = std::mem::take(&mut self.pending);
        self.seal(&pending, true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(data);
        while self.pending.len() >= CHUNK_SIZE {
            let chunk: Vec<u8> = self.pending.drain(..CHUNK_SIZE).collect();
            self.seal(&chunk, false)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Pending plaintext stays buffered until a full chunk or finish();
        // flushing mid-chunk would leak chunk boundaries to write patterns.
        self.inner.flush()
    }
}

/// Decrypting source for an envelope produced by [`EncryptWriter`].
pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: XChaCha20Poly1305,
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
    counter: u64,
    buf: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(mut inner: R, secret: &StaticSecret) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        inner.read_exact(&mut magic)?;
        if magic != ENVELOPE_MAGIC {
            return Err(crypto_err("bad magic"));
        }
        let mut ephemeral = [0u8; 32];
        inner.read_exact(&mut ephemeral)?;
        let ephemeral = PublicKey::from(ephemeral);
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        inner.read_exact(&mut nonce_prefix)?;

        let recipient = PublicKey::from(secret);
        let shared = secret.diffie_hellman(&ephemeral);
        let key = stream_key(shared.as_bytes(), &ephemeral, &recipient)?;

        Ok(Self {
            inner,
            cipher: XChaCha20Poly1305::new(&key.into()),
            nonce_prefix,
            counter: 0,
            buf: Vec::new(),
            pos: 0,
            done: false,
        })
    }

    fn next_chunk(&mut self) -> io::Result<()> {
        let mut len_bytes = [0u8; 4];
        if let Err(e) = self.inner.read_exact(&mut len_bytes) {
            return Err(if e.kind() == io::ErrorKind::UnexpectedEof {
                crypto_err("stream truncated before final chunk")
            } else {
                e
            });
        }
        let framed = u32::from_le_bytes(len_bytes);
        let last = framed & FINAL_FLAG != 0;
        let clen = (framed & !FINAL_FLAG) as usize;
        if clen < TAG_LEN || clen > CHUNK_SIZE + TAG_LEN {
            return Err(crypto_err("implausible chunk length"));
        }

        let mut ciphertext = vec![0u8; clen];
        self.inner.read_exact(&mut ciphertext)?;
        let nonce = chunk_nonce(&self.nonce_prefix, self.counter, last);
        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| crypto_err("authentication failed"))?;
        self.counter += 1;
        self.buf = plaintext;
        self.pos = 0;
        self.done = last;
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buf.len() {
            if self.done {
                return Ok(0);
            }
            self.next_chunk()?;
        }
        let n = (self.buf.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use x25519_dalek::StaticSecret;

    fn keypair() -> (StaticSecret, PublicKey) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    fn encrypt(data: &[u8], public: &PublicKey) -> Vec<u8> {
        let mut w = EncryptWriter::new(Vec::new(), public).unwrap();
        w.write_all(data).unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn round_trip_small() {
        let (secret, public) = keypair();
        let sealed = encrypt(b"hello snapshot", &public);

        let mut r = DecryptReader::new(Cursor::new(&sealed), &secret).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello snapshot");
    }

    #[test]
    fn round_trip_empty() {
        let (secret, public) = keypair();
        let sealed = encrypt(b"", &public);
        let mut r = DecryptReader::new(Cursor::new(&sealed), &secret).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn round_trip_multiple_chunks() {
        let (secret, public) = keypair();
        let data: Vec<u8> = (0..CHUNK_SIZE * 3 + 777).map(|i| (i % 251) as u8).collect();
        let sealed = encrypt(&data, &public);

        let mut r = DecryptReader::new(Cursor::new(&sealed), &secret).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn wrong_key_fails() {
        let (_, public) = keypair();
        let (other_secret, _) = keypair();
        let sealed = encrypt(b"for someone else", &public);

        let mut r = DecryptReader::new(Cursor::new(&sealed), &other_secret).unwrap();
        let mut out = Vec::new();
        assert!(r.read_to_end(&mut out).is_err());
    }

    #[test]
    fn truncation_fails() {
        let (secret, public) = keypair();
        let sealed = encrypt(b"data that will be cut short", &public);
        let cut = &sealed[..sealed.len() - 5];

        let mut r = DecryptReader::new(Cursor::new(cut), &secret).unwrap();
        let mut out = Vec::new();
        assert!(r.read_to_end(&mut out).is_err());
    }

    #[test]
    fn tampering_fails() {
        let (secret, public) = keypair();
        let mut sealed = encrypt(b"integrity protected", &public);
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let mut r = DecryptReader::new(Cursor::new(&sealed), &secret).unwrap();
        let mut out = Vec::new();
        assert!(r.read_to_end(&mut out).is_err());
    }
}

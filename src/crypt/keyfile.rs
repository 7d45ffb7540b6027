//! Key files: a hex public key the producing host reads, and a secret key
//! sealed under an Argon2id-derived key that only the restore side needs.
//!
//! Secret layout: `magic "SBSK" | version: u16 | m_cost: u32 | t_cost: u32 |
//! p_cost: u32 | salt: [16] | nonce: [24] | sealed: [48]`.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};
use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

use crate::{Result, SnapbackError};

pub use x25519_dalek::PublicKey;
pub type SecretKey = StaticSecret;

const SECRET_MAGIC: [u8; 4] = *b"SBSK";
const SECRET_VERSION: u16 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const SEALED_LEN: usize = 32 + 16;

// Argon2id work factors: 64 MiB, 3 passes, single lane.
const M_COST: u32 = 64 * 1024;
const T_COST: u32 = 3;
const P_COST: u32 = 1;

pub struct Keypair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

pub fn generate() -> Keypair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    Keypair { public, secret }
}

fn derive_key(passphrase: &[u8], salt: &[u8], m: u32, t: u32, p: u32) -> Result<[u8; 32]> {
    let params = Params::new(m, t, p, Some(32))
        .map_err(|e| SnapbackError::Crypto(format!("bad kdf parameters: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon
        .hash_password_into(passphrase, salt, &mut key)
        .map_err(|e| SnapbackError::Crypto(format!("key derivation failed: {e}")))?;
    Ok(key)
}

/// Seal a secret key under a passphrase.
pub fn seal_secret_key(secret: &SecretKey, passphrase: &[u8]) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut key = derive_key(passphrase, &salt, M_COST, T_COST, P_COST)?;
    let cipher = XChaCha20Poly1305::new(&key.into());
    key.zeroize();

    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), secret.to_bytes().as_slice())
        .map_err(|_| SnapbackError::Crypto("sealing secret key failed".into()))?;

    let mut out = Vec::with_capacity(4 + 2 + 12 + SALT_LEN + NONCE_LEN + SEALED_LEN);
    out.extend_from_slice(&SECRET_MAGIC);
    out.extend_from_slice(&SECRET_VERSION.to_le_bytes());
    out.extend_from_slice(&M_COST.to_le_bytes());
    out.extend_from_slice(&T_COST.to_le_bytes());
    out.extend_from_slice(&P_COST.to_le_bytes());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a sealed secret key. A wrong passphrase fails authentication.
pub fn open_secret_key(bytes: &[u8], passphrase: &[u8]) -> Result<SecretKey> {
    let mut r = bytes;
    let err = |detail: &str| SnapbackError::Crypto(format!("secret key file: {detail}"));

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(|_| err("truncated"))?;
    if magic != SECRET_MAGIC {
        return Err(err("bad magic"));
    }
    let version = crate::wire::read_u16(&mut r).map_err(|_| err("truncated"))?;
    if version != SECRET_VERSION {
        return Err(err("unsupported version"));
    }
    let m = crate::wire::read_u32(&mut r).map_err(|_| err("truncated"))?;
    let t = crate::wire::read_u32(&mut r).map_err(|_| err("truncated"))?;
    let p = crate::wire::read_u32(&mut r).map_err(|_| err("truncated"))?;
    let mut salt = [0u8; SALT_LEN];
    r.read_exact(&mut salt).map_err(|_| err("truncated"))?;
    let mut nonce = [0u8; NONCE_LEN];
    r.read_exact(&mut nonce).map_err(|_| err("truncated"))?;
    let mut sealed = [0u8; SEALED_LEN];
    r.read_exact(&mut sealed).map_err(|_| err("truncated"))?;

    let mut key = derive_key(passphrase, &salt, m, t, p)?;
    let cipher = XChaCha20Poly1305::new(&key.into());
    key.zeroize();

    let mut opened = cipher
        .decrypt(XNonce::from_slice(&nonce), sealed.as_slice())
        .map_err(|_| SnapbackError::Crypto("wrong passphrase or corrupt secret key".into()))?;
    let mut raw = [0u8; 32];
    raw.copy_from_slice(&opened);
    opened.zeroize();
    Ok(SecretKey::from(raw))
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

pub fn write_public_key(path: &Path, public: &PublicKey) -> Result<()> {
    let mut line = encode_hex(public.as_bytes());
    line.push('\n');
    fs::write(path, line)?;
    Ok(())
}

pub fn read_public_key(path: &Path) -> Result<PublicKey> {
    let text = fs::read_to_string(path)?;
    parse_public_key(&text)
        .ok_or_else(|| SnapbackError::Config(format!("{}: not a public key file", path.display())))
}

fn parse_public_key(text: &str) -> Option<PublicKey> {
    let raw = decode_hex(text.trim())?;
    let raw: [u8; 32] = raw.try_into().ok()?;
    Some(PublicKey::from(raw))
}

/// Secret key files are 0600: the restoring operator's eyes only.
pub fn write_secret_key(path: &Path, secret: &SecretKey, passphrase: &[u8]) -> Result<()> {
    let sealed = seal_secret_key(secret, passphrase)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(&sealed)?;
    file.sync_all()?;
    Ok(())
}

pub fn read_secret_key(path: &Path, passphrase: &[u8]) -> Result<SecretKey> {
    let bytes = fs::read(path)?;
    open_secret_key(&bytes, passphrase)
}

//! Encryption primitives for ENCRYPTED bottles.
//!
//! Content cipher: AES-256 in counter mode, applied as a stream so an
//! encrypted bottle never has to be buffered. Key material is 48 bytes:
//! `key (32 B) || iv (16 B)`.
//!
//! Two ways to obtain key material:
//! - **Recipients**: a fresh random key per archive, wrapped once per recipient
//!   by a [`KeyService`]. [`LocalKeyring`] wraps with AES-256-GCM under a
//!   per-identity secret.
//! - **Password**: derived by a [`Kdf`] (Argon2id by default) from the password
//!   and the salt/iteration count stored in the bottle header.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::error::{BottleError, Result};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub const KEY_LEN:          usize = 32;
pub const IV_LEN:           usize = 16;
pub const KEY_MATERIAL_LEN: usize = KEY_LEN + IV_LEN;

/// Byte length of the AES-GCM nonce prepended to every wrapped key.
pub const NONCE_LEN: usize = 12;

/// Salt used for every password-encrypted archive.
///
/// Known weakness: identical passwords yield identical key/IV pairs across
/// archives. Changing it is a format change, so the salt is also stored in
/// each header and readers always use the stored value.
pub const FIXED_PASSWORD_SALT: &[u8; 16] = b"bottler.salt.v1!";

pub const DEFAULT_KDF_ITERATIONS: u32 = 3;

// ── Cipher ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    Aes256Ctr,
}

impl Cipher {
    pub fn tag(self) -> u64 {
        match self {
            Cipher::Aes256Ctr => 0,
        }
    }

    pub fn from_tag(tag: u64) -> Result<Self> {
        match tag {
            0 => Ok(Cipher::Aes256Ctr),
            other => Err(BottleError::UnsupportedCipher(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Cipher::Aes256Ctr => "aes-256-ctr",
        }
    }

    fn keystream(self, key: &KeyMaterial) -> Aes256Ctr {
        match self {
            Cipher::Aes256Ctr => Aes256Ctr::new((&key.key).into(), (&key.iv).into()),
        }
    }

    pub fn encryptor<W: Write>(self, inner: W, key: &KeyMaterial) -> CipherWriter<W> {
        CipherWriter { inner, keystream: self.keystream(key), scratch: Vec::new() }
    }

    pub fn decryptor<R: Read>(self, inner: R, key: &KeyMaterial) -> CipherReader<R> {
        CipherReader { inner, keystream: self.keystream(key) }
    }
}

/// Symmetric key and IV for the content cipher.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    key: [u8; KEY_LEN],
    iv:  [u8; IV_LEN],
}

impl KeyMaterial {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_MATERIAL_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self::split(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_MATERIAL_LEN {
            return Err(BottleError::Crypto(format!(
                "key material must be {KEY_MATERIAL_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self::split(bytes))
    }

    fn split(bytes: &[u8]) -> Self {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        key.copy_from_slice(&bytes[..KEY_LEN]);
        iv.copy_from_slice(&bytes[KEY_LEN..KEY_MATERIAL_LEN]);
        Self { key, iv }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(KEY_MATERIAL_LEN);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.iv);
        out
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// Encrypts everything written through it.
pub struct CipherWriter<W: Write> {
    inner:     W,
    keystream: Aes256Ctr,
    scratch:   Vec<u8>,
}

impl<W: Write> CipherWriter<W> {
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.keystream.apply_keystream(&mut self.scratch);
        // The keystream has advanced; every byte must reach the sink.
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypts everything read through it.
pub struct CipherReader<R: Read> {
    inner:     R,
    keystream: Aes256Ctr,
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.keystream.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}

// ── Key derivation ───────────────────────────────────────────────────────────

/// Password key derivation.
pub trait Kdf: Send + Sync {
    fn derive(&self, password: &str, salt: &[u8], iterations: u32, output_len: usize) -> Result<Vec<u8>>;
}

/// Argon2id; `iterations` is the time cost.
#[derive(Debug, Clone)]
pub struct Argon2Kdf {
    pub memory_kib: u32,
    pub lanes:      u32,
}

impl Default for Argon2Kdf {
    fn default() -> Self {
        Self { memory_kib: 19 * 1024, lanes: 1 }
    }
}

impl Kdf for Argon2Kdf {
    fn derive(&self, password: &str, salt: &[u8], iterations: u32, output_len: usize) -> Result<Vec<u8>> {
        let params = Params::new(self.memory_kib, iterations, self.lanes, Some(output_len))
            .map_err(|e| BottleError::KeyDerivation(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut out = vec![0u8; output_len];
        argon2
            .hash_password_into(password.as_bytes(), salt, &mut out)
            .map_err(|e| BottleError::KeyDerivation(e.to_string()))?;
        Ok(out)
    }
}

// ── Identity key service ─────────────────────────────────────────────────────

/// Wraps and unwraps per-archive symmetric keys on behalf of named
/// recipients. Failures to reach or authenticate with the service surface as
/// [`BottleError::KeyServiceUnavailable`].
pub trait KeyService: Send + Sync {
    /// The identity whose keys [`unwrap`](Self::unwrap) can open.
    fn current_identity(&self) -> Result<String>;
    fn wrap(&self, key: &[u8], recipient: &str) -> Result<Vec<u8>>;
    /// Only succeeds when the caller is the recipient the blob was wrapped for.
    fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>>;
}

/// In-process key service: each identity owns a 256-bit secret, keys are
/// wrapped as `nonce (12 B) || AES-256-GCM(secret, key)`.
#[derive(Clone, Default)]
pub struct LocalKeyring {
    identity: Option<String>,
    secrets:  HashMap<String, [u8; KEY_LEN]>,
}

impl LocalKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` with a random secret.
    pub fn generate(&mut self, name: &str) {
        let mut secret = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut secret);
        self.insert(name, secret);
    }

    pub fn insert(&mut self, name: &str, secret: [u8; KEY_LEN]) {
        self.secrets.insert(name.to_owned(), secret);
    }

    /// Act as `name` when unwrapping.
    pub fn select(&mut self, name: &str) {
        self.identity = Some(name.to_owned());
    }

    /// Load a keyring file: `{"identity": "alice", "secrets": {"alice": "<64 hex chars>"}}`.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: KeyringFile = serde_json::from_str(text)
            .map_err(|e| BottleError::KeyServiceUnavailable(format!("keyring: {e}")))?;
        let mut ring = Self::new();
        for (name, secret_hex) in &file.secrets {
            let mut secret = [0u8; KEY_LEN];
            hex::decode_to_slice(secret_hex, &mut secret)
                .map_err(|e| BottleError::KeyServiceUnavailable(format!("keyring secret for {name}: {e}")))?;
            ring.insert(name, secret);
        }
        ring.identity = file.identity;
        Ok(ring)
    }

    fn secret(&self, name: &str) -> Result<&[u8; KEY_LEN]> {
        self.secrets
            .get(name)
            .ok_or_else(|| BottleError::KeyServiceUnavailable(format!("no key known for {name}")))
    }
}

#[derive(serde::Deserialize)]
struct KeyringFile {
    #[serde(default)]
    identity: Option<String>,
    #[serde(default)]
    secrets:  HashMap<String, String>,
}

impl KeyService for LocalKeyring {
    fn current_identity(&self) -> Result<String> {
        self.identity
            .clone()
            .ok_or_else(|| BottleError::KeyServiceUnavailable("no identity selected".into()))
    }

    fn wrap(&self, key: &[u8], recipient: &str) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(self.secret(recipient)?)
            .map_err(|e| BottleError::Crypto(e.to_string()))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, key)
            .map_err(|_| BottleError::Crypto("key wrap failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        let me = self.current_identity()?;
        if wrapped.len() < NONCE_LEN {
            return Err(BottleError::Crypto("wrapped key too short".into()));
        }
        let cipher = Aes256Gcm::new_from_slice(self.secret(&me)?)
            .map_err(|e| BottleError::Crypto(e.to_string()))?;
        let nonce = aes_gcm::Nonce::from_slice(&wrapped[..NONCE_LEN]);
        cipher
            .decrypt(nonce, &wrapped[NONCE_LEN..])
            .map_err(|_| BottleError::Crypto(format!("wrapped key is not addressed to {me}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctr_stream_roundtrip_across_uneven_writes() {
        let key = KeyMaterial::generate();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 256) as u8).collect();
        let mut enc = Cipher::Aes256Ctr.encryptor(Vec::new(), &key);
        for piece in data.chunks(333) {
            enc.write_all(piece).unwrap();
        }
        let sealed = enc.into_inner();
        assert_eq!(sealed.len(), data.len());
        assert_ne!(sealed, data);

        let mut back = Vec::new();
        let mut dec = Cipher::Aes256Ctr.decryptor(&sealed[..], &key);
        let mut buf = [0u8; 97];
        loop {
            let n = dec.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            back.extend_from_slice(&buf[..n]);
        }
        assert_eq!(back, data);
    }

    #[test]
    fn key_material_length_is_checked() {
        assert!(KeyMaterial::from_bytes(&[0u8; 10]).is_err());
        let km = KeyMaterial::generate();
        assert_eq!(KeyMaterial::from_bytes(&km.to_bytes()).unwrap(), km);
        assert!(matches!(Cipher::from_tag(5), Err(BottleError::UnsupportedCipher(5))));
    }

    #[test]
    fn argon2_is_deterministic_per_salt() {
        let kdf = Argon2Kdf { memory_kib: 1024, lanes: 1 };
        let a = kdf.derive("MrSparkle", FIXED_PASSWORD_SALT, 1, KEY_MATERIAL_LEN).unwrap();
        let b = kdf.derive("MrSparkle", FIXED_PASSWORD_SALT, 1, KEY_MATERIAL_LEN).unwrap();
        let c = kdf.derive("MrSparkle", b"another salt....", 1, KEY_MATERIAL_LEN).unwrap();
        assert_eq!(a.len(), KEY_MATERIAL_LEN);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn keyring_wraps_for_the_addressed_recipient_only() {
        let mut ring = LocalKeyring::new();
        ring.generate("alice");
        ring.generate("bob");
        let key = KeyMaterial::generate().to_bytes();
        let for_alice = ring.wrap(&key, "alice").unwrap();

        assert!(matches!(ring.unwrap(&for_alice), Err(BottleError::KeyServiceUnavailable(_))));
        ring.select("alice");
        assert_eq!(ring.unwrap(&for_alice).unwrap(), key);
        ring.select("bob");
        assert!(matches!(ring.unwrap(&for_alice), Err(BottleError::Crypto(_))));
        assert!(matches!(ring.wrap(&key, "mallory"), Err(BottleError::KeyServiceUnavailable(_))));
    }

    #[test]
    fn keyring_loads_from_json() {
        let secret = "11".repeat(KEY_LEN);
        let text = format!(r#"{{"identity": "alice", "secrets": {{"alice": "{secret}"}}}}"#);
        let ring = LocalKeyring::from_json(&text).unwrap();
        assert_eq!(ring.current_identity().unwrap(), "alice");
        let wrapped = ring.wrap(b"key", "alice").unwrap();
        assert_eq!(ring.unwrap(&wrapped).unwrap(), b"key");

        assert!(matches!(
            LocalKeyring::from_json(r#"{"secrets": {"bob": "abc"}}"#),
            Err(BottleError::KeyServiceUnavailable(_))
        ));
    }
}

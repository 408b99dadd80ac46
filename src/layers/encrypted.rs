//! ENCRYPTED bottles: one chunked substream holding the inner bottle under
//! the content cipher.
//!
//! # Header
//! | class   | id | value                                   |
//! |---------|----|-----------------------------------------|
//! | INTEGER | 0  | cipher tag                              |
//! | STRING  | 0  | `recipient:hex(wrapped key)`, repeated  |
//! | STRING  | 1  | KDF salt, hex (password mode)           |
//! | INTEGER | 1  | KDF iterations (password mode)          |
//!
//! A bottle may carry both recipient entries and password parameters; a
//! reader uses whichever it can satisfy.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use tracing::debug;

use crate::crypto::{
    Cipher, Kdf, KeyMaterial, KeyService, DEFAULT_KDF_ITERATIONS, FIXED_PASSWORD_SALT, KEY_MATERIAL_LEN,
};
use crate::error::{BottleError, Result};
use crate::header::Header;
use crate::io_stream::{ensure_exhausted, BottleKind, BottleReader, BottleWriter};

// INTEGER ids
pub const FIELD_CIPHER:         u64 = 0;
pub const FIELD_KDF_ITERATIONS: u64 = 1;

// STRING ids
pub const FIELD_RECIPIENT: u64 = 0;
pub const FIELD_KDF_SALT:  u64 = 1;

// ── Write side ───────────────────────────────────────────────────────────────

/// How an archive's content key is produced and recorded.
#[derive(Clone)]
pub enum Encryption {
    /// Fresh random key material, wrapped once per recipient.
    Recipients { service: Arc<dyn KeyService>, recipients: Vec<String> },
    /// Key material derived from a password and the fixed salt.
    Password { password: String, kdf: Arc<dyn Kdf>, iterations: u32 },
}

impl Encryption {
    pub fn password(password: impl Into<String>, kdf: Arc<dyn Kdf>) -> Self {
        Encryption::Password { password: password.into(), kdf, iterations: DEFAULT_KDF_ITERATIONS }
    }

    fn prepare(&self, cipher: Cipher) -> Result<(Header, KeyMaterial)> {
        let builder = Header::builder().integer(FIELD_CIPHER, cipher.tag());
        match self {
            Encryption::Recipients { service, recipients } => {
                if recipients.is_empty() {
                    return Err(BottleError::Crypto("no recipients given".into()));
                }
                let key = KeyMaterial::generate();
                let raw = key.to_bytes();
                let mut builder = builder;
                for recipient in recipients {
                    let wrapped = service.wrap(&raw, recipient)?;
                    builder = builder.string(FIELD_RECIPIENT, format!("{recipient}:{}", hex::encode(wrapped)));
                }
                Ok((builder.build(), key))
            }
            Encryption::Password { password, kdf, iterations } => {
                let derived = kdf.derive(password, FIXED_PASSWORD_SALT, *iterations, KEY_MATERIAL_LEN)?;
                let header = builder
                    .string(FIELD_KDF_SALT, hex::encode(FIXED_PASSWORD_SALT))
                    .integer(FIELD_KDF_ITERATIONS, u64::from(*iterations))
                    .build();
                Ok((header, KeyMaterial::from_bytes(&derived)?))
            }
        }
    }
}

impl fmt::Debug for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encryption::Recipients { recipients, .. } => {
                f.debug_struct("Recipients").field("recipients", recipients).finish_non_exhaustive()
            }
            Encryption::Password { iterations, .. } => {
                f.debug_struct("Password").field("iterations", iterations).finish_non_exhaustive()
            }
        }
    }
}

/// Write an ENCRYPTED bottle to `sink`; `body` writes the plaintext inner
/// bottle.
pub fn write<W, T, F>(sink: W, encryption: &Encryption, body: F) -> Result<(W, T)>
where
    W: Write,
    F: FnOnce(&mut dyn Write) -> Result<T>,
{
    let cipher = Cipher::Aes256Ctr;
    let (header, key) = encryption.prepare(cipher)?;
    let mut bottle = BottleWriter::new(sink, BottleKind::Encrypted, &header)?;
    let value = {
        let mut encryptor = cipher.encryptor(bottle.substream()?, &key);
        let value = body(&mut encryptor)?;
        let sealed = encryptor.into_inner().finish()?;
        debug!(cipher = cipher.name(), sealed, "encrypted bottle sealed");
        value
    };
    bottle.close()?;
    Ok((bottle.into_inner(), value))
}

// ── Read side ────────────────────────────────────────────────────────────────

/// Password-mode parameters recorded in the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    pub salt:       Vec<u8>,
    pub iterations: u32,
}

/// Everything an ENCRYPTED header says about how to recover the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionInfo {
    pub cipher: Cipher,
    /// `(recipient, wrapped key)` in header order.
    pub keymap: Vec<(String, Vec<u8>)>,
    pub kdf:    Option<KdfParams>,
}

impl EncryptionInfo {
    pub fn from_header(header: &Header) -> Result<Self> {
        let tag = header
            .integer(FIELD_CIPHER)
            .ok_or_else(|| BottleError::MalformedHeader("encrypted bottle has no cipher".into()))?;
        let cipher = Cipher::from_tag(tag)?;

        let mut keymap = Vec::new();
        for entry in header.strings(FIELD_RECIPIENT) {
            let (recipient, blob) = entry
                .rsplit_once(':')
                .ok_or_else(|| BottleError::MalformedHeader(format!("key map entry without ':' ({entry})")))?;
            let wrapped = hex::decode(blob)
                .map_err(|e| BottleError::MalformedHeader(format!("key map entry for {recipient}: {e}")))?;
            keymap.push((recipient.to_owned(), wrapped));
        }

        let kdf = match header.string(FIELD_KDF_SALT) {
            None => None,
            Some(salt) => {
                let salt = hex::decode(salt).map_err(|e| BottleError::MalformedHeader(format!("kdf salt: {e}")))?;
                let iterations = header.integer(FIELD_KDF_ITERATIONS).unwrap_or(u64::from(DEFAULT_KDF_ITERATIONS));
                let iterations = u32::try_from(iterations)
                    .map_err(|_| BottleError::MalformedHeader(format!("kdf iterations {iterations}")))?;
                Some(KdfParams { salt, iterations })
            }
        };
        Ok(Self { cipher, keymap, kdf })
    }

    pub fn recipients(&self) -> impl Iterator<Item = &str> + '_ {
        self.keymap.iter().map(|(r, _)| r.as_str())
    }

    pub fn wrapped_key_for(&self, recipient: &str) -> Option<&[u8]> {
        self.keymap.iter().find(|(r, _)| r == recipient).map(|(_, k)| k.as_slice())
    }
}

/// The reader's way of recovering key material.
#[derive(Clone, Default)]
pub enum Decryption {
    /// Every encrypted bottle fails with [`BottleError::MissingDecryptionKey`].
    #[default]
    None,
    Password { password: String, kdf: Arc<dyn Kdf> },
    KeyService(Arc<dyn KeyService>),
}

impl Decryption {
    /// Produce the raw key material for the bottle `info` describes.
    pub fn resolve(&self, info: &EncryptionInfo) -> Result<Vec<u8>> {
        match self {
            Decryption::None => Err(BottleError::MissingDecryptionKey),
            Decryption::Password { password, kdf } => {
                let params = info.kdf.as_ref().ok_or(BottleError::MissingDecryptionKey)?;
                kdf.derive(password, &params.salt, params.iterations, KEY_MATERIAL_LEN)
            }
            Decryption::KeyService(service) => {
                let me = service.current_identity()?;
                let wrapped = info.wrapped_key_for(&me).ok_or(BottleError::MissingDecryptionKey)?;
                service.unwrap(wrapped)
            }
        }
    }
}

impl fmt::Debug for Decryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Decryption::None            => "Decryption::None",
            Decryption::Password { .. } => "Decryption::Password(..)",
            Decryption::KeyService(_)   => "Decryption::KeyService(..)",
        })
    }
}

pub fn info<R: Read>(bottle: &BottleReader<R>) -> Result<EncryptionInfo> {
    if bottle.kind() != BottleKind::Encrypted {
        return Err(BottleError::UnexpectedKind { expected: "encrypted", found: bottle.kind().tag() });
    }
    EncryptionInfo::from_header(bottle.header())
}

/// Decrypt the inner bottle with the key `decrypt_key` returns and hand the
/// plaintext stream to `body`. Plaintext left unread by `body` is
/// [`BottleError::MalformedFrame`].
pub fn decrypt_with<R, T, K, F>(bottle: &mut BottleReader<R>, decrypt_key: K, body: F) -> Result<T>
where
    R: Read,
    K: FnOnce(&EncryptionInfo) -> Result<Vec<u8>>,
    F: FnOnce(&mut dyn Read) -> Result<T>,
{
    let info = info(bottle)?;
    let key = KeyMaterial::from_bytes(&decrypt_key(&info)?)?;
    let value = {
        let mut sub = bottle.require_substream("content")?;
        let mut decryptor = info.cipher.decryptor(&mut sub, &key);
        let value = body(&mut decryptor)?;
        ensure_exhausted(&mut decryptor, "encrypted bottle")?;
        value
    };
    bottle.expect_end()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Argon2Kdf, LocalKeyring};

    fn fast_kdf() -> Arc<dyn Kdf> {
        Arc::new(Argon2Kdf { memory_kib: 1024, lanes: 1 })
    }

    fn read_all(r: &mut dyn Read) -> Result<Vec<u8>> {
        let mut v = Vec::new();
        r.read_to_end(&mut v)?;
        Ok(v)
    }

    #[test]
    fn password_roundtrip_records_kdf_parameters() {
        let enc = Encryption::Password { password: "MrSparkle".into(), kdf: fast_kdf(), iterations: 1 };
        let (bytes, ()) = write(Vec::new(), &enc, |w| Ok(w.write_all(b"secret inner bottle")?)).unwrap();
        assert!(bytes.windows(6).all(|w| w != b"secret"));

        let mut bottle = BottleReader::new(&bytes[..]).unwrap();
        let info = info(&bottle).unwrap();
        assert_eq!(info.kdf, Some(KdfParams { salt: FIXED_PASSWORD_SALT.to_vec(), iterations: 1 }));
        assert!(info.keymap.is_empty());

        let dec = Decryption::Password { password: "MrSparkle".into(), kdf: fast_kdf() };
        let plain = decrypt_with(&mut bottle, |i| dec.resolve(i), read_all).unwrap();
        assert_eq!(plain, b"secret inner bottle");
    }

    #[test]
    fn every_recipient_can_open_and_others_cannot() {
        let mut ring = LocalKeyring::new();
        for name in ["alice", "bob", "carol"] {
            ring.generate(name);
        }
        let writer = Encryption::Recipients {
            service:    Arc::new(ring.clone()),
            recipients: vec!["alice".into(), "bob".into()],
        };
        let (bytes, ()) = write(Vec::new(), &writer, |w| Ok(w.write_all(b"for two")?)).unwrap();

        for name in ["alice", "bob"] {
            let mut me = ring.clone();
            me.select(name);
            let dec = Decryption::KeyService(Arc::new(me));
            let mut bottle = BottleReader::new(&bytes[..]).unwrap();
            assert_eq!(info(&bottle).unwrap().recipients().collect::<Vec<_>>(), ["alice", "bob"]);
            assert_eq!(decrypt_with(&mut bottle, |i| dec.resolve(i), read_all).unwrap(), b"for two");
        }

        ring.select("carol");
        let dec = Decryption::KeyService(Arc::new(ring));
        let mut bottle = BottleReader::new(&bytes[..]).unwrap();
        let err = decrypt_with(&mut bottle, |i| dec.resolve(i), read_all).unwrap_err();
        assert!(matches!(err, BottleError::MissingDecryptionKey));
    }

    #[test]
    fn unknown_cipher_and_missing_key() {
        let header = Header::builder().integer(FIELD_CIPHER, 4).build();
        assert!(matches!(EncryptionInfo::from_header(&header), Err(BottleError::UnsupportedCipher(4))));

        let header = Header::builder().integer(FIELD_CIPHER, 0).build();
        let info = EncryptionInfo::from_header(&header).unwrap();
        assert!(matches!(Decryption::None.resolve(&info), Err(BottleError::MissingDecryptionKey)));
        let dec = Decryption::Password { password: "x".into(), kdf: fast_kdf() };
        assert!(matches!(dec.resolve(&info), Err(BottleError::MissingDecryptionKey)));
    }

    #[test]
    fn recipient_names_may_contain_colons() {
        let header = Header::builder()
            .integer(FIELD_CIPHER, 0)
            .string(FIELD_RECIPIENT, "team:ops:00ff")
            .build();
        let info = EncryptionInfo::from_header(&header).unwrap();
        assert_eq!(info.wrapped_key_for("team:ops"), Some(&[0x00, 0xff][..]));
    }
}

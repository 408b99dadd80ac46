//! The four bottle kinds, each a thin layer over [`crate::io_stream`].
//!
//! Write-side helpers take a `body` closure that produces the inner bottle
//! into the transformed stream; read-side helpers hand the untransformed
//! inner stream to a closure and check that nothing was left over.

pub mod compressed;
pub mod encrypted;
pub mod file;
pub mod hashed;

pub use encrypted::{Decryption, Encryption, EncryptionInfo};
pub use hashed::{begin_validate, HashOutcome, PendingDigest, Validator};

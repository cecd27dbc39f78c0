/* APK signing.
 *
 * The repackaged archive is signed twice: a JAR-style v1 signature written as
 * META-INF entries before the archive is serialized, then a v2 signing block
 * spliced between the last entry and the central directory. Installers that
 * understand v2 ignore v1, older ones fall back to it.
 */

pub mod keystore;
pub mod v1;
pub mod v2;

use std::fmt;
use std::io;

use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};

use crate::apk::zip::{ApkError, ApkFile};
use crate::sign::keystore::SigningMaterial;

pub type SignResult<T> = Result<T, SignError>;

#[derive(Debug)]
pub enum SignError {
    Io(io::Error),
    Key(String),
    Certificate(String),
    Archive(ApkError),
    Rsa(rsa::Error),
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignError::Io(err) => write!(f, "I/O error: {err}"),
            SignError::Key(msg) => write!(f, "key error: {msg}"),
            SignError::Certificate(msg) => write!(f, "certificate error: {msg}"),
            SignError::Archive(err) => write!(f, "archive error: {err}"),
            SignError::Rsa(err) => write!(f, "RSA error: {err}"),
        }
    }
}

impl std::error::Error for SignError {}

impl From<io::Error> for SignError {
    fn from(err: io::Error) -> Self {
        SignError::Io(err)
    }
}

impl From<ApkError> for SignError {
    fn from(err: ApkError) -> Self {
        SignError::Archive(err)
    }
}

impl From<rsa::Error> for SignError {
    fn from(err: rsa::Error) -> Self {
        SignError::Rsa(err)
    }
}

/// PKCS#1 v1.5 signature over the SHA-256 digest of `data`.
pub(crate) fn sign_sha256(key: &RsaPrivateKey, data: &[u8]) -> SignResult<Vec<u8>> {
    let digest = Sha256::digest(data);
    Ok(key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?)
}

/// Applies both signature schemes and serializes the archive.
pub fn sign_apk(mut apk: ApkFile, material: &SigningMaterial) -> SignResult<Vec<u8>> {
    v1::sign(&mut apk, material)?;
    let bytes = apk.to_bytes()?;
    v2::sign(&bytes, material)
}

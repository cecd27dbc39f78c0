/* Persistent signing identity.
 *
 * One 2048-bit RSA key and a matching self-signed certificate live in a single
 * PEM file next to the clone output. The key is generated lazily on first use
 * and cached behind a mutex; a keystore that no longer parses is thrown away
 * and replaced rather than aborting the pipeline.
 */

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::Encode;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;

use crate::sign::{SignError, SignResult};

const KEY_BITS: usize = 2048;
const VALIDITY_DAYS: u64 = 30 * 365;
const SUBJECT: &str = "CN=APK Clone,O=Clone";

// Same role as the fixed password on Android debug keystores.
const STORE_PASSWORD: &[u8] = b"android";

const KEY_TAG: &str = "ENCRYPTED PRIVATE KEY";
const CERT_TAG: &str = "CERTIFICATE";

/// Key material handed to the v1 and v2 signers.
pub struct SigningMaterial {
    pub key: RsaPrivateKey,
    pub cert_der: Vec<u8>,
}

impl SigningMaterial {
    /// DER-encoded SubjectPublicKeyInfo for the signing key.
    pub fn public_key_der(&self) -> SignResult<Vec<u8>> {
        let public = RsaPublicKey::from(&self.key);
        let der = public
            .to_public_key_der()
            .map_err(|err| SignError::Key(err.to_string()))?;
        Ok(der.as_ref().to_vec())
    }
}

pub trait KeyProvider {
    fn signing_material(&self) -> SignResult<Arc<SigningMaterial>>;
}

/// Keystore persisted as a two-block PEM file.
pub struct FileKeyStore {
    path: PathBuf,
    cached: Mutex<Option<Arc<SigningMaterial>>>,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileKeyStore { path: path.into(), cached: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> SignResult<SigningMaterial> {
        let text = std::fs::read_to_string(&self.path)?;
        let blocks = pem::parse_many(&text).map_err(|err| SignError::Key(err.to_string()))?;

        let key_block = blocks
            .iter()
            .find(|b| b.tag() == KEY_TAG)
            .ok_or_else(|| SignError::Key("keystore has no private key block".to_string()))?;
        let key = RsaPrivateKey::from_pkcs8_encrypted_der(key_block.contents(), STORE_PASSWORD)
            .map_err(|err| SignError::Key(err.to_string()))?;

        let cert_block = blocks
            .iter()
            .find(|b| b.tag() == CERT_TAG)
            .ok_or_else(|| SignError::Certificate("keystore has no certificate block".to_string()))?;

        Ok(SigningMaterial { key, cert_der: cert_block.contents().to_vec() })
    }

    fn generate(&self) -> SignResult<SigningMaterial> {
        debug!("generating signing key at {}", self.path.display());
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, KEY_BITS)?;
        let cert_der = self_signed_certificate(&key)?;

        let encrypted = key
            .to_pkcs8_encrypted_der(&mut rng, STORE_PASSWORD)
            .map_err(|err| SignError::Key(err.to_string()))?;
        let blocks = vec![
            pem::Pem::new(KEY_TAG, encrypted.as_bytes().to_vec()),
            pem::Pem::new(CERT_TAG, cert_der.clone()),
        ];
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, pem::encode_many(&blocks))?;

        Ok(SigningMaterial { key, cert_der })
    }
}

impl KeyProvider for FileKeyStore {
    fn signing_material(&self) -> SignResult<Arc<SigningMaterial>> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(material) = cached.as_ref() {
            return Ok(material.clone());
        }

        let material = if self.path.exists() {
            match self.load() {
                Ok(material) => material,
                Err(err) => {
                    warn!(
                        "keystore {} is unreadable ({}), generating a new key",
                        self.path.display(),
                        err
                    );
                    self.generate()?
                }
            }
        } else {
            self.generate()?
        };

        let material = Arc::new(material);
        *cached = Some(material.clone());
        Ok(material)
    }
}

fn self_signed_certificate(key: &RsaPrivateKey) -> SignResult<Vec<u8>> {
    let public = RsaPublicKey::from(key);
    let spki_der = public
        .to_public_key_der()
        .map_err(|err| SignError::Key(err.to_string()))?;
    let spki = SubjectPublicKeyInfoOwned::try_from(spki_der.as_bytes())
        .map_err(|err| SignError::Certificate(err.to_string()))?;

    let subject =
        Name::from_str(SUBJECT).map_err(|err| SignError::Certificate(err.to_string()))?;
    let serial = SerialNumber::from(rand::random::<u32>());
    let validity = Validity::from_now(Duration::from_secs(VALIDITY_DAYS * 24 * 60 * 60))
        .map_err(|err| SignError::Certificate(err.to_string()))?;

    let signer = SigningKey::<Sha256>::new(key.clone());
    let builder = CertificateBuilder::new(Profile::Root, serial, validity, subject, spki, &signer)
        .map_err(|err| SignError::Certificate(err.to_string()))?;
    let cert = builder
        .build::<rsa::pkcs1v15::Signature>()
        .map_err(|err| SignError::Certificate(err.to_string()))?;

    cert.to_der().map_err(|err| SignError::Certificate(err.to_string()))
}

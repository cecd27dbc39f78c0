/* JAR-style (v1) signing.
 *
 * Three entries are added under META-INF: MANIFEST.MF with one SHA-256 digest
 * per archive entry, CERT.SF digesting the manifest sections, and CERT.RSA, a
 * PKCS#7 SignedData blob over CERT.SF carrying the signing certificate. Any
 * signature entries from the source archive are dropped first.
 */

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use x509_cert::der::asn1::ObjectIdentifier;
use x509_cert::der::{Decode, Encode};
use x509_cert::Certificate;

use crate::apk::zip::{ApkError, ApkFile};
use crate::sign::keystore::SigningMaterial;
use crate::sign::{sign_sha256, SignError, SignResult};

const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";
const SF_NAME: &str = "META-INF/CERT.SF";
const RSA_NAME: &str = "META-INF/CERT.RSA";

const CREATED_BY: &str = "1.0 (apkclone)";

// JAR manifests wrap at 72 bytes per line including the CRLF.
const MAX_LINE: usize = 70;

fn is_signature_entry(name: &str) -> bool {
    if !name.starts_with("META-INF/") {
        return false;
    }
    name == MANIFEST_NAME
        || name.ends_with(".SF")
        || name.ends_with(".RSA")
        || name.ends_with(".DSA")
        || name.ends_with(".EC")
}

fn wrap_line(out: &mut String, line: &str) {
    let bytes = line.as_bytes();
    let mut start = 0;
    let mut first = true;
    while start < bytes.len() {
        let budget = if first { MAX_LINE } else { MAX_LINE - 1 };
        let mut end = (start + budget).min(bytes.len());
        // never split inside a UTF-8 sequence
        while end < bytes.len() && !line.is_char_boundary(end) {
            end -= 1;
        }
        if !first {
            out.push(' ');
        }
        out.push_str(&line[start..end]);
        out.push_str("\r\n");
        start = end;
        first = false;
    }
}

fn attribute(out: &mut String, key: &str, value: &str) {
    wrap_line(out, &format!("{key}: {value}"));
}

fn entry_section(name: &str, digest: &str) -> String {
    let mut section = String::new();
    attribute(&mut section, "Name", name);
    attribute(&mut section, "SHA-256-Digest", digest);
    section.push_str("\r\n");
    section
}

struct ManifestFile {
    bytes: Vec<u8>,
    // per-entry section text, digested again for CERT.SF
    sections: Vec<(String, String)>,
}

fn build_manifest(apk: &ApkFile) -> SignResult<ManifestFile> {
    let mut main = String::new();
    attribute(&mut main, "Manifest-Version", "1.0");
    attribute(&mut main, "Created-By", CREATED_BY);
    main.push_str("\r\n");

    let mut sections = vec![];
    let names: Vec<String> = apk.entry_names().map(|n| n.to_string()).collect();
    for name in names {
        let entry = apk
            .entry(&name)
            .ok_or_else(|| ApkError::InvalidInput(format!("missing entry '{name}'")))?;
        let digest = BASE64.encode(Sha256::digest(entry.uncompressed()?));
        sections.push((name.clone(), entry_section(&name, &digest)));
    }

    let mut bytes = main.into_bytes();
    for (_, section) in &sections {
        bytes.extend_from_slice(section.as_bytes());
    }
    Ok(ManifestFile { bytes, sections })
}

fn build_signature_file(manifest: &ManifestFile) -> Vec<u8> {
    let mut main = String::new();
    attribute(&mut main, "Signature-Version", "1.0");
    attribute(&mut main, "Created-By", CREATED_BY);
    attribute(
        &mut main,
        "SHA-256-Digest-Manifest",
        &BASE64.encode(Sha256::digest(&manifest.bytes)),
    );
    // tells the platform a v2 block is also present, so a stripped v2
    // signature cannot be silently downgraded
    attribute(&mut main, "X-Android-APK-Signed", "2");
    main.push_str("\r\n");

    let mut bytes = main.into_bytes();
    for (name, section) in &manifest.sections {
        let digest = BASE64.encode(Sha256::digest(section.as_bytes()));
        bytes.extend_from_slice(entry_section(name, &digest).as_bytes());
    }
    bytes
}

// DER tags used by the PKCS#7 wrapper
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_CONTEXT_0: u8 = 0xa0;

const OID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
const OID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
const OID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
const OID_SHA256_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let len_bytes = len.to_be_bytes();
        let skip = len_bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (len_bytes.len() - skip) as u8);
        out.extend_from_slice(&len_bytes[skip..]);
    }
    out.extend_from_slice(content);
    out
}

fn der_oid(oid: ObjectIdentifier) -> SignResult<Vec<u8>> {
    oid.to_der().map_err(|err| SignError::Certificate(err.to_string()))
}

fn algorithm_identifier(oid: ObjectIdentifier) -> SignResult<Vec<u8>> {
    let mut content = der_oid(oid)?;
    content.extend_from_slice(&tlv(TAG_NULL, &[]));
    Ok(tlv(TAG_SEQUENCE, &content))
}

/// PKCS#7 SignedData with detached content: the signature covers the raw
/// CERT.SF bytes.
fn build_pkcs7(sf_bytes: &[u8], material: &SigningMaterial) -> SignResult<Vec<u8>> {
    let cert = Certificate::from_der(&material.cert_der)
        .map_err(|err| SignError::Certificate(err.to_string()))?;
    let issuer = cert
        .tbs_certificate
        .issuer
        .to_der()
        .map_err(|err| SignError::Certificate(err.to_string()))?;
    let serial = cert
        .tbs_certificate
        .serial_number
        .to_der()
        .map_err(|err| SignError::Certificate(err.to_string()))?;

    let signature = sign_sha256(&material.key, sf_bytes)?;

    let mut issuer_and_serial = issuer;
    issuer_and_serial.extend_from_slice(&serial);

    let mut signer_info = tlv(TAG_INTEGER, &[1]);
    signer_info.extend_from_slice(&tlv(TAG_SEQUENCE, &issuer_and_serial));
    signer_info.extend_from_slice(&algorithm_identifier(OID_SHA256)?);
    signer_info.extend_from_slice(&algorithm_identifier(OID_SHA256_RSA)?);
    signer_info.extend_from_slice(&tlv(TAG_OCTET_STRING, &signature));
    let signer_info = tlv(TAG_SEQUENCE, &signer_info);

    let mut signed_data = tlv(TAG_INTEGER, &[1]);
    signed_data.extend_from_slice(&tlv(TAG_SET, &algorithm_identifier(OID_SHA256)?));
    signed_data.extend_from_slice(&tlv(TAG_SEQUENCE, &der_oid(OID_DATA)?));
    signed_data.extend_from_slice(&tlv(TAG_CONTEXT_0, &material.cert_der));
    signed_data.extend_from_slice(&tlv(TAG_SET, &signer_info));
    let signed_data = tlv(TAG_SEQUENCE, &signed_data);

    let mut content_info = der_oid(OID_SIGNED_DATA)?;
    content_info.extend_from_slice(&tlv(TAG_CONTEXT_0, &signed_data));
    Ok(tlv(TAG_SEQUENCE, &content_info))
}

/// Signs every entry of the archive in place.
pub fn sign(apk: &mut ApkFile, material: &SigningMaterial) -> SignResult<()> {
    apk.retain_entries(|name| !is_signature_entry(name));
    if apk.entry_names().next().is_none() {
        return Err(SignError::Archive(ApkError::InvalidInput(
            "archive has no entries to sign".to_string(),
        )));
    }

    let manifest = build_manifest(apk)?;
    let sf = build_signature_file(&manifest);
    let pkcs7 = build_pkcs7(&sf, material)?;

    apk.replace_entry(MANIFEST_NAME, manifest.bytes)?;
    apk.replace_entry(SF_NAME, sf)?;
    apk.replace_entry(RSA_NAME, pkcs7)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::keystore::{FileKeyStore, KeyProvider};
    use once_cell::sync::Lazy;
    use rsa::traits::PublicKeyParts;
    use rsa::{Pkcs1v15Sign, RsaPublicKey};
    use std::sync::Arc;

    static MATERIAL: Lazy<Arc<SigningMaterial>> = Lazy::new(|| {
        let path = std::env::temp_dir().join("apkclone-v1-tests").join("signer.pem");
        let _ = std::fs::remove_file(&path);
        FileKeyStore::new(path).signing_material().unwrap()
    });

    fn sample_apk() -> ApkFile {
        let mut apk = ApkFile::new();
        apk.replace_entry("classes.dex", b"dex bytes".to_vec()).unwrap();
        apk.replace_entry("res/values.xml", b"<resources/>".to_vec()).unwrap();
        apk.replace_entry("META-INF/OLD.SF", b"stale".to_vec()).unwrap();
        apk
    }

    #[test]
    fn adds_signature_entries_and_strips_stale_ones() {
        let mut apk = sample_apk();
        sign(&mut apk, &MATERIAL).unwrap();
        assert!(apk.contains(MANIFEST_NAME));
        assert!(apk.contains(SF_NAME));
        assert!(apk.contains(RSA_NAME));
        assert!(!apk.contains("META-INF/OLD.SF"));
    }

    #[test]
    fn manifest_digests_match_entry_contents() {
        let mut apk = sample_apk();
        sign(&mut apk, &MATERIAL).unwrap();

        let manifest = apk.entry(MANIFEST_NAME).unwrap().uncompressed().unwrap();
        let text = String::from_utf8(manifest).unwrap();
        assert!(text.starts_with("Manifest-Version: 1.0\r\n"));
        assert!(text.contains("Name: classes.dex\r\n"));
        let expected = BASE64.encode(Sha256::digest(b"dex bytes"));
        assert!(text.contains(&format!("SHA-256-Digest: {expected}\r\n")));
    }

    #[test]
    fn signature_file_digests_the_manifest() {
        let mut apk = sample_apk();
        sign(&mut apk, &MATERIAL).unwrap();

        let manifest = apk.entry(MANIFEST_NAME).unwrap().uncompressed().unwrap();
        let sf = apk.entry(SF_NAME).unwrap().uncompressed().unwrap();
        let text = String::from_utf8(sf).unwrap();
        let expected = BASE64.encode(Sha256::digest(&manifest));
        assert!(text.contains(&format!("SHA-256-Digest-Manifest: {expected}\r\n")));
        assert!(text.contains("X-Android-APK-Signed: 2\r\n"));
    }

    #[test]
    fn pkcs7_signature_verifies_against_signing_key() {
        let mut apk = sample_apk();
        sign(&mut apk, &MATERIAL).unwrap();

        let sf = apk.entry(SF_NAME).unwrap().uncompressed().unwrap();
        let pkcs7 = apk.entry(RSA_NAME).unwrap().uncompressed().unwrap();

        // the raw RSA signature is the trailing OCTET STRING of the blob
        let sig_len = MATERIAL.key.size();
        let signature = &pkcs7[pkcs7.len() - sig_len..];
        let public = RsaPublicKey::from(&MATERIAL.key);
        public
            .verify(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(&sf), signature)
            .unwrap();
        // and the embedded certificate is the keystore one
        assert!(pkcs7
            .windows(MATERIAL.cert_der.len())
            .any(|w| w == MATERIAL.cert_der));
    }

    #[test]
    fn long_attribute_lines_are_wrapped() {
        let mut out = String::new();
        let name = "a".repeat(200);
        wrap_line(&mut out, &format!("Name: {name}"));
        for line in out.split("\r\n").filter(|l| !l.is_empty()) {
            assert!(line.len() <= MAX_LINE);
        }
        // continuation lines start with a space and reassemble losslessly
        let joined: String = out
            .split("\r\n")
            .filter(|l| !l.is_empty())
            .enumerate()
            .map(|(i, l)| if i == 0 { l } else { &l[1..] })
            .collect();
        assert_eq!(joined, format!("Name: {name}"));
    }

    #[test]
    fn empty_archive_is_fatal() {
        let mut apk = ApkFile::new();
        apk.replace_entry("META-INF/ONLY.RSA", b"x".to_vec()).unwrap();
        assert!(sign(&mut apk, &MATERIAL).is_err());
    }
}

/* APK Signature Scheme v2.
 *
 * The signing block sits between the last entry's data and the central
 * directory. The digest splits the three zip regions (entry data, central
 * directory, end-of-central-directory with its pointer patched back to the
 * block start) into 1 MiB chunks, hashes each behind an 0xa5 prefix and hashes
 * the chunk list behind an 0x5a prefix. Re-signing an already signed archive
 * replaces the old block.
 */

use sha2::{Digest, Sha256};

use crate::apk::zip::ApkError;
use crate::sign::keystore::SigningMaterial;
use crate::sign::{sign_sha256, SignError, SignResult};

const SIGNING_BLOCK_MAGIC: &[u8; 16] = b"APK Sig Block 42";
const SIGNING_BLOCK_V2_ID: u32 = 0x7109871a;
const RSA_PKCS1V15_SHA2_256: u32 = 0x0103;
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

const EOCD_SIGNATURE: u32 = 0x06054b50;
const EOCD_MIN_SIZE: usize = 22;

struct Layout {
    /// Start of the signing block, or of the central directory when unsigned.
    sb_start: usize,
    cd_start: usize,
    eocd_start: usize,
}

fn read_u32_at(bytes: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
}

fn read_u64_at(bytes: &[u8], pos: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[pos..pos + 8]);
    u64::from_le_bytes(b)
}

fn find_eocd(bytes: &[u8]) -> SignResult<usize> {
    if bytes.len() < EOCD_MIN_SIZE {
        return Err(malformed("archive shorter than an end-of-central-directory record"));
    }
    let lower = bytes.len().saturating_sub(EOCD_MIN_SIZE + u16::MAX as usize);
    let mut pos = bytes.len() - EOCD_MIN_SIZE;
    loop {
        if read_u32_at(bytes, pos) == EOCD_SIGNATURE {
            return Ok(pos);
        }
        if pos == lower {
            return Err(malformed("no end-of-central-directory record found"));
        }
        pos -= 1;
    }
}

fn malformed(msg: &str) -> SignError {
    SignError::Archive(ApkError::InvalidInput(msg.to_string()))
}

fn field_at(data: &[u8], start: usize, len: usize) -> SignResult<&[u8]> {
    start
        .checked_add(len)
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| malformed("truncated signing block"))
}

fn length_at(data: &[u8], pos: usize) -> SignResult<usize> {
    let b = field_at(data, pos, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
}

fn layout(bytes: &[u8]) -> SignResult<Layout> {
    let eocd_start = find_eocd(bytes)?;
    let cd_start = read_u32_at(bytes, eocd_start + 16) as usize;
    if cd_start > eocd_start {
        return Err(malformed("central directory offset past its end record"));
    }

    // an existing signing block ends with [size u64][magic 16]
    let mut sb_start = cd_start;
    if cd_start >= 24 && &bytes[cd_start - 16..cd_start] == SIGNING_BLOCK_MAGIC {
        let size = read_u64_at(bytes, cd_start - 24) as usize;
        let candidate = size.checked_add(8).and_then(|s| cd_start.checked_sub(s));
        match candidate {
            Some(start) if read_u64_at(bytes, start) as usize == size => sb_start = start,
            _ => return Err(malformed("corrupt signing block size")),
        }
    }

    Ok(Layout { sb_start, cd_start, eocd_start })
}

fn hash_chunks(chunks: &mut Vec<[u8; 32]>, region: &[u8]) {
    for chunk in region.chunks(MAX_CHUNK_SIZE) {
        let mut hasher = Sha256::new();
        hasher.update([0xa5]);
        hasher.update((chunk.len() as u32).to_le_bytes());
        hasher.update(chunk);
        chunks.push(hasher.finalize().into());
    }
}

fn content_digest(bytes: &[u8], layout: &Layout) -> [u8; 32] {
    let mut chunks = vec![];
    hash_chunks(&mut chunks, &bytes[..layout.sb_start]);
    hash_chunks(&mut chunks, &bytes[layout.cd_start..layout.eocd_start]);

    // the EOCD is hashed with its central directory pointer rewound to the
    // block start, so the digest is independent of the block's size
    let mut eocd = bytes[layout.eocd_start..].to_vec();
    eocd[16..20].copy_from_slice(&(layout.sb_start as u32).to_le_bytes());
    hash_chunks(&mut chunks, &eocd);

    let mut hasher = Sha256::new();
    hasher.update([0x5a]);
    hasher.update((chunks.len() as u32).to_le_bytes());
    for chunk in &chunks {
        hasher.update(chunk);
    }
    hasher.finalize().into()
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_length_prefixed(buf: &mut Vec<u8>, data: &[u8]) {
    push_u32(buf, data.len() as u32);
    buf.extend_from_slice(data);
}

fn build_signed_data(digest: [u8; 32], cert_der: &[u8]) -> Vec<u8> {
    let mut digest_record = vec![];
    push_u32(&mut digest_record, RSA_PKCS1V15_SHA2_256);
    push_length_prefixed(&mut digest_record, &digest);

    let mut digests = vec![];
    push_length_prefixed(&mut digests, &digest_record);

    let mut certificates = vec![];
    push_length_prefixed(&mut certificates, cert_der);

    let mut signed_data = vec![];
    push_length_prefixed(&mut signed_data, &digests);
    push_length_prefixed(&mut signed_data, &certificates);
    push_u32(&mut signed_data, 0); // no additional attributes
    signed_data
}

fn build_signing_block(digest: [u8; 32], material: &SigningMaterial) -> SignResult<Vec<u8>> {
    let signed_data = build_signed_data(digest, &material.cert_der);
    let signature = sign_sha256(&material.key, &signed_data)?;
    let public_key = material.public_key_der()?;

    let mut sig_record = vec![];
    push_u32(&mut sig_record, RSA_PKCS1V15_SHA2_256);
    push_length_prefixed(&mut sig_record, &signature);

    let mut signatures = vec![];
    push_length_prefixed(&mut signatures, &sig_record);

    let mut signer = vec![];
    push_length_prefixed(&mut signer, &signed_data);
    push_length_prefixed(&mut signer, &signatures);
    push_length_prefixed(&mut signer, &public_key);

    let mut signers = vec![];
    push_length_prefixed(&mut signers, &signer);

    let mut v2 = vec![];
    push_length_prefixed(&mut v2, &signers);

    // [size][id + v2][size][magic], both sizes excluding the leading u64
    let block_size = (8 + 4 + v2.len() + 8 + 16) as u64;
    let mut block = vec![];
    push_u64(&mut block, block_size);
    push_u64(&mut block, 4 + v2.len() as u64);
    push_u32(&mut block, SIGNING_BLOCK_V2_ID);
    block.extend_from_slice(&v2);
    push_u64(&mut block, block_size);
    block.extend_from_slice(SIGNING_BLOCK_MAGIC);
    Ok(block)
}

/// Inserts a v2 signing block into a serialized archive.
pub fn sign(bytes: &[u8], material: &SigningMaterial) -> SignResult<Vec<u8>> {
    let layout = layout(bytes)?;
    let digest = content_digest(bytes, &layout);
    let block = build_signing_block(digest, material)?;

    let mut out = Vec::with_capacity(bytes.len() + block.len());
    out.extend_from_slice(&bytes[..layout.sb_start]);
    out.extend_from_slice(&block);
    let new_cd_start = out.len() as u32;
    out.extend_from_slice(&bytes[layout.cd_start..layout.eocd_start]);
    let eocd_at = out.len();
    out.extend_from_slice(&bytes[layout.eocd_start..]);
    out[eocd_at + 16..eocd_at + 20].copy_from_slice(&new_cd_start.to_le_bytes());
    Ok(out)
}

/// Whether a serialized archive carries a v2 signing block.
pub fn has_signing_block(bytes: &[u8]) -> SignResult<bool> {
    let layout = layout(bytes)?;
    Ok(layout.sb_start != layout.cd_start)
}

/// Checks the v2 block's RSA signature and content digest over `bytes`.
pub fn verify(bytes: &[u8]) -> SignResult<()> {
    use rsa::pkcs8::DecodePublicKey;
    use rsa::{Pkcs1v15Sign, RsaPublicKey};

    let layout = layout(bytes)?;
    if layout.sb_start == layout.cd_start {
        return Err(malformed("archive has no signing block"));
    }

    // walk the id/value pairs for the v2 entry
    let block_end = layout.cd_start - 24;
    let mut pos = layout.sb_start + 8;
    let mut v2 = None;
    while pos < block_end {
        if pos + 12 > block_end {
            return Err(malformed("truncated signing block"));
        }
        let len = read_u64_at(bytes, pos) as usize;
        let id = read_u32_at(bytes, pos + 8);
        let end = len
            .checked_add(8)
            .and_then(|n| pos.checked_add(n))
            .filter(|e| *e <= block_end)
            .ok_or_else(|| malformed("signing block entry overruns the block"))?;
        if id == SIGNING_BLOCK_V2_ID {
            if len < 4 {
                return Err(malformed("truncated signing block"));
            }
            v2 = Some(&bytes[pos + 12..end]);
        }
        pos = end;
    }
    let v2 = v2.ok_or_else(|| malformed("no v2 entry in signing block"))?;

    // first signer of the first (and only) signer list
    let signer = v2.get(8..).ok_or_else(|| malformed("truncated signer list"))?;
    let signed_data_len = length_at(signer, 0)?;
    let signed_data = field_at(signer, 4, signed_data_len)?;
    let sigs_at = 4 + signed_data_len;
    let sigs_len = length_at(signer, sigs_at)?;
    let sig_len = length_at(signer, sigs_at + 12)?;
    let signature = field_at(signer, sigs_at + 16, sig_len)?;
    let key_at = sigs_at + 4 + sigs_len;
    let key_len = length_at(signer, key_at)?;
    let public_key = field_at(signer, key_at + 4, key_len)?;

    let key = RsaPublicKey::from_public_key_der(public_key)
        .map_err(|err| SignError::Key(err.to_string()))?;
    key.verify(
        Pkcs1v15Sign::new::<Sha256>(),
        &Sha256::digest(signed_data),
        signature,
    )?;

    // digest bytes inside the first digest record
    let embedded = field_at(signed_data, 16, 32)?;
    let computed = content_digest(bytes, &layout);
    if embedded != computed {
        return Err(malformed("content digest mismatch"));
    }
    Ok(())
}

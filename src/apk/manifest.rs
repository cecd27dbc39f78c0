/* Binary AndroidManifest.xml string-pool rewriting.
 *
 * Attribute and element nodes reference strings by pool index, so renaming the
 * package never needs to touch anything outside the RES_STRING_POOL chunk: the
 * pool is decoded, rewritten and spliced back between the untouched document
 * header and the remaining chunks.
 */

use std::fmt;

const RES_XML_TYPE: u16 = 0x0003;
const RES_STRING_POOL_TYPE: u16 = 0x0001;

const STRING_FLAG_UTF8: u32 = 0x0000_0100;

pub type ManifestResult<T> = Result<T, ManifestError>;

#[derive(Debug)]
pub enum ManifestError {
    MalformedDocument(String),
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestError::MalformedDocument(msg) => write!(f, "malformed binary XML: {msg}"),
        }
    }
}

impl std::error::Error for ManifestError {}

fn malformed(msg: impl Into<String>) -> ManifestError {
    ManifestError::MalformedDocument(msg.into())
}

struct ChunkHeader {
    chunk_type: u16,
    chunk_size: u32,
    start: usize,
}

impl ChunkHeader {
    fn end(&self) -> usize {
        self.start + self.chunk_size as usize
    }
}

fn read_u16(data: &[u8], pos: usize) -> ManifestResult<u16> {
    if pos + 2 > data.len() {
        return Err(malformed("unexpected end of document"));
    }
    Ok(u16::from_le_bytes([data[pos], data[pos + 1]]))
}

fn read_u32(data: &[u8], pos: usize) -> ManifestResult<u32> {
    if pos + 4 > data.len() {
        return Err(malformed("unexpected end of document"));
    }
    Ok(u32::from_le_bytes([
        data[pos],
        data[pos + 1],
        data[pos + 2],
        data[pos + 3],
    ]))
}

fn read_chunk_header(data: &[u8], start: usize) -> ManifestResult<ChunkHeader> {
    let chunk_type = read_u16(data, start)?;
    let header_size = read_u16(data, start + 2)?;
    let chunk_size = read_u32(data, start + 4)?;
    if chunk_size < header_size as u32 {
        return Err(malformed("invalid chunk sizing"));
    }
    let end = start
        .checked_add(chunk_size as usize)
        .ok_or_else(|| malformed("chunk size overflow"))?;
    if end > data.len() {
        return Err(malformed("chunk extends past end of document"));
    }
    Ok(ChunkHeader { chunk_type, chunk_size, start })
}

/// Decodes every entry of a string pool chunk.
fn parse_string_pool(data: &[u8], header: &ChunkHeader) -> ManifestResult<Vec<String>> {
    let base = header.start;
    let string_count = read_u32(data, base + 8)? as usize;
    let flags = read_u32(data, base + 16)?;
    let strings_start = read_u32(data, base + 20)? as usize;
    let is_utf8 = (flags & STRING_FLAG_UTF8) != 0;
    let header_size = read_u16(data, base + 2)? as usize;

    let limit = header.end();
    let strings_base = base + strings_start;

    let mut strings = Vec::with_capacity(string_count);
    for i in 0..string_count {
        let offset = read_u32(data, base + header_size + i * 4)? as usize;
        let absolute = strings_base + offset;
        let text = if is_utf8 {
            read_utf8_string(data, absolute, limit)?
        } else {
            read_utf16_string(data, absolute, limit)?
        };
        strings.push(text);
    }
    Ok(strings)
}

fn read_utf8_string(data: &[u8], offset: usize, limit: usize) -> ManifestResult<String> {
    let mut cursor = offset;
    let (_char_len, header_bytes) = read_utf8_length(data, cursor, limit)?;
    cursor += header_bytes;
    let (byte_len, len_bytes) = read_utf8_length(data, cursor, limit)?;
    cursor += len_bytes;
    if cursor + byte_len > limit {
        return Err(malformed("UTF-8 string exceeds chunk bounds"));
    }
    let text = std::str::from_utf8(&data[cursor..cursor + byte_len])
        .map_err(|err| malformed(err.to_string()))?;
    Ok(text.to_string())
}

fn read_utf16_string(data: &[u8], offset: usize, limit: usize) -> ManifestResult<String> {
    let mut cursor = offset;
    let (char_count, header_bytes) = read_utf16_length(data, cursor, limit)?;
    cursor += header_bytes;
    let byte_len = char_count * 2;
    if cursor + byte_len > limit {
        return Err(malformed("UTF-16 string exceeds chunk bounds"));
    }
    let mut units = Vec::with_capacity(char_count);
    for chunk in data[cursor..cursor + byte_len].chunks_exact(2) {
        units.push(u16::from_le_bytes([chunk[0], chunk[1]]));
    }
    String::from_utf16(&units).map_err(|err| malformed(err.to_string()))
}

fn read_utf8_length(data: &[u8], offset: usize, limit: usize) -> ManifestResult<(usize, usize)> {
    if offset >= limit {
        return Err(malformed("invalid UTF-8 length offset"));
    }
    let first = data[offset];
    if (first & 0x80) == 0 {
        Ok((first as usize, 1))
    } else {
        if offset + 1 >= limit {
            return Err(malformed("truncated UTF-8 length"));
        }
        let length = (((first & 0x7F) as usize) << 8) | data[offset + 1] as usize;
        Ok((length, 2))
    }
}

fn read_utf16_length(data: &[u8], offset: usize, limit: usize) -> ManifestResult<(usize, usize)> {
    if offset + 2 > limit {
        return Err(malformed("invalid UTF-16 length offset"));
    }
    let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
    if (first & 0x8000) == 0 {
        Ok((first as usize, 2))
    } else {
        if offset + 4 > limit {
            return Err(malformed("truncated UTF-16 length"));
        }
        let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        Ok(((((first & 0x7FFF) as usize) << 16) | second as usize, 4))
    }
}

/// Serializes a string pool chunk: UTF-16 payload, no styles, 4-byte aligned.
fn build_string_pool(strings: &[String]) -> Vec<u8> {
    let header_size = 28u16;
    let strings_start = header_size as u32 + strings.len() as u32 * 4;

    let mut string_data = Vec::new();
    let mut offsets = Vec::with_capacity(strings.len());
    for s in strings {
        offsets.push(string_data.len() as u32);
        write_utf16_string(&mut string_data, s);
    }
    align_to_four(&mut string_data);

    let mut chunk = Vec::new();
    write_u16(&mut chunk, RES_STRING_POOL_TYPE);
    write_u16(&mut chunk, header_size);
    write_u32(&mut chunk, 0); // chunk size, patched below
    write_u32(&mut chunk, strings.len() as u32);
    write_u32(&mut chunk, 0); // style count
    write_u32(&mut chunk, 0); // flags (UTF-16)
    write_u32(&mut chunk, strings_start);
    write_u32(&mut chunk, 0); // styles start
    for offset in offsets {
        write_u32(&mut chunk, offset);
    }
    chunk.extend_from_slice(&string_data);
    align_to_four(&mut chunk);
    let chunk_size = chunk.len() as u32;
    chunk[4..8].copy_from_slice(&chunk_size.to_le_bytes());
    chunk
}

fn write_utf16_string(buf: &mut Vec<u8>, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    if units.len() >= 0x8000 {
        write_u16(buf, 0x8000 | ((units.len() >> 16) as u16));
        write_u16(buf, units.len() as u16);
    } else {
        write_u16(buf, units.len() as u16);
    }
    for unit in units {
        write_u16(buf, unit);
    }
    write_u16(buf, 0);
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn align_to_four(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// The package rename policy applied to a single pool string, first match
/// wins:
///
/// 1. the source package itself becomes the clone package;
/// 2. a value extending the package with `.` or `/` (authorities, component
///    paths) keeps its suffix on the clone package;
/// 3. any other value containing the package (permission names and the like)
///    has every occurrence substituted.
pub fn package_replacement(value: &str, source_pkg: &str, clone_pkg: &str) -> Option<String> {
    if value == source_pkg {
        return Some(clone_pkg.to_string());
    }
    if let Some(suffix) = value.strip_prefix(source_pkg) {
        if suffix.starts_with('.') || suffix.starts_with('/') {
            return Some(format!("{clone_pkg}{suffix}"));
        }
    }
    if value.contains(source_pkg) {
        return Some(value.replace(source_pkg, clone_pkg));
    }
    None
}

/// Rewrites the document's string pool through `replace`, leaving every other
/// chunk byte-identical. When no string changes the input is returned
/// byte-for-byte unchanged.
pub fn rewrite_string_pool<F>(bytes: &[u8], mut replace: F) -> ManifestResult<Vec<u8>>
where
    F: FnMut(&str) -> Option<String>,
{
    let doc = read_chunk_header(bytes, 0)?;
    if doc.chunk_type != RES_XML_TYPE {
        return Err(malformed(format!("not a binary XML document (type 0x{:04x})", doc.chunk_type)));
    }
    let doc_header_size = read_u16(bytes, 2)? as usize;
    if doc.end() != bytes.len() {
        return Err(malformed("document size does not match data"));
    }

    // The string pool is the first chunk after the document header.
    let pool = read_chunk_header(bytes, doc_header_size)?;
    if pool.chunk_type != RES_STRING_POOL_TYPE {
        return Err(malformed("document does not start with a string pool"));
    }

    let mut strings = parse_string_pool(bytes, &pool)?;
    let mut changed = false;
    for s in strings.iter_mut() {
        if let Some(replacement) = replace(s) {
            changed = *s != replacement || changed;
            *s = replacement;
        }
    }
    if !changed {
        return Ok(bytes.to_vec());
    }

    let mut out = Vec::with_capacity(bytes.len());
    out.extend_from_slice(&bytes[..doc_header_size]);
    out.extend_from_slice(&build_string_pool(&strings));
    out.extend_from_slice(&bytes[pool.end()..]);

    let total = out.len() as u32;
    out[4..8].copy_from_slice(&total.to_le_bytes());
    Ok(out)
}

/// Applies the package rename policy to the whole pool.
pub fn rewrite_package(bytes: &[u8], source_pkg: &str, clone_pkg: &str) -> ManifestResult<Vec<u8>> {
    rewrite_string_pool(bytes, |s| package_replacement(s, source_pkg, clone_pkg))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal document: header, UTF-16 pool, one opaque tail chunk.
    pub(crate) fn build_document(strings: &[&str], tail_chunk: &[u8]) -> Vec<u8> {
        let owned: Vec<String> = strings.iter().map(|s| s.to_string()).collect();
        let pool = build_string_pool(&owned);
        let mut doc = Vec::new();
        write_u16(&mut doc, RES_XML_TYPE);
        write_u16(&mut doc, 8);
        write_u32(&mut doc, 0);
        doc.extend_from_slice(&pool);
        doc.extend_from_slice(tail_chunk);
        let total = doc.len() as u32;
        doc[4..8].copy_from_slice(&total.to_le_bytes());
        doc
    }

    fn fake_tail() -> Vec<u8> {
        // shaped like a chunk so the document stays well-formed
        let mut tail = Vec::new();
        write_u16(&mut tail, 0x0102);
        write_u16(&mut tail, 8);
        write_u32(&mut tail, 16);
        tail.extend_from_slice(&[0xAA; 8]);
        tail
    }

    #[test]
    fn replacement_policy_priority() {
        assert_eq!(
            package_replacement("com.app", "com.app", "com.app.clone1"),
            Some("com.app.clone1".to_string())
        );
        assert_eq!(
            package_replacement("com.app.provider", "com.app", "com.app.clone1"),
            Some("com.app.clone1.provider".to_string())
        );
        assert_eq!(
            package_replacement("com.app/.MainActivity", "com.app", "com.app.clone1"),
            Some("com.app.clone1/.MainActivity".to_string())
        );
        // no dot/slash boundary: substring substitution
        assert_eq!(
            package_replacement("permission.com.app.READ", "com.app", "com.app.clone1"),
            Some("permission.com.app.clone1.READ".to_string())
        );
        assert_eq!(package_replacement("unrelated", "com.app", "c"), None);
    }

    #[test]
    fn prefix_rule_beats_substring_rule() {
        // "com.appx" must NOT be treated as a prefix extension of "com.app";
        // the substring rule still rewrites the embedded occurrence.
        assert_eq!(
            package_replacement("com.appx", "com.app", "org.clone"),
            Some("org.clonex".to_string())
        );
    }

    #[test]
    fn rewrites_only_the_pool() {
        let tail = fake_tail();
        let doc = build_document(&["com.app", "com.app.provider", "label"], &tail);

        let out = rewrite_package(&doc, "com.app", "com.app.clone1").unwrap();

        let pool = read_chunk_header(&out, 8).unwrap();
        let strings = parse_string_pool(&out, &pool).unwrap();
        assert_eq!(strings, vec!["com.app.clone1", "com.app.clone1.provider", "label"]);

        // tail chunk untouched, document size patched
        assert_eq!(&out[out.len() - tail.len()..], &tail[..]);
        assert_eq!(read_u32(&out, 4).unwrap() as usize, out.len());
    }

    #[test]
    fn idempotent_when_nothing_matches() {
        let doc = build_document(&["alpha", "beta"], &fake_tail());
        let once = rewrite_package(&doc, "com.app", "com.app.clone1").unwrap();
        assert_eq!(once, doc);
        let twice = rewrite_package(&once, "com.app", "com.app.clone1").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn pool_chunk_stays_aligned() {
        let doc = build_document(&["x"], &[]);
        let out = rewrite_package(&doc, "x", "abc").unwrap();
        let pool = read_chunk_header(&out, 8).unwrap();
        assert_eq!(pool.chunk_size % 4, 0);
        let strings = parse_string_pool(&out, &pool).unwrap();
        assert_eq!(strings, vec!["abc"]);
    }

    #[test]
    fn rejects_non_xml_input() {
        assert!(rewrite_package(&[0u8; 32], "a", "b").is_err());
        assert!(rewrite_package(b"PK\x03\x04 not xml at all", "a", "b").is_err());
    }
}

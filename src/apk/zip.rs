use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

use crc32fast::Hasher as Crc32;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use zip::read::ZipArchive;

/// Result alias for APK (ZIP) container operations.
pub type ApkResult<T> = Result<T, ApkError>;

/// Errors surfaced by the APK container helpers.
#[derive(Debug)]
pub enum ApkError {
    Io(io::Error),
    Zip(zip::result::ZipError),
    InvalidInput(String),
}

impl std::fmt::Display for ApkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApkError::Io(err) => write!(f, "I/O error: {err}"),
            ApkError::Zip(err) => write!(f, "ZIP error: {err}"),
            ApkError::InvalidInput(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ApkError {}

impl From<io::Error> for ApkError {
    fn from(value: io::Error) -> Self {
        ApkError::Io(value)
    }
}

impl From<zip::result::ZipError> for ApkError {
    fn from(value: zip::result::ZipError) -> Self {
        ApkError::Zip(value)
    }
}

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

/// Compression preference for a freshly written entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApkCompression {
    Stored,
    Deflated,
}

/// Entry payload: either raw bytes carried over from the source archive
/// (re-emitted byte-identically, original method/CRC/sizes intact) or fresh
/// content compressed at write time.
#[derive(Clone, Debug)]
enum Payload {
    Raw {
        data: Vec<u8>,
        method: u16,
        crc32: u32,
        uncompressed_size: u32,
    },
    Fresh {
        data: Vec<u8>,
        compression: Option<ApkCompression>,
    },
}

/// A single file entry stored in [`ApkFile`].
#[derive(Clone, Debug)]
pub struct ApkEntry {
    payload: Payload,
}

impl ApkEntry {
    pub fn fresh(data: Vec<u8>) -> Self {
        ApkEntry { payload: Payload::Fresh { data, compression: None } }
    }

    pub fn fresh_with_compression(data: Vec<u8>, compression: ApkCompression) -> Self {
        ApkEntry { payload: Payload::Fresh { data, compression: Some(compression) } }
    }

    /// Uncompressed content, inflating raw deflated payloads on demand.
    pub fn uncompressed(&self) -> ApkResult<Vec<u8>> {
        match &self.payload {
            Payload::Fresh { data, .. } => Ok(data.clone()),
            Payload::Raw { data, method: METHOD_STORED, .. } => Ok(data.clone()),
            Payload::Raw { data, method: METHOD_DEFLATED, uncompressed_size, .. } => {
                let mut out = Vec::with_capacity(*uncompressed_size as usize);
                DeflateDecoder::new(Cursor::new(data)).read_to_end(&mut out)?;
                Ok(out)
            }
            Payload::Raw { method, .. } => Err(ApkError::InvalidInput(format!(
                "unsupported compression method {method}"
            ))),
        }
    }

    fn is_stored(&self, name: &str) -> bool {
        match &self.payload {
            Payload::Raw { method, .. } => *method == METHOD_STORED,
            Payload::Fresh { compression, .. } => match compression {
                Some(ApkCompression::Stored) => true,
                Some(ApkCompression::Deflated) => false,
                None => should_store_uncompressed(&name.to_ascii_lowercase()),
            },
        }
    }
}

/// An in-memory APK. Entries live in a deterministic `BTreeMap`; untouched
/// entries round-trip with their original compressed bytes.
pub struct ApkFile {
    entries: BTreeMap<String, ApkEntry>,
}

impl Default for ApkFile {
    fn default() -> Self {
        Self::new()
    }
}

impl ApkFile {
    pub fn new() -> Self {
        ApkFile { entries: BTreeMap::new() }
    }

    /// Load an APK from disk, keeping every entry's compressed payload as-is.
    pub fn from_file(path: impl AsRef<Path>) -> ApkResult<Self> {
        let file = File::open(path.as_ref())?;
        Self::read_archive(ZipArchive::new(file)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ApkResult<Self> {
        Self::read_archive(ZipArchive::new(Cursor::new(bytes))?)
    }

    fn read_archive<R: Read + io::Seek>(mut archive: ZipArchive<R>) -> ApkResult<Self> {
        let mut entries = BTreeMap::new();
        for idx in 0..archive.len() {
            let mut entry = archive.by_index_raw(idx)?;
            if entry.name().ends_with('/') {
                continue;
            }
            let method = match entry.compression() {
                zip::CompressionMethod::Stored => METHOD_STORED,
                zip::CompressionMethod::Deflated => METHOD_DEFLATED,
                other => {
                    return Err(ApkError::InvalidInput(format!(
                        "unsupported compression method {other} for {}",
                        entry.name()
                    )))
                }
            };
            let mut data = Vec::with_capacity(entry.compressed_size() as usize);
            entry.read_to_end(&mut data)?;
            let name = normalize_entry_name(entry.name())?;
            entries.insert(
                name,
                ApkEntry {
                    payload: Payload::Raw {
                        data,
                        method,
                        crc32: entry.crc32(),
                        uncompressed_size: entry.size() as u32,
                    },
                },
            );
        }
        Ok(ApkFile { entries })
    }

    /// Serialize the archive. Raw entries are emitted with their original
    /// bytes, method, CRC and sizes; fresh entries are compressed here.
    pub fn to_bytes(&self) -> ApkResult<Vec<u8>> {
        if self.entries.len() > u16::MAX as usize {
            return Err(ApkError::InvalidInput(format!(
                "{} entries exceed the archive limit of {}",
                self.entries.len(),
                u16::MAX
            )));
        }
        let mut buffer = Vec::new();
        let mut central_records = Vec::new();

        for (name, entry) in &self.entries {
            let record = write_local_entry(&mut buffer, name, entry)?;
            central_records.push(record);
        }

        let central_start = buffer.len() as u32;
        for record in &central_records {
            write_central_directory_entry(&mut buffer, record);
        }
        let central_size = buffer.len() as u32 - central_start;
        write_end_of_central_directory(&mut buffer, central_records.len(), central_size, central_start);

        Ok(buffer)
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> ApkResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    pub fn entry(&self, name: &str) -> Option<&ApkEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Replace the contents of an entry, or add a new one. The payload is
    /// compressed at write time according to the entry name.
    pub fn replace_entry(&mut self, name: impl AsRef<str>, data: Vec<u8>) -> ApkResult<()> {
        let normalized = normalize_entry_name(name.as_ref())?;
        self.entries.insert(normalized, ApkEntry::fresh(data));
        Ok(())
    }

    pub fn insert_entry(&mut self, name: impl AsRef<str>, entry: ApkEntry) -> ApkResult<()> {
        let normalized = normalize_entry_name(name.as_ref())?;
        self.entries.insert(normalized, entry);
        Ok(())
    }

    pub fn remove_entry(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Drop all entries the predicate rejects.
    pub fn retain_entries(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.retain(|name, _| keep(name));
    }
}

struct CentralDirectoryRecord {
    file_name: Vec<u8>,
    method: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    local_header_offset: u32,
}

fn write_local_entry(buf: &mut Vec<u8>, name: &str, entry: &ApkEntry) -> ApkResult<CentralDirectoryRecord> {
    let offset = buf.len() as u32;

    let (compressed, method, crc32, uncompressed_size) = match &entry.payload {
        Payload::Raw { data, method, crc32, uncompressed_size } => {
            (data.clone(), *method, *crc32, *uncompressed_size)
        }
        Payload::Fresh { data, .. } => {
            let mut crc = Crc32::new();
            crc.update(data);
            let crc32 = crc.finalize();
            if entry.is_stored(name) {
                (data.clone(), METHOD_STORED, crc32, data.len() as u32)
            } else {
                (deflate_bytes(data)?, METHOD_DEFLATED, crc32, data.len() as u32)
            }
        }
    };

    // Stored entries are padded out so their payload lands on an alignment
    // boundary; native libraries get page alignment for direct mmap.
    let extra_len = if method == METHOD_STORED {
        let lower = name.to_ascii_lowercase();
        let alignment = if lower.starts_with("lib/") && lower.ends_with(".so") {
            16 * 1024
        } else {
            4
        };
        alignment_padding(offset, name.len(), alignment)
    } else {
        0
    };

    write_u32(buf, 0x04034b50);
    write_u16(buf, 20);
    write_u16(buf, 0);
    write_u16(buf, method);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, crc32);
    write_u32(buf, compressed.len() as u32);
    write_u32(buf, uncompressed_size);
    write_u16(buf, name.len() as u16);
    write_u16(buf, extra_len as u16);
    buf.extend_from_slice(name.as_bytes());
    buf.extend(std::iter::repeat(0u8).take(extra_len as usize));
    buf.extend_from_slice(&compressed);

    Ok(CentralDirectoryRecord {
        file_name: name.as_bytes().to_vec(),
        method,
        crc32,
        compressed_size: compressed.len() as u32,
        uncompressed_size,
        local_header_offset: offset,
    })
}

fn write_central_directory_entry(buf: &mut Vec<u8>, record: &CentralDirectoryRecord) {
    write_u32(buf, 0x02014b50);
    write_u16(buf, 0x031E);
    write_u16(buf, 20);
    write_u16(buf, 0);
    write_u16(buf, record.method);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, record.crc32);
    write_u32(buf, record.compressed_size);
    write_u32(buf, record.uncompressed_size);
    write_u16(buf, record.file_name.len() as u16);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, 0o644 << 16);
    write_u32(buf, record.local_header_offset);
    buf.extend_from_slice(&record.file_name);
}

fn write_end_of_central_directory(buf: &mut Vec<u8>, entry_count: usize, central_size: u32, central_offset: u32) {
    write_u32(buf, 0x06054b50);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, entry_count as u16);
    write_u16(buf, entry_count as u16);
    write_u32(buf, central_size);
    write_u32(buf, central_offset);
    write_u16(buf, 0);
}

fn deflate_bytes(data: &[u8]) -> ApkResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn normalize_entry_name(name: &str) -> ApkResult<String> {
    let mut components = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(ApkError::InvalidInput(
                    "entry paths may not contain parent components".to_string(),
                ))
            }
            _ => components.push(part),
        }
    }
    if components.is_empty() {
        return Err(ApkError::InvalidInput("entry name must not be empty".to_string()));
    }
    Ok(components.join("/"))
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn alignment_padding(offset: u32, name_len: usize, alignment: u32) -> u32 {
    let base = offset as u64 + 30 + name_len as u64;
    let align = alignment as u64;
    ((align - (base % align)) % align) as u32
}

fn should_store_uncompressed(name: &str) -> bool {
    if name == "resources.arsc" {
        return true;
    }
    name.ends_with(".arsc")
        || name.ends_with(".so")
        || matches!(
            name.rsplit('.').next(),
            Some(ext)
                if matches!(
                    ext,
                    "png" | "jpg" | "jpeg" | "gif" | "webp" | "mp3" | "ogg" | "wav" | "mp4" | "webm"
                )
        )
}

//! Content Analyzer.
//!
//! Produces the `type_metadata` map stored with each catalog entry. Each content family with
//! something worth reporting has a [`MetadataExtractor`]:
//!
//! - [`DiskImageExtractor`]: ISO 9660/UDF descriptors, MBR/GPT tables, filesystem superblocks,
//!   UDIF trailers
//! - [`VirtualMachineExtractor`]: OVF envelopes (bare or inside an OVA) and VirtualBox machine
//!   files
//! - [`VirtualDiskExtractor`]: format name, compatible hypervisors, header signature
//!
//! Analysis is best effort. [`ContentAnalyzer::analyze`] never fails; an extractor error is
//! logged and recorded under `analysis_error` instead.

mod disk_image;
mod virtual_disk;
mod virtual_machine;

pub use disk_image::DiskImageExtractor;
pub use virtual_disk::VirtualDiskExtractor;
pub use virtual_machine::VirtualMachineExtractor;

use crate::constants::ANALYSIS_ERROR_KEY;
use crate::policy;
use crate::{LibraryError, LibraryResult};
use libris_types::{Category, StoredName};
use serde_json::Value;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Extractor-specific fields for one file.
pub type TypeMetadata = serde_json::Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unrecognised {kind}: {reason}")]
    Unrecognised { kind: &'static str, reason: String },
    #[error("invalid descriptor: {0}")]
    Descriptor(String),
}

/// Reads type-specific metadata from a stored file.
pub trait MetadataExtractor: Send + Sync {
    /// Short identifier used in logs.
    fn id(&self) -> &'static str;

    /// Extracts metadata for a file whose lower-cased extension (with dot) is `extension`.
    fn extract(&self, path: &Path, extension: &str) -> Result<TypeMetadata, AnalysisError>;
}

/// Dispatches files to the extractor for their category.
#[derive(Debug, Default, Clone)]
pub struct ContentAnalyzer {
    disk_image: DiskImageExtractor,
    virtual_machine: VirtualMachineExtractor,
    virtual_disk: VirtualDiskExtractor,
}

impl ContentAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    fn extractor_for(&self, category: Category) -> Option<&dyn MetadataExtractor> {
        match category {
            Category::DiskImage => Some(&self.disk_image),
            Category::VirtualMachine => Some(&self.virtual_machine),
            Category::VirtualDisk => Some(&self.virtual_disk),
            _ => None,
        }
    }

    /// Analyses a stored file.
    ///
    /// # Arguments
    ///
    /// * `path` - Location of the file's bytes (the stored file or a staging file)
    /// * `name` - The file's name; only its extension is consulted
    ///
    /// # Returns
    ///
    /// The metadata map, empty for categories without an extractor. Extractor failures are
    /// reported as a map holding only `analysis_error`.
    pub fn analyze(&self, path: &Path, name: &StoredName) -> TypeMetadata {
        let extension = name.normalized_extension().unwrap_or_default();
        let category = policy::category_for_extension(&extension);

        let Some(extractor) = self.extractor_for(category) else {
            return TypeMetadata::new();
        };

        match extractor.extract(path, &extension) {
            Ok(metadata) => {
                if let Some(Value::String(reason)) = metadata.get(ANALYSIS_ERROR_KEY) {
                    tracing::warn!("{} analysis of {} incomplete: {}", extractor.id(), name, reason);
                }
                metadata
            }
            Err(e) => {
                tracing::warn!("{} analysis of {} failed: {}", extractor.id(), name, e);
                error_metadata(&e.to_string())
            }
        }
    }

    /// Computes the SHA-256 hex digest of a file, streamed in fixed-size blocks.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::Hash` if the file cannot be read.
    pub fn content_hash(&self, path: &Path) -> LibraryResult<String> {
        libris_files::sha256_file(path).map_err(LibraryError::Hash)
    }
}

/// A metadata map carrying only an analysis error.
pub fn error_metadata(reason: &str) -> TypeMetadata {
    let mut metadata = TypeMetadata::new();
    metadata.insert(ANALYSIS_ERROR_KEY.into(), Value::String(reason.to_string()));
    metadata
}

/// Upper bound on the buffer reserved up front by [`read_region`]; header fields decide `len`.
const READ_REGION_PREALLOC: usize = 64 * 1024;

/// Reads up to `len` bytes at `offset`; fewer bytes are returned near the end of the file.
pub(crate) fn read_region(file: &mut File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len.min(READ_REGION_PREALLOC));
    file.by_ref().take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

pub(crate) fn u16_le(bytes: &[u8], at: usize) -> Option<u16> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

pub(crate) fn u32_le(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn u64_le(bytes: &[u8], at: usize) -> Option<u64> {
    let slice: [u8; 8] = bytes.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(slice))
}

pub(crate) fn u32_be(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn u64_be(bytes: &[u8], at: usize) -> Option<u64> {
    let slice: [u8; 8] = bytes.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_be_bytes(slice))
}

/// Trims padding (spaces and NULs) from a fixed-width ASCII field.
pub(crate) fn ascii_field(bytes: &[u8]) -> Option<String> {
    let text: String = bytes
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { ' ' })
        .collect();
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

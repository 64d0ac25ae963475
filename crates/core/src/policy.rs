//! Validation Policy.
//!
//! The allow-list below is the single source of truth for which extensions may be stored, the
//! MIME type each is served with, its [`Category`], and how large one file of that type may be.
//!
//! Uploads pass two gates in fixed order:
//!
//! 1. [`ValidationPolicy::check_extension`] as soon as the filename is known, before any
//!    payload byte is written.
//! 2. Size: [`ValidationPolicy::check_declared_length`] against the request's declared length
//!    before the body is parsed, then [`ValidationPolicy::check_payload_length`] as payload
//!    bytes stream in.

use crate::constants::{DEFAULT_MAX_FILE_BYTES, GIB, MIB};
use crate::error::SizeLimit;
use crate::{LibraryError, LibraryResult};
use libris_types::{Category, StoredName};

const DISK_IMAGE_MAX_BYTES: u64 = 16 * GIB;
const VM_ARCHIVE_MAX_BYTES: u64 = 32 * GIB;
const DESCRIPTOR_MAX_BYTES: u64 = 16 * MIB;
const VIRTUAL_DISK_MAX_BYTES: u64 = 32 * GIB;

/// MIME type served for files outside the allow-list (only reachable for drifted files).
pub const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// One row of the allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedType {
    /// Lower-case extension with leading dot
    pub extension: &'static str,
    pub mime_type: &'static str,
    pub category: Category,
    /// Largest accepted payload for this extension
    pub max_bytes: u64,
}

const fn row(extension: &'static str, mime_type: &'static str, category: Category) -> AllowedType {
    AllowedType {
        extension,
        mime_type,
        category,
        max_bytes: DEFAULT_MAX_FILE_BYTES,
    }
}

const fn sized(
    extension: &'static str,
    mime_type: &'static str,
    category: Category,
    max_bytes: u64,
) -> AllowedType {
    AllowedType {
        extension,
        mime_type,
        category,
        max_bytes,
    }
}

/// Every extension the library accepts.
pub static ALLOWED_TYPES: &[AllowedType] = &[
    row(".pdf", "application/pdf", Category::Document),
    row(".doc", "application/msword", Category::Document),
    row(
        ".docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Category::Document,
    ),
    row(".txt", "text/plain", Category::Document),
    row(".rtf", "application/rtf", Category::Document),
    row(".odt", "application/vnd.oasis.opendocument.text", Category::Document),
    row(".json", "application/json", Category::Document),
    row(".xml", "application/xml", Category::Document),
    row(".html", "text/html", Category::Document),
    row(".htm", "text/html", Category::Document),
    row(".js", "application/javascript", Category::Document),
    row(".css", "text/css", Category::Document),
    row(".py", "text/x-python", Category::Document),
    row(".java", "text/x-java-source", Category::Document),
    row(".c", "text/x-c", Category::Document),
    row(".cpp", "text/x-c++", Category::Document),
    row(".md", "text/markdown", Category::Document),
    row(".xls", "application/vnd.ms-excel", Category::Spreadsheet),
    row(
        ".xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Category::Spreadsheet,
    ),
    row(
        ".ods",
        "application/vnd.oasis.opendocument.spreadsheet",
        Category::Spreadsheet,
    ),
    row(".csv", "text/csv", Category::Spreadsheet),
    row(".ppt", "application/vnd.ms-powerpoint", Category::Presentation),
    row(
        ".pptx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        Category::Presentation,
    ),
    row(
        ".odp",
        "application/vnd.oasis.opendocument.presentation",
        Category::Presentation,
    ),
    row(".jpg", "image/jpeg", Category::Image),
    row(".jpeg", "image/jpeg", Category::Image),
    row(".png", "image/png", Category::Image),
    row(".gif", "image/gif", Category::Image),
    row(".bmp", "image/bmp", Category::Image),
    row(".svg", "image/svg+xml", Category::Image),
    row(".webp", "image/webp", Category::Image),
    row(".zip", "application/zip", Category::Archive),
    row(".rar", "application/vnd.rar", Category::Archive),
    row(".7z", "application/x-7z-compressed", Category::Archive),
    row(".tar", "application/x-tar", Category::Archive),
    row(".gz", "application/gzip", Category::Archive),
    sized(
        ".iso",
        "application/x-iso9660-image",
        Category::DiskImage,
        DISK_IMAGE_MAX_BYTES,
    ),
    sized(
        ".img",
        "application/x-raw-disk-image",
        Category::DiskImage,
        DISK_IMAGE_MAX_BYTES,
    ),
    sized(
        ".dmg",
        "application/x-apple-diskimage",
        Category::DiskImage,
        DISK_IMAGE_MAX_BYTES,
    ),
    sized(
        ".ova",
        "application/x-virtualbox-ova",
        Category::VirtualMachine,
        VM_ARCHIVE_MAX_BYTES,
    ),
    sized(
        ".ovf",
        "application/x-virtualbox-ovf",
        Category::VirtualMachine,
        DESCRIPTOR_MAX_BYTES,
    ),
    sized(
        ".vbox",
        "application/x-virtualbox-vbox",
        Category::VirtualMachine,
        DESCRIPTOR_MAX_BYTES,
    ),
    sized(
        ".vmdk",
        "application/x-vmdk",
        Category::VirtualDisk,
        VIRTUAL_DISK_MAX_BYTES,
    ),
    sized(
        ".vdi",
        "application/x-virtualbox-vdi",
        Category::VirtualDisk,
        VIRTUAL_DISK_MAX_BYTES,
    ),
    sized(
        ".vhd",
        "application/x-virtualbox-vhd",
        Category::VirtualDisk,
        VIRTUAL_DISK_MAX_BYTES,
    ),
    sized(
        ".vhdx",
        "application/x-virtualbox-vhdx",
        Category::VirtualDisk,
        VIRTUAL_DISK_MAX_BYTES,
    ),
    sized(
        ".qcow2",
        "application/x-qemu-disk",
        Category::VirtualDisk,
        VIRTUAL_DISK_MAX_BYTES,
    ),
];

/// Finds the allow-list row for an extension, with or without its leading dot, in any case.
pub fn lookup_extension(extension: &str) -> Option<&'static AllowedType> {
    let trimmed = extension.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        return None;
    }
    ALLOWED_TYPES
        .iter()
        .find(|t| t.extension[1..].eq_ignore_ascii_case(trimmed))
}

/// Finds the allow-list row for a stored name's extension.
pub fn lookup(name: &StoredName) -> Option<&'static AllowedType> {
    name.extension().and_then(lookup_extension)
}

/// Category for an extension; anything unknown is a document.
pub fn category_for_extension(extension: &str) -> Category {
    lookup_extension(extension)
        .map(|t| t.category)
        .unwrap_or_default()
}

/// MIME type for an extension, falling back to [`FALLBACK_MIME_TYPE`].
pub fn mime_for_extension(extension: &str) -> &'static str {
    lookup_extension(extension)
        .map(|t| t.mime_type)
        .unwrap_or(FALLBACK_MIME_TYPE)
}

/// The full allow-list, as reported in rejection messages.
pub fn allowed_extensions() -> Vec<String> {
    ALLOWED_TYPES.iter().map(|t| t.extension.to_string()).collect()
}

/// Size and type rules applied to every upload.
#[derive(Debug, Clone, Copy)]
pub struct ValidationPolicy {
    max_request_bytes: u64,
}

impl ValidationPolicy {
    /// Creates a policy with the given global ceiling.
    pub fn new(max_request_bytes: u64) -> Self {
        Self { max_request_bytes }
    }

    pub fn max_request_bytes(&self) -> u64 {
        self.max_request_bytes
    }

    /// Checks the request's declared length against the global ceiling.
    ///
    /// An undeclared length (chunked transfer) passes; the per-extension ceiling still bounds
    /// the payload as it streams.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::PayloadTooLarge` with [`SizeLimit::Request`].
    pub fn check_declared_length(&self, declared: Option<u64>) -> LibraryResult<()> {
        match declared {
            Some(len) if len > self.max_request_bytes => Err(LibraryError::PayloadTooLarge {
                limit: self.max_request_bytes,
                scope: SizeLimit::Request,
            }),
            _ => Ok(()),
        }
    }

    /// Checks a filename's extension against the allow-list.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::ExtensionRejected` listing the whole allow-list.
    pub fn check_extension(&self, name: &StoredName) -> LibraryResult<&'static AllowedType> {
        lookup(name).ok_or_else(|| LibraryError::ExtensionRejected {
            extension: name
                .normalized_extension()
                .unwrap_or_else(|| "(none)".to_string()),
            allowed: allowed_extensions(),
        })
    }

    /// Effective ceiling for one file of this type.
    pub fn limit_for(&self, allowed: &AllowedType) -> u64 {
        allowed.max_bytes.min(self.max_request_bytes)
    }

    /// Checks a payload length (so far, or final) against the type's ceiling.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::PayloadTooLarge` with [`SizeLimit::Extension`].
    pub fn check_payload_length(&self, allowed: &AllowedType, len: u64) -> LibraryResult<()> {
        let limit = self.limit_for(allowed);
        if len > limit {
            return Err(LibraryError::PayloadTooLarge {
                limit,
                scope: SizeLimit::Extension(allowed.extension.to_string()),
            });
        }
        Ok(())
    }
}

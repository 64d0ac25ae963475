//! Libris File Storage
//!
//! This crate owns the storage directory of a Libris library: every uploaded file lives
//! there under its (possibly deduplicated) name, and nothing else in the workspace touches
//! that directory directly.
//!
//! ## Design Principles
//!
//! - File names are validated [`StoredName`]s, so joins never escape the directory
//! - Upload bytes land in a hidden staging file first and only become visible once placed
//! - Placement never overwrites: a taken name is deduplicated as `base_1.ext`, `base_2.ext`, …
//! - Content hashes are streamed in fixed-size blocks so memory use is independent of size
//!
//! ## Layout
//!
//! ```text
//! <storage_dir>/
//! ├── report.pdf
//! ├── report_1.pdf
//! ├── ubuntu.iso
//! └── .upload-Xk2f9a   # staging file, removed or renamed when the upload settles
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use libris_files::FilesService;
//! use libris_types::StoredName;
//! use std::io::Write;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = FilesService::create(Path::new("library_data/uploads"))?;
//!
//! let mut staged = service.stage()?;
//! staged.write_all(b"hello")?;
//! let placement = service.place(staged, &StoredName::parse("hello.txt")?)?;
//! println!("stored as {}", placement.name);
//! # Ok(())
//! # }
//! ```

mod constants;
mod files;
mod hashing;

pub use constants::{HASH_ALGORITHM, HASH_BLOCK_SIZE, MAX_DEDUP_ATTEMPTS, STAGING_PREFIX};
pub use files::{DirectoryScan, FileStat, FilesService, Placement, StagedFile};
pub use hashing::{sha256_bytes, sha256_file, sniff_media_type};
pub use libris_types::StoredName;

/// Errors that can occur during file operations
#[derive(Debug, thiserror::Error)]
pub enum FilesError {
    /// Root directory does not exist or is not a directory
    #[error("Invalid storage directory: {0}")]
    InvalidRootDirectory(String),

    /// A name could not be used inside the storage directory
    #[error("Invalid name: {0}")]
    InvalidName(#[from] libris_types::NameError),

    /// No stored file carries the requested name
    #[error("File not found: {0}")]
    NotFound(String),

    /// Every deduplicated variant of a name was already taken
    #[error("No free name left for {0}")]
    NamesExhausted(String),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

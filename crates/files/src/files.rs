//! Storage directory service implementation
//!
//! This module provides the [`FilesService`] type, the single owner of a library's storage
//! directory. It stages incoming bytes, places them under a collision-free name, and serves
//! stat/open/remove/scan requests for stored files.
//!
//! # Staging and Placement
//!
//! Uploads are written to a hidden staging file (see [`STAGING_PREFIX`]) inside the storage
//! directory. Because the staging file lives on the same filesystem, placement is a rename:
//!
//! 1. Try the requested name.
//! 2. If taken, try `base_1.ext`, `base_2.ext`, … in order.
//! 3. Each attempt is a no-clobber rename, so two concurrent uploads can never both win the
//!    same name even if they checked for it at the same moment.
//!
//! A staging file that is dropped without being placed is deleted.
//!
//! # Security Model
//!
//! - The root is canonicalised at construction time
//! - Every name passes through [`StoredName`], which rejects separators and `..`
//! - Staging files start with `.` and are therefore unreachable through [`StoredName`]

use crate::constants::{MAX_DEDUP_ATTEMPTS, STAGING_PREFIX};
use crate::hashing::sha256_file;
use crate::FilesError;
use chrono::{DateTime, Utc};
use libris_types::StoredName;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Filesystem facts about a stored file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileStat {
    /// Size of the file in bytes
    pub size_bytes: u64,

    /// Creation time, when the platform reports one
    pub created_at: Option<DateTime<Utc>>,

    /// Last modification time, when the platform reports one
    pub modified_at: Option<DateTime<Utc>>,
}

/// Outcome of placing a staged upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Name the file was stored under
    pub name: StoredName,

    /// Whether `name` differs from the requested name
    pub renamed: bool,
}

/// Result of scanning the storage directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirectoryScan {
    /// Regular files with valid stored names, sorted
    pub stored: Vec<StoredName>,

    /// Entries that are not addressable as stored files (staging files, hidden files,
    /// directories, names that fail validation)
    pub ignored: Vec<String>,
}

/// An upload in progress, backed by a hidden file in the storage directory.
///
/// Implements [`Write`]; dropping it without calling [`FilesService::place`] deletes the
/// staged bytes.
#[derive(Debug)]
pub struct StagedFile {
    inner: NamedTempFile,
    bytes_written: u64,
}

impl StagedFile {
    /// Number of bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Path of the staging file.
    pub fn path(&self) -> &Path {
        self.inner.path()
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.bytes_written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Service for managing the files of one library
///
/// # Design
///
/// - Directory-scoped: each instance is bound to one storage directory
/// - Non-destructive: placement never replaces an existing file
/// - Validated: every name is a `StoredName` before it touches the filesystem
#[derive(Debug, Clone)]
pub struct FilesService {
    /// Canonicalised storage directory
    root_directory: PathBuf,
}

impl FilesService {
    /// Creates a new `FilesService` over an existing directory
    ///
    /// # Arguments
    ///
    /// * `root_directory` - The storage directory
    ///
    /// # Errors
    ///
    /// Returns `FilesError::InvalidRootDirectory` if:
    /// - The directory does not exist or is not a directory
    /// - Path canonicalisation fails
    pub fn new(root_directory: &Path) -> Result<Self, FilesError> {
        if !root_directory.exists() {
            return Err(FilesError::InvalidRootDirectory(format!(
                "Directory does not exist: {}",
                root_directory.display()
            )));
        }

        if !root_directory.is_dir() {
            return Err(FilesError::InvalidRootDirectory(format!(
                "Path is not a directory: {}",
                root_directory.display()
            )));
        }

        let root_directory = root_directory.canonicalize().map_err(|e| {
            FilesError::InvalidRootDirectory(format!(
                "Cannot canonicalize path {}: {}",
                root_directory.display(),
                e
            ))
        })?;

        Ok(Self { root_directory })
    }

    /// Creates the storage directory if needed, then behaves like [`FilesService::new`].
    ///
    /// # Errors
    ///
    /// Returns `FilesError::Io` if the directory cannot be created, or any error from
    /// [`FilesService::new`].
    pub fn create(root_directory: &Path) -> Result<Self, FilesError> {
        fs::create_dir_all(root_directory)?;
        Self::new(root_directory)
    }

    /// Returns the canonicalised storage directory
    #[must_use]
    pub fn root_directory(&self) -> &Path {
        &self.root_directory
    }

    /// Returns the absolute path a stored name maps to
    #[must_use]
    pub fn path_for(&self, name: &StoredName) -> PathBuf {
        self.root_directory.join(name.as_str())
    }

    /// Returns whether a regular file with this name exists
    pub fn exists(&self, name: &StoredName) -> bool {
        self.path_for(name).is_file()
    }

    /// Opens a new staging file for an incoming upload
    ///
    /// # Errors
    ///
    /// Returns `FilesError::Io` if the staging file cannot be created.
    pub fn stage(&self) -> Result<StagedFile, FilesError> {
        let inner = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(&self.root_directory)?;
        Ok(StagedFile {
            inner,
            bytes_written: 0,
        })
    }

    /// Moves a staged upload to its final, collision-free name
    ///
    /// The requested name is tried first, then `base_1.ext`, `base_2.ext`, … until a name is
    /// free. Each attempt is an atomic no-clobber rename.
    ///
    /// # Arguments
    ///
    /// * `staged` - The staged upload, fully written
    /// * `requested` - The validated name supplied by the client
    ///
    /// # Errors
    ///
    /// Returns `FilesError` if:
    /// - Flushing or renaming the staging file fails (I/O)
    /// - A suffixed name becomes invalid (too long)
    /// - [`MAX_DEDUP_ATTEMPTS`] candidates are all taken
    pub fn place(&self, staged: StagedFile, requested: &StoredName) -> Result<Placement, FilesError> {
        let mut temp = staged.inner;
        temp.as_file().sync_all()?;

        for attempt in 0..MAX_DEDUP_ATTEMPTS {
            let candidate = if attempt == 0 {
                requested.clone()
            } else {
                requested.with_suffix(attempt)?
            };
            let target = self.path_for(&candidate);
            if target.exists() {
                continue;
            }

            match temp.persist_noclobber(&target) {
                Ok(_) => {
                    return Ok(Placement {
                        renamed: attempt > 0,
                        name: candidate,
                    })
                }
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    // Lost a race for this name; keep the staged file and move on.
                    temp = e.file;
                }
                Err(e) => return Err(FilesError::Io(e.error)),
            }
        }

        Err(FilesError::NamesExhausted(requested.to_string()))
    }

    /// Returns size and timestamps of a stored file
    ///
    /// # Errors
    ///
    /// Returns `FilesError::NotFound` if no regular file carries the name, or
    /// `FilesError::Io` if the metadata cannot be read.
    pub fn stat(&self, name: &StoredName) -> Result<FileStat, FilesError> {
        let path = self.existing_path(name)?;
        let metadata = fs::metadata(&path)?;

        Ok(FileStat {
            size_bytes: metadata.len(),
            created_at: metadata.created().ok().map(DateTime::<Utc>::from),
            modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    /// Computes the SHA-256 content hash of a stored file
    ///
    /// # Errors
    ///
    /// Returns `FilesError::NotFound` if the file is missing, or `FilesError::Io` on read
    /// failure.
    pub fn hash(&self, name: &StoredName) -> Result<String, FilesError> {
        let path = self.existing_path(name)?;
        Ok(sha256_file(&path)?)
    }

    /// Reads a stored file into memory
    ///
    /// Intended for small files and tests; downloads stream from [`FilesService::path_for`].
    ///
    /// # Errors
    ///
    /// Returns `FilesError::NotFound` if the file is missing, or `FilesError::Io` on read
    /// failure.
    pub fn read(&self, name: &StoredName) -> Result<Vec<u8>, FilesError> {
        let path = self.existing_path(name)?;
        Ok(fs::read(&path)?)
    }

    /// Deletes a stored file
    ///
    /// # Errors
    ///
    /// Returns `FilesError::NotFound` if the file is missing, or `FilesError::Io` if removal
    /// fails.
    pub fn remove(&self, name: &StoredName) -> Result<(), FilesError> {
        let path = self.existing_path(name)?;
        fs::remove_file(&path)?;
        tracing::info!("removed stored file {}", name);
        Ok(())
    }

    /// Lists the storage directory
    ///
    /// # Errors
    ///
    /// Returns `FilesError::Io` if the directory cannot be read.
    pub fn scan(&self) -> Result<DirectoryScan, FilesError> {
        let mut scan = DirectoryScan::default();

        for entry in fs::read_dir(&self.root_directory)? {
            let entry = entry?;
            let raw = entry.file_name().to_string_lossy().into_owned();

            if !entry.file_type()?.is_file() {
                scan.ignored.push(raw);
                continue;
            }

            match StoredName::parse(&raw) {
                Ok(name) if name.as_str() == raw => scan.stored.push(name),
                _ => scan.ignored.push(raw),
            }
        }

        scan.stored.sort();
        scan.ignored.sort();
        Ok(scan)
    }

    fn existing_path(&self, name: &StoredName) -> Result<PathBuf, FilesError> {
        let path = self.path_for(name);
        if !path.is_file() {
            return Err(FilesError::NotFound(name.to_string()));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::sha256_bytes;
    use tempfile::TempDir;

    fn service(temp: &TempDir) -> FilesService {
        FilesService::create(&temp.path().join("uploads")).unwrap()
    }

    fn stage_bytes(service: &FilesService, bytes: &[u8]) -> StagedFile {
        let mut staged = service.stage().unwrap();
        staged.write_all(bytes).unwrap();
        staged
    }

    fn name(raw: &str) -> StoredName {
        StoredName::parse(raw).unwrap()
    }

    #[test]
    fn test_files_service_root_not_exists() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("non-existent");

        let service = FilesService::new(&root);

        assert!(matches!(service, Err(FilesError::InvalidRootDirectory(_))));
    }

    #[test]
    fn test_files_service_root_not_directory() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("file.txt");
        fs::write(&root, "not a directory").unwrap();

        let service = FilesService::new(&root);

        assert!(matches!(service, Err(FilesError::InvalidRootDirectory(_))));
    }

    #[test]
    fn test_create_makes_directory() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("a").join("b");

        let service = FilesService::create(&root).unwrap();

        assert!(service.root_directory().is_dir());
        assert!(service.root_directory().is_absolute());
    }

    #[test]
    fn test_place_keeps_requested_name() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);

        let staged = stage_bytes(&service, b"Hello");
        assert_eq!(staged.bytes_written(), 5);

        let placement = service.place(staged, &name("a.txt")).unwrap();

        assert_eq!(placement.name.as_str(), "a.txt");
        assert!(!placement.renamed);
        assert_eq!(service.read(&placement.name).unwrap(), b"Hello");
    }

    #[test]
    fn test_place_deduplicates_in_order() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);

        let first = service
            .place(stage_bytes(&service, b"one"), &name("a.txt"))
            .unwrap();
        let second = service
            .place(stage_bytes(&service, b"two"), &name("a.txt"))
            .unwrap();
        let third = service
            .place(stage_bytes(&service, b"three"), &name("a.txt"))
            .unwrap();

        assert_eq!(first.name.as_str(), "a.txt");
        assert_eq!(second.name.as_str(), "a_1.txt");
        assert!(second.renamed);
        assert_eq!(third.name.as_str(), "a_2.txt");

        // Nothing was overwritten
        assert_eq!(service.read(&name("a.txt")).unwrap(), b"one");
        assert_eq!(service.read(&name("a_1.txt")).unwrap(), b"two");
    }

    #[test]
    fn test_place_skips_gaps_already_taken() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);
        fs::write(service.root_directory().join("a.txt"), b"x").unwrap();
        fs::write(service.root_directory().join("a_1.txt"), b"x").unwrap();

        let placement = service
            .place(stage_bytes(&service, b"new"), &name("a.txt"))
            .unwrap();

        assert_eq!(placement.name.as_str(), "a_2.txt");
    }

    #[test]
    fn test_dropped_stage_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);

        let staged = stage_bytes(&service, b"partial");
        let staged_path = staged.path().to_path_buf();
        assert!(staged_path.exists());
        drop(staged);

        assert!(!staged_path.exists());
        assert!(service.scan().unwrap().stored.is_empty());
    }

    #[test]
    fn test_stat_and_hash() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);
        let placement = service
            .place(stage_bytes(&service, b"abc"), &name("abc.txt"))
            .unwrap();

        let stat = service.stat(&placement.name).unwrap();
        assert_eq!(stat.size_bytes, 3);
        assert!(stat.modified_at.is_some());

        assert_eq!(service.hash(&placement.name).unwrap(), sha256_bytes(b"abc"));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);

        assert!(matches!(
            service.stat(&name("ghost.pdf")),
            Err(FilesError::NotFound(_))
        ));
        assert!(matches!(
            service.remove(&name("ghost.pdf")),
            Err(FilesError::NotFound(_))
        ));
        assert!(!service.exists(&name("ghost.pdf")));
    }

    #[test]
    fn test_remove_deletes_file() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);
        let placement = service
            .place(stage_bytes(&service, b"bye"), &name("bye.txt"))
            .unwrap();

        service.remove(&placement.name).unwrap();

        assert!(!service.exists(&placement.name));
    }

    #[test]
    fn test_scan_separates_ignored_entries() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);
        let root = service.root_directory().to_path_buf();
        fs::write(root.join("b.pdf"), b"x").unwrap();
        fs::write(root.join("a.txt"), b"x").unwrap();
        fs::write(root.join(".hidden"), b"x").unwrap();
        fs::create_dir(root.join("nested")).unwrap();
        let _staged = service.stage().unwrap();

        let scan = service.scan().unwrap();

        assert_eq!(scan.stored, vec![name("a.txt"), name("b.pdf")]);
        assert!(scan.ignored.contains(&".hidden".to_string()));
        assert!(scan.ignored.contains(&"nested".to_string()));
        assert!(scan.ignored.iter().any(|n| n.starts_with(STAGING_PREFIX)));
    }

    #[test]
    fn test_binary_roundtrip() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);
        let binary_data: Vec<u8> = (0..=255).collect();

        let placement = service
            .place(stage_bytes(&service, &binary_data), &name("binary.img"))
            .unwrap();

        assert_eq!(service.read(&placement.name).unwrap(), binary_data);
    }
}

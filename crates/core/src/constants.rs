//! Constants used throughout the Libris core crate.
//!
//! Directory names, file names and size thresholds live here so the server, the CLI and the
//! tests agree on them.

/// Default base directory for library data when no explicit directory is configured.
pub const DEFAULT_DATA_DIR: &str = "library_data";

/// Directory name, under the data directory, holding stored files.
pub const UPLOADS_DIR_NAME: &str = "uploads";

/// Filename of the catalog, under the data directory.
pub const CATALOG_FILENAME: &str = "catalog.json";

/// Default global ceiling on a single upload request (50 GiB).
pub const DEFAULT_MAX_REQUEST_BYTES: u64 = 50 * GIB;

/// Ceiling for extensions without their own limit (512 MiB).
pub const DEFAULT_MAX_FILE_BYTES: u64 = 512 * MIB;

/// Files larger than this receive a cache-control hint on download (100 MiB).
pub const LARGE_FILE_THRESHOLD: u64 = 100 * MIB;

/// Cache-control value sent for large downloads.
pub const LARGE_FILE_CACHE_CONTROL: &str = "private, max-age=3600";

/// Chunk size used when streaming downloads.
pub const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Label given to freshly ingested files.
pub const DEFAULT_LABEL: &str = "uncategorized";

/// Key under which best-effort analysis failures are reported in type metadata.
pub const ANALYSIS_ERROR_KEY: &str = "analysis_error";

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

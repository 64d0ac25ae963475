/// Prefix of staging files inside the storage directory.
pub const STAGING_PREFIX: &str = ".upload-";

/// Block size used when streaming a file through the hasher.
pub const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// Algorithm name recorded next to every content hash.
pub const HASH_ALGORITHM: &str = "sha256";

/// Upper bound on `base_N.ext` candidates tried before giving up.
pub const MAX_DEDUP_ATTEMPTS: u32 = 10_000;

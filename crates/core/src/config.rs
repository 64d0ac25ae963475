//! Core runtime configuration.
//!
//! This module defines configuration that should be resolved once at process startup and then
//! passed into core services. The intent is to avoid reading process-wide environment variables
//! during request handling, which can lead to inconsistent behaviour in multi-threaded runtimes
//! and test harnesses.
//!
//! Binaries resolve configuration with [`CoreConfig::from_lookup`], handing it a closure over
//! `std::env::var`; tests hand it a closure over a fixed map instead.

use crate::constants::{CATALOG_FILENAME, DEFAULT_DATA_DIR, DEFAULT_MAX_REQUEST_BYTES, UPLOADS_DIR_NAME};
use crate::{LibraryError, LibraryResult};
use std::path::{Path, PathBuf};

/// Environment variable naming the base data directory.
pub const ENV_DATA_DIR: &str = "LIBRIS_DATA_DIR";
/// Environment variable overriding the storage directory.
pub const ENV_UPLOAD_DIR: &str = "LIBRIS_UPLOAD_DIR";
/// Environment variable overriding the catalog path.
pub const ENV_CATALOG_PATH: &str = "LIBRIS_CATALOG_PATH";
/// Environment variable overriding the global upload ceiling, in bytes.
pub const ENV_MAX_UPLOAD_BYTES: &str = "LIBRIS_MAX_UPLOAD_BYTES";
/// Environment variable toggling startup reconciliation.
pub const ENV_RECONCILE_ON_STARTUP: &str = "LIBRIS_RECONCILE_ON_STARTUP";

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    data_dir: PathBuf,
    storage_dir: PathBuf,
    catalog_path: PathBuf,
    max_request_bytes: u64,
    reconcile_on_startup: bool,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// `storage_dir` and `catalog_path` default to `<data_dir>/uploads` and
    /// `<data_dir>/catalog.json`.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::InvalidInput` if `max_request_bytes` is zero or the catalog path
    /// lies inside the storage directory (it would be picked up as a stored file).
    pub fn new(
        data_dir: PathBuf,
        storage_dir: Option<PathBuf>,
        catalog_path: Option<PathBuf>,
        max_request_bytes: u64,
        reconcile_on_startup: bool,
    ) -> LibraryResult<Self> {
        if max_request_bytes == 0 {
            return Err(LibraryError::InvalidInput(
                "max upload size must be greater than zero".into(),
            ));
        }

        let storage_dir = storage_dir.unwrap_or_else(|| data_dir.join(UPLOADS_DIR_NAME));
        let catalog_path = catalog_path.unwrap_or_else(|| data_dir.join(CATALOG_FILENAME));

        if catalog_path.parent() == Some(storage_dir.as_path()) {
            return Err(LibraryError::InvalidInput(
                "catalog file must not live inside the storage directory".into(),
            ));
        }

        Ok(Self {
            data_dir,
            storage_dir,
            catalog_path,
            max_request_bytes,
            reconcile_on_startup,
        })
    }

    /// Resolve configuration from a key lookup (normally the process environment).
    ///
    /// Missing or empty values fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::InvalidInput` if a numeric or boolean value cannot be parsed, or
    /// any error from [`CoreConfig::new`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LibraryResult<Self> {
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let data_dir = value(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let storage_dir = value(ENV_UPLOAD_DIR).map(PathBuf::from);
        let catalog_path = value(ENV_CATALOG_PATH).map(PathBuf::from);
        let max_request_bytes = byte_limit_from_env_value(value(ENV_MAX_UPLOAD_BYTES))?
            .unwrap_or(DEFAULT_MAX_REQUEST_BYTES);
        let reconcile_on_startup = flag_from_env_value(value(ENV_RECONCILE_ON_STARTUP), true)?;

        Self::new(
            data_dir,
            storage_dir,
            catalog_path,
            max_request_bytes,
            reconcile_on_startup,
        )
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn catalog_path(&self) -> &Path {
        &self.catalog_path
    }

    pub fn max_request_bytes(&self) -> u64 {
        self.max_request_bytes
    }

    pub fn reconcile_on_startup(&self) -> bool {
        self.reconcile_on_startup
    }
}

/// Parse an optional byte count.
///
/// Plain integers are bytes; `K`, `M`, `G` and `T` suffixes (optionally followed by `B` or
/// `iB`) are binary multiples.
pub fn byte_limit_from_env_value(value: Option<String>) -> LibraryResult<Option<u64>> {
    let Some(raw) = value else {
        return Ok(None);
    };

    let upper = raw.trim().to_ascii_uppercase();
    let unit_start = upper
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(upper.len());
    let (digits, unit) = upper.split_at(unit_start);

    let number: u64 = digits
        .parse()
        .map_err(|_| LibraryError::InvalidInput(format!("invalid byte size: {raw}")))?;
    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        "T" | "TB" | "TIB" => 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(LibraryError::InvalidInput(format!(
                "invalid byte size unit: {raw}"
            )))
        }
    };

    number
        .checked_mul(multiplier)
        .map(Some)
        .ok_or_else(|| LibraryError::InvalidInput(format!("byte size overflows: {raw}")))
}

/// Parse an optional boolean flag, returning `default` when absent.
pub fn flag_from_env_value(value: Option<String>, default: bool) -> LibraryResult<bool> {
    let Some(raw) = value else {
        return Ok(default);
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(LibraryError::InvalidInput(format!("invalid boolean: {raw}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = CoreConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(cfg.data_dir(), Path::new(DEFAULT_DATA_DIR));
        assert_eq!(cfg.storage_dir(), Path::new("library_data/uploads"));
        assert_eq!(cfg.catalog_path(), Path::new("library_data/catalog.json"));
        assert_eq!(cfg.max_request_bytes(), DEFAULT_MAX_REQUEST_BYTES);
        assert!(cfg.reconcile_on_startup());
    }

    #[test]
    fn test_overrides() {
        let cfg = CoreConfig::from_lookup(lookup(&[
            (ENV_DATA_DIR, "/srv/libris"),
            (ENV_UPLOAD_DIR, "/mnt/big"),
            (ENV_MAX_UPLOAD_BYTES, "2G"),
            (ENV_RECONCILE_ON_STARTUP, "off"),
        ]))
        .unwrap();

        assert_eq!(cfg.storage_dir(), Path::new("/mnt/big"));
        assert_eq!(cfg.catalog_path(), Path::new("/srv/libris/catalog.json"));
        assert_eq!(cfg.max_request_bytes(), 2 * 1024 * 1024 * 1024);
        assert!(!cfg.reconcile_on_startup());
    }

    #[test]
    fn test_blank_values_fall_back() {
        let cfg = CoreConfig::from_lookup(lookup(&[(ENV_DATA_DIR, "   ")])).unwrap();
        assert_eq!(cfg.data_dir(), Path::new(DEFAULT_DATA_DIR));
    }

    #[test]
    fn test_catalog_inside_storage_rejected() {
        let result = CoreConfig::new(
            PathBuf::from("data"),
            Some(PathBuf::from("data/uploads")),
            Some(PathBuf::from("data/uploads/catalog.json")),
            1024,
            true,
        );
        assert!(matches!(result, Err(LibraryError::InvalidInput(_))));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let result = CoreConfig::new(PathBuf::from("data"), None, None, 0, true);
        assert!(matches!(result, Err(LibraryError::InvalidInput(_))));
    }

    #[test]
    fn test_byte_limit_parsing() {
        assert_eq!(byte_limit_from_env_value(None).unwrap(), None);
        assert_eq!(
            byte_limit_from_env_value(Some("1024".into())).unwrap(),
            Some(1024)
        );
        assert_eq!(
            byte_limit_from_env_value(Some("16MiB".into())).unwrap(),
            Some(16 * 1024 * 1024)
        );
        assert_eq!(
            byte_limit_from_env_value(Some("3 kb".into())).unwrap(),
            Some(3 * 1024)
        );
        assert!(byte_limit_from_env_value(Some("lots".into())).is_err());
        assert!(byte_limit_from_env_value(Some("5X".into())).is_err());
        assert!(byte_limit_from_env_value(Some("99999999999T".into())).is_err());
    }

    #[test]
    fn test_flag_parsing() {
        assert!(flag_from_env_value(None, true).unwrap());
        assert!(!flag_from_env_value(Some("No".into()), true).unwrap());
        assert!(flag_from_env_value(Some("1".into()), false).unwrap());
        assert!(flag_from_env_value(Some("maybe".into()), false).is_err());
    }
}

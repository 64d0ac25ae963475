//! Catalog Store.
//!
//! The catalog is a single JSON array, one [`CatalogEntry`] per stored file. [`CatalogStore`]
//! is the only code that reads or writes it.
//!
//! ## Writes
//!
//! Every change goes through [`CatalogStore::mutate`], which holds the store's mutex across the
//! whole load → change → save sequence. Saves write a sibling temp file and rename it over the
//! catalog, so a reader never observes a half-written array.
//!
//! ## Legacy catalogs
//!
//! Entries written by the earlier deployment used different field names (`nombre`, `tipo`,
//! `categoria`, `scroll`, `tamaño`, `fecha`) and stored the upload time as epoch seconds.
//! Those names are accepted as aliases when reading; saves always use the current names.
//! Entries are read one at a time. A null or mistyped field falls back to its default, and an
//! entry without a name is skipped with a warning.

use crate::analysis::TypeMetadata;
use crate::constants::DEFAULT_LABEL;
use crate::policy::AllowedType;
use crate::{LibraryError, LibraryResult};
use chrono::{DateTime, TimeZone, Utc};
use libris_files::HASH_ALGORITHM;
use libris_types::{Category, StoredName};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Metadata record for one stored file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Filename on disk, unique across the catalog
    ///
    /// Kept as a plain string so a legacy entry with an odd name does not make the whole
    /// catalog unreadable; use [`CatalogEntry::stored_name`] before touching the filesystem.
    #[serde(alias = "nombre")]
    pub name: String,

    #[serde(default, alias = "tipo", deserialize_with = "deserialize_category")]
    pub category: Category,

    /// Lower-cased extension with its leading dot
    #[serde(default, deserialize_with = "deserialize_text")]
    pub extension: String,

    #[serde(default, deserialize_with = "deserialize_text")]
    pub mime_type: String,

    /// User-assigned free text
    #[serde(
        default = "default_label",
        alias = "categoria",
        deserialize_with = "deserialize_label"
    )]
    pub label: String,

    #[serde(
        default,
        alias = "scroll",
        deserialize_with = "deserialize_lenient_integer"
    )]
    pub scroll_position: i64,

    #[serde(default, alias = "tamaño", deserialize_with = "deserialize_size")]
    pub size_bytes: u64,

    #[serde(
        default = "epoch",
        alias = "fecha",
        deserialize_with = "deserialize_timestamp"
    )]
    pub upload_timestamp: DateTime<Utc>,

    /// Hex SHA-256 of the stored bytes; absent on entries carried over from legacy catalogs
    #[serde(default, deserialize_with = "deserialize_optional_text")]
    pub content_hash: Option<String>,

    #[serde(
        default = "default_hash_algorithm",
        deserialize_with = "deserialize_hash_algorithm"
    )]
    pub hash_algorithm: String,

    #[serde(default, deserialize_with = "deserialize_type_metadata")]
    pub type_metadata: TypeMetadata,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_timestamp"
    )]
    pub last_modified_timestamp: Option<DateTime<Utc>>,

    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "deserialize_tags"
    )]
    pub tags: Vec<String>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_text"
    )]
    pub description: Option<String>,
}

impl CatalogEntry {
    /// Builds the entry for a freshly stored file.
    ///
    /// # Arguments
    ///
    /// * `name` - Final (post-dedup) stored name
    /// * `allowed` - Policy row for the file's extension; supplies category and MIME type
    /// * `size_bytes` - Bytes written to disk
    /// * `content_hash` - Hex SHA-256 of those bytes
    /// * `type_metadata` - Output of the content analyzer
    pub fn new(
        name: &StoredName,
        allowed: &AllowedType,
        size_bytes: u64,
        content_hash: String,
        type_metadata: TypeMetadata,
    ) -> Self {
        Self {
            name: name.to_string(),
            category: allowed.category,
            extension: allowed.extension.to_string(),
            mime_type: allowed.mime_type.to_string(),
            label: default_label(),
            scroll_position: 0,
            size_bytes,
            upload_timestamp: Utc::now(),
            content_hash: Some(content_hash),
            hash_algorithm: default_hash_algorithm(),
            type_metadata,
            last_modified_timestamp: None,
            tags: Vec::new(),
            description: None,
        }
    }

    /// Validates the entry's name as a stored name.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::InvalidPath` if the recorded name could escape the storage
    /// directory.
    pub fn stored_name(&self) -> LibraryResult<StoredName> {
        Ok(StoredName::parse(&self.name)?)
    }
}

fn default_label() -> String {
    DEFAULT_LABEL.to_string()
}

fn default_hash_algorithm() -> String {
    HASH_ALGORITHM.to_string()
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// Timestamps appear either as RFC 3339 strings or, in legacy catalogs, as epoch seconds.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Text(String),
    Seconds(f64),
}

impl RawTimestamp {
    fn into_datetime(self) -> Option<DateTime<Utc>> {
        match self {
            RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(text.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            RawTimestamp::Seconds(seconds) if seconds.is_finite() => {
                let whole = seconds.trunc() as i64;
                let nanos = ((seconds - seconds.trunc()) * 1e9)
                    .round()
                    .clamp(0.0, 999_999_999.0) as u32;
                Utc.timestamp_opt(whole, nanos).single()
            }
            RawTimestamp::Seconds(_) => None,
        }
    }
}

// Field readers below never fail: a null or mistyped value reads as the field's default.

fn timestamp_value(value: Value) -> Option<DateTime<Utc>> {
    RawTimestamp::deserialize(value)
        .ok()
        .and_then(RawTimestamp::into_datetime)
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(timestamp_value(Value::deserialize(deserializer)?).unwrap_or_else(epoch))
}

fn deserialize_optional_timestamp<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(timestamp_value(Value::deserialize(deserializer)?))
}

/// Strings are kept, numbers are rendered as text, anything else is absent.
fn text_value(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn deserialize_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(text_value(Value::deserialize(deserializer)?).unwrap_or_default())
}

fn deserialize_optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(text_value(Value::deserialize(deserializer)?))
}

fn deserialize_label<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(text_value(Value::deserialize(deserializer)?).unwrap_or_else(default_label))
}

fn deserialize_hash_algorithm<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(text_value(Value::deserialize(deserializer)?).unwrap_or_else(default_hash_algorithm))
}

fn deserialize_category<'de, D>(deserializer: D) -> Result<Category, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(tag) => Category::from_tag(&tag).unwrap_or_default(),
        _ => Category::default(),
    })
}

fn deserialize_type_metadata<'de, D>(deserializer: D) -> Result<TypeMetadata, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(map) => map,
        _ => TypeMetadata::new(),
    })
}

/// Tags are an array of strings or one comma-separated string.
fn deserialize_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let tags = match Value::deserialize(deserializer)? {
        Value::Array(items) => items.into_iter().filter_map(text_value).collect(),
        Value::String(joined) => joined.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    };
    Ok(tags
        .into_iter()
        .map(|tag: String| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect())
}

/// Integers that may have been written as floats or numeric strings.
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum LenientInteger {
    Int(i64),
    Float(f64),
    Text(String),
}

impl LenientInteger {
    pub(crate) fn into_i64(self) -> Option<i64> {
        match self {
            LenientInteger::Int(value) => Some(value),
            LenientInteger::Float(value) if value.is_finite() => Some(value.trunc() as i64),
            LenientInteger::Float(_) => None,
            LenientInteger::Text(text) => {
                let text = text.trim();
                text.parse::<i64>()
                    .ok()
                    .or_else(|| text.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v.trunc() as i64))
            }
        }
    }
}

fn integer_value(value: Value) -> Option<i64> {
    LenientInteger::deserialize(value)
        .ok()
        .and_then(LenientInteger::into_i64)
}

fn deserialize_lenient_integer<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(integer_value(Value::deserialize(deserializer)?).unwrap_or(0))
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(integer_value(Value::deserialize(deserializer)?)
        .and_then(|size| u64::try_from(size).ok())
        .unwrap_or(0))
}

/// Owner of the catalog file.
///
/// Construct once and share (the API state holds it in an `Arc`); all writers in the process
/// then serialise on the same mutex.
#[derive(Debug)]
pub struct CatalogStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CatalogStore {
    /// Creates a store for the catalog at `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the catalog.
    ///
    /// A missing file is an empty catalog. An unreadable or unparsable file is logged at warn
    /// and also read as empty.
    pub fn load(&self) -> Vec<CatalogEntry> {
        match self.read_entries() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("catalog {} unreadable, treating as empty: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    /// Returns the entry for `name`, if cataloged.
    pub fn find(&self, name: &str) -> Option<CatalogEntry> {
        self.load().into_iter().find(|entry| entry.name == name)
    }

    /// Replaces the catalog with `entries`.
    ///
    /// Takes the write lock; inside [`CatalogStore::mutate`] the save happens automatically.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::Serialization` or `LibraryError::CatalogWrite` on failure; the
    /// previous catalog is left intact.
    pub fn save(&self, entries: &[CatalogEntry]) -> LibraryResult<()> {
        let _guard = self.lock();
        self.write_entries(entries)
    }

    /// Runs `change` against the current catalog under the write lock and saves the result.
    ///
    /// Nothing is saved when `change` returns an error. If the existing catalog cannot be
    /// parsed it is moved aside to `<catalog>.corrupt` before the new one is written.
    ///
    /// # Errors
    ///
    /// Returns the error from `change`, or any error from saving.
    pub fn mutate<T, F>(&self, change: F) -> LibraryResult<T>
    where
        F: FnOnce(&mut Vec<CatalogEntry>) -> LibraryResult<T>,
    {
        let _guard = self.lock();

        let mut entries = match self.read_entries() {
            Ok(entries) => entries,
            Err(CatalogLoadError::Io(e)) => return Err(LibraryError::CatalogRead(e)),
            Err(CatalogLoadError::Parse(e)) => {
                let aside = self.corrupt_path();
                tracing::warn!(
                    "catalog {} is not valid JSON ({}); moving it to {}",
                    self.path.display(),
                    e,
                    aside.display()
                );
                fs::rename(&self.path, &aside).map_err(LibraryError::CatalogWrite)?;
                Vec::new()
            }
        };

        let result = change(&mut entries)?;
        self.write_entries(&entries)?;
        Ok(result)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded data is `()`, so a poisoned lock carries no broken state.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".corrupt");
        PathBuf::from(name)
    }

    fn read_entries(&self) -> Result<Vec<CatalogEntry>, CatalogLoadError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CatalogLoadError::Io(e)),
        };

        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<Value> = serde_json::from_str(&contents).map_err(CatalogLoadError::Parse)?;
        let mut entries = Vec::with_capacity(raw.len());
        for (index, value) in raw.into_iter().enumerate() {
            match serde_json::from_value::<CatalogEntry>(value) {
                Ok(entry) if !entry.name.trim().is_empty() => entries.push(entry),
                Ok(_) => tracing::warn!(
                    "skipping catalog entry {} in {}: empty name",
                    index,
                    self.path.display()
                ),
                Err(e) => tracing::warn!(
                    "skipping catalog entry {} in {}: {}",
                    index,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(entries)
    }

    fn write_entries(&self, entries: &[CatalogEntry]) -> LibraryResult<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(LibraryError::CatalogWrite)?;

        let json = serde_json::to_vec_pretty(entries).map_err(LibraryError::Serialization)?;

        let mut temp = tempfile::Builder::new()
            .prefix(".catalog-")
            .tempfile_in(&parent)
            .map_err(LibraryError::CatalogWrite)?;
        temp.write_all(&json).map_err(LibraryError::CatalogWrite)?;
        temp.write_all(b"\n").map_err(LibraryError::CatalogWrite)?;
        temp.as_file().sync_all().map_err(LibraryError::CatalogWrite)?;
        temp.persist(&self.path)
            .map_err(|e| LibraryError::CatalogWrite(e.error))?;

        tracing::debug!("saved {} catalog entries to {}", entries.len(), self.path.display());
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum CatalogLoadError {
    #[error("{0}")]
    Io(io::Error),
    #[error("{0}")]
    Parse(serde_json::Error),
}

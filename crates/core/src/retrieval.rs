//! Retrieval Service: downloads and on-demand file information.

use crate::analysis::{ContentAnalyzer, TypeMetadata};
use crate::catalog::CatalogStore;
use crate::constants::{LARGE_FILE_CACHE_CONTROL, LARGE_FILE_THRESHOLD};
use crate::library::parse_name_param;
use crate::policy;
use crate::LibraryResult;
use chrono::{DateTime, Utc};
use libris_files::{FilesService, HASH_ALGORITHM};
use libris_types::{Category, StoredName};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything the HTTP layer needs to stream a stored file.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTarget {
    pub name: StoredName,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub mime_type: &'static str,
    /// Set for files above the large-file threshold
    pub cache_control: Option<&'static str>,
}

impl DownloadTarget {
    /// `Content-Disposition` value marking the response as an attachment.
    ///
    /// Names outside printable ASCII get an RFC 5987 `filename*` alongside a sanitised
    /// fallback.
    pub fn content_disposition(&self) -> String {
        let name = self.name.as_str();
        let fallback: String = name
            .chars()
            .map(|c| if (c.is_ascii_graphic() && c != '"') || c == ' ' { c } else { '_' })
            .collect();

        if fallback == name {
            format!("attachment; filename=\"{name}\"")
        } else {
            format!(
                "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
                percent_encode(name)
            )
        }
    }
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'!' | b'#' | b'$' | b'&' | b'+' | b'-'
            | b'.' | b'^' | b'_' | b'`' | b'|' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Detailed, freshly computed information about one stored file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub category: Category,
    pub extension: String,
    pub mime_type: String,

    /// Media type guessed from the leading bytes, when recognisable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_media_type: Option<String>,

    pub size_bytes: u64,
    pub size_mb: f64,
    pub size_gb: f64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub content_hash: String,
    pub hash_algorithm: String,
    pub type_metadata: TypeMetadata,

    /// Whether the catalog has an entry for this file
    pub cataloged: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll_position: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_timestamp: Option<DateTime<Utc>>,
}

/// Read-only access to stored files.
#[derive(Debug, Clone)]
pub struct RetrievalService {
    files: FilesService,
    catalog: Arc<CatalogStore>,
    analyzer: ContentAnalyzer,
}

impl RetrievalService {
    pub fn new(files: FilesService, catalog: Arc<CatalogStore>, analyzer: ContentAnalyzer) -> Self {
        Self {
            files,
            catalog,
            analyzer,
        }
    }

    /// Resolves a download request.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::InvalidPath` for an invalid name or `LibraryError::NotFound` if
    /// no file carries it.
    pub fn download(&self, raw_name: &str) -> LibraryResult<DownloadTarget> {
        let name = parse_name_param(raw_name)?;
        let stat = self.files.stat(&name)?;
        let mime_type = policy::lookup(&name)
            .map(|t| t.mime_type)
            .unwrap_or(policy::FALLBACK_MIME_TYPE);
        let cache_control =
            (stat.size_bytes > LARGE_FILE_THRESHOLD).then_some(LARGE_FILE_CACHE_CONTROL);

        tracing::debug!("serving {} ({} bytes)", name, stat.size_bytes);
        Ok(DownloadTarget {
            path: self.files.path_for(&name),
            name,
            size_bytes: stat.size_bytes,
            mime_type,
            cache_control,
        })
    }

    /// Recomputes size, timestamps, hash and type metadata for a stored file, merging in the
    /// user-assigned catalog fields when an entry exists.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::InvalidPath` for an invalid name, `LibraryError::NotFound` if no
    /// file carries it, or `LibraryError::Storage` if the file cannot be read.
    pub fn file_info(&self, raw_name: &str) -> LibraryResult<FileInfo> {
        let name = parse_name_param(raw_name)?;
        let stat = self.files.stat(&name)?;
        let content_hash = self.files.hash(&name)?;

        let path = self.files.path_for(&name);
        let type_metadata = self.analyzer.analyze(&path, &name);
        let detected_media_type = libris_files::sniff_media_type(&path);

        let extension = name.normalized_extension().unwrap_or_default();
        let mut info = FileInfo {
            name: name.to_string(),
            category: policy::category_for_extension(&extension),
            mime_type: policy::mime_for_extension(&extension).to_string(),
            extension,
            detected_media_type,
            size_bytes: stat.size_bytes,
            size_mb: libris_types::size_in_mb(stat.size_bytes),
            size_gb: libris_types::size_in_gb(stat.size_bytes),
            created_at: stat.created_at,
            modified_at: stat.modified_at,
            content_hash,
            hash_algorithm: HASH_ALGORITHM.to_string(),
            type_metadata,
            cataloged: false,
            label: None,
            scroll_position: None,
            tags: Vec::new(),
            description: None,
            upload_timestamp: None,
            last_modified_timestamp: None,
        };

        if let Some(entry) = self.catalog.find(name.as_str()) {
            if entry.content_hash.as_deref().is_some_and(|h| h != info.content_hash) {
                tracing::warn!("content of {} no longer matches its cataloged hash", name);
            }
            info.cataloged = true;
            info.label = Some(entry.label);
            info.scroll_position = Some(entry.scroll_position);
            info.tags = entry.tags;
            info.description = entry.description;
            info.upload_timestamp = Some(entry.upload_timestamp);
            info.last_modified_timestamp = entry.last_modified_timestamp;
        }

        Ok(info)
    }
}

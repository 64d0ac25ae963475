//! Request and response bodies, with their OpenAPI schemas.

use chrono::{DateTime, Utc};
use libris_core::{CatalogEntry, FileInfo, IngestReport, TypeMetadata};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorRes {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One catalog entry as listed by `GET /files`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FileEntry {
    pub name: String,
    /// One of document, spreadsheet, presentation, image, archive, disk_image,
    /// virtual_machine, virtual_disk
    pub category: String,
    pub extension: String,
    pub mime_type: String,
    pub label: String,
    pub scroll_position: i64,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub size_gb: f64,
    pub upload_timestamp: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub hash_algorithm: String,
    #[schema(value_type = Object)]
    pub type_metadata: TypeMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<CatalogEntry> for FileEntry {
    fn from(entry: CatalogEntry) -> Self {
        Self {
            size_mb: libris_core::size_in_mb(entry.size_bytes),
            size_gb: libris_core::size_in_gb(entry.size_bytes),
            name: entry.name,
            category: entry.category.tag().to_string(),
            extension: entry.extension,
            mime_type: entry.mime_type,
            label: entry.label,
            scroll_position: entry.scroll_position,
            size_bytes: entry.size_bytes,
            upload_timestamp: entry.upload_timestamp,
            content_hash: entry.content_hash,
            hash_algorithm: entry.hash_algorithm,
            type_metadata: entry.type_metadata,
            last_modified_timestamp: entry.last_modified_timestamp,
            tags: entry.tags,
            description: entry.description,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UploadRes {
    pub success: bool,
    pub message: String,
    /// Final stored name
    pub name: String,
    /// Name sent by the client, present only when the file was renamed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    pub renamed: bool,
    pub category: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub size_gb: f64,
    pub content_hash: String,
    pub hash_algorithm: String,
    #[schema(value_type = Object)]
    pub type_metadata: TypeMetadata,
}

impl From<IngestReport> for UploadRes {
    fn from(report: IngestReport) -> Self {
        let message = match &report.original_name {
            Some(original) => format!("{} uploaded as {}", original, report.name),
            None => format!("{} uploaded", report.name),
        };
        Self {
            success: true,
            message,
            renamed: report.renamed(),
            name: report.name,
            original_name: report.original_name,
            category: report.category.tag().to_string(),
            mime_type: report.mime_type,
            size_bytes: report.size_bytes,
            size_mb: report.size_mb,
            size_gb: report.size_gb,
            content_hash: report.content_hash,
            hash_algorithm: report.hash_algorithm,
            type_metadata: report.type_metadata,
        }
    }
}

/// Detailed metadata returned by `GET /file-info/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FileInfoRes {
    pub name: String,
    pub category: String,
    pub extension: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_media_type: Option<String>,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub size_gb: f64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub content_hash: String,
    pub hash_algorithm: String,
    #[schema(value_type = Object)]
    pub type_metadata: TypeMetadata,
    pub cataloged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll_position: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_timestamp: Option<DateTime<Utc>>,
}

impl From<FileInfo> for FileInfoRes {
    fn from(info: FileInfo) -> Self {
        Self {
            name: info.name,
            category: info.category.tag().to_string(),
            extension: info.extension,
            mime_type: info.mime_type,
            detected_media_type: info.detected_media_type,
            size_bytes: info.size_bytes,
            size_mb: info.size_mb,
            size_gb: info.size_gb,
            created_at: info.created_at,
            modified_at: info.modified_at,
            content_hash: info.content_hash,
            hash_algorithm: info.hash_algorithm,
            type_metadata: info.type_metadata,
            cataloged: info.cataloged,
            label: info.label,
            scroll_position: info.scroll_position,
            tags: info.tags,
            description: info.description,
            upload_timestamp: info.upload_timestamp,
            last_modified_timestamp: info.last_modified_timestamp,
        }
    }
}

/// Body of `PUT /update`.
///
/// Documentation only: the handler parses the raw body so malformed JSON is reported in the
/// usual error shape. `scroll_position`, `label` and `description` are accepted as aliases.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateReq {
    pub name: String,
    pub scroll: Option<i64>,
    pub categoria: Option<String>,
    /// An array of strings, or one comma-separated string
    pub tags: Option<Vec<String>>,
    pub descripcion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateRes {
    pub success: bool,
    pub message: String,
    pub entry: FileEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeleteRes {
    pub success: bool,
    pub message: String,
}

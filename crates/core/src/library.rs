//! Catalog operations: list, update and delete.
//!
//! The catalog is authoritative for these operations. Delete refuses names the catalog does
//! not know, even if a file with that name exists on disk; an entry whose file has vanished is
//! still removed (and the drift logged).

use crate::catalog::{CatalogEntry, CatalogStore, LenientInteger};
use crate::{LibraryError, LibraryResult};
use chrono::Utc;
use libris_files::{FilesError, FilesService};
use libris_types::StoredName;
use serde::{Deserialize, Deserializer};
use std::sync::Arc;

/// Validates a name taken from a request path.
///
/// # Errors
///
/// Returns `LibraryError::InvalidPath` for names containing `/`, `\` or `..`, hidden names,
/// and names with control characters.
pub fn parse_name_param(raw: &str) -> LibraryResult<StoredName> {
    StoredName::parse(raw).map_err(|e| {
        tracing::debug!("rejected name parameter {:?}: {}", raw, e);
        LibraryError::InvalidPath(e.to_string())
    })
}

/// User-editable fields of a catalog entry.
///
/// Absent fields are left unchanged. Both the legacy field names and the current ones are
/// accepted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EntryUpdate {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(
        default,
        alias = "scroll",
        deserialize_with = "deserialize_optional_integer"
    )]
    pub scroll_position: Option<i64>,

    #[serde(default, alias = "categoria")]
    pub label: Option<String>,

    #[serde(default, deserialize_with = "deserialize_tags")]
    pub tags: Option<Vec<String>>,

    #[serde(default, alias = "descripcion")]
    pub description: Option<String>,
}

impl EntryUpdate {
    /// Parses an update request body.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::InvalidJson` if the body is not a JSON object of the expected
    /// shape.
    pub fn from_json(body: &[u8]) -> LibraryResult<Self> {
        serde_json::from_slice(body).map_err(|e| LibraryError::InvalidJson(e.to_string()))
    }

    fn is_empty(&self) -> bool {
        self.scroll_position.is_none()
            && self.label.is_none()
            && self.tags.is_none()
            && self.description.is_none()
    }

    fn apply(self, entry: &mut CatalogEntry) {
        if let Some(scroll) = self.scroll_position {
            entry.scroll_position = scroll;
        }
        if let Some(label) = self.label {
            entry.label = label;
        }
        if let Some(tags) = self.tags {
            entry.tags = tags;
        }
        if let Some(description) = self.description {
            entry.description = Some(description);
        }
        entry.last_modified_timestamp = Some(Utc::now());
    }
}

fn deserialize_optional_integer<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<LenientInteger>::deserialize(deserializer)? {
        None => Ok(None),
        Some(value) => value
            .into_i64()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("scroll position must be an integer")),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTags {
    List(Vec<String>),
    Text(String),
}

/// Tags arrive either as an array or as one comma-separated string.
fn deserialize_tags<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawTags>::deserialize(deserializer)?;
    Ok(raw.map(|raw| {
        let tags = match raw {
            RawTags::List(list) => list,
            RawTags::Text(text) => text.split(',').map(str::to_string).collect(),
        };
        tags.into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }))
}

/// List, update and delete over the catalog and storage directory.
#[derive(Debug, Clone)]
pub struct LibraryService {
    files: FilesService,
    catalog: Arc<CatalogStore>,
}

impl LibraryService {
    pub fn new(files: FilesService, catalog: Arc<CatalogStore>) -> Self {
        Self { files, catalog }
    }

    /// Returns every catalog entry, in catalog order.
    pub fn list(&self) -> Vec<CatalogEntry> {
        self.catalog.load()
    }

    /// Applies user-editable changes to one entry.
    ///
    /// # Arguments
    ///
    /// * `name` - Stored name of the entry
    /// * `update` - Fields to change; `update.name` is ignored here
    ///
    /// # Returns
    ///
    /// The entry as saved.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::InvalidPath` for an invalid name, `LibraryError::NotFound` if the
    /// catalog has no such entry, or catalog write errors.
    pub fn update(&self, name: &str, update: EntryUpdate) -> LibraryResult<CatalogEntry> {
        let name = parse_name_param(name)?;
        if update.is_empty() {
            tracing::debug!("update for {} carries no editable fields", name);
        }

        let updated = self.catalog.mutate(|entries| {
            let entry = entries
                .iter_mut()
                .find(|entry| entry.name == name.as_str())
                .ok_or_else(|| LibraryError::NotFound(name.to_string()))?;
            update.apply(entry);
            Ok(entry.clone())
        })?;

        tracing::info!("updated catalog entry {}", name);
        Ok(updated)
    }

    /// Parses an update request body and applies it to the entry it names.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::InvalidJson` for an unparsable body, `LibraryError::InvalidInput`
    /// if `name` is missing, or any error from [`LibraryService::update`].
    pub fn update_from_json(&self, body: &[u8]) -> LibraryResult<CatalogEntry> {
        let mut update = EntryUpdate::from_json(body)?;
        let name = update
            .name
            .take()
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| LibraryError::InvalidInput("name is required".into()))?;
        self.update(&name, update)
    }

    /// Deletes a stored file and its catalog entry.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::InvalidPath` for an invalid name, `LibraryError::NotFound` if the
    /// catalog has no such entry (the catalog is left unchanged), or I/O and catalog errors.
    pub fn delete(&self, name: &str) -> LibraryResult<()> {
        let name = parse_name_param(name)?;
        let files = &self.files;

        self.catalog.mutate(|entries| {
            let position = entries
                .iter()
                .position(|entry| entry.name == name.as_str())
                .ok_or_else(|| LibraryError::NotFound(name.to_string()))?;

            match files.remove(&name) {
                Ok(()) => {}
                Err(FilesError::NotFound(_)) => {
                    tracing::warn!("catalog entry {} had no stored file; removing entry", name);
                }
                Err(e) => return Err(e.into()),
            }
            entries.remove(position);
            Ok(())
        })?;

        tracing::info!("deleted {}", name);
        Ok(())
    }
}

//! # Libris Core
//!
//! Core business logic for the Libris file library.
//!
//! This crate contains the upload pipeline and everything that reads or writes the catalog:
//! - Multipart decoding and the validation policy (allow-list plus size ceilings)
//! - Content analysis (disk images, virtual machines, virtual disks) and content hashing
//! - The JSON catalog store and the list/update/delete operations over it
//! - Retrieval of stored files and drift reconciliation
//!
//! **No API concerns**: HTTP routing, status codes and streaming belong in `api-rest`; the
//! operator CLI lives in `libris-cli`. Everything here is synchronous and is run on the
//! blocking pool by async callers.
//!
//! ## Wiring
//!
//! [`Library::open`] builds every service from one [`CoreConfig`], sharing a single
//! [`CatalogStore`] so all writers in the process serialise on the same lock.

pub mod analysis;
pub mod catalog;
pub mod config;
pub mod constants;
pub mod error;
pub mod ingest;
pub mod library;
pub mod multipart;
pub mod policy;
pub mod reconcile;
pub mod retrieval;

pub use analysis::{ContentAnalyzer, TypeMetadata};
pub use catalog::{CatalogEntry, CatalogStore};
pub use config::CoreConfig;
pub use error::{LibraryError, LibraryResult, SizeLimit};
pub use ingest::{IngestReport, IngestionPipeline, UploadSession};
pub use library::{parse_name_param, EntryUpdate, LibraryService};
pub use policy::ValidationPolicy;
pub use reconcile::{ReconcileReport, Reconciler};
pub use retrieval::{DownloadTarget, FileInfo, RetrievalService};

pub use libris_types::{size_in_gb, size_in_mb, Category, StoredName};

use libris_files::FilesService;
use std::fs;
use std::sync::Arc;

/// All core services for one library, built from a single configuration.
#[derive(Debug, Clone)]
pub struct Library {
    cfg: Arc<CoreConfig>,
    catalog: Arc<CatalogStore>,
    ingest: IngestionPipeline,
    retrieval: RetrievalService,
    service: LibraryService,
    reconciler: Reconciler,
}

impl Library {
    /// Opens (creating if needed) the library described by `cfg`.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::Io` if the data directory or the catalog's parent directory
    /// cannot be created, or `LibraryError::Storage` if the storage directory is unusable.
    pub fn open(cfg: Arc<CoreConfig>) -> LibraryResult<Self> {
        fs::create_dir_all(cfg.data_dir())?;
        if let Some(parent) = cfg.catalog_path().parent() {
            fs::create_dir_all(parent)?;
        }
        let files = FilesService::create(cfg.storage_dir())?;

        let catalog = Arc::new(CatalogStore::new(cfg.catalog_path()));
        let analyzer = ContentAnalyzer::new();
        let policy = ValidationPolicy::new(cfg.max_request_bytes());

        tracing::info!(
            "opened library: storage {}, catalog {}",
            files.root_directory().display(),
            catalog.path().display()
        );

        Ok(Self {
            ingest: IngestionPipeline::new(
                files.clone(),
                catalog.clone(),
                analyzer.clone(),
                policy,
            ),
            retrieval: RetrievalService::new(files.clone(), catalog.clone(), analyzer.clone()),
            service: LibraryService::new(files.clone(), catalog.clone()),
            reconciler: Reconciler::new(files, catalog.clone(), analyzer, policy),
            catalog,
            cfg,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub fn ingest(&self) -> &IngestionPipeline {
        &self.ingest
    }

    pub fn retrieval(&self) -> &RetrievalService {
        &self.retrieval
    }

    /// List, update and delete.
    pub fn entries(&self) -> &LibraryService {
        &self.service
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }
}

//! Ingestion Pipeline.
//!
//! Takes one upload from raw request bytes to a cataloged file:
//!
//! ```text
//! Received → Decoded → Validated → Staged → Named → Analyzed → Cataloged
//! ```
//!
//! - **Received**: the declared `Content-Length` is checked against the global ceiling
//! - **Decoded / Validated**: the multipart decoder yields the filename; the extension gate
//!   runs before a single payload byte is written
//! - **Staged**: payload bytes stream into a hidden staging file while the per-extension
//!   ceiling is enforced
//! - **Named**: the staging file is renamed into place under a collision-free name
//! - **Analyzed**: content hash and type metadata are computed from the stored bytes
//! - **Cataloged**: the entry is added under the catalog lock
//!
//! A failure before **Named** leaves nothing behind: the staging file is deleted when dropped.
//! A failure after **Named** leaves the file without a catalog entry; it is logged and later
//! adopted by reconciliation.
//!
//! The pipeline is synchronous. The HTTP layer runs it on the blocking pool.

use crate::analysis::{ContentAnalyzer, TypeMetadata};
use crate::catalog::{CatalogEntry, CatalogStore};
use crate::multipart::{boundary_from_content_type, MultipartDecoder, PartSink};
use crate::policy::{AllowedType, ValidationPolicy};
use crate::{LibraryError, LibraryResult};
use libris_files::{FilesService, StagedFile};
use libris_types::{Category, StoredName};
use serde::Serialize;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

/// Progress markers used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IngestStage {
    Received,
    Validated,
    Staged,
    Named,
    Analyzed,
    Cataloged,
}

/// Outcome of a successful ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    /// Final stored name
    pub name: String,

    /// Name the client supplied, present only when dedup renamed the file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,

    pub category: Category,
    pub mime_type: String,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub size_gb: f64,
    pub content_hash: String,
    pub hash_algorithm: String,
    pub type_metadata: TypeMetadata,
}

impl IngestReport {
    pub fn renamed(&self) -> bool {
        self.original_name.is_some()
    }

    fn from_entry(entry: &CatalogEntry, original_name: Option<String>) -> Self {
        Self {
            name: entry.name.clone(),
            original_name,
            category: entry.category,
            mime_type: entry.mime_type.clone(),
            size_bytes: entry.size_bytes,
            size_mb: libris_types::size_in_mb(entry.size_bytes),
            size_gb: libris_types::size_in_gb(entry.size_bytes),
            content_hash: entry.content_hash.clone().unwrap_or_default(),
            hash_algorithm: entry.hash_algorithm.clone(),
            type_metadata: entry.type_metadata.clone(),
        }
    }
}

/// Validates, stores, analyses and catalogs incoming files.
#[derive(Debug, Clone)]
pub struct IngestionPipeline {
    files: FilesService,
    catalog: Arc<CatalogStore>,
    analyzer: ContentAnalyzer,
    policy: ValidationPolicy,
}

impl IngestionPipeline {
    pub fn new(
        files: FilesService,
        catalog: Arc<CatalogStore>,
        analyzer: ContentAnalyzer,
        policy: ValidationPolicy,
    ) -> Self {
        Self {
            files,
            catalog,
            analyzer,
            policy,
        }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Starts decoding a multipart upload.
    ///
    /// # Arguments
    ///
    /// * `content_type` - The request's `Content-Type` header
    /// * `declared_len` - The request's `Content-Length`, if sent
    ///
    /// # Returns
    ///
    /// A session to feed body chunks into, then finish.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::PayloadTooLarge` if the declared length exceeds the global
    /// ceiling, or `LibraryError::MalformedMultipart` if no boundary is declared.
    pub fn begin_upload(
        &self,
        content_type: &str,
        declared_len: Option<u64>,
    ) -> LibraryResult<UploadSession> {
        self.policy.check_declared_length(declared_len)?;
        let boundary = boundary_from_content_type(content_type)?;
        tracing::debug!(
            "upload {:?}: boundary {:?}, declared length {:?}",
            IngestStage::Received,
            boundary,
            declared_len
        );

        Ok(UploadSession {
            pipeline: self.clone(),
            decoder: MultipartDecoder::new(&boundary),
            sink: StagingSink {
                files: self.files.clone(),
                policy: self.policy,
                pending: None,
            },
        })
    }

    /// Ingests a file from the local filesystem.
    ///
    /// The file is copied into the library under its own file name (deduplicated as usual);
    /// the source is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::InvalidPath` if the source has no usable file name,
    /// `LibraryError::ExtensionRejected` or `LibraryError::PayloadTooLarge` from the policy,
    /// `LibraryError::InvalidInput` for an empty file, or I/O and catalog errors.
    pub fn ingest_path(&self, source: &Path) -> LibraryResult<IngestReport> {
        let raw_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| LibraryError::InvalidPath(source.display().to_string()))?;

        let mut sink = StagingSink {
            files: self.files.clone(),
            policy: self.policy,
            pending: None,
        };
        sink.begin_file(&raw_name)?;

        let mut reader = File::open(source)?;
        io::copy(&mut reader, &mut SinkWriter(&mut sink)).map_err(unwrap_sink_error)?;

        let pending = sink
            .pending
            .ok_or_else(|| LibraryError::InvalidPath(raw_name.clone()))?;
        if pending.staged.bytes_written() == 0 {
            return Err(LibraryError::InvalidInput(format!("{} is empty", source.display())));
        }
        self.commit(pending)
    }

    fn commit(&self, pending: PendingFile) -> LibraryResult<IngestReport> {
        let PendingFile {
            requested,
            allowed,
            mut staged,
        } = pending;

        staged.flush()?;
        let size_bytes = staged.bytes_written();
        self.policy.check_payload_length(allowed, size_bytes)?;
        tracing::debug!("upload {} {:?}: {} bytes", requested, IngestStage::Staged, size_bytes);

        let placement = self.files.place(staged, &requested)?;
        let stored = placement.name;
        tracing::debug!("upload {} {:?} as {}", requested, IngestStage::Named, stored);

        let entry = match self.describe(&stored, allowed, size_bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(
                    "stored {} but could not analyse it, leaving it uncataloged: {}",
                    stored,
                    e
                );
                return Err(e);
            }
        };
        tracing::debug!("upload {} {:?}", stored, IngestStage::Analyzed);

        let cataloged = entry.clone();
        if let Err(e) = self.catalog.mutate(move |entries| {
            entries.retain(|existing| existing.name != cataloged.name);
            entries.push(cataloged);
            Ok(())
        }) {
            tracing::error!("stored {} but could not catalog it: {}", stored, e);
            return Err(e);
        }
        tracing::debug!("upload {} {:?}", stored, IngestStage::Cataloged);

        let original_name = placement.renamed.then(|| requested.to_string());
        match &original_name {
            Some(original) => tracing::info!(
                "stored {} as {} ({} bytes, {})",
                original,
                stored,
                size_bytes,
                entry.category
            ),
            None => tracing::info!("stored {} ({} bytes, {})", stored, size_bytes, entry.category),
        }

        Ok(IngestReport::from_entry(&entry, original_name))
    }

    fn describe(
        &self,
        stored: &StoredName,
        allowed: &AllowedType,
        size_bytes: u64,
    ) -> LibraryResult<CatalogEntry> {
        let path = self.files.path_for(stored);
        let content_hash = self.analyzer.content_hash(&path)?;
        let type_metadata = self.analyzer.analyze(&path, stored);
        Ok(CatalogEntry::new(
            stored,
            allowed,
            size_bytes,
            content_hash,
            type_metadata,
        ))
    }
}

/// One multipart upload in progress.
///
/// Dropping the session without finishing discards any staged bytes.
#[derive(Debug)]
pub struct UploadSession {
    pipeline: IngestionPipeline,
    decoder: MultipartDecoder,
    sink: StagingSink,
}

impl UploadSession {
    /// Feeds the next chunk of the request body.
    ///
    /// # Errors
    ///
    /// Returns framing, policy or staging errors; the session should then be dropped.
    pub fn feed(&mut self, chunk: &[u8]) -> LibraryResult<()> {
        self.decoder.feed(chunk, &mut self.sink)
    }

    /// Completes the upload once the body has ended.
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::MalformedMultipart` for a missing, truncated or empty file part,
    /// or any error from storing and cataloging the file.
    pub fn finish(self) -> LibraryResult<IngestReport> {
        let decoded = self.decoder.finish()?;
        let pending = self.sink.pending.ok_or_else(|| {
            LibraryError::MalformedMultipart(format!("file part {:?} was not staged", decoded.filename))
        })?;
        self.pipeline.commit(pending)
    }
}

#[derive(Debug)]
struct PendingFile {
    requested: StoredName,
    allowed: &'static AllowedType,
    staged: StagedFile,
}

/// Receives the decoded file part and writes it to a staging file.
#[derive(Debug)]
struct StagingSink {
    files: FilesService,
    policy: ValidationPolicy,
    pending: Option<PendingFile>,
}

impl PartSink for StagingSink {
    fn begin_file(&mut self, filename: &str) -> LibraryResult<()> {
        let requested = StoredName::from_upload(filename)?;
        let allowed = self.policy.check_extension(&requested)?;
        tracing::debug!("upload {} {:?} as {}", requested, IngestStage::Validated, allowed.category);

        let staged = self.files.stage()?;
        self.pending = Some(PendingFile {
            requested,
            allowed,
            staged,
        });
        Ok(())
    }

    fn write_payload(&mut self, bytes: &[u8]) -> LibraryResult<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        let len = pending.staged.bytes_written() + bytes.len() as u64;
        self.policy.check_payload_length(pending.allowed, len)?;
        pending.staged.write_all(bytes)?;
        Ok(())
    }
}

/// Adapts a sink to [`Write`] so local files can be copied with [`io::copy`].
struct SinkWriter<'a>(&'a mut StagingSink);

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .write_payload(buf)
            .map_err(|e| io::Error::other(SinkError(e)))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct SinkError(LibraryError);

fn unwrap_sink_error(err: io::Error) -> LibraryError {
    if !err.get_ref().is_some_and(|inner| inner.is::<SinkError>()) {
        return LibraryError::Io(err);
    }
    match err.into_inner().map(|inner| inner.downcast::<SinkError>()) {
        Some(Ok(sink)) => sink.0,
        _ => LibraryError::InvalidInput("local copy aborted".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_MAX_REQUEST_BYTES;
    use crate::error::SizeLimit;
    use std::fs;
    use tempfile::TempDir;

    const BOUNDARY: &str = "XyZ123";

    struct Fixture {
        _temp: TempDir,
        pipeline: IngestionPipeline,
        files: FilesService,
        catalog: Arc<CatalogStore>,
    }

    fn fixture_with_limit(max_request_bytes: u64) -> Fixture {
        let temp = TempDir::new().unwrap();
        let files = FilesService::create(&temp.path().join("uploads")).unwrap();
        let catalog = Arc::new(CatalogStore::new(temp.path().join("catalog.json")));
        let pipeline = IngestionPipeline::new(
            files.clone(),
            catalog.clone(),
            ContentAnalyzer::new(),
            ValidationPolicy::new(max_request_bytes),
        );
        Fixture {
            _temp: temp,
            pipeline,
            files,
            catalog,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_limit(DEFAULT_MAX_REQUEST_BYTES)
    }

    fn body(filename: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n")
                .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload(f: &Fixture, filename: &str, payload: &[u8]) -> LibraryResult<IngestReport> {
        let bytes = body(filename, payload);
        let mut session = f
            .pipeline
            .begin_upload(&format!("multipart/form-data; boundary={BOUNDARY}"), None)?;
        for chunk in bytes.chunks(7) {
            session.feed(chunk)?;
        }
        session.finish()
    }

    fn stored_files(f: &Fixture) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(f.files.root_directory())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_upload_is_stored_and_cataloged() {
        let f = fixture();

        let report = upload(&f, "a.txt", b"Hello").unwrap();

        assert_eq!(report.name, "a.txt");
        assert!(!report.renamed());
        assert_eq!(report.category, Category::Document);
        assert_eq!(report.size_bytes, 5);
        assert_eq!(report.content_hash, libris_files::sha256_bytes(b"Hello"));
        assert_eq!(f.files.read(&StoredName::parse("a.txt").unwrap()).unwrap(), b"Hello");

        let entries = f.catalog.load();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].mime_type, "text/plain");
    }

    #[test]
    fn test_second_upload_is_renamed() {
        let f = fixture();

        upload(&f, "a.txt", b"Hello").unwrap();
        let second = upload(&f, "a.txt", b"World").unwrap();

        assert_eq!(second.name, "a_1.txt");
        assert_eq!(second.original_name.as_deref(), Some("a.txt"));
        assert_eq!(f.catalog.load().len(), 2);
    }

    #[test]
    fn test_rejected_extension_leaves_nothing() {
        let f = fixture();

        let err = upload(&f, "setup.exe", &vec![0u8; 1024]).unwrap_err();

        match err {
            LibraryError::ExtensionRejected { extension, allowed } => {
                assert_eq!(extension, ".exe");
                assert!(allowed.contains(&".pdf".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(stored_files(&f).is_empty());
        assert!(f.catalog.load().is_empty());
    }

    #[test]
    fn test_declared_length_over_ceiling() {
        let f = fixture_with_limit(100);

        let err = f
            .pipeline
            .begin_upload(&format!("multipart/form-data; boundary={BOUNDARY}"), Some(101))
            .unwrap_err();

        assert!(matches!(
            err,
            LibraryError::PayloadTooLarge {
                limit: 100,
                scope: SizeLimit::Request
            }
        ));
    }

    #[test]
    fn test_payload_over_extension_ceiling() {
        let f = fixture_with_limit(64);

        let err = upload(&f, "big.txt", &vec![b'x'; 65]).unwrap_err();

        assert!(matches!(
            err,
            LibraryError::PayloadTooLarge {
                scope: SizeLimit::Extension(_),
                ..
            }
        ));
        assert!(stored_files(&f).is_empty());
    }

    #[test]
    fn test_truncated_body_leaves_nothing() {
        let f = fixture();
        let bytes = body("a.txt", b"Hello world");
        let cut = bytes.len() - 12;

        let mut session = f
            .pipeline
            .begin_upload(&format!("multipart/form-data; boundary={BOUNDARY}"), None)
            .unwrap();
        session.feed(&bytes[..cut]).unwrap();
        let err = session.finish().unwrap_err();

        assert!(matches!(err, LibraryError::MalformedMultipart(_)));
        assert!(stored_files(&f).is_empty());
        assert!(f.catalog.load().is_empty());
    }

    #[test]
    fn test_abandoned_session_discards_staging_file() {
        let f = fixture();
        let bytes = body("a.txt", b"Hello world");

        let mut session = f
            .pipeline
            .begin_upload(&format!("multipart/form-data; boundary={BOUNDARY}"), None)
            .unwrap();
        session.feed(&bytes[..bytes.len() - 5]).unwrap();
        drop(session);

        assert!(stored_files(&f).is_empty());
    }

    #[test]
    fn test_browser_path_is_reduced_to_file_name() {
        let f = fixture();

        let report = upload(&f, "C:\\fakepath\\notes.md", b"# notes").unwrap();

        assert_eq!(report.name, "notes.md");
    }

    #[test]
    fn test_ingest_path_copies_local_file() {
        let f = fixture();
        let source_dir = TempDir::new().unwrap();
        let source = source_dir.path().join("report.pdf");
        fs::write(&source, b"%PDF-1.4 test").unwrap();

        let report = f.pipeline.ingest_path(&source).unwrap();

        assert_eq!(report.name, "report.pdf");
        assert_eq!(report.category, Category::Document);
        assert!(source.exists());
        assert_eq!(f.catalog.find("report.pdf").unwrap().size_bytes, 13);
    }

    #[test]
    fn test_ingest_path_rejects_disallowed_and_empty() {
        let f = fixture();
        let source_dir = TempDir::new().unwrap();
        let exe = source_dir.path().join("tool.exe");
        fs::write(&exe, b"MZ").unwrap();
        let empty = source_dir.path().join("empty.txt");
        fs::write(&empty, b"").unwrap();

        assert!(matches!(
            f.pipeline.ingest_path(&exe),
            Err(LibraryError::ExtensionRejected { .. })
        ));
        assert!(matches!(
            f.pipeline.ingest_path(&empty),
            Err(LibraryError::InvalidInput(_))
        ));
        assert!(stored_files(&f).is_empty());
    }

    #[test]
    fn test_ingest_path_over_ceiling_keeps_library_error() {
        let f = fixture_with_limit(4);
        let source_dir = TempDir::new().unwrap();
        let source = source_dir.path().join("long.txt");
        fs::write(&source, b"too long").unwrap();

        assert!(matches!(
            f.pipeline.ingest_path(&source),
            Err(LibraryError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_stale_entry_with_same_name_is_replaced() {
        let f = fixture();
        let mut stale = CatalogEntry::new(
            &StoredName::parse("a.txt").unwrap(),
            crate::policy::lookup_extension(".txt").unwrap(),
            99,
            "deadbeef".into(),
            TypeMetadata::new(),
        );
        stale.label = "old".into();
        f.catalog.save(&[stale]).unwrap();

        upload(&f, "a.txt", b"Hello").unwrap();

        let entries = f.catalog.load();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size_bytes, 5);
        assert_eq!(entries[0].label, "uncategorized");
    }
}

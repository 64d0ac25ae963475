//! Drift reconciliation between the catalog and the storage directory.
//!
//! - An entry whose file is gone is **pruned**.
//! - A stored file without an entry is **adopted** (hashed, analysed and cataloged) when its
//!   extension is on the allow-list.
//! - Everything else in the directory (staging files, hidden files, subdirectories, files with
//!   disallowed extensions) is **ignored**: reported, never touched.
//!
//! Hashing and analysis run before the catalog lock is taken; the lock is held only to merge
//! the results, re-checking each candidate against the latest catalog.

use crate::analysis::ContentAnalyzer;
use crate::catalog::{CatalogEntry, CatalogStore};
use crate::policy::ValidationPolicy;
use crate::LibraryResult;
use libris_files::FilesService;
use libris_types::StoredName;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// What a reconciliation pass changed (or would change, for a dry run).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub pruned: Vec<String>,
    pub adopted: Vec<String>,
    pub ignored: Vec<String>,
    pub dry_run: bool,
}

impl ReconcileReport {
    /// Whether the catalog and directory already agreed.
    pub fn is_clean(&self) -> bool {
        self.pruned.is_empty() && self.adopted.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    files: FilesService,
    catalog: Arc<CatalogStore>,
    analyzer: ContentAnalyzer,
    policy: ValidationPolicy,
}

impl Reconciler {
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

    /// Runs one reconciliation pass.
    ///
    /// # Arguments
    ///
    /// * `dry_run` - Report what would change without touching the catalog
    ///
    /// # Errors
    ///
    /// Returns `LibraryError::Storage` if the directory cannot be scanned, or catalog errors.
    /// Files that cannot be hashed are reported as ignored instead.
    pub fn run(&self, dry_run: bool) -> LibraryResult<ReconcileReport> {
        let scan = self.files.scan()?;
        let entries = self.catalog.load();

        let on_disk: HashSet<&str> = scan.stored.iter().map(StoredName::as_str).collect();
        let cataloged: HashSet<&str> = entries.iter().map(|e| e.name.as_str()).collect();

        let mut report = ReconcileReport {
            dry_run,
            ignored: scan.ignored.clone(),
            ..Default::default()
        };

        report.pruned = entries
            .iter()
            .filter(|e| !on_disk.contains(e.name.as_str()))
            .map(|e| e.name.clone())
            .collect();

        let mut candidates = Vec::new();
        for name in scan.stored.iter().filter(|n| !cataloged.contains(n.as_str())) {
            match self.policy.check_extension(name) {
                Ok(_) => candidates.push(name.clone()),
                Err(_) => report.ignored.push(name.to_string()),
            }
        }

        if dry_run {
            report.adopted = candidates.iter().map(StoredName::to_string).collect();
            report.ignored.sort();
            return Ok(report);
        }

        let mut adoptions = Vec::new();
        for name in candidates {
            match self.describe(&name) {
                Ok(entry) => adoptions.push(entry),
                Err(e) => {
                    tracing::warn!("could not adopt {}: {}", name, e);
                    report.ignored.push(name.to_string());
                }
            }
        }
        report.ignored.sort();

        if report.pruned.is_empty() && adoptions.is_empty() {
            tracing::debug!("catalog and storage directory agree");
            return Ok(report);
        }

        let files = &self.files;
        let (pruned, adopted) = self.catalog.mutate(|entries| {
            let mut pruned = Vec::new();
            entries.retain(|entry| {
                let present = StoredName::parse(&entry.name).is_ok_and(|n| files.exists(&n));
                if !present {
                    pruned.push(entry.name.clone());
                }
                present
            });

            let mut adopted = Vec::new();
            for entry in adoptions {
                if entries.iter().all(|existing| existing.name != entry.name) {
                    adopted.push(entry.name.clone());
                    entries.push(entry);
                }
            }
            Ok((pruned, adopted))
        })?;

        for name in &pruned {
            tracing::info!("pruned catalog entry {} (file missing)", name);
        }
        for name in &adopted {
            tracing::info!("adopted uncataloged file {}", name);
        }
        report.pruned = pruned;
        report.adopted = adopted;
        Ok(report)
    }

    fn describe(&self, name: &StoredName) -> LibraryResult<CatalogEntry> {
        let allowed = self.policy.check_extension(name)?;
        let stat = self.files.stat(name)?;
        let path = self.files.path_for(name);
        let content_hash = self.analyzer.content_hash(&path)?;
        let type_metadata = self.analyzer.analyze(&path, name);
        Ok(CatalogEntry::new(
            name,
            allowed,
            stat.size_bytes,
            content_hash,
            type_metadata,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::TypeMetadata;
    use crate::constants::DEFAULT_MAX_REQUEST_BYTES;
    use crate::policy;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        reconciler: Reconciler,
        files: FilesService,
        catalog: Arc<CatalogStore>,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let files = FilesService::create(&temp.path().join("uploads")).unwrap();
        let catalog = Arc::new(CatalogStore::new(temp.path().join("catalog.json")));
        let reconciler = Reconciler::new(
            files.clone(),
            catalog.clone(),
            ContentAnalyzer::new(),
            ValidationPolicy::new(DEFAULT_MAX_REQUEST_BYTES),
        );
        Fixture {
            temp,
            reconciler,
            files,
            catalog,
        }
    }

    fn entry(name: &str) -> CatalogEntry {
        let stored = StoredName::parse(name).unwrap();
        CatalogEntry::new(
            &stored,
            policy::lookup(&stored).unwrap(),
            1,
            "00".into(),
            TypeMetadata::new(),
        )
    }

    fn write(f: &Fixture, name: &str, bytes: &[u8]) {
        fs::write(f.files.root_directory().join(name), bytes).unwrap();
    }

    #[test]
    fn test_clean_library() {
        let f = fixture();
        write(&f, "a.txt", b"a");
        f.catalog.save(&[entry("a.txt")]).unwrap();

        let report = f.reconciler.run(false).unwrap();

        assert!(report.is_clean());
        assert!(report.ignored.is_empty());
    }

    #[test]
    fn test_prunes_and_adopts() {
        let f = fixture();
        write(&f, "kept.txt", b"kept");
        write(&f, "new.pdf", b"%PDF-1.7");
        write(&f, "tool.exe", b"MZ");
        write(&f, ".upload-abc123", b"partial");
        fs::create_dir(f.files.root_directory().join("subdir")).unwrap();
        f.catalog
            .save(&[entry("kept.txt"), entry("gone.txt")])
            .unwrap();

        let report = f.reconciler.run(false).unwrap();

        assert_eq!(report.pruned, vec!["gone.txt"]);
        assert_eq!(report.adopted, vec!["new.pdf"]);
        assert_eq!(report.ignored, vec![".upload-abc123", "subdir", "tool.exe"]);

        let entries = f.catalog.load();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["kept.txt", "new.pdf"]);
        let adopted = &entries[1];
        assert_eq!(adopted.size_bytes, 8);
        assert_eq!(
            adopted.content_hash.as_deref(),
            Some(libris_files::sha256_bytes(b"%PDF-1.7").as_str())
        );
        assert!(f.temp.path().join("uploads").join("tool.exe").exists());
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let f = fixture();
        write(&f, "new.pdf", b"%PDF-1.7");
        f.catalog.save(&[entry("gone.txt")]).unwrap();
        let before = fs::read(f.catalog.path()).unwrap();

        let report = f.reconciler.run(true).unwrap();

        assert!(report.dry_run);
        assert_eq!(report.pruned, vec!["gone.txt"]);
        assert_eq!(report.adopted, vec!["new.pdf"]);
        assert_eq!(fs::read(f.catalog.path()).unwrap(), before);
    }

    #[test]
    fn test_missing_catalog_adopts_everything() {
        let f = fixture();
        write(&f, "b.png", b"\x89PNG");
        write(&f, "a.csv", b"x,y");

        let report = f.reconciler.run(false).unwrap();

        assert_eq!(report.adopted, vec!["a.csv", "b.png"]);
        assert_eq!(f.catalog.load().len(), 2);
    }
}

use clap::{Parser, Subcommand};
use libris_core::config::ENV_DATA_DIR;
use libris_core::{CoreConfig, EntryUpdate, Library};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "libris")]
#[command(about = "Libris file library CLI")]
struct Cli {
    /// Base data directory (overrides LIBRIS_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List all cataloged files
    List,
    /// Show detailed metadata for a stored file
    Info {
        /// Stored file name
        name: String,
    },
    /// Copy local files into the library
    Ingest {
        /// Files to ingest
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Update the user-editable fields of an entry
    Update {
        /// Stored file name
        name: String,
        /// Scroll position
        #[arg(long)]
        scroll: Option<i64>,
        /// Label
        #[arg(long)]
        label: Option<String>,
        /// Tags (comma-separated)
        #[arg(long)]
        tags: Option<String>,
        /// Description
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a stored file and its entry
    Delete {
        /// Stored file name
        name: String,
    },
    /// Reconcile the catalog with the storage directory
    Reconcile {
        /// Report changes without applying them
        #[arg(long)]
        dry_run: bool,
    },
}

fn open_library(data_dir: Option<PathBuf>) -> anyhow::Result<Library> {
    let cfg = CoreConfig::from_lookup(|key| {
        if key == ENV_DATA_DIR {
            if let Some(dir) = &data_dir {
                return Some(dir.display().to_string());
            }
        }
        std::env::var(key).ok()
    })?;
    Ok(Library::open(Arc::new(cfg))?)
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("libris_core=warn".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        println!("Use 'libris --help' for commands");
        return Ok(());
    };
    let library = open_library(cli.data_dir)?;

    match command {
        Commands::List => {
            let entries = library.entries().list();
            if entries.is_empty() {
                println!("No files found.");
            }
            for entry in entries {
                println!(
                    "{}  [{}]  {:.2} MB  label: {}  uploaded: {}",
                    entry.name,
                    entry.category,
                    libris_core::size_in_mb(entry.size_bytes),
                    entry.label,
                    entry.upload_timestamp.to_rfc3339()
                );
            }
        }
        Commands::Info { name } => {
            let info = library.retrieval().file_info(&name)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Ingest { paths } => {
            let mut failed = 0;
            for path in paths {
                match library.ingest().ingest_path(&path) {
                    Ok(report) => match &report.original_name {
                        Some(original) => println!(
                            "Stored {} as {} ({}, sha256 {})",
                            original, report.name, report.category, report.content_hash
                        ),
                        None => println!(
                            "Stored {} ({}, sha256 {})",
                            report.name, report.category, report.content_hash
                        ),
                    },
                    Err(e) => {
                        failed += 1;
                        eprintln!("Error ingesting {}: {}", path.display(), e);
                        if let Some(detail) = e.detail() {
                            eprintln!("  {}", detail);
                        }
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} file(s) could not be ingested", failed);
            }
        }
        Commands::Update {
            name,
            scroll,
            label,
            tags,
            description,
        } => {
            let update = EntryUpdate {
                name: None,
                scroll_position: scroll,
                label,
                tags: tags.map(|t| {
                    t.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                }),
                description,
            };
            let entry = library.entries().update(&name, update)?;
            println!(
                "Updated {}: scroll {}, label {}",
                entry.name, entry.scroll_position, entry.label
            );
        }
        Commands::Delete { name } => {
            library.entries().delete(&name)?;
            println!("Deleted {}", name);
        }
        Commands::Reconcile { dry_run } => {
            let report = library.reconciler().run(dry_run)?;
            let verb = if dry_run { "Would prune" } else { "Pruned" };
            for name in &report.pruned {
                println!("{} entry {}", verb, name);
            }
            let verb = if dry_run { "Would adopt" } else { "Adopted" };
            for name in &report.adopted {
                println!("{} file {}", verb, name);
            }
            for name in &report.ignored {
                println!("Ignored {}", name);
            }
            if report.is_clean() {
                println!("Catalog and storage directory agree.");
            }
        }
    }

    Ok(())
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use vibe_library::codec::bundle::{self, BundleItem};
use vibe_library::codec::{envelope, png, Envelope};
use vibe_library::import::{self, CancelFlag, ImportOptions, ItemOutcome};
use vibe_library::{ConflictResolution, LibraryConfig, SaveOutcome, VibeLibrary, VibeParams};

/// Save, bundle and share vibe references
#[derive(Parser)]
#[command(name = "vibe-library")]
#[command(version, about = "Store, bundle and share image-derived vibe references", long_about = None)]
struct Cli {
    /// Library data directory (defaults to VIBE_LIBRARY_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Thumbnail cache directory (defaults to VIBE_LIBRARY_CACHE_DIR or the platform cache dir)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import vibe files, bundles, PNGs or folders of them
    Import {
        paths: Vec<PathBuf>,

        /// What to do when a different vibe already has the same name
        #[arg(long, value_enum, default_value_t = OnConflict::KeepBoth)]
        on_conflict: OnConflict,

        /// Save each vibe of a bundle as its own entry
        #[arg(long)]
        split_bundles: bool,
    },

    /// List saved vibes, newest first
    List {
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one entry
    Show { id: String },

    /// Print or write the share form of a saved vibe
    Export {
        id: String,

        #[arg(long, value_enum, default_value_t = ShareFormat::Base64)]
        format: ShareFormat,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Embed a saved vibe into a PNG
    Embed {
        id: String,
        png: PathBuf,
        out: PathBuf,
    },

    /// Create a bundle file from saved single vibes
    Bundle {
        title: String,
        out: PathBuf,
        ids: Vec<String>,
    },

    /// Print one vibe of a saved bundle, optionally saving it as its own entry
    Extract {
        id: String,
        index: usize,

        #[arg(long)]
        save: bool,
    },

    /// Delete an entry and its file
    Delete { id: String },

    Rename { id: String, name: String },

    /// Change strength / information extracted
    Params {
        id: String,
        #[arg(long)]
        strength: Option<f64>,
        #[arg(long)]
        info_extracted: Option<f64>,

        /// Start from the default values instead of the current ones
        #[arg(long)]
        reset: bool,
    },

    /// Mark or unmark an entry as favorite
    Favorite {
        id: String,
        #[arg(long)]
        off: bool,
    },

    Stats,

    /// Remove vibe files no entry points at
    Sweep,

    /// Delete every entry
    Clear {
        /// Required; clearing cannot be undone
        #[arg(long)]
        yes: bool,
    },

    /// Bring the catalog to the current schema and report what happened
    Migrate,
}

#[derive(Clone, Copy, ValueEnum)]
enum OnConflict {
    Skip,
    Overwrite,
    KeepBoth,
}

impl From<OnConflict> for ConflictResolution {
    fn from(value: OnConflict) -> Self {
        match value {
            OnConflict::Skip => ConflictResolution::Skip,
            OnConflict::Overwrite => ConflictResolution::Overwrite,
            OnConflict::KeepBoth => ConflictResolution::KeepBoth,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ShareFormat {
    Json,
    Base64,
    Url,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let library = VibeLibrary::open(config.clone())
        .map_err(|e| anyhow::anyhow!("{} ({})", e.user_message(), e))
        .with_context(|| format!("Failed to open vibe library at {}", config.data_dir.display()))?;

    match cli.command {
        Commands::Import {
            paths,
            on_conflict,
            split_bundles,
        } => {
            let files = expand_paths(&paths);
            if files.is_empty() {
                bail!("No files to import");
            }
            let mut options = ImportOptions::new(on_conflict.into());
            options.split_bundles = split_bundles;
            options.thumbnail_size = config.thumbnail_size;

            let library = Arc::new(library);
            let summary = import::import_files(
                Arc::clone(&library),
                files,
                options,
                |p| println!("[{}/{}] {}", p.completed, p.total, p.current),
                &CancelFlag::new(),
            )
            .await;

            for outcome in &summary.outcomes {
                match outcome {
                    ItemOutcome::Saved { name, outcome, .. } => println!("  {}: {}", name, describe(outcome)),
                    ItemOutcome::NeedsEncoding { path, .. } => {
                        println!("  {}: needs encoding before it can be saved", path.display())
                    }
                    ItemOutcome::Failed { path, error } => {
                        println!("  {}: {}", path.display(), error.user_message())
                    }
                }
            }
            println!("✅ Imported {} item(s), {} failed", summary.saved(), summary.failed());

            match Arc::try_unwrap(library) {
                Ok(library) => library.close()?,
                Err(_) => tracing::warn!("library still shared at exit; skipping checkpoint"),
            }
            return Ok(());
        }

        Commands::List { json } => {
            let entries = library.get_all_entries()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for e in &entries {
                    let kind = if e.is_bundle() {
                        format!("bundle of {}", e.bundled_vibe_count())
                    } else {
                        "vibe".to_string()
                    };
                    let star = if e.is_favorite { "★" } else { " " };
                    println!("{} {}  {:<32} {:<14} used {}×", star, e.id, e.name, kind, e.used_count);
                }
                println!("{} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
            }
        }

        Commands::Show { id } => {
            let entry = library
                .get_entry(&id)?
                .with_context(|| format!("No entry with id {}", id))?;
            println!("Name:           {}", entry.name);
            println!("Id:             {}", entry.id);
            println!("Strength:       {:.2}", entry.strength);
            println!("Info extracted: {:.2}", entry.info_extracted);
            println!("Used:           {} time(s)", entry.used_count);
            println!("Created:        {}", entry.created_at.to_rfc3339());
            if let Some(last) = entry.last_used_at {
                println!("Last used:      {}", last.to_rfc3339());
            }
            if let Some(path) = &entry.file_path {
                println!("File:           {}", path.display());
            }
            if !entry.is_bundle() {
                match library.load_reference(&id) {
                    Ok(reference) => println!("Source:         {:?}", reference.source_type()),
                    Err(e) => tracing::warn!(id = %id, error = %e, "could not load vibe file"),
                }
            }
            for (i, name) in entry.bundled_vibe_names.iter().enumerate() {
                println!("  [{}] {}", i, name);
            }
        }

        Commands::Export { id, format, out } => {
            let reference = library.load_reference(&id)?;
            let shared = match format {
                ShareFormat::Json => envelope::encode_to_json(&reference)?,
                ShareFormat::Base64 => envelope::encode_to_base64(&reference)?,
                ShareFormat::Url => envelope::encode_to_url_safe_base64(&reference)?,
            };
            match out {
                Some(path) => {
                    std::fs::write(&path, shared).with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("💾 Wrote {}", path.display());
                }
                None => println!("{}", shared),
            }
            library.increment_used_count(&id)?;
        }

        Commands::Embed { id, png: source, out } => {
            let reference = library.load_reference(&id)?;
            let bytes = std::fs::read(&source).with_context(|| format!("Failed to read {}", source.display()))?;
            let embedded = png::embed(&bytes, &Envelope::from_reference(&reference))?;
            std::fs::write(&out, embedded).with_context(|| format!("Failed to write {}", out.display()))?;
            println!("🖼️ Embedded '{}' into {}", reference.display_name, out.display());
        }

        Commands::Bundle { title, out, ids } => {
            if ids.is_empty() {
                bail!("A bundle needs at least one vibe");
            }
            let mut items = Vec::with_capacity(ids.len());
            for id in &ids {
                let reference = library.load_reference(id)?;
                let preview = library
                    .get_entry(id)?
                    .and_then(|e| e.thumbnail)
                    .unwrap_or_default();
                items.push(BundleItem { reference, preview });
            }
            let bytes = bundle::create(&title, &items)?;
            std::fs::write(&out, bytes).with_context(|| format!("Failed to write {}", out.display()))?;
            println!("📦 Bundled {} vibe(s) into {}", items.len(), out.display());
        }

        Commands::Extract { id, index, save } => {
            let reference = library
                .extract_from_bundle(&id, index)?
                .with_context(|| format!("Bundle {} has no vibe at index {}", id, index))?;
            if save {
                let outcome = library.save_reference(&reference, None, ConflictResolution::KeepBoth)?;
                println!("{}: {}", reference.display_name, describe(&outcome));
            } else {
                println!("{}", envelope::encode_to_base64(&reference)?);
            }
        }

        Commands::Delete { id } => {
            library.delete_entry(&id)?;
            println!("🗑️ Deleted {}", id);
        }

        Commands::Rename { id, name } => {
            let entry = library.rename_entry(&id, &name)?;
            println!("Renamed to '{}'", entry.name);
        }

        Commands::Params {
            id,
            strength,
            info_extracted,
            reset,
        } => {
            let mut current = library
                .get_entry(&id)?
                .with_context(|| format!("No entry with id {}", id))?
                .params();
            if reset {
                current.reset();
            }
            let params = VibeParams::new(
                strength.unwrap_or(current.strength),
                info_extracted.unwrap_or(current.info_extracted),
            );
            let entry = library.update_params(&id, params)?;
            println!(
                "'{}': strength {:.2}, info extracted {:.2}{}",
                entry.name,
                entry.strength,
                entry.info_extracted,
                if entry.params().is_default() { " (defaults)" } else { "" }
            );
        }

        Commands::Favorite { id, off } => {
            let entry = library.set_favorite(&id, !off)?;
            println!("'{}' favorite: {}", entry.name, entry.is_favorite);
        }

        Commands::Stats => {
            let stats = library.stats()?;
            println!("Entries:   {}", stats.entries);
            println!("Bundles:   {}", stats.bundles);
            println!("Favorites: {}", stats.favorites);
            println!("Uses:      {}", stats.total_uses);
            println!("On disk:   {} bytes", stats.file_bytes);
        }

        Commands::Sweep => {
            let removed = library.sweep_orphans()?;
            for path in &removed {
                println!("  removed {}", path.display());
            }
            println!("🧹 Removed {} orphan file(s)", removed.len());
        }

        Commands::Clear { yes } => {
            if !yes {
                bail!("Refusing to clear the library without --yes");
            }
            let removed = library.clear_all()?;
            println!("🧹 Removed {} entr{}", removed, if removed == 1 { "y" } else { "ies" });
        }

        Commands::Migrate => {
            let report = library.migration_report();
            println!(
                "{:?}: schema v{} -> v{} ({} record(s) migrated, {} skipped)",
                report.status, report.from_version, report.to_version, report.migrated, report.skipped
            );
        }
    }

    library.close()?;
    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<LibraryConfig> {
    let mut config = LibraryConfig::from_env().context("Could not determine a data directory; pass --data-dir")?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
        if cli.cache_dir.is_none() {
            config.cache_dir = dir.join("cache");
        }
    }
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = dir.clone();
    }
    Ok(config)
}

/// Files as given, folders walked recursively
fn expand_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            files.extend(
                WalkDir::new(path)
                    .follow_links(true)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file() && !is_hidden(e.path()))
                    .map(|e| e.into_path()),
            );
        } else {
            files.push(path.clone());
        }
    }
    files
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

fn describe(outcome: &SaveOutcome) -> String {
    match outcome {
        SaveOutcome::Created(id) => format!("saved as {}", id),
        SaveOutcome::Duplicate(id) => format!("already saved as {}, usage counted", id),
        SaveOutcome::Skipped(id) => format!("name taken by {}, skipped", id),
        SaveOutcome::Overwritten(id) => format!("replaced {}", id),
    }
}

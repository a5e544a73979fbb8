/// Bulk import of user-picked files
///
/// Decoding is pure and runs on the blocking pool, a few files ahead of
/// the save loop. Saving goes through the library strictly one item at a
/// time, with a progress report after each item and a cancellation check
/// before it and before each new decode.
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::{self, JoinHandle};

use crate::codec::envelope::MAX_PAYLOAD_BYTES;
use crate::codec::{bundle, envelope, png};
use crate::error::{CodecError, StorageError, StorageResult};
use crate::preview::{generate_thumbnail, THUMBNAIL_SIZE};
use crate::state::data::{VibeEncoding, VibeReference};
use crate::state::edit::VibeParams;
use crate::state::files::{BUNDLE_EXTENSION, VIBE_EXTENSION};
use crate::state::library::{ConflictResolution, SaveOutcome, VibeLibrary};

/// Turns a raw image into a vibe encoding (the paid step)
pub trait VibeEncoder: Send + Sync {
    fn encode(&self, image: &[u8], params: VibeParams) -> Result<VibeEncoding, CodecError>;
}

/// Shared cancellation switch checked between items
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Files decoded ahead of the save loop unless configured otherwise
pub const DECODE_AHEAD: usize = 4;

#[derive(Clone)]
pub struct ImportOptions {
    pub on_conflict: ConflictResolution,
    /// Raw images are reported as `NeedsEncoding` without one
    pub encoder: Option<Arc<dyn VibeEncoder>>,
    /// Save each vibe of a bundle as its own entry instead of one bundle entry
    pub split_bundles: bool,
    pub thumbnail_size: u32,
    /// How many files may be decoded (and held in memory) at once
    pub decode_ahead: usize,
}

impl ImportOptions {
    pub fn new(on_conflict: ConflictResolution) -> Self {
        Self {
            on_conflict,
            encoder: None,
            split_bundles: false,
            thumbnail_size: THUMBNAIL_SIZE,
            decode_ahead: DECODE_AHEAD,
        }
    }
}

/// One decoded unit of work
#[derive(Debug, Clone)]
pub enum DecodedItem {
    Vibe {
        reference: VibeReference,
        thumbnail: Option<Vec<u8>>,
        /// Found inside a PNG; the thumbnail shows the host image
        embedded: bool,
    },
    Bundle {
        name: String,
        bytes: Vec<u8>,
    },
}

#[derive(Debug)]
pub enum ItemOutcome {
    Saved {
        path: PathBuf,
        name: String,
        outcome: SaveOutcome,
    },
    /// Raw image awaiting the encode step; nothing was saved
    NeedsEncoding { path: PathBuf, reference: VibeReference },
    Failed { path: PathBuf, error: StorageError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportProgress {
    pub completed: usize,
    pub total: usize,
    pub current: String,
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub outcomes: Vec<ItemOutcome>,
    pub cancelled: bool,
    /// Files never saved because the import was cancelled first
    pub remaining: usize,
}

impl ImportSummary {
    pub fn saved(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::Saved { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::Failed { .. }))
            .count()
    }
}

/// Decode one file into the items it contains
///
/// Dispatch is by extension: vibe files and `.json`/`.txt` hold an
/// envelope, bundles are split or kept whole, PNGs are checked for an
/// embedded vibe, and any other image becomes a raw reference.
pub fn decode_file(path: &Path, options: &ImportOptions) -> StorageResult<Vec<DecodedItem>> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Imported vibe".to_string());
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let is_envelope = matches!(ext.as_str(), VIBE_EXTENSION | "json" | "txt");
    if is_envelope {
        // Envelopes are small; refuse a huge file before reading it
        let size = std::fs::metadata(path)
            .map_err(|e| StorageError::io("read import file", path, e))?
            .len();
        if size >= MAX_PAYLOAD_BYTES as u64 {
            return Err(CodecError::PayloadTooLarge {
                size: usize::try_from(size).unwrap_or(usize::MAX),
                limit: MAX_PAYLOAD_BYTES,
            }
            .into());
        }
    }
    let bytes = std::fs::read(path).map_err(|e| StorageError::io("read import file", path, e))?;

    let items = match ext.as_str() {
        _ if is_envelope => {
            let reference = envelope::decode_envelope_bytes(&bytes)?.into_reference()?;
            vec![vibe_item(reference, None, false, options)]
        }
        BUNDLE_EXTENSION => {
            if options.split_bundles {
                bundle::read_all(&bytes)?
                    .into_iter()
                    .map(|entry| {
                        let preview = Some(entry.preview).filter(|p| !p.is_empty());
                        vibe_item(entry.reference, preview, false, options)
                    })
                    .collect()
            } else {
                let title = bundle::title(&bytes)?;
                let name = if title.trim().is_empty() { stem } else { title };
                vec![DecodedItem::Bundle { name, bytes }]
            }
        }
        "png" => match png::extract_reference(&bytes)? {
            Some(reference) => {
                let thumbnail = thumbnail_or_none(&bytes, options.thumbnail_size);
                vec![vibe_item(reference, thumbnail, true, options)]
            }
            None => vec![raw_item(stem, bytes, options)?],
        },
        _ => vec![raw_item(stem, bytes, options)?],
    };
    Ok(items)
}

fn vibe_item(
    reference: VibeReference,
    thumbnail: Option<Vec<u8>>,
    embedded: bool,
    options: &ImportOptions,
) -> DecodedItem {
    // A raw envelope still carries its image; preview it
    let thumbnail = thumbnail.or_else(|| {
        reference
            .raw_image_data()
            .and_then(|image| thumbnail_or_none(image, options.thumbnail_size))
    });
    DecodedItem::Vibe {
        reference,
        thumbnail,
        embedded,
    }
}

fn raw_item(name: String, image: Vec<u8>, options: &ImportOptions) -> StorageResult<DecodedItem> {
    // Anything the image crate cannot read is not an importable image
    let thumbnail = generate_thumbnail(&image, options.thumbnail_size)?;
    Ok(DecodedItem::Vibe {
        reference: VibeReference::raw_image(name, image),
        thumbnail: Some(thumbnail),
        embedded: false,
    })
}

fn thumbnail_or_none(image: &[u8], size: u32) -> Option<Vec<u8>> {
    match generate_thumbnail(image, size) {
        Ok(thumb) => Some(thumb),
        Err(e) => {
            tracing::warn!(error = %e, "could not generate thumbnail");
            None
        }
    }
}

/// Import `paths` into the library
///
/// Up to `decode_ahead` files are decoded concurrently while earlier
/// items are saved in order. `progress` is called after every item.
/// `cancel` is checked before each save and before each new decode, so
/// a cancel never interrupts a save midway and stops further reads.
/// The reported total grows when a split bundle holds several vibes.
pub async fn import_files(
    library: Arc<VibeLibrary>,
    paths: Vec<PathBuf>,
    options: ImportOptions,
    mut progress: impl FnMut(ImportProgress),
    cancel: &CancelFlag,
) -> ImportSummary {
    tracing::info!(files = paths.len(), "📥 importing");

    let window = options.decode_ahead.max(1);
    let mut total = paths.len();
    let mut completed = 0;
    let mut pending = paths.into_iter();
    let mut decoding: VecDeque<(PathBuf, JoinHandle<StorageResult<Vec<DecodedItem>>>)> = VecDeque::new();
    let mut summary = ImportSummary::default();

    'files: loop {
        if cancel.is_cancelled() && (pending.len() > 0 || !decoding.is_empty()) {
            summary.cancelled = true;
            break;
        }
        while decoding.len() < window {
            let Some(path) = pending.next() else { break };
            let task_options = options.clone();
            let task_path = path.clone();
            let handle = task::spawn_blocking(move || decode_file(&task_path, &task_options));
            decoding.push_back((path, handle));
        }
        let Some((path, handle)) = decoding.pop_front() else { break };

        let items: Vec<StorageResult<DecodedItem>> = match handle.await {
            Ok(Ok(items)) => items.into_iter().map(Ok).collect(),
            Ok(Err(e)) => vec![Err(e)],
            Err(join) => vec![Err(StorageError::io(
                "decode import file",
                &path,
                std::io::Error::other(join.to_string()),
            ))],
        };
        // This file was counted once already
        total = total - 1 + items.len();

        let current = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        for item in items {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break 'files;
            }

            let outcome = match item {
                Ok(item) => save_item(&library, path.clone(), item, &options).await,
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "could not decode import file");
                    ItemOutcome::Failed {
                        path: path.clone(),
                        error,
                    }
                }
            };
            summary.outcomes.push(outcome);

            completed += 1;
            progress(ImportProgress {
                completed,
                total,
                current: current.clone(),
            });
        }
    }

    if summary.cancelled {
        summary.remaining = pending.len() + decoding.len();
        tracing::info!(completed, total, remaining = summary.remaining, "import cancelled");
    }
    tracing::info!(
        saved = summary.saved(),
        failed = summary.failed(),
        cancelled = summary.cancelled,
        "import finished"
    );
    summary
}

async fn save_item(library: &Arc<VibeLibrary>, path: PathBuf, item: DecodedItem, options: &ImportOptions) -> ItemOutcome {
    let work = match item {
        DecodedItem::Vibe {
            reference,
            thumbnail,
            embedded,
        } => {
            if !reference.is_encoded() && options.encoder.is_none() {
                return ItemOutcome::NeedsEncoding { path, reference };
            }
            SaveWork::Vibe {
                reference,
                thumbnail,
                embedded,
            }
        }
        DecodedItem::Bundle { name, bytes } => SaveWork::Bundle { name, bytes },
    };

    let library = Arc::clone(library);
    let encoder = options.encoder.clone();
    let on_conflict = options.on_conflict;
    let joined = task::spawn_blocking(move || work.run(&library, encoder.as_deref(), on_conflict)).await;

    match joined {
        Ok(Ok((name, outcome))) => ItemOutcome::Saved { path, name, outcome },
        Ok(Err(error)) => {
            tracing::warn!(path = %path.display(), error = %error, "could not save imported vibe");
            ItemOutcome::Failed { path, error }
        }
        Err(join) => {
            let error = StorageError::io("save import item", &path, std::io::Error::other(join.to_string()));
            ItemOutcome::Failed { path, error }
        }
    }
}

enum SaveWork {
    Vibe {
        reference: VibeReference,
        thumbnail: Option<Vec<u8>>,
        embedded: bool,
    },
    Bundle {
        name: String,
        bytes: Vec<u8>,
    },
}

impl SaveWork {
    fn run(
        self,
        library: &VibeLibrary,
        encoder: Option<&dyn VibeEncoder>,
        on_conflict: ConflictResolution,
    ) -> StorageResult<(String, SaveOutcome)> {
        match self {
            SaveWork::Vibe {
                mut reference,
                thumbnail,
                embedded,
            } => {
                if let Some(encoder) = encoder {
                    if let Some(image) = reference.raw_image_data() {
                        let encoding = encoder.encode(image, reference.params())?;
                        reference.complete_encoding(encoding);
                    }
                }
                let outcome = if embedded {
                    library.save_embedded_reference(&reference, thumbnail, on_conflict)?
                } else {
                    library.save_reference(&reference, thumbnail, on_conflict)?
                };
                Ok((reference.display_name, outcome))
            }
            SaveWork::Bundle { name, bytes } => {
                let outcome = library.save_bundle(&name, &bytes, on_conflict)?;
                Ok((name, outcome))
            }
        }
    }
}

//! Vibe library
//!
//! Capture, store, bundle and share vibe references: image-derived
//! encodings that condition image generation.
//!
//! - `codec`: share envelope, PNG embedding, bundle container
//! - `state`: catalog index, vibe files, migrations, the library service
//! - `preview`: thumbnails and content hashes
//! - `import`: concurrent decode, sequential save of user-picked files

pub mod codec;
pub mod config;
pub mod error;
pub mod import;
pub mod preview;
pub mod state;

#[cfg(test)]
mod test_support;

pub use config::LibraryConfig;
pub use error::{CodecError, StorageError};
pub use state::data::{VibeEncoding, VibeLibraryEntry, VibeReference, VibeSource};
pub use state::edit::VibeParams;
pub use state::library::{ConflictResolution, SaveOutcome, VibeLibrary};

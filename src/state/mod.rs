/// State management module
///
/// This module handles all persistent state, including:
/// - The SQLite catalog index (catalog.rs)
/// - Shared data structures (data.rs)
/// - Editable vibe parameters (edit.rs)
/// - Vibe and bundle files on disk (files.rs)
/// - Schema migrations of the catalog (migration.rs)
/// - The library service tying catalog and files together (library.rs)

pub mod catalog;
pub mod data;
pub mod edit;
pub mod files;
pub mod library;
pub mod migration;

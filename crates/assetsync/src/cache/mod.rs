//! # Blob Cache
//!
//! Durable, namespace-scoped storage for asset bytes. Every manifest
//! version owns one namespace; keys are asset paths (plus the cached
//! manifest document).

mod file;
mod memory;
mod provider;

pub use file::FileBlobCache;
pub use memory::MemoryBlobCache;
pub use provider::{BlobCache, validate_namespace};

/// Key under which the last good manifest document of a version is cached
pub const MANIFEST_KEY: &str = "manifest.json";

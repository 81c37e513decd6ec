//! S3-compatible media storage client (Cloudflare R2).
//!
//! The blob-store collaborator of the entitlement engine: content upload,
//! time-limited signed GET URLs, existence checks, and deletion.

pub mod client;
pub mod error;

pub use client::{media_key, MediaStorage, StorageConfig};
pub use error::{StorageError, StorageResult};

//! Firestore REST API client.
//!
//! The document-store collaborator of the entitlement engine. Provides:
//! - Keyed get/create/set/delete with typed wire values
//! - Per-field updates with a field mask and a delete-field sentinel
//! - Optimistic concurrency via the `updateTime` precondition
//! - Equality queries and paged listing
//! - Service-account auth with a cached, single-flight token
//! - Retry with exponential backoff and jitter

pub mod client;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod token_cache;
pub mod types;

pub use client::{FirestoreClient, FirestoreConfig};
pub use error::{FirestoreError, FirestoreResult};
pub use retry::RetryConfig;
pub use types::{Document, FieldWrite, FromFirestoreValue, ToFirestoreValue, Value};

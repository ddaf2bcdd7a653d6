//! # Infrastructure Adapters
//!
//! Concrete implementations of the storage ports:
//!
//! - [`InMemoryIdempotencyStore`] for [`IdempotencyStore`](crate::IdempotencyStore)
//! - [`InMemoryRetryStore`] and [`FilesystemRetryStore`] for [`RetryStore`](crate::RetryStore)
//!
//! The token store adapter lives next to the token cache in
//! [`auth`](crate::auth::InMemoryTokenStore).

pub mod filesystem_retry_store;
pub mod memory_idempotency;
pub mod memory_retry_store;

pub use filesystem_retry_store::FilesystemRetryStore;
pub use memory_idempotency::InMemoryIdempotencyStore;
pub use memory_retry_store::InMemoryRetryStore;

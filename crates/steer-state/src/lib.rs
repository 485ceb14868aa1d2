//! steer-state — embedded state store for Steer.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for backends, client sessions, and the observability event log.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Sessions carry a version counter and are written with compare-and-swap
//! (`upsert_session`), so two writers racing on one session never silently
//! overwrite each other: the loser gets `StateError::Conflict` and retries.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

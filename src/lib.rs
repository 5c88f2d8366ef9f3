// src/lib.rs
//! Content-addressed, tiered buffer cache for a node-based image compositor.
//!
//! A [`manager::CacheManager`] fronts two storage tiers — an in-memory tier for the
//! hot path and a disk tier for overflow and cross-session reuse — plus an
//! independent preview/viewer registry for UI-facing lookups. Entries are addressed
//! by [`keys::OpKey`], a content hash over an operation's type and inputs; a
//! secondary [`keys::PersistentKey`] lets a cache entry survive graph
//! recompilation when only a node's position (not its content) is what's stable.

pub mod base_convert;
pub mod config;
pub mod context_ext;
pub mod error;
pub mod keys;
pub mod manager;
pub mod tier;
pub mod time;
pub mod view_registry;

pub use config::CacheContext;
pub use error::{CacheError, Result};
pub use keys::{OpKey, PersistentKey, PixelType};
pub use manager::{CacheManager, CacheStats, GraphOp, OpKind};
pub use tier::{CacheBuffer, Mode};

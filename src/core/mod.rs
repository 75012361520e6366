//! Core domain types: entities, their on-disk document form, and the
//! content fingerprint used for change detection.

pub mod document;
pub mod entity;

pub use document::Document;
pub use entity::{
    CREATED_BY_KEY, Entity, EntityFields, EntityKind, SyncMeta, SyncStatus, fingerprint,
};

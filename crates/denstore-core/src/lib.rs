//! DenStore Core — quota-aware local persistence for a virtual pet
//!
//! A small storage engine for a virtual-pet application: one mutable
//! pet record, a capped append-only feeding history, and a capped
//! expression gallery, persisted as JSON in a size-constrained local
//! key-value store.
//!
//! # Architecture
//!
//! - **Save path**: buffer-first — saves coalesce per record kind
//!   behind a debounce window, with a batch-size fast path for the logs
//! - **Read path**: synchronous against the current backing surface,
//!   self-healing anything corrupted to absent/empty
//! - **Capacity**: accounted usage over a byte budget triggers minified
//!   rewrites, then oldest-first pruning of the logs
//! - **Fallback**: an unavailable or failing backing store switches the
//!   engine one-way to a process-lifetime in-memory mirror
//!
//! # No UI assumptions
//!
//! This crate has no rendering, animation, or service-call concerns.
//! Pet lifecycle logic lives in separate crates (e.g. denstore-pet).

pub mod backend;
pub mod buffer;
pub mod capacity;
pub mod config;
pub mod engine;
pub mod error;
pub mod records;
pub mod transfer;

// Re-export key types for convenience
pub use backend::{Backend, FileBackend, MemoryBackend};
pub use buffer::{ArmState, AutoflushHandle, FlushTracker, PendingFlush, WriteBuffer};
pub use capacity::CapacityReport;
pub use config::Config;
pub use engine::DenStoreEngine;
pub use error::{DenError, DenResult};
pub use records::{
    validate_expression, validate_feeding, validate_pet, ArtExpression, EmotionVector,
    Expression, FeedingRecord, PetState, PoetryExpression, RecordViolation, Stage,
    EMOTION_NAMES,
};
pub use transfer::StorageDocument;

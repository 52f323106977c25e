//! Pet lifecycle adapter for DenStore
//!
//! Implements the feeding/state-management logic of the virtual pet
//! over DenStore's persistence engine.
//!
//! # Architecture
//!
//! The engine owns persistence: debounced writes, capacity limits,
//! fallback. This crate owns the domain rules layered on top:
//! - Adopting a new pet or restoring the persisted one
//! - Feeding: tokenizing input, recording the analyzed emotion delta,
//!   accumulating it into the pet, evolving the growth stage
//! - Emotion decay over elapsed time
//! - Expression creation (art and poetry), gated on the evolved stage

pub mod keeper;

pub use keeper::{FeedingOutcome, KeeperError, PetKeeper, DECAY_PER_HOUR, EVOLUTION_FEEDING_COUNT};

//! Pet lifecycle over the DenStore engine
//!
//! `PetKeeper` is the single writer of pet domain state. Every mutation
//! goes through the engine's record-store operations, so the write
//! buffer, capacity limits, and fallback behavior all apply unchanged.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use denstore_core::{
    ArtExpression, DenStoreEngine, EmotionVector, Expression, FeedingRecord, PetState,
    PoetryExpression, Stage,
};

/// Feedings required before the pet evolves to stage 2.
pub const EVOLUTION_FEEDING_COUNT: u32 = 10;

/// Emotion decay applied per elapsed hour since the last update.
pub const DECAY_PER_HOUR: f64 = 0.05;

/// Domain errors surfaced by the keeper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeeperError {
    /// Expression generation is gated on the evolved stage
    StageLocked {
        /// The pet's current stage
        stage: Stage,
    },
    /// Poetry must carry 3 to 5 lines
    MalformedPoetry {
        /// Number of lines offered
        lines: usize,
    },
}

impl fmt::Display for KeeperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeeperError::StageLocked { stage } => {
                write!(f, "expression generation locked at stage {}", u8::from(*stage))
            }
            KeeperError::MalformedPoetry { lines } => {
                write!(f, "poetry needs 3 to 5 lines, got {}", lines)
            }
        }
    }
}

impl Error for KeeperError {}

/// Outcome of one completed feeding.
#[derive(Debug, Clone)]
pub struct FeedingOutcome {
    /// The pet after the feeding was applied
    pub pet: PetState,
    /// The appended history record
    pub record: FeedingRecord,
    /// Whether this feeding triggered the stage transition
    pub evolved: bool,
}

/// Pet lifecycle logic over a shared engine.
pub struct PetKeeper {
    engine: Arc<DenStoreEngine>,
}

impl PetKeeper {
    pub fn new(engine: Arc<DenStoreEngine>) -> Self {
        Self { engine }
    }

    /// The underlying engine, for diagnostics and export/import.
    pub fn engine(&self) -> &DenStoreEngine {
        &self.engine
    }

    /// Load the persisted pet, or create and save a fresh one.
    pub fn adopt_or_restore(&self) -> PetState {
        if let Some(pet) = self.engine.load_pet() {
            return pet;
        }
        let now = now_ms();
        let pet = PetState {
            id: Uuid::new_v4().to_string(),
            stage: Stage::Hatchling,
            feeding_count: 0,
            emotion_vector: EmotionVector::zero(now),
            created_at: now,
        };
        self.engine.save_pet(pet.clone());
        pet
    }

    /// Complete one feeding.
    ///
    /// Records the analyzed `delta` as history (the delta, not the
    /// accumulated total), merges it clamped into the pet's vector,
    /// bumps the feeding count, and applies the 1 → 2 stage transition
    /// exactly once when the count reaches the threshold.
    pub fn feed(&self, pet: &PetState, input_text: &str, delta: EmotionVector) -> FeedingOutcome {
        let now = now_ms();
        let record = FeedingRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: now,
            input_text: input_text.to_string(),
            words: tokenize(input_text),
            emotion_analysis: EmotionVector { last_updated: now, ..delta },
        };

        let mut next = pet.clone();
        next.emotion_vector = pet.emotion_vector.accumulate(&delta, now);
        next.feeding_count = pet.feeding_count + 1;

        let evolved =
            next.stage == Stage::Hatchling && next.feeding_count >= EVOLUTION_FEEDING_COUNT;
        if evolved {
            next.stage = Stage::Evolved;
        }

        self.engine.save_feeding_record(record.clone());
        self.engine.save_pet(next.clone());

        FeedingOutcome { pet: next, record, evolved }
    }

    /// Decay each emotion toward zero for the time elapsed since the
    /// vector's last update, and persist the result.
    pub fn apply_decay(&self, pet: &PetState, now_ms: i64) -> PetState {
        let elapsed_ms = (now_ms - pet.emotion_vector.last_updated).max(0);
        let hours = elapsed_ms as f64 / 3_600_000.0;
        let amount = DECAY_PER_HOUR * hours;

        let mut next = pet.clone();
        next.emotion_vector = pet.emotion_vector.decayed(amount, now_ms);
        self.engine.save_pet(next.clone());
        next
    }

    /// Save a generated artwork expression.
    ///
    /// The dominant emotion is snapshotted from the pet at call time.
    pub fn record_art(
        &self,
        pet: &PetState,
        image_url: &str,
        prompt: &str,
    ) -> Result<Expression, KeeperError> {
        self.require_evolved(pet)?;
        let expression = Expression::Art(ArtExpression {
            id: Uuid::new_v4().to_string(),
            timestamp: now_ms(),
            image_url: image_url.to_string(),
            prompt: prompt.to_string(),
            dominant_emotion: pet.emotion_vector.dominant().to_string(),
        });
        self.engine.save_expression(expression.clone());
        Ok(expression)
    }

    /// Save a generated poetry expression with the pet's full emotion
    /// snapshot as context.
    pub fn record_poetry(
        &self,
        pet: &PetState,
        lines: Vec<String>,
        source_text: &str,
    ) -> Result<Expression, KeeperError> {
        self.require_evolved(pet)?;
        if !(3..=5).contains(&lines.len()) {
            return Err(KeeperError::MalformedPoetry { lines: lines.len() });
        }
        let expression = Expression::Poetry(PoetryExpression {
            id: Uuid::new_v4().to_string(),
            timestamp: now_ms(),
            lines,
            source_text: source_text.to_string(),
            emotion_context: pet.emotion_vector,
        });
        self.engine.save_expression(expression.clone());
        Ok(expression)
    }

    fn require_evolved(&self, pet: &PetState) -> Result<(), KeeperError> {
        if pet.stage != Stage::Evolved {
            return Err(KeeperError::StageLocked { stage: pet.stage });
        }
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn tokenize(input: &str) -> Vec<String> {
    input.split_whitespace().map(str::to_owned).collect()
}

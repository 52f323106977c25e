//! Record kinds and wire shapes for DenStore
//!
//! Everything the engine persists is one of the three record kinds here,
//! serialized as camelCase JSON. Each kind has exactly one validator,
//! shared by the load path and the import path so the two can never
//! drift apart.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Names of the seven tracked emotions, in wire order
pub const EMOTION_NAMES: [&str; 7] =
    ["joy", "sadness", "anger", "fear", "surprise", "disgust", "love"];

/// Seven-dimensional accumulated emotion state, each axis in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotionVector {
    pub joy: f64,
    pub sadness: f64,
    pub anger: f64,
    pub fear: f64,
    pub surprise: f64,
    pub disgust: f64,
    pub love: f64,
    /// Milliseconds since epoch of the last mutation
    pub last_updated: i64,
}

impl EmotionVector {
    /// All-zero vector stamped at `now_ms`.
    pub fn zero(now_ms: i64) -> Self {
        Self {
            joy: 0.0,
            sadness: 0.0,
            anger: 0.0,
            fear: 0.0,
            surprise: 0.0,
            disgust: 0.0,
            love: 0.0,
            last_updated: now_ms,
        }
    }

    /// Axis values paired with their wire names, in wire order.
    pub fn axes(&self) -> [(&'static str, f64); 7] {
        [
            ("joy", self.joy),
            ("sadness", self.sadness),
            ("anger", self.anger),
            ("fear", self.fear),
            ("surprise", self.surprise),
            ("disgust", self.disgust),
            ("love", self.love),
        ]
    }

    /// Add `delta` axis-wise, clamping every axis to [0, 1].
    pub fn accumulate(&self, delta: &EmotionVector, now_ms: i64) -> Self {
        Self {
            joy: clamp01(self.joy + delta.joy),
            sadness: clamp01(self.sadness + delta.sadness),
            anger: clamp01(self.anger + delta.anger),
            fear: clamp01(self.fear + delta.fear),
            surprise: clamp01(self.surprise + delta.surprise),
            disgust: clamp01(self.disgust + delta.disgust),
            love: clamp01(self.love + delta.love),
            last_updated: now_ms,
        }
    }

    /// Subtract `amount` from every axis, floored at zero.
    pub fn decayed(&self, amount: f64, now_ms: i64) -> Self {
        Self {
            joy: (self.joy - amount).max(0.0),
            sadness: (self.sadness - amount).max(0.0),
            anger: (self.anger - amount).max(0.0),
            fear: (self.fear - amount).max(0.0),
            surprise: (self.surprise - amount).max(0.0),
            disgust: (self.disgust - amount).max(0.0),
            love: (self.love - amount).max(0.0),
            last_updated: now_ms,
        }
    }

    /// Name of the strongest axis; earlier wire order wins ties.
    pub fn dominant(&self) -> &'static str {
        let mut best = ("joy", f64::MIN);
        for (name, value) in self.axes() {
            if value > best.1 {
                best = (name, value);
            }
        }
        best.0
    }
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Growth stage of the pet. Transitions 1 → 2 only, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Stage {
    /// Initial stage, expression generation locked
    Hatchling,
    /// Evolved stage, all capabilities active
    Evolved,
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> u8 {
        match stage {
            Stage::Hatchling => 1,
            Stage::Evolved => 2,
        }
    }
}

impl TryFrom<u8> for Stage {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Stage::Hatchling),
            2 => Ok(Stage::Evolved),
            other => Err(format!("invalid stage: {}", other)),
        }
    }
}

/// The singleton pet record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PetState {
    /// Opaque unique identifier, assigned once at creation
    pub id: String,
    pub stage: Stage,
    /// Completed feedings over the pet's lifetime
    pub feeding_count: u32,
    pub emotion_vector: EmotionVector,
    /// Milliseconds since epoch, immutable after creation
    pub created_at: i64,
}

/// One completed feeding, never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedingRecord {
    pub id: String,
    pub timestamp: i64,
    /// Raw text that produced this feeding
    pub input_text: String,
    /// Tokens derived from `input_text`
    pub words: Vec<String>,
    /// The analyzed delta for this feeding, not the accumulated state
    pub emotion_analysis: EmotionVector,
}

/// An expression the pet produced.
///
/// Variants are discriminated structurally on the wire: art carries
/// `imageUrl`, poetry carries `lines`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expression {
    Art(ArtExpression),
    Poetry(PoetryExpression),
}

impl Expression {
    pub fn id(&self) -> &str {
        match self {
            Expression::Art(art) => &art.id,
            Expression::Poetry(poetry) => &poetry.id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Expression::Art(art) => art.timestamp,
            Expression::Poetry(poetry) => poetry.timestamp,
        }
    }
}

/// Generated artwork variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtExpression {
    pub id: String,
    pub timestamp: i64,
    /// Self-contained encoded image payload
    pub image_url: String,
    /// Text used to generate the image
    pub prompt: String,
    /// Name of the strongest emotion at generation time
    pub dominant_emotion: String,
}

/// Generated poetry variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoetryExpression {
    pub id: String,
    pub timestamp: i64,
    /// 3 to 5 lines
    pub lines: Vec<String>,
    pub source_text: String,
    /// Full emotion snapshot at generation time
    pub emotion_context: EmotionVector,
}

/// A structural invariant violated by a record.
///
/// Load paths treat any violation as corruption (delete the key, return
/// absent); the import path treats it as a rejection signal.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordViolation {
    pub field: &'static str,
    pub reason: String,
}

impl fmt::Display for RecordViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

fn check_axes(vector: &EmotionVector) -> Result<(), RecordViolation> {
    for (name, value) in vector.axes() {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(RecordViolation {
                field: "emotionVector",
                reason: format!("{} out of range: {}", name, value),
            });
        }
    }
    Ok(())
}

/// Validate the pet record's structural invariants.
pub fn validate_pet(pet: &PetState) -> Result<(), RecordViolation> {
    if pet.id.is_empty() {
        return Err(RecordViolation { field: "id", reason: "empty".to_string() });
    }
    if pet.created_at < 0 {
        return Err(RecordViolation {
            field: "createdAt",
            reason: format!("negative timestamp: {}", pet.created_at),
        });
    }
    check_axes(&pet.emotion_vector)
}

/// Validate one feeding record.
pub fn validate_feeding(record: &FeedingRecord) -> Result<(), RecordViolation> {
    if record.id.is_empty() {
        return Err(RecordViolation { field: "id", reason: "empty".to_string() });
    }
    if record.timestamp < 0 {
        return Err(RecordViolation {
            field: "timestamp",
            reason: format!("negative timestamp: {}", record.timestamp),
        });
    }
    check_axes(&record.emotion_analysis)
}

/// Validate one expression of either variant.
pub fn validate_expression(expression: &Expression) -> Result<(), RecordViolation> {
    if expression.id().is_empty() {
        return Err(RecordViolation { field: "id", reason: "empty".to_string() });
    }
    match expression {
        Expression::Art(art) => {
            if art.image_url.is_empty() {
                return Err(RecordViolation { field: "imageUrl", reason: "empty".to_string() });
            }
            Ok(())
        }
        Expression::Poetry(poetry) => {
            if !(3..=5).contains(&poetry.lines.len()) {
                return Err(RecordViolation {
                    field: "lines",
                    reason: format!("expected 3 to 5 lines, got {}", poetry.lines.len()),
                });
            }
            check_axes(&poetry.emotion_context)
        }
    }
}

//! Export/import — one-document transfer of the whole store
//!
//! The export document is the wire format for moving a pet between
//! instances: `{ "pet": ..., "feedingHistory": [...], "expressions": [...] }`.
//! Import is all-or-nothing: a document that fails to parse or carries
//! any invalid record is rejected without touching existing state.

use serde::{Deserialize, Serialize};

use crate::error::{DenError, DenResult};
use crate::records::{
    validate_expression, validate_feeding, validate_pet, Expression, FeedingRecord, PetState,
    RecordViolation,
};

/// Top-level wire fields every import document must carry.
const REQUIRED_FIELDS: [&str; 3] = ["pet", "feedingHistory", "expressions"];

/// Transient transfer document; never persisted as its own entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDocument {
    pub pet: Option<PetState>,
    pub feeding_history: Vec<FeedingRecord>,
    pub expressions: Vec<Expression>,
}

impl StorageDocument {
    /// Serialize for export.
    pub fn to_export_string(&self) -> DenResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse an import payload.
    ///
    /// Rejects anything that is not a JSON object carrying all three
    /// top-level fields — `Option` and `Vec` would otherwise silently
    /// default, and a wrong-shaped document must not wipe a store.
    pub fn parse(text: &str) -> DenResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let object = value.as_object().ok_or_else(|| DenError::Serde {
            key: None,
            reason: "top level is not an object".to_string(),
        })?;
        for field in REQUIRED_FIELDS {
            if !object.contains_key(field) {
                return Err(DenError::Serde {
                    key: None,
                    reason: format!("missing top-level field: {}", field),
                });
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Validate every contained record with the shared validators —
    /// the same checks the load path applies.
    pub fn validate(&self) -> Result<(), RecordViolation> {
        if let Some(pet) = &self.pet {
            validate_pet(pet)?;
        }
        for record in &self.feeding_history {
            validate_feeding(record)?;
        }
        for expression in &self.expressions {
            validate_expression(expression)?;
        }
        Ok(())
    }
}

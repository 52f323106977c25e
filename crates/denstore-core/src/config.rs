//! Configuration management for DenStore
//!
//! Provides presets for common deployment footprints and validation
//! of every tunable's legal range.

use std::time::Duration;

/// DenStore configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Key-space prefix for every persisted key (`<prefix>.pet`, ...)
    pub key_prefix: String,
    /// Total byte budget for persisted data (two bytes per UTF-16 unit)
    pub byte_budget: u64,
    /// Compact stores when usage exceeds this fraction of the budget
    pub compact_trigger_ratio: f64,
    /// Fraction of each append log kept (most recent first) by a prune pass
    pub prune_keep_ratio: f64,
    /// Quiet period before a pending write flushes
    pub debounce_window: Duration,
    /// Pending log length that triggers an immediate flush
    pub batch_flush_threshold: usize,
    /// Maximum retained feeding records
    pub max_feeding_records: usize,
    /// Maximum retained expressions
    pub max_expressions: usize,
}

impl Config {
    /// Standard profile: the 5 MiB budget of a browser-class local store.
    pub fn standard() -> Self {
        Self {
            key_prefix: "denstore".to_string(),
            byte_budget: 5 * 1024 * 1024,
            compact_trigger_ratio: 0.8,
            prune_keep_ratio: 0.8,
            debounce_window: Duration::from_millis(500),
            batch_flush_threshold: 10,
            max_feeding_records: 1000,
            max_expressions: 500,
        }
    }

    /// Constrained profile: tight budget, earlier compaction, smaller logs.
    pub fn constrained() -> Self {
        Self {
            key_prefix: "denstore".to_string(),
            byte_budget: 1024 * 1024,
            compact_trigger_ratio: 0.7,
            prune_keep_ratio: 0.7,
            debounce_window: Duration::from_millis(250),
            batch_flush_threshold: 5,
            max_feeding_records: 200,
            max_expressions: 100,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.key_prefix.is_empty() {
            return Err("key_prefix must not be empty".into());
        }
        if self.byte_budget == 0 {
            return Err("byte_budget must be > 0".into());
        }
        if self.compact_trigger_ratio <= 0.0 || self.compact_trigger_ratio >= 1.0 {
            return Err("compact_trigger_ratio must be in (0.0, 1.0)".into());
        }
        if self.prune_keep_ratio <= 0.0 || self.prune_keep_ratio >= 1.0 {
            return Err("prune_keep_ratio must be in (0.0, 1.0)".into());
        }
        if self.debounce_window.as_millis() == 0 {
            return Err("debounce_window must be > 0".into());
        }
        if self.batch_flush_threshold < 2 {
            return Err("batch_flush_threshold must be >= 2".into());
        }
        if self.max_feeding_records == 0 || self.max_expressions == 0 {
            return Err("record caps must be > 0".into());
        }
        Ok(())
    }

    /// Key under which the pet record is persisted.
    pub fn pet_key(&self) -> String {
        format!("{}.pet", self.key_prefix)
    }

    /// Key under which the feeding history is persisted.
    pub fn feeding_key(&self) -> String {
        format!("{}.feedingHistory", self.key_prefix)
    }

    /// Key under which the expression gallery is persisted.
    pub fn expressions_key(&self) -> String {
        format!("{}.expressions", self.key_prefix)
    }
}

impl Default for Config {
    fn default() -> Self { Self::standard() }
}

//! Integration tests: the pet lifecycle over a real file-backed engine.
//!
//! These exercise the full keeper -> engine -> backend pipeline:
//! feeding and evolution, debounced persistence, capacity caps,
//! export/import, and the memory fallback.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use denstore_core::{Config, DenStoreEngine, EmotionVector, Expression, Stage};
use denstore_pet::{PetKeeper, EVOLUTION_FEEDING_COUNT};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_config() -> Config {
    let mut config = Config::standard();
    config.debounce_window = Duration::from_millis(40);
    config
}

fn test_keeper() -> (PetKeeper, TempDir) {
    let dir = TempDir::new().unwrap();
    let engine = DenStoreEngine::open(dir.path(), fast_config());
    (PetKeeper::new(Arc::new(engine)), dir)
}

fn joy_delta(amount: f64) -> EmotionVector {
    EmotionVector { joy: amount, ..EmotionVector::zero(0) }
}

// ---------------------------------------------------------------------------
// The feeding scenario
// ---------------------------------------------------------------------------

#[test]
fn test_ten_feedings_cap_joy_and_evolve_once() {
    let (keeper, _dir) = test_keeper();
    let mut pet = keeper.adopt_or_restore();

    let mut evolutions = 0;
    for n in 1..=10u32 {
        let outcome = keeper.feed(&pet, "a little treat", joy_delta(0.1));
        pet = outcome.pet;
        if outcome.evolved {
            evolutions += 1;
            assert_eq!(n, EVOLUTION_FEEDING_COUNT);
        }
    }
    keeper.engine().flush_all();

    let loaded = keeper.engine().load_pet().unwrap();
    assert!((loaded.emotion_vector.joy - 1.0).abs() < 1e-9, "joy must cap at 1.0");
    assert_eq!(loaded.feeding_count, 10);
    assert_eq!(loaded.stage, Stage::Evolved);
    assert_eq!(evolutions, 1, "stage transition must be applied exactly once");

    // Every feeding left its delta snapshot in the history
    let history = keeper.engine().feeding_history(100);
    assert_eq!(history.len(), 10);
    for record in &history {
        assert!((record.emotion_analysis.joy - 0.1).abs() < 1e-12);
    }
}

#[test]
fn test_restore_after_restart() {
    let dir = TempDir::new().unwrap();
    let pet_id;
    {
        let keeper = PetKeeper::new(Arc::new(DenStoreEngine::open(dir.path(), fast_config())));
        let pet = keeper.adopt_or_restore();
        pet_id = pet.id.clone();
        keeper.feed(&pet, "welcome snack", joy_delta(0.3));
        keeper.engine().flush_all();
    }
    {
        let keeper = PetKeeper::new(Arc::new(DenStoreEngine::open(dir.path(), fast_config())));
        let restored = keeper.adopt_or_restore();
        assert_eq!(restored.id, pet_id);
        assert_eq!(restored.feeding_count, 1);
        assert_eq!(keeper.engine().feeding_history(10).len(), 1);
    }
}

// ---------------------------------------------------------------------------
// Write coalescing
// ---------------------------------------------------------------------------

#[test]
fn test_rapid_feedings_coalesce_writes() {
    let (keeper, _dir) = test_keeper();
    let mut pet = keeper.adopt_or_restore();

    // Five feedings inside the debounce window: five pet saves
    // supersede to one, five records batch into one list write.
    for _ in 0..5 {
        pet = keeper.feed(&pet, "bite", joy_delta(0.05)).pet;
    }
    keeper.engine().flush_all();

    assert_eq!(keeper.engine().backend_writes(), 2, "one write per record kind");
    assert_eq!(keeper.engine().load_pet().unwrap().feeding_count, 5);
    assert_eq!(keeper.engine().feeding_history(10).len(), 5);
}

#[test]
fn test_autoflush_persists_without_explicit_flush() {
    let (keeper, _dir) = test_keeper();
    keeper.engine().start_autoflush().unwrap();

    let pet = keeper.adopt_or_restore();
    keeper.feed(&pet, "supper", joy_delta(0.2));
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(keeper.engine().load_pet().unwrap().feeding_count, 1);
    assert_eq!(keeper.engine().feeding_history(10).len(), 1);
    keeper.engine().stop_autoflush();
}

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

#[test]
fn test_history_cap_keeps_most_recent() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config();
    config.max_feeding_records = 20;
    let keeper = PetKeeper::new(Arc::new(DenStoreEngine::open(dir.path(), config)));

    let mut pet = keeper.adopt_or_restore();
    for n in 0..30 {
        pet = keeper.feed(&pet, &format!("meal {}", n), joy_delta(0.01)).pet;
    }
    keeper.engine().flush_all();

    let history = keeper.engine().feeding_history(100);
    assert_eq!(history.len(), 20);
    assert_eq!(history.first().unwrap().input_text, "meal 10");
    assert_eq!(history.last().unwrap().input_text, "meal 29");
    // The pet record is untouched by eviction
    assert_eq!(keeper.engine().load_pet().unwrap().feeding_count, 30);
}

#[test]
fn test_prune_old_data_keeps_recent_entries() {
    let (keeper, _dir) = test_keeper();
    let mut pet = keeper.adopt_or_restore();
    for n in 0..10 {
        pet = keeper.feed(&pet, &format!("meal {}", n), joy_delta(0.01)).pet;
    }

    let report = keeper.engine().prune_old_data();
    assert_eq!(report.pruned_feedings, 2);

    let history = keeper.engine().feeding_history(100);
    assert_eq!(history.len(), 8);
    assert_eq!(history.first().unwrap().input_text, "meal 2");
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[test]
fn test_expression_gallery_after_evolution() {
    let (keeper, _dir) = test_keeper();
    let mut pet = keeper.adopt_or_restore();

    // Locked while a hatchling
    assert!(keeper.record_art(&pet, "data:image/png;base64,AAAA", "first portrait").is_err());

    for _ in 0..EVOLUTION_FEEDING_COUNT {
        pet = keeper.feed(&pet, "grow", joy_delta(0.1)).pet;
    }
    assert_eq!(pet.stage, Stage::Evolved);

    keeper.record_art(&pet, "data:image/png;base64,AAAA", "first portrait").unwrap();
    let lines = vec!["soft paws".to_string(), "warm sun".to_string(), "long nap".to_string()];
    keeper.record_poetry(&pet, lines, "afternoon").unwrap();
    keeper.engine().flush_all();

    let gallery = keeper.engine().expressions(10);
    assert_eq!(gallery.len(), 2);
    assert!(matches!(gallery[0], Expression::Art(_)));
    assert!(matches!(gallery[1], Expression::Poetry(_)));
}

// ---------------------------------------------------------------------------
// Export / import
// ---------------------------------------------------------------------------

#[test]
fn test_export_import_moves_whole_pet() {
    let (keeper, _dir) = test_keeper();
    let mut pet = keeper.adopt_or_restore();
    for _ in 0..EVOLUTION_FEEDING_COUNT {
        pet = keeper.feed(&pet, "grow", joy_delta(0.1)).pet;
    }
    keeper.record_art(&pet, "data:image/png;base64,AAAA", "portrait").unwrap();
    let exported = keeper.engine().export_data().unwrap();

    let (other, _dir2) = test_keeper();
    assert!(other.engine().import_data(&exported));

    let migrated = other.adopt_or_restore();
    assert_eq!(migrated.id, pet.id);
    assert_eq!(migrated.feeding_count, 10);
    assert_eq!(migrated.stage, Stage::Evolved);
    assert_eq!(other.engine().feeding_history(100).len(), 10);
    assert_eq!(other.engine().expressions(100).len(), 1);
}

#[test]
fn test_import_rejection_leaves_pet_alone() {
    let (keeper, _dir) = test_keeper();
    let pet = keeper.adopt_or_restore();
    keeper.engine().flush_all();

    assert!(!keeper.engine().import_data("{ not valid json"));
    assert!(!keeper.engine().import_data(r#"{"pet": 42}"#));

    let unchanged = keeper.engine().load_pet().unwrap();
    assert_eq!(unchanged.id, pet.id);
}

// ---------------------------------------------------------------------------
// Degraded modes
// ---------------------------------------------------------------------------

#[test]
fn test_memory_fallback_keeps_pet_usable() {
    let dir = TempDir::new().unwrap();
    // Quota of zero fails the availability probe outright
    let engine = DenStoreEngine::open_with_quota(dir.path(), fast_config(), 0);
    let keeper = PetKeeper::new(Arc::new(engine));
    assert!(keeper.engine().is_memory_only());

    let mut pet = keeper.adopt_or_restore();
    pet = keeper.feed(&pet, "still hungry", joy_delta(0.2)).pet;
    keeper.engine().flush_all();

    assert_eq!(keeper.engine().load_pet().unwrap().feeding_count, pet.feeding_count);
    assert_eq!(keeper.engine().feeding_history(10).len(), 1);
}

#[test]
fn test_corrupted_pet_record_recovers_to_fresh_pet() {
    let (keeper, dir) = test_keeper();
    let first = keeper.adopt_or_restore();
    keeper.engine().flush_all();

    std::fs::write(dir.path().join("denstore.pet"), "garbage").unwrap();

    // Self-heal: the corrupted record is gone, adoption starts over
    let second = keeper.adopt_or_restore();
    assert_ne!(second.id, first.id);
    assert_eq!(second.feeding_count, 0);
}

#[test]
fn test_reset_all_clears_everything() {
    let (keeper, _dir) = test_keeper();
    let mut pet = keeper.adopt_or_restore();
    for _ in 0..3 {
        pet = keeper.feed(&pet, "meal", joy_delta(0.1)).pet;
    }
    keeper.engine().flush_all();

    keeper.engine().reset_all();
    assert!(keeper.engine().load_pet().is_none());
    assert!(keeper.engine().feeding_history(10).is_empty());
    assert_eq!(keeper.engine().storage_size(), 0);
}

//! Write buffer and batching scheduler
//!
//! Coalesces rapid successive saves into one flush per record kind.
//! Each kind holds a pending slot and an arm state; every save re-arms
//! the debounce deadline, and an append log that reaches the batch
//! threshold flushes immediately. The batch transition disarms the
//! deadline before the flush runs, so a superseded deadline can never
//! fire a redundant second flush.
//!
//! The state machine is pure over caller-supplied instants: scheduling
//! is unit-testable by passing synthetic `Instant`s, no sleeping.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::records::{Expression, FeedingRecord, PetState};

/// Arm state of one record kind's debounce timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmState {
    Idle,
    Armed { deadline: Instant },
}

impl ArmState {
    fn due(&self, now: Instant) -> bool {
        match self {
            ArmState::Idle => false,
            ArmState::Armed { deadline } => *deadline <= now,
        }
    }
}

/// Pending data handed to the engine for one flush pass.
#[derive(Debug, Default)]
pub struct PendingFlush {
    /// Latest pending pet, if one is due (supersedes, never queues)
    pub pet: Option<PetState>,
    pub feedings: Vec<FeedingRecord>,
    pub expressions: Vec<Expression>,
}

impl PendingFlush {
    pub fn is_empty(&self) -> bool {
        self.pet.is_none() && self.feedings.is_empty() && self.expressions.is_empty()
    }
}

/// Per-record-kind coalescing buffer.
pub struct WriteBuffer {
    debounce_window: Duration,
    batch_threshold: usize,
    pet: Option<PetState>,
    pet_arm: ArmState,
    feedings: Vec<FeedingRecord>,
    feedings_arm: ArmState,
    expressions: Vec<Expression>,
    expressions_arm: ArmState,
}

impl WriteBuffer {
    pub fn new(debounce_window: Duration, batch_threshold: usize) -> Self {
        Self {
            debounce_window,
            batch_threshold,
            pet: None,
            pet_arm: ArmState::Idle,
            feedings: Vec::new(),
            feedings_arm: ArmState::Idle,
            expressions: Vec::new(),
            expressions_arm: ArmState::Idle,
        }
    }

    fn rearm(&self, now: Instant) -> ArmState {
        ArmState::Armed { deadline: now + self.debounce_window }
    }

    /// Supersede the pending pet and re-arm its timer.
    pub fn stage_pet(&mut self, pet: PetState, now: Instant) {
        self.pet = Some(pet);
        self.pet_arm = self.rearm(now);
    }

    /// Append a feeding record and re-arm its timer.
    ///
    /// Returns true when the pending list reached the batch threshold:
    /// the timer is already disarmed and the caller must take and flush
    /// the list immediately.
    pub fn stage_feeding(&mut self, record: FeedingRecord, now: Instant) -> bool {
        self.feedings.push(record);
        if self.feedings.len() >= self.batch_threshold {
            self.feedings_arm = ArmState::Idle;
            true
        } else {
            self.feedings_arm = self.rearm(now);
            false
        }
    }

    /// Append an expression; same contract as [`stage_feeding`].
    ///
    /// [`stage_feeding`]: WriteBuffer::stage_feeding
    pub fn stage_expression(&mut self, expression: Expression, now: Instant) -> bool {
        self.expressions.push(expression);
        if self.expressions.len() >= self.batch_threshold {
            self.expressions_arm = ArmState::Idle;
            true
        } else {
            self.expressions_arm = self.rearm(now);
            false
        }
    }

    /// Take the pending feeding list immediately (batch-triggered path).
    pub fn take_feedings(&mut self) -> Vec<FeedingRecord> {
        self.feedings_arm = ArmState::Idle;
        std::mem::take(&mut self.feedings)
    }

    /// Take the pending expression list immediately (batch-triggered path).
    pub fn take_expressions(&mut self) -> Vec<Expression> {
        self.expressions_arm = ArmState::Idle;
        std::mem::take(&mut self.expressions)
    }

    /// Take the pending data of every kind whose deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> PendingFlush {
        let mut due = PendingFlush::default();
        if self.pet_arm.due(now) {
            self.pet_arm = ArmState::Idle;
            due.pet = self.pet.take();
        }
        if self.feedings_arm.due(now) {
            due.feedings = self.take_feedings();
        }
        if self.expressions_arm.due(now) {
            due.expressions = self.take_expressions();
        }
        due
    }

    /// Take everything pending regardless of deadlines (flush-all path).
    pub fn take_all(&mut self) -> PendingFlush {
        self.pet_arm = ArmState::Idle;
        PendingFlush {
            pet: self.pet.take(),
            feedings: self.take_feedings(),
            expressions: self.take_expressions(),
        }
    }

    /// Discard everything pending without flushing (import/reset path).
    pub fn clear(&mut self) {
        let _ = self.take_all();
    }

    /// Earliest armed deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.pet_arm, self.feedings_arm, self.expressions_arm]
            .iter()
            .filter_map(|arm| match arm {
                ArmState::Armed { deadline } => Some(*deadline),
                ArmState::Idle => None,
            })
            .min()
    }

    /// Number of pending values across all kinds.
    pub fn pending_count(&self) -> usize {
        usize::from(self.pet.is_some()) + self.feedings.len() + self.expressions.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending_count() == 0 && self.next_deadline().is_none()
    }
}

/// Flush statistics shared between the engine and the autoflush thread.
pub struct FlushTracker {
    total_flushes: AtomicU64,
    backend_writes: AtomicU64,
    autoflush_cycles: AtomicU64,
    quota_recoveries: AtomicU64,
}

impl FlushTracker {
    pub fn new() -> Self {
        Self {
            total_flushes: AtomicU64::new(0),
            backend_writes: AtomicU64::new(0),
            autoflush_cycles: AtomicU64::new(0),
            quota_recoveries: AtomicU64::new(0),
        }
    }

    pub fn record_flush(&self) {
        self.total_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.backend_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle(&self) {
        self.autoflush_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quota_recovery(&self) {
        self.quota_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed flushes (one per record kind per pass).
    pub fn total_flushes(&self) -> u64 {
        self.total_flushes.load(Ordering::Relaxed)
    }

    /// Successful writes against the backing surface.
    pub fn backend_writes(&self) -> u64 {
        self.backend_writes.load(Ordering::Relaxed)
    }

    /// Autoflush thread wake-ups.
    pub fn autoflush_cycles(&self) -> u64 {
        self.autoflush_cycles.load(Ordering::Relaxed)
    }

    /// Quota rejections recovered by prune-and-retry.
    pub fn quota_recoveries(&self) -> u64 {
        self.quota_recoveries.load(Ordering::Relaxed)
    }
}

impl Default for FlushTracker {
    fn default() -> Self { Self::new() }
}

/// Handle to a running autoflush background thread.
/// Dropping this handle signals the thread to stop.
pub struct AutoflushHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AutoflushHandle {
    pub(crate) fn new(shutdown: Arc<AtomicBool>, thread: thread::JoinHandle<()>) -> Self {
        Self { shutdown, thread: Some(thread) }
    }

    /// Request graceful shutdown and wait for the thread's final flush.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Check if the autoflush thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for AutoflushHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::EmotionVector;

    const WINDOW: Duration = Duration::from_millis(100);

    fn buffer() -> WriteBuffer {
        WriteBuffer::new(WINDOW, 10)
    }

    fn pet(count: u32) -> PetState {
        PetState {
            id: "pet-1".to_string(),
            stage: crate::records::Stage::Hatchling,
            feeding_count: count,
            emotion_vector: EmotionVector::zero(0),
            created_at: 0,
        }
    }

    fn feeding(n: usize) -> FeedingRecord {
        FeedingRecord {
            id: format!("f{}", n),
            timestamp: n as i64,
            input_text: "hello".to_string(),
            words: vec!["hello".to_string()],
            emotion_analysis: EmotionVector::zero(n as i64),
        }
    }

    #[test]
    fn test_pet_supersedes() {
        let mut buf = buffer();
        let t0 = Instant::now();

        buf.stage_pet(pet(1), t0);
        buf.stage_pet(pet(2), t0 + Duration::from_millis(10));
        buf.stage_pet(pet(3), t0 + Duration::from_millis(20));
        assert_eq!(buf.pending_count(), 1);

        let due = buf.take_due(t0 + Duration::from_millis(20) + WINDOW);
        assert_eq!(due.pet.unwrap().feeding_count, 3);
        assert!(buf.is_idle());
    }

    #[test]
    fn test_save_restarts_debounce_timer() {
        let mut buf = buffer();
        let t0 = Instant::now();

        buf.stage_pet(pet(1), t0);
        // A second save just before the first deadline pushes it out
        buf.stage_pet(pet(2), t0 + Duration::from_millis(90));

        let due = buf.take_due(t0 + Duration::from_millis(110));
        assert!(due.is_empty(), "restarted timer must not be due yet");

        let due = buf.take_due(t0 + Duration::from_millis(195));
        assert_eq!(due.pet.unwrap().feeding_count, 2);
    }

    #[test]
    fn test_logs_append_rather_than_supersede() {
        let mut buf = buffer();
        let t0 = Instant::now();

        for n in 0..3 {
            assert!(!buf.stage_feeding(feeding(n), t0));
        }
        let due = buf.take_due(t0 + WINDOW);
        assert_eq!(due.feedings.len(), 3);
        assert_eq!(due.feedings[0].id, "f0");
        assert_eq!(due.feedings[2].id, "f2");
    }

    #[test]
    fn test_batch_threshold_fires_immediately() {
        let mut buf = buffer();
        let t0 = Instant::now();

        for n in 0..9 {
            assert!(!buf.stage_feeding(feeding(n), t0));
        }
        assert!(buf.stage_feeding(feeding(9), t0), "10th record must trigger the batch flush");
        assert_eq!(buf.take_feedings().len(), 10);
    }

    #[test]
    fn test_batch_flush_disarms_timer() {
        let mut buf = buffer();
        let t0 = Instant::now();

        for n in 0..10 {
            buf.stage_feeding(feeding(n), t0);
        }
        let batch = buf.take_feedings();
        assert_eq!(batch.len(), 10);

        // The deadline armed by the 9th save must be gone: nothing is
        // due even arbitrarily far in the future.
        let due = buf.take_due(t0 + WINDOW * 10);
        assert!(due.is_empty(), "superseded deadline fired a second flush");
        assert!(buf.is_idle());
    }

    #[test]
    fn test_take_due_is_per_kind() {
        let mut buf = buffer();
        let t0 = Instant::now();

        buf.stage_pet(pet(1), t0);
        buf.stage_feeding(feeding(0), t0 + Duration::from_millis(60));

        // Pet deadline passed, feeding deadline not yet
        let due = buf.take_due(t0 + Duration::from_millis(110));
        assert!(due.pet.is_some());
        assert!(due.feedings.is_empty());
        assert_eq!(buf.pending_count(), 1);
    }

    #[test]
    fn test_take_all_ignores_deadlines() {
        let mut buf = buffer();
        let t0 = Instant::now();

        buf.stage_pet(pet(1), t0);
        buf.stage_feeding(feeding(0), t0);

        let all = buf.take_all();
        assert!(all.pet.is_some());
        assert_eq!(all.feedings.len(), 1);
        assert!(buf.is_idle());
    }

    #[test]
    fn test_next_deadline_is_earliest() {
        let mut buf = buffer();
        let t0 = Instant::now();

        buf.stage_feeding(feeding(0), t0);
        buf.stage_pet(pet(1), t0 + Duration::from_millis(50));

        assert_eq!(buf.next_deadline(), Some(t0 + WINDOW));
    }

    #[test]
    fn test_clear_discards_pending() {
        let mut buf = buffer();
        let t0 = Instant::now();

        buf.stage_pet(pet(1), t0);
        buf.stage_feeding(feeding(0), t0);
        buf.clear();

        assert!(buf.is_idle());
        assert!(buf.take_due(t0 + WINDOW * 2).is_empty());
    }

    #[test]
    fn test_tracker_counters() {
        let tracker = FlushTracker::new();
        tracker.record_flush();
        tracker.record_write();
        tracker.record_write();
        tracker.record_cycle();
        tracker.record_quota_recovery();

        assert_eq!(tracker.total_flushes(), 1);
        assert_eq!(tracker.backend_writes(), 2);
        assert_eq!(tracker.autoflush_cycles(), 1);
        assert_eq!(tracker.quota_recoveries(), 1);
    }
}

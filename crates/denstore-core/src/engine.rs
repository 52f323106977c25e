//! Core engine — the heart of DenStore.
//!
//! `DenStoreEngine` combines a key-value backing surface with a
//! coalescing write buffer and a capacity manager.
//!
//! **Save path**: buffer-first (debounced per record kind, batch-size
//! flush for the append logs), then flushed to the backing store
//! **Read path**: synchronous against the current backing surface;
//! malformed stored values self-heal to absent/empty
//! **Background**: autoflush thread fires due flushes on a short cadence
//!
//! Every storage failure is absorbed here: quota rejections prune and
//! retry once, anything else switches the engine to the in-memory
//! mirror for the rest of the process lifetime. No error reaches the
//! record-store operations' callers.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::{Backend, FileBackend, MemoryBackend};
use crate::buffer::{AutoflushHandle, FlushTracker, PendingFlush, WriteBuffer};
use crate::capacity::{self, CapacityReport};
use crate::config::Config;
use crate::error::{DenError, DenResult};
use crate::records::{validate_pet, Expression, FeedingRecord, PetState};
use crate::transfer::StorageDocument;

/// Key suffix for the availability probe performed at construction.
const PROBE_SUFFIX: &str = "__probe";

/// Autoflush thread wake-up step.
const AUTOFLUSH_POLL: Duration = Duration::from_millis(20);

/// State behind the engine's single lock: the active backing surface,
/// the one-way fallback flag, and the pending write buffer. One lock
/// means no two flushes for the same key can ever run concurrently and
/// flush ordering is FIFO per key.
struct Inner {
    backend: Box<dyn Backend>,
    memory_only: bool,
    buffer: WriteBuffer,
}

/// Which pending data a flush pass takes.
enum FlushScope {
    /// Only record kinds whose debounce deadline has passed
    Due(Instant),
    /// Everything, deadlines cancelled
    All,
}

/// Local persistence engine: record stores + write buffer + capacity
/// management + one-way in-memory fallback.
///
/// All public methods take `&self`. Construct once per process and
/// share; the engine exclusively owns its key namespace.
pub struct DenStoreEngine {
    inner: Arc<Mutex<Inner>>,
    tracker: Arc<FlushTracker>,
    /// Background autoflush handle (None if not started)
    autoflush: Mutex<Option<AutoflushHandle>>,
    config: Config,
}

impl DenStoreEngine {
    /// Open an engine over a file backend at the given directory.
    ///
    /// Never fails: if the directory cannot be opened or the
    /// availability probe fails, the engine starts in memory-only mode.
    pub fn open<P: AsRef<Path>>(dir: P, config: Config) -> Self {
        match FileBackend::open(dir) {
            Ok(backend) => Self::with_backend(Box::new(backend), config),
            Err(e) => {
                eprintln!("[FALLBACK] failed to open file backend: {}", e);
                Self::memory_engine(config)
            }
        }
    }

    /// Open over a file backend that enforces a byte quota.
    pub fn open_with_quota<P: AsRef<Path>>(dir: P, config: Config, quota_bytes: u64) -> Self {
        match FileBackend::with_quota(dir, quota_bytes) {
            Ok(backend) => Self::with_backend(Box::new(backend), config),
            Err(e) => {
                eprintln!("[FALLBACK] failed to open file backend: {}", e);
                Self::memory_engine(config)
            }
        }
    }

    /// Engine with no durable surface at all; `is_memory_only` reports
    /// true from the start.
    pub fn in_memory(config: Config) -> Self {
        Self::memory_engine(config)
    }

    /// Build over any backend — the dependency-injection seam tests use
    /// to fake the backing store.
    ///
    /// Probes availability with a trial write/delete. A failed probe
    /// permanently switches to the in-memory mirror; the result is
    /// cached for the process lifetime, there is no re-probe.
    pub fn with_backend(mut backend: Box<dyn Backend>, config: Config) -> Self {
        let probe_key = format!("{}.{}", config.key_prefix, PROBE_SUFFIX);
        let probe = backend
            .write(&probe_key, "1")
            .and_then(|_| backend.remove(&probe_key));

        let (backend, memory_only) = match probe {
            Ok(()) => (backend, false),
            Err(e) => {
                eprintln!("[FALLBACK] availability probe failed, using in-memory mirror: {}", e);
                (Box::new(MemoryBackend::new()) as Box<dyn Backend>, true)
            }
        };

        let buffer = WriteBuffer::new(config.debounce_window, config.batch_flush_threshold);
        Self {
            inner: Arc::new(Mutex::new(Inner { backend, memory_only, buffer })),
            tracker: Arc::new(FlushTracker::new()),
            autoflush: Mutex::new(None),
            config,
        }
    }

    fn memory_engine(config: Config) -> Self {
        let buffer = WriteBuffer::new(config.debounce_window, config.batch_flush_threshold);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                backend: Box::new(MemoryBackend::new()),
                memory_only: true,
                buffer,
            })),
            tracker: Arc::new(FlushTracker::new()),
            autoflush: Mutex::new(None),
            config,
        }
    }

    // -- record store operations ----------------------------------------

    /// Stage the pet for a debounced flush. Supersedes any pending pet —
    /// only the latest value matters.
    pub fn save_pet(&self, pet: PetState) {
        let mut inner = self.inner.lock();
        inner.buffer.stage_pet(pet, Instant::now());
    }

    /// Load the persisted pet, validating its shape. A corrupted or
    /// invalid value is deleted and reported absent rather than raised.
    pub fn load_pet(&self) -> Option<PetState> {
        let mut inner = self.inner.lock();
        load_pet_inner(&mut inner, &self.config)
    }

    /// Append a feeding record for a debounced flush; a pending batch of
    /// `batch_flush_threshold` flushes immediately.
    pub fn save_feeding_record(&self, record: FeedingRecord) {
        let mut inner = self.inner.lock();
        if inner.buffer.stage_feeding(record, Instant::now()) {
            let pending = inner.buffer.take_feedings();
            flush_log(
                &mut inner,
                &self.config,
                &self.tracker,
                &self.config.feeding_key(),
                self.config.max_feeding_records,
                pending,
            );
            maybe_compact(&mut inner, &self.config, &self.tracker);
        }
    }

    /// The most recent `limit` feeding records, in chronological order.
    pub fn feeding_history(&self, limit: usize) -> Vec<FeedingRecord> {
        let mut inner = self.inner.lock();
        let mut list: Vec<FeedingRecord> = read_log(&mut inner, &self.config.feeding_key());
        if list.len() > limit {
            list.split_off(list.len() - limit)
        } else {
            list
        }
    }

    /// Append an expression; same batching contract as feeding records.
    pub fn save_expression(&self, expression: Expression) {
        let mut inner = self.inner.lock();
        if inner.buffer.stage_expression(expression, Instant::now()) {
            let pending = inner.buffer.take_expressions();
            flush_log(
                &mut inner,
                &self.config,
                &self.tracker,
                &self.config.expressions_key(),
                self.config.max_expressions,
                pending,
            );
            maybe_compact(&mut inner, &self.config, &self.tracker);
        }
    }

    /// The most recent `limit` expressions, in chronological order.
    pub fn expressions(&self, limit: usize) -> Vec<Expression> {
        let mut inner = self.inner.lock();
        let mut list: Vec<Expression> = read_log(&mut inner, &self.config.expressions_key());
        if list.len() > limit {
            list.split_off(list.len() - limit)
        } else {
            list
        }
    }

    // -- flushing --------------------------------------------------------

    /// Cancel all timers and flush everything pending synchronously.
    ///
    /// Must run before destructive or cross-cutting operations; export,
    /// import, and drop all call it themselves.
    pub fn flush_all(&self) {
        let mut inner = self.inner.lock();
        flush_pending(&mut inner, &self.config, &self.tracker, FlushScope::All);
    }

    /// Flush every record kind whose debounce deadline has passed.
    ///
    /// The cooperative tick for hosts that do not run the autoflush
    /// thread; also what the thread itself calls.
    pub fn flush_due(&self, now: Instant) {
        let mut inner = self.inner.lock();
        flush_pending(&mut inner, &self.config, &self.tracker, FlushScope::Due(now));
    }

    /// Start the background autoflush thread.
    ///
    /// Not starting it is valid — hosts may drive `flush_due` or
    /// `flush_all` themselves.
    pub fn start_autoflush(&self) -> DenResult<()> {
        let mut slot = self.autoflush.lock();
        if slot.is_some() {
            return Ok(());
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let inner = Arc::clone(&self.inner);
        let tracker = Arc::clone(&self.tracker);
        let config = self.config.clone();

        let thread = thread::Builder::new()
            .name("denstore-autoflush".to_string())
            .spawn(move || autoflush_loop(inner, tracker, config, shutdown_clone))
            .map_err(|e| DenError::Io {
                path: None,
                kind: std::io::ErrorKind::Other,
                message: format!("Failed to spawn autoflush thread: {}", e),
            })?;

        *slot = Some(AutoflushHandle::new(shutdown, thread));
        Ok(())
    }

    /// Stop the autoflush thread gracefully; it flushes everything
    /// pending before exiting.
    pub fn stop_autoflush(&self) {
        let mut slot = self.autoflush.lock();
        if let Some(handle) = slot.take() {
            handle.shutdown();
        }
    }

    // -- capacity and diagnostics ---------------------------------------

    /// Accounted bytes currently persisted under this engine's prefix.
    pub fn storage_size(&self) -> u64 {
        let inner = self.inner.lock();
        capacity::measure(inner.backend.as_ref(), &self.config.key_prefix).unwrap_or(0)
    }

    /// Whether the engine has switched to the in-memory mirror.
    pub fn is_memory_only(&self) -> bool {
        self.inner.lock().memory_only
    }

    /// Flush pending data, then discard the oldest entries of both logs
    /// by the configured keep ratio. The pet record is never pruned.
    pub fn prune_old_data(&self) -> CapacityReport {
        let mut inner = self.inner.lock();
        flush_pending(&mut inner, &self.config, &self.tracker, FlushScope::All);

        let bytes_before =
            capacity::measure(inner.backend.as_ref(), &self.config.key_prefix).unwrap_or(0);
        let (pruned_feedings, pruned_expressions) =
            prune_stores(&mut inner, &self.config, &self.tracker);
        let bytes_after = capacity::measure(inner.backend.as_ref(), &self.config.key_prefix)
            .unwrap_or(bytes_before);

        CapacityReport {
            bytes_before,
            bytes_after,
            compacted_keys: 0,
            pruned_feedings,
            pruned_expressions,
        }
    }

    /// Discard pending writes and delete every persisted record.
    pub fn reset_all(&self) {
        let mut inner = self.inner.lock();
        inner.buffer.clear();
        for key in [
            self.config.pet_key(),
            self.config.feeding_key(),
            self.config.expressions_key(),
        ] {
            let _ = inner.backend.remove(&key);
        }
    }

    /// Values pending in the write buffer.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().buffer.pending_count()
    }

    /// Completed flushes since engine start.
    pub fn total_flushes(&self) -> u64 {
        self.tracker.total_flushes()
    }

    /// Successful writes against the backing surface.
    pub fn backend_writes(&self) -> u64 {
        self.tracker.backend_writes()
    }

    /// Autoflush thread wake-ups.
    pub fn autoflush_cycles(&self) -> u64 {
        self.tracker.autoflush_cycles()
    }

    /// Quota rejections recovered by prune-and-retry.
    pub fn quota_recoveries(&self) -> u64 {
        self.tracker.quota_recoveries()
    }

    /// Engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    // -- export / import -------------------------------------------------

    /// Flush pending writes, then serialize all three stores into one
    /// transferable document.
    pub fn export_data(&self) -> DenResult<String> {
        let mut inner = self.inner.lock();
        flush_pending(&mut inner, &self.config, &self.tracker, FlushScope::All);

        let document = StorageDocument {
            pet: load_pet_inner(&mut inner, &self.config),
            feeding_history: read_log(&mut inner, &self.config.feeding_key()),
            expressions: read_log(&mut inner, &self.config.expressions_key()),
        };
        document.to_export_string()
    }

    /// Replace all three stores wholesale with the document's content.
    ///
    /// Returns false — leaving existing state untouched — when the text
    /// fails to parse or any contained record fails validation.
    pub fn import_data(&self, text: &str) -> bool {
        let document = match StorageDocument::parse(text) {
            Ok(document) => document,
            Err(e) => {
                eprintln!("[DENSTORE] import rejected: {}", e);
                return false;
            }
        };
        if let Err(violation) = document.validate() {
            eprintln!("[DENSTORE] import rejected: {}", violation);
            return false;
        }

        let mut inner = self.inner.lock();
        // Settle pending writes before the wholesale replace.
        flush_pending(&mut inner, &self.config, &self.tracker, FlushScope::All);

        let StorageDocument { pet, mut feeding_history, mut expressions } = document;

        match pet {
            Some(pet) => match serde_json::to_string_pretty(&pet) {
                Ok(value) => write_through(
                    &mut inner,
                    &self.config,
                    &self.tracker,
                    &self.config.pet_key(),
                    &value,
                ),
                Err(e) => eprintln!("[DENSTORE] failed to serialize imported pet: {}", e),
            },
            None => {
                let _ = inner.backend.remove(&self.config.pet_key());
            }
        }

        truncate_to_cap(&mut feeding_history, self.config.max_feeding_records);
        truncate_to_cap(&mut expressions, self.config.max_expressions);
        write_list(
            &mut inner,
            &self.config,
            &self.tracker,
            &self.config.feeding_key(),
            &feeding_history,
        );
        write_list(
            &mut inner,
            &self.config,
            &self.tracker,
            &self.config.expressions_key(),
            &expressions,
        );

        maybe_compact(&mut inner, &self.config, &self.tracker);
        true
    }
}

impl Drop for DenStoreEngine {
    fn drop(&mut self) {
        let handle = self.autoflush.lock().take();
        match handle {
            // Shutdown performs the final flush on the thread
            Some(handle) => handle.shutdown(),
            None => {
                let mut inner = self.inner.lock();
                flush_pending(&mut inner, &self.config, &self.tracker, FlushScope::All);
            }
        }
    }
}

// -- background loop -----------------------------------------------------

/// Main autoflush loop — runs on the background thread.
fn autoflush_loop(
    inner: Arc<Mutex<Inner>>,
    tracker: Arc<FlushTracker>,
    config: Config,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        thread::sleep(AUTOFLUSH_POLL);
        if shutdown.load(Ordering::Acquire) {
            // Final flush before shutdown
            let mut guard = inner.lock();
            flush_pending(&mut guard, &config, &tracker, FlushScope::All);
            return;
        }
        {
            let mut guard = inner.lock();
            flush_pending(&mut guard, &config, &tracker, FlushScope::Due(Instant::now()));
        }
        tracker.record_cycle();
    }
}

// -- flush internals -----------------------------------------------------

fn flush_pending(inner: &mut Inner, config: &Config, tracker: &FlushTracker, scope: FlushScope) {
    let pending = match scope {
        FlushScope::Due(now) => inner.buffer.take_due(now),
        FlushScope::All => inner.buffer.take_all(),
    };
    if pending.is_empty() {
        return;
    }

    let PendingFlush { pet, feedings, expressions } = pending;
    if let Some(pet) = pet {
        flush_pet(inner, config, tracker, pet);
    }
    flush_log(
        inner,
        config,
        tracker,
        &config.feeding_key(),
        config.max_feeding_records,
        feedings,
    );
    flush_log(
        inner,
        config,
        tracker,
        &config.expressions_key(),
        config.max_expressions,
        expressions,
    );
    maybe_compact(inner, config, tracker);
}

fn flush_pet(inner: &mut Inner, config: &Config, tracker: &FlushTracker, pet: PetState) {
    match serde_json::to_string_pretty(&pet) {
        Ok(value) => {
            write_through(inner, config, tracker, &config.pet_key(), &value);
            tracker.record_flush();
        }
        Err(e) => eprintln!("[DENSTORE] failed to serialize pet: {}", e),
    }
}

/// Merge pending entries into the persisted log, enforce the cap
/// (oldest-first eviction), and write the full list back.
fn flush_log<T: Serialize + DeserializeOwned>(
    inner: &mut Inner,
    config: &Config,
    tracker: &FlushTracker,
    key: &str,
    cap: usize,
    mut pending: Vec<T>,
) {
    if pending.is_empty() {
        return;
    }
    let mut list: Vec<T> = read_log(inner, key);
    list.append(&mut pending);
    truncate_to_cap(&mut list, cap);

    write_list(inner, config, tracker, key, &list);
    tracker.record_flush();
}

fn truncate_to_cap<T>(list: &mut Vec<T>, cap: usize) {
    if list.len() > cap {
        let excess = list.len() - cap;
        list.drain(..excess);
    }
}

fn write_list<T: Serialize>(
    inner: &mut Inner,
    config: &Config,
    tracker: &FlushTracker,
    key: &str,
    list: &[T],
) {
    match serde_json::to_string_pretty(list) {
        Ok(value) => write_through(inner, config, tracker, key, &value),
        Err(e) => eprintln!("[DENSTORE] failed to serialize {}: {}", key, e),
    }
}

/// Write one value to the backing surface, absorbing failures.
///
/// Quota rejections prune both logs and retry once; a second failure —
/// or any non-quota failure — switches to the in-memory mirror and
/// lands the value there, so pending data is retained even when
/// durability is lost.
fn write_through(inner: &mut Inner, config: &Config, tracker: &FlushTracker, key: &str, value: &str) {
    match inner.backend.write(key, value) {
        Ok(()) => {
            tracker.record_write();
            return;
        }
        Err(e) if e.is_quota() => {
            eprintln!("[CAPACITY] quota exceeded writing {}, pruning and retrying", key);
            prune_stores(inner, config, tracker);
            match inner.backend.write(key, value) {
                Ok(()) => {
                    tracker.record_write();
                    tracker.record_quota_recovery();
                    return;
                }
                Err(retry_err) => {
                    enter_memory_mode(inner, config, &retry_err.to_string());
                }
            }
        }
        Err(e) => {
            enter_memory_mode(inner, config, &e.to_string());
        }
    }

    // Mirror writes cannot fail; the pending data stays resident.
    if inner.backend.write(key, value).is_ok() {
        tracker.record_write();
    }
}

/// One-way switch to the in-memory mirror, copying whatever namespaced
/// keys are still readable so reads keep working in reduced mode.
fn enter_memory_mode(inner: &mut Inner, config: &Config, reason: &str) {
    if inner.memory_only {
        return;
    }
    eprintln!("[FALLBACK] switching to in-memory mirror: {}", reason);

    let mut mirror = MemoryBackend::new();
    if let Ok(keys) = inner.backend.keys() {
        for key in keys.iter().filter(|k| k.starts_with(&config.key_prefix)) {
            if let Ok(Some(value)) = inner.backend.read(key) {
                let _ = mirror.write(key, &value);
            }
        }
    }

    inner.backend = Box::new(mirror);
    inner.memory_only = true;
}

// -- capacity internals --------------------------------------------------

/// Compact-then-prune pass, run after every flush.
fn maybe_compact(inner: &mut Inner, config: &Config, tracker: &FlushTracker) {
    let bytes_before =
        match capacity::measure(inner.backend.as_ref(), &config.key_prefix) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
    let trigger = (config.byte_budget as f64 * config.compact_trigger_ratio) as u64;
    if bytes_before <= trigger {
        return;
    }

    let mut compacted_keys = 0usize;
    for key in [config.pet_key(), config.feeding_key(), config.expressions_key()] {
        if compact_key(inner, tracker, &key) {
            compacted_keys += 1;
        }
    }

    let after_compact = capacity::measure(inner.backend.as_ref(), &config.key_prefix)
        .unwrap_or(bytes_before);

    let mut pruned_feedings = 0;
    let mut pruned_expressions = 0;
    if after_compact > config.byte_budget {
        let (feedings, expressions) = prune_stores(inner, config, tracker);
        pruned_feedings = feedings;
        pruned_expressions = expressions;
    }

    let bytes_after = capacity::measure(inner.backend.as_ref(), &config.key_prefix)
        .unwrap_or(after_compact);
    let report = CapacityReport {
        bytes_before,
        bytes_after,
        compacted_keys,
        pruned_feedings,
        pruned_expressions,
    };
    if !report.is_noop() {
        eprintln!(
            "[CAPACITY] {} -> {} bytes ({} keys compacted, {} feedings / {} expressions pruned)",
            report.bytes_before,
            report.bytes_after,
            report.compacted_keys,
            report.pruned_feedings,
            report.pruned_expressions
        );
    }
}

/// Rewrite one key's value minified. Returns true when bytes shrank.
fn compact_key(inner: &mut Inner, tracker: &FlushTracker, key: &str) -> bool {
    let raw = match inner.backend.read(key) {
        Ok(Some(raw)) => raw,
        _ => return false,
    };
    let value: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            eprintln!("[RECOVERY] clearing corrupted {} during compaction: {}", key, e);
            let _ = inner.backend.remove(key);
            return false;
        }
    };
    let minified = match serde_json::to_string(&value) {
        Ok(minified) => minified,
        Err(_) => return false,
    };
    if minified.len() >= raw.len() {
        return false;
    }
    if inner.backend.write(key, &minified).is_ok() {
        tracker.record_write();
        true
    } else {
        false
    }
}

/// Prune both append logs by the keep ratio; the pet is never touched.
fn prune_stores(inner: &mut Inner, config: &Config, tracker: &FlushTracker) -> (usize, usize) {
    let feedings = prune_log::<FeedingRecord>(
        inner,
        tracker,
        &config.feeding_key(),
        config.prune_keep_ratio,
    );
    let expressions = prune_log::<Expression>(
        inner,
        tracker,
        &config.expressions_key(),
        config.prune_keep_ratio,
    );
    (feedings, expressions)
}

fn prune_log<T: Serialize + DeserializeOwned>(
    inner: &mut Inner,
    tracker: &FlushTracker,
    key: &str,
    keep_ratio: f64,
) -> usize {
    let list: Vec<T> = read_log(inner, key);
    let keep = capacity::prune_keep(list.len(), keep_ratio);
    if keep >= list.len() {
        return 0;
    }
    let removed = list.len() - keep;
    let kept: Vec<T> = list.into_iter().skip(removed).collect();

    // Pruned stores are written minified; they exist to free space.
    match serde_json::to_string(&kept) {
        Ok(value) => {
            if inner.backend.write(key, &value).is_ok() {
                tracker.record_write();
            }
        }
        Err(e) => eprintln!("[DENSTORE] failed to serialize pruned {}: {}", key, e),
    }
    removed
}

// -- read internals ------------------------------------------------------

fn load_pet_inner(inner: &mut Inner, config: &Config) -> Option<PetState> {
    let key = config.pet_key();
    let raw = match inner.backend.read(&key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            eprintln!("[RECOVERY] read failed for {}: {}", key, e);
            return None;
        }
    };
    let pet: PetState = match serde_json::from_str(&raw) {
        Ok(pet) => pet,
        Err(e) => {
            eprintln!("[RECOVERY] clearing corrupted {}: {}", key, e);
            let _ = inner.backend.remove(&key);
            return None;
        }
    };
    if let Err(violation) = validate_pet(&pet) {
        eprintln!("[RECOVERY] clearing invalid {}: {}", key, violation);
        let _ = inner.backend.remove(&key);
        return None;
    }
    Some(pet)
}

/// Read a persisted log, self-healing anything that does not parse as
/// an array of the record kind.
fn read_log<T: DeserializeOwned>(inner: &mut Inner, key: &str) -> Vec<T> {
    let raw = match inner.backend.read(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(e) => {
            eprintln!("[RECOVERY] read failed for {}: {}", key, e);
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<T>>(&raw) {
        Ok(list) => list,
        Err(e) => {
            eprintln!("[RECOVERY] clearing corrupted {}: {}", key, e);
            let _ = inner.backend.remove(key);
            Vec::new()
        }
    }
}

//! Post-mortem bookkeeping and task-health supervision.
//!
//! A small fixed-layout record survives restarts (retained RAM on the
//! vehicle, a file under the data directory here) and names the reason for
//! the last halt: `{status, task name, crc32}`. The CRC is computed over the
//! whole record with the CRC field zeroed, so corruption and first-boot
//! garbage are indistinguishable from each other and both reset the record.
//!
//! Task health is a heartbeat gauge, the host analog of a stack high-water
//! mark: every pipeline task restores its gauge to [`HEALTHY_WATERMARK`] on
//! each loop pass, and the watchdog decays it on every sweep. A task that
//! stops iterating — wedged on a modem exchange that never terminates, a
//! dead channel peer — sinks through the warning band and, below the halt
//! threshold, gets its name written to the post-mortem record before the
//! process aborts for the supervisor layer to restart.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

/// Bytes reserved for the halting task's name.
pub const TASK_NAME_LEN: usize = 16;

/// Clean shutdown / nothing recorded.
pub const HCF_NONE: u32 = 0;
/// A task's health gauge sank below the halt threshold.
pub const HCF_STACK_OVERFLOW: u32 = 1;
/// An unrecoverable panic routed through the watchdog.
pub const HCF_PANIC: u32 = 2;

/// Gauge value a live task restores on every loop pass.
pub const HEALTHY_WATERMARK: u32 = 512;

/// Amount the sweeper takes off an untouched gauge, per sweep. At one sweep
/// every [`SWEEP_PERIOD`], a silent task halts after roughly twenty seconds.
const SWEEP_DECAY: u32 = 8;

/// Watermark levels, in words, matching the firmware's thresholds.
const WARN_WATERMARK: u32 = 48;
const HALT_WATERMARK: u32 = 24;

/// Sweep period.
const SWEEP_PERIOD: Duration = Duration::from_millis(333);

const RECORD_SIZE: usize = 4 + 4 + TASK_NAME_LEN + 4;

/// The retained post-mortem record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostMortem {
    pub status: u32,
    pub name_len: u32,
    pub task_name: [u8; TASK_NAME_LEN],
    pub crc: u32,
}

impl Default for PostMortem {
    fn default() -> Self {
        Self {
            status: HCF_NONE,
            name_len: 0,
            task_name: [0; TASK_NAME_LEN],
            crc: 0,
        }
    }
}

impl PostMortem {
    fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0..4].copy_from_slice(&self.status.to_le_bytes());
        out[4..8].copy_from_slice(&self.name_len.to_le_bytes());
        out[8..8 + TASK_NAME_LEN].copy_from_slice(&self.task_name);
        out[8 + TASK_NAME_LEN..].copy_from_slice(&self.crc.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Self {
        let mut task_name = [0u8; TASK_NAME_LEN];
        task_name.copy_from_slice(&bytes[8..8 + TASK_NAME_LEN]);
        Self {
            status: u32::from_le_bytes(bytes[0..4].try_into().unwrap_or_default()),
            name_len: u32::from_le_bytes(bytes[4..8].try_into().unwrap_or_default()),
            task_name,
            crc: u32::from_le_bytes(bytes[8 + TASK_NAME_LEN..].try_into().unwrap_or_default()),
        }
    }

    /// CRC32 (ISO-HDLC) over the record with the CRC field zeroed.
    #[must_use]
    pub fn self_check(&self) -> u32 {
        let mut shadow = self.clone();
        shadow.crc = 0;
        crc32fast::hash(&shadow.to_bytes())
    }

    /// Reset to a clean record if the checksum does not hold. Returns true
    /// when a reset happened.
    pub fn initialize_if_needed(&mut self) -> bool {
        if self.self_check() == self.crc {
            return false;
        }
        *self = Self::default();
        self.crc = self.self_check();
        true
    }

    /// Record a halt cause and re-seal the checksum.
    pub fn record(&mut self, status: u32, who: &str) {
        self.status = status;
        let bytes = who.as_bytes();
        let len = bytes.len().min(TASK_NAME_LEN);
        self.task_name = [0; TASK_NAME_LEN];
        self.task_name[..len].copy_from_slice(&bytes[..len]);
        #[allow(clippy::cast_possible_truncation)]
        {
            self.name_len = len as u32;
        }
        self.crc = self.self_check();
    }

    /// The recorded task name, if any.
    #[must_use]
    pub fn task_name(&self) -> String {
        let len = (self.name_len as usize).min(TASK_NAME_LEN);
        String::from_utf8_lossy(&self.task_name[..len]).into_owned()
    }

    /// Load from the retained-storage file; a missing or short file yields a
    /// record that fails its self check.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) if bytes.len() == RECORD_SIZE => {
                let mut fixed = [0u8; RECORD_SIZE];
                fixed.copy_from_slice(&bytes);
                Self::from_bytes(&fixed)
            }
            _ => Self::default(),
        }
    }

    pub fn store(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("create {}: {e}", parent.display()))?;
        }
        std::fs::write(path, self.to_bytes()).map_err(|e| format!("write {}: {e}", path.display()))
    }
}

/// Liveness gauge owned by one task. Call [`Heartbeat::beat`] on every loop
/// pass; the watchdog decays the gauge between beats.
#[derive(Clone)]
pub struct Heartbeat(Arc<AtomicU32>);

impl Heartbeat {
    /// Restore the gauge to full health.
    pub fn beat(&self) {
        self.0.store(HEALTHY_WATERMARK, Ordering::Relaxed);
    }

    /// A gauge attached to no registry, for tasks running outside watchdog
    /// supervision (tests, tools).
    #[must_use]
    pub fn standalone() -> Self {
        Self(Arc::new(AtomicU32::new(HEALTHY_WATERMARK)))
    }
}

struct TaskHealth {
    name: String,
    gauge: Arc<AtomicU32>,
    warned: bool,
}

/// Registry of supervised tasks.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<Vec<TaskHealth>>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a task; returns the heartbeat it must keep beating.
    pub fn register(&self, name: &str) -> Heartbeat {
        let heartbeat = Heartbeat::standalone();
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.push(TaskHealth {
            name: name.to_string(),
            gauge: Arc::clone(&heartbeat.0),
            warned: false,
        });
        heartbeat
    }

    /// One sweep over every registered task: decay each gauge and evaluate
    /// the thresholds. Returns the name of a task whose gauge fell below the
    /// halt threshold, if any.
    fn sweep(&self) -> Option<String> {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for task in tasks.iter_mut() {
            let previous = task.gauge.load(Ordering::Relaxed);
            let watermark = previous.saturating_sub(SWEEP_DECAY);
            if task
                .gauge
                .compare_exchange(previous, watermark, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
            {
                // the task beat while we were looking; alive by definition
                task.warned = false;
                continue;
            }

            if watermark > WARN_WATERMARK {
                task.warned = false;
                continue;
            }
            if watermark < HALT_WATERMARK {
                return Some(task.name.clone());
            }
            if !task.warned {
                task.warned = true;
                warn!(
                    "task \"{}\" has stopped heartbeating (watermark {watermark})",
                    task.name
                );
            }
        }
        None
    }
}

/// Report the previous halt (if any), write a clean record, and supervise
/// task health until the process ends.
pub fn spawn_watchdog(registry: Arc<TaskRegistry>, store_path: PathBuf) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut record = PostMortem::load(&store_path);
        if record.initialize_if_needed() {
            info!("post-mortem record was blank or corrupt, starting clean");
        } else if record.status != HCF_NONE {
            warn!("the previous reset was a halt (code {})", record.status);
            warn!("task that halted, if any: \"{}\"", record.task_name());
        }

        record.record(HCF_NONE, "no fire");
        if let Err(e) = record.store(&store_path) {
            warn!("could not persist post-mortem record: {e}");
        }

        let mut interval = tokio::time::interval(SWEEP_PERIOD);
        loop {
            interval.tick().await;
            if let Some(task_name) = registry.sweep() {
                error!("task \"{task_name}\" stopped responding, halting");
                record.record(HCF_STACK_OVERFLOW, &task_name);
                if let Err(e) = record.store(&store_path) {
                    error!("could not persist post-mortem record: {e}");
                }
                std::process::abort();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("racetel-wd-{tag}-{}", std::process::id()))
    }

    #[test]
    fn test_fresh_record_fails_self_check() {
        let mut record = PostMortem::default();
        assert_ne!(record.self_check(), record.crc);
        assert!(record.initialize_if_needed());
        assert!(!record.initialize_if_needed());
    }

    #[test]
    fn test_record_seals_checksum() {
        let mut record = PostMortem::default();
        record.record(HCF_STACK_OVERFLOW, "uplink");
        assert_eq!(record.self_check(), record.crc);
        assert_eq!(record.status, HCF_STACK_OVERFLOW);
        assert_eq!(record.task_name(), "uplink");
    }

    #[test]
    fn test_corruption_is_detected() {
        let mut record = PostMortem::default();
        record.record(HCF_PANIC, "forger");
        record.status = HCF_NONE;
        assert_ne!(record.self_check(), record.crc);
        assert!(record.initialize_if_needed());
        assert_eq!(record.status, HCF_NONE);
    }

    #[test]
    fn test_long_task_name_is_truncated() {
        let mut record = PostMortem::default();
        record.record(HCF_STACK_OVERFLOW, "a-task-name-well-beyond-the-limit");
        assert_eq!(record.name_len as usize, TASK_NAME_LEN);
        assert_eq!(record.task_name().len(), TASK_NAME_LEN);
        assert_eq!(record.self_check(), record.crc);
    }

    #[test]
    fn test_store_load_round_trip() {
        let path = scratch_path("roundtrip");
        let mut record = PostMortem::default();
        record.record(HCF_STACK_OVERFLOW, "coordinator");
        record.store(&path).unwrap();

        let loaded = PostMortem::load(&path);
        assert_eq!(loaded, record);
        assert_eq!(loaded.self_check(), loaded.crc);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_load_missing_file_is_invalid() {
        let record = PostMortem::load(Path::new("/nonexistent/racetel-postmortem"));
        assert_ne!(record.self_check(), record.crc);
    }

    #[test]
    fn test_silent_task_decays_to_a_halt() {
        let registry = TaskRegistry::new();
        let _heartbeat = registry.register("uplink");

        // 512 decays by 8 per sweep; the gauge crosses the halt line on the
        // 62nd sweep and not before
        for i in 1..=61 {
            assert!(registry.sweep().is_none(), "halted too early, sweep {i}");
        }
        assert_eq!(registry.sweep().as_deref(), Some("uplink"));
    }

    #[test]
    fn test_beating_task_never_degrades() {
        let registry = TaskRegistry::new();
        let heartbeat = registry.register("forger");
        for _ in 0..200 {
            heartbeat.beat();
            assert!(registry.sweep().is_none());
        }
    }

    #[test]
    fn test_beat_resets_the_decay_budget() {
        let registry = TaskRegistry::new();
        let heartbeat = registry.register("coordinator");

        for _ in 0..40 {
            let _ = registry.sweep();
        }
        heartbeat.beat();

        // a recovered task gets the full budget again
        for i in 1..=61 {
            assert!(registry.sweep().is_none(), "halted too early, sweep {i}");
        }
        assert_eq!(registry.sweep().as_deref(), Some("coordinator"));
    }

    #[test]
    fn test_only_the_silent_task_halts() {
        let registry = TaskRegistry::new();
        let alive = registry.register("uplink");
        let _dead = registry.register("forger");

        let mut halted = None;
        for _ in 0..100 {
            alive.beat();
            if let Some(name) = registry.sweep() {
                halted = Some(name);
                break;
            }
        }
        assert_eq!(halted.as_deref(), Some("forger"));
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sysinfo::{ProcessesToUpdate, System};

const DEFAULT_LISTENER_MARKER: &str = "Runner.Listener";
const DEFAULT_WORKER_MARKER: &str = "Runner.Worker";

/// Observed process liveness for one runner slot, recomputed every poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotProcessState {
    pub listener_alive: bool,
    pub worker_alive: bool,
}

impl SlotProcessState {
    pub fn classify(self) -> SlotClassification {
        match (self.listener_alive, self.worker_alive) {
            (true, true) => SlotClassification::Active,
            (true, false) => SlotClassification::Idle,
            _ => SlotClassification::Dead,
        }
    }
}

/// Derived slot classification driving record reclassification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotClassification {
    /// Listener and worker both alive: a job is verifiably executing.
    Active,
    /// Listener alive, worker gone: the job very likely finished without
    /// its completion hook running.
    Idle,
    /// Neither process alive: the slot itself is gone.
    Dead,
}

impl SlotClassification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Dead => "dead",
        }
    }
}

/// Capability interface over OS process liveness, one implementation per
/// target platform plus an in-memory one for deterministic tests.
pub trait ProcessRegistry: Send + Sync {
    /// Re-reads the process table. Called once per decision cycle.
    fn refresh(&self);
    /// Liveness of the listener/worker pair for one slot.
    fn slot_state(&self, slot: u32) -> SlotProcessState;
    /// Count of live listener processes across all slots.
    fn listener_count(&self) -> usize;
}

/// Process-table-backed registry. Runner agent processes are recognized by
/// a command-line marker and attributed to a slot through the slot-scoped
/// working directory (`<slots_root>/runner-<slot>`).
pub struct SystemProcessRegistry {
    system: Mutex<System>,
    slots_root: PathBuf,
    listener_marker: String,
    worker_marker: String,
}

impl SystemProcessRegistry {
    pub fn new(slots_root: &Path) -> Self {
        Self::with_markers(slots_root, DEFAULT_LISTENER_MARKER, DEFAULT_WORKER_MARKER)
    }

    pub fn with_markers(slots_root: &Path, listener_marker: &str, worker_marker: &str) -> Self {
        Self {
            system: Mutex::new(System::new()),
            slots_root: slots_root.to_path_buf(),
            listener_marker: listener_marker.to_string(),
            worker_marker: worker_marker.to_string(),
        }
    }

    pub fn slot_dir(&self, slot: u32) -> PathBuf {
        self.slots_root.join(format!("runner-{slot}"))
    }

    fn count_matching(&self, marker: &str, slot_dir: Option<&Path>) -> usize {
        let system = lock_unpoisoned(&self.system);
        system
            .processes()
            .values()
            .filter(|process| {
                process_carries_marker(process, marker)
                    && slot_dir.map_or(true, |dir| process_belongs_to_dir(process, dir))
            })
            .count()
    }
}

impl ProcessRegistry for SystemProcessRegistry {
    fn refresh(&self) {
        let mut system = lock_unpoisoned(&self.system);
        system.refresh_processes(ProcessesToUpdate::All);
    }

    fn slot_state(&self, slot: u32) -> SlotProcessState {
        let slot_dir = self.slot_dir(slot);
        SlotProcessState {
            listener_alive: self.count_matching(&self.listener_marker, Some(&slot_dir)) > 0,
            worker_alive: self.count_matching(&self.worker_marker, Some(&slot_dir)) > 0,
        }
    }

    fn listener_count(&self) -> usize {
        self.count_matching(&self.listener_marker, None)
    }
}

fn process_carries_marker(process: &sysinfo::Process, marker: &str) -> bool {
    if process.name().to_string_lossy().contains(marker) {
        return true;
    }
    if let Some(exe) = process.exe() {
        if exe.to_string_lossy().contains(marker) {
            return true;
        }
    }
    process
        .cmd()
        .iter()
        .any(|argument| argument.to_string_lossy().contains(marker))
}

fn process_belongs_to_dir(process: &sysinfo::Process, dir: &Path) -> bool {
    if let Some(cwd) = process.cwd() {
        if cwd.starts_with(dir) {
            return true;
        }
    }
    if let Some(exe) = process.exe() {
        if exe.starts_with(dir) {
            return true;
        }
    }
    let dir_text = dir.to_string_lossy();
    process
        .cmd()
        .iter()
        .any(|argument| argument.to_string_lossy().contains(dir_text.as_ref()))
}

/// In-memory registry for tests: slot states are set explicitly and the
/// listener count is derived from them.
#[derive(Debug, Default)]
pub struct StaticProcessRegistry {
    states: Mutex<HashMap<u32, SlotProcessState>>,
}

impl StaticProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_slot(&self, slot: u32, listener_alive: bool, worker_alive: bool) {
        lock_unpoisoned(&self.states).insert(
            slot,
            SlotProcessState {
                listener_alive,
                worker_alive,
            },
        );
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.states).clear();
    }
}

impl ProcessRegistry for StaticProcessRegistry {
    fn refresh(&self) {}

    fn slot_state(&self, slot: u32) -> SlotProcessState {
        lock_unpoisoned(&self.states)
            .get(&slot)
            .copied()
            .unwrap_or_default()
    }

    fn listener_count(&self) -> usize {
        lock_unpoisoned(&self.states)
            .values()
            .filter(|state| state.listener_alive)
            .count()
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_classification_covers_all_liveness_pairs() {
        let active = SlotProcessState {
            listener_alive: true,
            worker_alive: true,
        };
        let idle = SlotProcessState {
            listener_alive: true,
            worker_alive: false,
        };
        let dead = SlotProcessState {
            listener_alive: false,
            worker_alive: false,
        };
        // Worker without listener means the slot's dispatch loop is gone.
        let orphan_worker = SlotProcessState {
            listener_alive: false,
            worker_alive: true,
        };
        assert_eq!(active.classify(), SlotClassification::Active);
        assert_eq!(idle.classify(), SlotClassification::Idle);
        assert_eq!(dead.classify(), SlotClassification::Dead);
        assert_eq!(orphan_worker.classify(), SlotClassification::Dead);
    }

    #[test]
    fn unit_static_registry_derives_listener_count() {
        let registry = StaticProcessRegistry::new();
        assert_eq!(registry.listener_count(), 0);
        registry.set_slot(0, true, true);
        registry.set_slot(1, true, false);
        registry.set_slot(2, false, false);
        assert_eq!(registry.listener_count(), 2);
        assert_eq!(
            registry.slot_state(1).classify(),
            SlotClassification::Idle
        );
        assert_eq!(
            registry.slot_state(9).classify(),
            SlotClassification::Dead
        );
    }
}

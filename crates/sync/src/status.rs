//! Progress of a sync run, readable from any task while the run goes on.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use derive_more::Display;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Phase {
    Reset = 0,
    PreUpdate,
    UpToDate,
    DiffComputed,
    Adding,
    Updating,
    CleaningUp,
    PostUpdate,
    Complete,
    Cancelled,
    Error,
}

impl Phase {
    const ALL: [Phase; 11] = [
        Self::Reset,
        Self::PreUpdate,
        Self::UpToDate,
        Self::DiffComputed,
        Self::Adding,
        Self::Updating,
        Self::CleaningUp,
        Self::PostUpdate,
        Self::Complete,
        Self::Cancelled,
        Self::Error,
    ];

    fn from_u8(value: u8) -> Self {
        Self::ALL.get(value as usize).copied().unwrap_or(Self::Error)
    }

    /// A run is doing work in this phase.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::PreUpdate | Self::UpToDate | Self::DiffComputed | Self::Adding | Self::Updating | Self::CleaningUp
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Error)
    }
}

/// A consistent-enough copy of [`SyncStatus`] at one moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub phase: Phase,
    /// The last active phase, kept so a failed run can say where it stopped.
    pub last_active: Option<Phase>,
    pub files_done: u64,
    pub files_total: u64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub current_file: Option<String>,
}

/// Shared progress counters. Writers are the running sync, readers anyone.
///
/// Counters are plain atomics; only the current file name sits behind a
/// (briefly held) lock.
#[derive(Debug)]
pub struct SyncStatus {
    phase: AtomicU8,
    last_active: AtomicU8,
    files_done: AtomicU64,
    files_total: AtomicU64,
    bytes_done: AtomicU64,
    bytes_total: AtomicU64,
    current_file: Mutex<Option<String>>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Reset as u8),
            last_active: AtomicU8::new(Phase::Reset as u8),
            files_done: AtomicU64::new(0),
            files_total: AtomicU64::new(0),
            bytes_done: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            current_file: Mutex::new(None),
        }
    }
}

impl SyncStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        if phase.is_active() {
            self.last_active.store(phase as u8, Ordering::Release);
        }
        self.phase.store(phase as u8, Ordering::Release);
        tracing::info!(%phase, "Sync phase");
    }

    pub(crate) fn reset(&self) {
        self.phase.store(Phase::Reset as u8, Ordering::Release);
        self.last_active.store(Phase::Reset as u8, Ordering::Release);
        self.files_done.store(0, Ordering::Relaxed);
        self.files_total.store(0, Ordering::Relaxed);
        self.bytes_done.store(0, Ordering::Relaxed);
        self.bytes_total.store(0, Ordering::Relaxed);
        self.set_current(None);
    }

    pub(crate) fn set_totals(&self, files: u64, bytes: u64) {
        self.files_total.store(files, Ordering::Relaxed);
        self.bytes_total.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn file_started(&self, path: &str) {
        self.set_current(Some(path.to_string()));
    }

    pub(crate) fn file_finished(&self) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
        self.set_current(None);
    }

    pub(crate) fn add_bytes(&self, bytes: u64) {
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
    }

    fn set_current(&self, path: Option<String>) {
        let mut current = self.current_file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = path;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let last_active = Phase::from_u8(self.last_active.load(Ordering::Acquire));
        StatusSnapshot {
            phase: self.phase(),
            last_active: (last_active != Phase::Reset).then_some(last_active),
            files_done: self.files_done.load(Ordering::Relaxed),
            files_total: self.files_total.load(Ordering::Relaxed),
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            current_file: self.current_file.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone(),
        }
    }
}

//! Per-job record and lifecycle state
//!
//! ```text
//!     ┌────────┐ run-at-load / !on-demand
//!     │ Loaded │──────────────┐
//!     └───┬────┘              │
//!         │ arm sources       │
//!     ┌───▼──────┐ activation │
//!     │ Watching │────────────┤
//!     └───▲──────┘            │
//!         │ re-arm       ┌────▼────┐
//!         ├──────────────│ Running │
//!         │              └────┬────┘
//!     ┌───┴───────┐  too-short│ reap
//!     │ Throttled │◄──────────┤
//!     └───────────┘           │ restart / remove
//! ```

use std::time::Instant;

use tokio::task::JoinHandle;

use crate::manifest::Manifest;

/// Where a job currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Loaded, nothing armed, no child.
    Loaded,
    /// Activation sources armed, waiting for demand.
    Watching,
    /// Child alive.
    Running,
    /// Post-reap backoff; sources disarmed until the restart timer fires.
    Throttled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loaded => "loaded",
            Self::Watching => "watching",
            Self::Running => "running",
            Self::Throttled => "throttled",
        }
    }
}

/// One supervised job: immutable identity plus mutable runtime state.
///
/// The registry owns exactly one `Job` per label. Armed event-source
/// tasks are tracked here so disarming (and removal) can cancel them;
/// every armed task carries the `generation` it was armed under and the
/// event handlers drop anything stale.
pub struct Job {
    pub label: String,
    pub manifest: Manifest,
    pub state: JobState,
    /// Child pid while alive and not yet reaped.
    pub pid: Option<i32>,
    /// Identifies the spawn a child-exit notice belongs to, so a reap
    /// racing a remove-and-resubmit cannot touch the wrong record.
    pub spawn_id: u64,
    /// Arm-cycle counter; bumped on every disarm.
    pub generation: u64,
    pub start_time: Option<Instant>,
    pub failed_exits: u32,
    pub checked_in: bool,
    pub throttled: bool,
    pub debug: bool,
    pub firstborn: bool,
    /// Live source-watcher tasks for the current arm cycle (plus the
    /// throttle restart timer while one is pending).
    pub armed: Vec<JoinHandle<()>>,
}

impl Job {
    pub fn new(manifest: Manifest) -> Job {
        let label = manifest.label().to_string();
        let debug = manifest.bool_key(crate::manifest::keys::DEBUG);
        Job {
            label,
            manifest,
            state: JobState::Loaded,
            pid: None,
            spawn_id: 0,
            generation: 0,
            start_time: None,
            failed_exits: 0,
            checked_in: false,
            throttled: false,
            debug,
            firstborn: false,
            armed: Vec::new(),
        }
    }

    /// Cancel every armed source task and invalidate in-flight events
    /// from the old cycle.
    pub fn disarm(&mut self) {
        for handle in self.armed.drain(..) {
            handle.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    /// Seconds the current (or last) child has been alive.
    pub fn time_alive(&self) -> std::time::Duration {
        self.start_time
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        for handle in self.armed.drain(..) {
            handle.abort();
        }
    }
}

//! Reaping policy: classify a child's exit, charge or forgive failures,
//! and decide whether the run was short enough to throttle.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use super::job::Job;

/// A child must live at least this long or its next restart is delayed
/// by the same amount.
pub const MIN_JOB_RUN_TIME: Duration = Duration::from_secs(10);

/// Living this long forgives all accumulated failures.
pub const REWARD_JOB_RUN_TIME: Duration = Duration::from_secs(60);

/// Accumulated bad exits that force removal.
pub const FAILED_EXITS_THRESHOLD: u32 = 10;

/// Idle supervisors (no jobs loaded, on-demand mode) exit after this.
pub const IDLE_EXIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How one child death looked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Exit code 0.
    Clean,
    /// Non-zero exit code.
    BadExit(i32),
    /// SIGKILL or SIGTERM; assumed to be an orderly stop.
    OrderlySignal(i32),
    /// Any other signal.
    BadSignal(i32),
}

impl ExitClass {
    pub fn of(status: ExitStatus) -> ExitClass {
        if let Some(sig) = status.signal() {
            if sig == libc::SIGKILL || sig == libc::SIGTERM {
                ExitClass::OrderlySignal(sig)
            } else {
                ExitClass::BadSignal(sig)
            }
        } else {
            match status.code().unwrap_or(0) {
                0 => ExitClass::Clean,
                code => ExitClass::BadExit(code),
            }
        }
    }

    pub fn is_bad(&self) -> bool {
        matches!(self, ExitClass::BadExit(_) | ExitClass::BadSignal(_))
    }
}

/// Apply the §reap policy to a job whose child just died.
///
/// Returns true when the exit counted as bad (after the too-short-run
/// penalty). The reward reset runs before the bad-exit increment, so a
/// long-lived child that then dies badly ends at exactly one failure.
pub fn apply(job: &mut Job, class: ExitClass, time_alive: Duration) -> bool {
    let mut bad_exit = false;

    match class {
        ExitClass::Clean => {}
        ExitClass::BadExit(code) => {
            log::warn!("{}: exited with exit code: {}", job.label, code);
            bad_exit = true;
        }
        ExitClass::OrderlySignal(sig) => {
            log::info!("{}: exited: signal {}", job.label, sig);
        }
        ExitClass::BadSignal(sig) => {
            log::warn!("{}: exited abnormally: signal {}", job.label, sig);
            bad_exit = true;
        }
    }

    if !job.manifest.on_demand() {
        if time_alive < MIN_JOB_RUN_TIME {
            log::warn!("{}: respawning too quickly, throttling", job.label);
            bad_exit = true;
            job.throttled = true;
        } else if time_alive >= REWARD_JOB_RUN_TIME {
            log::info!("{}: lived long enough, forgiving past exit failures", job.label);
            job.failed_exits = 0;
        }
    }

    if bad_exit {
        job.failed_exits += 1;
    }

    if job.failed_exits > 0 {
        let left = FAILED_EXITS_THRESHOLD.saturating_sub(job.failed_exits);
        if left > 0 {
            log::warn!(
                "{}: {} more failure{} without living at least {}s will cause removal",
                job.label,
                left,
                if left > 1 { "s" } else { "" },
                REWARD_JOB_RUN_TIME.as_secs()
            );
        }
    }

    bad_exit
}

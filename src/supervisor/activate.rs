//! Activation sources: the event streams that demand "start this job
//! now".
//!
//! Arming spawns one watcher task per source; each task sends a single
//! kind of [`Event::Activation`] tagged with the arm-cycle generation.
//! Disarming aborts the tasks, so a source can never fire twice into the
//! same cycle, and anything already in flight is dropped by the
//! generation check in the event handler.

use std::os::unix::io::{FromRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;

use crate::manifest::keys;

use super::calendar::{self, CalendarSpec};
use super::job::JobState;
use super::{ActivationKind, Event, Supervisor};

impl Supervisor {
    /// Arm every declared source of a job and mark it *Watching*.
    ///
    /// Returns true when a queue directory already has entries and the
    /// job should start right away (suppressed during shutdown).
    pub(super) fn arm_sources(&mut self, idx: usize) -> bool {
        let event_tx = self.event_tx.clone();

        let job = &mut self.jobs[idx];
        job.disarm();
        let generation = job.generation;
        let label = job.label.clone();

        let socket_fds = job.manifest.socket_fds();
        let watch_paths = job.manifest.string_array(keys::WATCH_PATHS);
        let queue_dirs = job.manifest.string_array(keys::QUEUE_DIRECTORIES);
        let interval = job
            .manifest
            .int_key(keys::START_INTERVAL)
            .filter(|s| *s > 0);
        let cal_spec = job
            .manifest
            .value()
            .get(keys::START_CALENDAR_INTERVAL)
            .map(CalendarSpec::from_value);

        for fd in socket_fds {
            // Watch a private dup of the descriptor: it shares the open
            // file description (and thus readiness) but keeps reactor
            // registrations from colliding across arm cycles.
            let watch_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
            if watch_fd < 0 {
                log::warn!(
                    "{}: cannot dup fd {}: {}",
                    label,
                    fd,
                    std::io::Error::last_os_error()
                );
                continue;
            }
            let owned = unsafe { OwnedFd::from_raw_fd(watch_fd) };
            let tx = event_tx.clone();
            let label = label.clone();
            job.armed.push(tokio::spawn(async move {
                let afd = match AsyncFd::with_interest(owned, Interest::READABLE) {
                    Ok(afd) => afd,
                    Err(e) => {
                        log::warn!("{}: cannot watch fd {}: {}", label, fd, e);
                        return;
                    }
                };
                match afd.readable().await {
                    Ok(mut guard) => {
                        guard.clear_ready();
                        let _ = tx.send(Event::Activation {
                            label,
                            generation,
                            kind: ActivationKind::Socket,
                        });
                        // One shot; the next arm cycle watches again.
                    }
                    Err(e) => log::warn!("{}: error waiting on fd {}: {}", label, fd, e),
                }
            }));
        }

        if !watch_paths.is_empty() {
            if let Some(handle) = spawn_fs_watcher(
                label.clone(),
                generation,
                watch_paths,
                ActivationKind::WatchPath,
                event_tx.clone(),
            ) {
                job.armed.push(handle);
            }
        }

        if !queue_dirs.is_empty() {
            if let Some(handle) = spawn_fs_watcher(
                label.clone(),
                generation,
                queue_dirs.clone(),
                ActivationKind::QueueDirectory,
                event_tx.clone(),
            ) {
                job.armed.push(handle);
            }
        }

        if let Some(secs) = interval {
            let tx = event_tx.clone();
            let label = label.clone();
            let period = Duration::from_secs(secs as u64);
            job.armed.push(tokio::spawn(async move {
                let start = tokio::time::Instant::now() + period;
                let mut ticker = tokio::time::interval_at(start, period);
                loop {
                    ticker.tick().await;
                    if tx
                        .send(Event::Activation {
                            label: label.clone(),
                            generation,
                            kind: ActivationKind::Interval,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }));
        }

        if let Some(spec) = cal_spec {
            let tx = event_tx.clone();
            let label = label.clone();
            job.armed.push(tokio::spawn(async move {
                loop {
                    let now = chrono::Local::now().naive_local();
                    let target = calendar::next_fire(&spec, now);
                    let wait = (target - now)
                        .to_std()
                        .unwrap_or(Duration::from_secs(60));
                    log::debug!("{}: next calendar fire at {}", label, target);
                    tokio::time::sleep(wait).await;
                    if tx
                        .send(Event::Activation {
                            label: label.clone(),
                            generation,
                            kind: ActivationKind::Calendar,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }));
        }

        job.state = JobState::Watching;

        // A queue directory that already has work is immediate demand.
        !self.shutdown_in_progress && self.queue_demand(idx)
    }

    /// True when any declared queue directory is non-empty. An empty
    /// scan after a wake is the spurious case and leaves the job
    /// watching.
    pub(super) fn queue_demand(&self, idx: usize) -> bool {
        let job = &self.jobs[idx];
        for dir in job.manifest.string_array(keys::QUEUE_DIRECTORIES) {
            match dir_has_files(Path::new(&dir)) {
                Ok(true) => return true,
                Ok(false) => {
                    log::debug!("{}: queue directory empty: {}", job.label, dir);
                }
                Err(e) => log::error!("{}: scanning {}: {}", job.label, dir, e),
            }
        }
        false
    }
}

fn dir_has_files(dir: &Path) -> std::io::Result<bool> {
    Ok(std::fs::read_dir(dir)?.next().is_some())
}

/// Bridge a filesystem watcher into the event loop.
///
/// The watcher lives inside the task so that aborting the task tears
/// down its registrations; access-only events are ignored, everything
/// else (writes, creates, removals, metadata, renames) is demand.
fn spawn_fs_watcher(
    label: String,
    generation: u64,
    paths: Vec<String>,
    kind: ActivationKind,
    tx: mpsc::UnboundedSender<Event>,
) -> Option<tokio::task::JoinHandle<()>> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();

    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let _ = raw_tx.send(res);
    }) {
        Ok(w) => w,
        Err(e) => {
            log::error!("{}: cannot create filesystem watcher: {}", label, e);
            return None;
        }
    };

    for path in &paths {
        if let Err(e) = watcher.watch(Path::new(path), RecursiveMode::NonRecursive) {
            // Missing paths are retried at the next arm cycle.
            log::warn!("{}: watch {}: {}", label, path, e);
        }
    }

    Some(tokio::spawn(async move {
        let _watcher = watcher;
        while let Some(res) = raw_rx.recv().await {
            let event = match res {
                Ok(ev) => ev,
                Err(e) => {
                    log::warn!("{}: filesystem watcher: {}", label, e);
                    continue;
                }
            };
            if matches!(event.kind, notify::EventKind::Access(_)) {
                continue;
            }
            log::debug!("{}: {} modified: {:?}", label, kind.as_str(), event.paths);
            if tx
                .send(Event::Activation {
                    label: label.clone(),
                    generation,
                    kind,
                })
                .is_err()
            {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_has_files() {
        let dir = std::path::PathBuf::from(format!(
            "/tmp/jobd-qdir-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(!dir_has_files(&dir).unwrap());

        std::fs::write(dir.join("item"), b"x").unwrap();
        assert!(dir_has_files(&dir).unwrap());

        std::fs::remove_dir_all(&dir).unwrap();
        assert!(dir_has_files(&dir).is_err());
    }
}

//! The supervisor engine: job registry, event loop, and lifecycle
//! transitions.
//!
//! One task owns all mutable state. Wakeup sources (child waiters,
//! activation watchers, timers, IPC connections, signals) are spawned
//! tasks that send typed events into the supervisor's channels; the run
//! loop drains them one at a time, so every handler sees a quiescent
//! registry. Process exits are polled ahead of everything else - an exit
//! always beats a pending activation in the same iteration.

mod activate;
pub mod calendar;
mod dispatch;
mod job;
mod reap;
pub mod rlimits;
mod spawn;

pub use job::{Job, JobState};
pub use reap::{
    ExitClass, FAILED_EXITS_THRESHOLD, IDLE_EXIT_TIMEOUT, MIN_JOB_RUN_TIME, REWARD_JOB_RUN_TIME,
};
pub use spawn::SpawnError;

use std::collections::{HashMap, VecDeque};
use std::process::ExitStatus;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::manifest::{keys, Manifest};
use crate::protocol::FIRSTBORN_LABEL;
use crate::wire::Value;

use rlimits::RlimitMirror;

/// How the supervisor was brought up.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory under which the per-uid control socket dir is created.
    pub socket_prefix: String,
    /// Use a uid.pid socket directory private to this process.
    pub create_session: bool,
    /// Running as the host's system supervisor: no idle exit, kernel
    /// knobs are adjusted alongside rlimit changes.
    pub system: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            socket_prefix: crate::protocol::SOCKET_PREFIX.to_string(),
            create_session: false,
            system: false,
        }
    }
}

/// Identity of one IPC connection, allocated by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

/// Which source demanded a start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Socket,
    WatchPath,
    QueueDirectory,
    Interval,
    Calendar,
}

impl ActivationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::WatchPath => "watch path",
            Self::QueueDirectory => "queue directory",
            Self::Interval => "start interval",
            Self::Calendar => "calendar interval",
        }
    }
}

/// Signals funneled into the event loop by the binary.
#[derive(Debug, Clone, Copy)]
pub enum DaemonSignal {
    Terminate,
    Interrupt,
    Hangup,
}

/// Everything that can wake the supervisor besides child exits and IPC.
#[derive(Debug)]
pub enum Event {
    Activation {
        label: String,
        generation: u64,
        kind: ActivationKind,
    },
    /// The post-throttle restart timer fired.
    ThrottleExpired { label: String, generation: u64 },
    /// The mount table changed; pending stdio redirections may now work.
    MountsChanged,
    Signal(DaemonSignal),
}

impl Event {
    /// Timer- and vnode-sourced events are held back while any
    /// connection has batch disabled (and for good once shutdown
    /// starts); socket activations, exits and IPC stay live.
    fn gated(&self) -> bool {
        match self {
            Event::Activation { kind, .. } => !matches!(kind, ActivationKind::Socket),
            Event::ThrottleExpired { .. } => true,
            Event::MountsChanged | Event::Signal(_) => false,
        }
    }
}

/// A child died; sent by its waiter task.
#[derive(Debug)]
pub struct ExitNotice {
    pub label: String,
    pub spawn_id: u64,
    pub status: Option<ExitStatus>,
}

/// Connection lifecycle and requests, sent by IPC tasks.
pub enum IpcEvent {
    Opened {
        conn: ConnId,
        /// Set on the trusted hand-off connection the launcher creates
        /// for a service-ipc child.
        associated_job: Option<String>,
    },
    Request {
        conn: ConnId,
        msg: Value,
        reply: oneshot::Sender<Value>,
    },
    Closed { conn: ConnId },
}

pub(crate) struct ConnState {
    pub(crate) disabled_batch: bool,
    pub(crate) associated_job: Option<String>,
}

pub struct Supervisor {
    cfg: SupervisorConfig,
    jobs: Vec<Job>,
    conns: HashMap<ConnId, ConnState>,
    batch_disabler_count: u32,
    deferred: VecDeque<Event>,
    shutdown_in_progress: bool,
    total_children: usize,
    spawn_seq: u64,
    pub(crate) pending_stdout: Option<String>,
    pub(crate) pending_stderr: Option<String>,
    pub(crate) rlimits: RlimitMirror,
    event_tx: mpsc::UnboundedSender<Event>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    ipc_tx: mpsc::UnboundedSender<IpcEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<Event>>,
    exit_rx: Option<mpsc::UnboundedReceiver<ExitNotice>>,
    ipc_rx: Option<mpsc::UnboundedReceiver<IpcEvent>>,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig) -> Supervisor {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (ipc_tx, ipc_rx) = mpsc::unbounded_channel();
        Supervisor {
            cfg,
            jobs: Vec::new(),
            conns: HashMap::new(),
            batch_disabler_count: 0,
            deferred: VecDeque::new(),
            shutdown_in_progress: false,
            total_children: 0,
            spawn_seq: 0,
            pending_stdout: None,
            pending_stderr: None,
            rlimits: RlimitMirror::new(),
            event_tx,
            exit_tx,
            ipc_tx,
            event_rx: Some(event_rx),
            exit_rx: Some(exit_rx),
            ipc_rx: Some(ipc_rx),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.cfg
    }

    /// Sender the IPC listener uses for connection events.
    pub fn ipc_sender(&self) -> mpsc::UnboundedSender<IpcEvent> {
        self.ipc_tx.clone()
    }

    /// Sender for signals and other external events.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<Event> {
        self.event_tx.clone()
    }

    pub fn job(&self, label: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.label == label)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    fn find_job(&self, label: &str) -> Option<usize> {
        self.jobs.iter().position(|j| j.label == label)
    }

    /// Load one submitted manifest: validate, take ownership of its
    /// descriptors, realize listeners, arm sources, maybe start.
    /// Returns the errno-style reply.
    pub fn load_job(&mut self, submitted: &mut Value) -> Value {
        let Some(label) = submitted.get(keys::LABEL).and_then(Value::as_str) else {
            return Value::errno(nix::errno::Errno::EINVAL);
        };
        let label = label.to_string();

        if self.find_job(&label).is_some() {
            log::warn!("{}: already loaded", label);
            return Value::errno(nix::errno::Errno::EEXIST);
        }

        let mut manifest = match Manifest::new(submitted.clone()) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("{}: rejected: {}", label, e);
                return Value::errno(nix::errno::Errno::EINVAL);
            }
        };
        // The copy owns the descriptors now; connection teardown must
        // not close them.
        submitted.revoke_fds();

        if let Err(e) = manifest.open_listeners() {
            log::warn!("{}: {}", label, e);
            manifest.value_mut().close_fds();
            return Value::errno(nix::errno::Errno::EINVAL);
        }

        for (key, value) in manifest.string_dict(keys::USER_ENVIRONMENT_VARIABLES) {
            std::env::set_var(key, value);
        }

        if manifest.int_key(keys::START_INTERVAL) == Some(0) {
            log::warn!("{}: start-interval is zero, ignoring", label);
        }

        let on_demand = manifest.on_demand();
        let run_at_load = manifest.bool_key(keys::RUN_AT_LOAD);

        self.jobs.push(Job::new(manifest));
        let idx = self.jobs.len() - 1;
        log::info!("{}: loaded", label);

        if on_demand {
            let demand = self.arm_sources(idx);
            if demand {
                self.start_job(idx);
            }
        }
        if !on_demand || run_at_load {
            self.start_job(idx);
        }

        Value::ok()
    }

    /// Synthesize and start the job carried on the daemon's own command
    /// line. Its clean exit later shuts the supervisor down.
    pub fn submit_firstborn(&mut self, argv: Vec<String>) {
        let mut tree = Value::Dict(vec![
            (keys::LABEL.into(), Value::string(FIRSTBORN_LABEL)),
            (
                keys::PROGRAM_ARGUMENTS.into(),
                Value::Array(argv.into_iter().map(Value::Str).collect()),
            ),
        ]);
        let resp = self.load_job(&mut tree);
        if resp.as_errno() != Some(0) {
            log::error!("failed to load firstborn job");
            return;
        }
        if let Some(idx) = self.find_job(FIRSTBORN_LABEL) {
            self.jobs[idx].firstborn = true;
            self.start_job(idx);
        }
    }

    /// Transition a job into *Starting*: disarm sources, fork, record
    /// the child, arm the exit watch.
    fn start_job(&mut self, idx: usize) {
        let label = self.jobs[idx].label.clone();
        if self.jobs[idx].pid.is_some() {
            log::debug!("{}: already running", label);
            return;
        }

        self.jobs[idx].checked_in = false;
        self.jobs[idx].disarm();

        self.spawn_seq += 1;
        let spawn_id = self.spawn_seq;
        log::debug!("{}: starting", label);

        let firstborn = self.jobs[idx].firstborn;
        match spawn::spawn_job(&self.jobs[idx].manifest, firstborn) {
            Ok(spawned) => {
                let job = &mut self.jobs[idx];
                job.pid = Some(spawned.pid);
                job.spawn_id = spawn_id;
                job.start_time = Some(Instant::now());
                job.state = JobState::Running;
                self.total_children += 1;
                log::info!("{}: started (pid {})", label, spawned.pid);

                let exit_tx = self.exit_tx.clone();
                let mut child = spawned.child;
                let waiter_label = label.clone();
                tokio::spawn(async move {
                    let status = child.wait().await;
                    let _ = exit_tx.send(ExitNotice {
                        label: waiter_label,
                        spawn_id,
                        status: status.ok(),
                    });
                });

                if let Some(stream) = spawned.trusted {
                    match stream.set_nonblocking(true).and_then(|_| {
                        tokio::net::UnixStream::from_std(stream)
                    }) {
                        Ok(stream) => {
                            crate::ipc::spawn_connection(stream, Some(label), self.ipc_tx.clone());
                        }
                        Err(e) => log::warn!("{}: trusted channel setup failed: {}", label, e),
                    }
                }
            }
            Err(e) if e.is_transient() => {
                log::warn!("{}: fork failed ({}), waiting for more demand", label, e);
                if self.jobs[idx].manifest.on_demand() {
                    self.arm_sources(idx);
                }
            }
            Err(e) => {
                log::error!("{}: {}", label, e);
                self.remove_job(idx);
            }
        }
    }

    /// Send the child (if any) a termination signal. The reap path does
    /// the rest.
    fn stop_job(&mut self, idx: usize) {
        let job = &self.jobs[idx];
        if let Some(pid) = job.pid {
            log::info!("{}: stopping (pid {})", job.label, pid);
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
    }

    /// Unlink a job: cancel its timers and watchers, close every owned
    /// descriptor, drop its user environment. A live child is signaled;
    /// its waiter task becomes the transient reaper whose notice finds
    /// no record and is discarded.
    fn remove_job(&mut self, idx: usize) {
        let mut job = self.jobs.remove(idx);
        log::info!("{}: removed", job.label);

        if let Some(pid) = job.pid {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            );
        }

        job.disarm();

        for (key, _) in job.manifest.string_dict(keys::USER_ENVIRONMENT_VARIABLES) {
            std::env::remove_var(key);
        }

        job.manifest.value_mut().close_fds();
    }

    /// Begin graceful shutdown: gate the async sources, signal every
    /// live child. The loop exits once the live-child count hits zero.
    fn do_shutdown(&mut self) {
        if self.shutdown_in_progress {
            return;
        }
        log::info!("shutdown requested");
        self.shutdown_in_progress = true;

        for idx in 0..self.jobs.len() {
            self.stop_job(idx);
        }
    }

    /// Take or release one connection's hold on the async event gate.
    fn batch_enable(&mut self, enable: bool, conn: ConnId) {
        let Some(state) = self.conns.get_mut(&conn) else {
            return;
        };
        if enable && state.disabled_batch {
            state.disabled_batch = false;
            self.batch_disabler_count -= 1;
            if self.batch_disabler_count == 0 && !self.shutdown_in_progress {
                log::debug!("batch jobs re-enabled");
                let drained: Vec<Event> = self.deferred.drain(..).collect();
                for ev in drained {
                    self.handle_event(ev);
                }
            }
        } else if !enable && !state.disabled_batch {
            state.disabled_batch = true;
            self.batch_disabler_count += 1;
            log::debug!("batch jobs disabled ({} holders)", self.batch_disabler_count);
        }
    }

    fn async_gated(&self) -> bool {
        self.batch_disabler_count > 0 || self.shutdown_in_progress
    }

    fn handle_exit(&mut self, notice: ExitNotice) {
        self.total_children = self.total_children.saturating_sub(1);

        let idx = match self.find_job(&notice.label) {
            Some(idx)
                if self.jobs[idx].spawn_id == notice.spawn_id
                    && self.jobs[idx].pid.is_some() =>
            {
                idx
            }
            _ => {
                // The record is already gone (removed while running) or
                // superseded; the status has served its only purpose.
                log::debug!("{}: reaped without a job record", notice.label);
                return;
            }
        };

        self.with_job_debug(idx, |sup, idx| sup.reap_job(idx, notice.status));
    }

    /// Reap one child and run the restart-fitness chain.
    fn reap_job(&mut self, idx: usize, status: Option<ExitStatus>) {
        let time_alive = self.jobs[idx].time_alive();
        let label = self.jobs[idx].label.clone();
        log::debug!("{}: reaping", label);

        let class = status.map(ExitClass::of).unwrap_or(ExitClass::Clean);
        let bad_exit = reap::apply(&mut self.jobs[idx], class, time_alive);

        let job = &mut self.jobs[idx];
        job.pid = None;
        job.state = JobState::Loaded;
        let firstborn = job.firstborn;
        let missed_checkin = job.manifest.service_ipc() && !job.checked_in;
        let failed_out = job.failed_exits >= FAILED_EXITS_THRESHOLD;

        // Each fitness check stands on its own: a firstborn that exits
        // badly is still subject to the check-in and failure-count rules.
        if firstborn && !bad_exit {
            log::debug!("{}: firstborn died, beginning shutdown", label);
            self.do_shutdown();
            return;
        }
        if missed_checkin {
            log::warn!("{}: failed to check in", label);
            self.remove_job(idx);
            return;
        }
        if failed_out {
            log::warn!("{}: too many failures in succession", label);
            self.remove_job(idx);
            return;
        }

        let on_demand = self.jobs[idx].manifest.on_demand();
        if on_demand || self.shutdown_in_progress {
            if !on_demand && self.shutdown_in_progress {
                log::info!(
                    "{}: exited during shutdown, will not restart unless demand requires it",
                    label
                );
            }
            let demand = self.arm_sources(idx);
            if demand {
                self.start_job(idx);
            }
            return;
        }

        if self.jobs[idx].throttled {
            let job = &mut self.jobs[idx];
            job.throttled = false;
            job.state = JobState::Throttled;
            log::warn!(
                "{}: will restart in {} seconds",
                label,
                MIN_JOB_RUN_TIME.as_secs()
            );
            let generation = job.generation;
            let tx = self.event_tx.clone();
            let timer_label = label.clone();
            self.jobs[idx].armed.push(tokio::spawn(async move {
                tokio::time::sleep(MIN_JOB_RUN_TIME).await;
                let _ = tx.send(Event::ThrottleExpired {
                    label: timer_label,
                    generation,
                });
            }));
            return;
        }

        self.start_job(idx);
    }

    fn handle_event(&mut self, ev: Event) {
        if self.async_gated() && ev.gated() {
            self.deferred.push_back(ev);
            return;
        }

        match ev {
            Event::Activation {
                label,
                generation,
                kind,
            } => {
                let Some(idx) = self.find_job(&label) else {
                    return;
                };
                if self.jobs[idx].generation != generation {
                    log::debug!("{}: stale {} event dropped", label, kind.as_str());
                    return;
                }
                if self.jobs[idx].pid.is_some() {
                    // Coalesced: a sibling source won this cycle.
                    return;
                }
                if self.shutdown_in_progress {
                    log::debug!("{}: activation suppressed during shutdown", label);
                    return;
                }
                self.with_job_debug(idx, |sup, idx| {
                    if kind == ActivationKind::QueueDirectory && !sup.queue_demand(idx) {
                        return;
                    }
                    log::debug!("{}: activated by {}", sup.jobs[idx].label, kind.as_str());
                    sup.start_job(idx);
                });
            }
            Event::ThrottleExpired { label, generation } => {
                let Some(idx) = self.find_job(&label) else {
                    return;
                };
                if self.jobs[idx].generation != generation || self.jobs[idx].pid.is_some() {
                    return;
                }
                self.start_job(idx);
            }
            Event::MountsChanged => self.apply_pending_stdio(),
            Event::Signal(sig) => match sig {
                DaemonSignal::Terminate | DaemonSignal::Interrupt => self.do_shutdown(),
                DaemonSignal::Hangup => {
                    log::debug!("hangup received, nothing to reload");
                }
            },
        }
    }

    fn handle_ipc(&mut self, ev: IpcEvent) {
        match ev {
            IpcEvent::Opened {
                conn,
                associated_job,
            } => {
                self.conns.insert(
                    conn,
                    ConnState {
                        disabled_batch: false,
                        associated_job,
                    },
                );
            }
            IpcEvent::Request { conn, mut msg, reply } => {
                let resp = self.dispatch(conn, &mut msg);
                // Descriptors not claimed by a handler must not leak.
                msg.close_fds();
                let _ = reply.send(resp);
            }
            IpcEvent::Closed { conn } => {
                self.batch_enable(true, conn);
                self.conns.remove(&conn);
            }
        }
    }

    /// Re-open `stdout-path` / `stderr-path` requests that were waiting
    /// for a filesystem to appear.
    fn apply_pending_stdio(&mut self) {
        for (pending, target) in [
            (&mut self.pending_stdout, libc::STDOUT_FILENO),
            (&mut self.pending_stderr, libc::STDERR_FILENO),
        ] {
            if let Some(path) = pending.as_deref() {
                match std::fs::OpenOptions::new().append(true).create(true).open(path) {
                    Ok(file) => {
                        use std::os::unix::io::AsRawFd;
                        unsafe { libc::dup2(file.as_raw_fd(), target) };
                        *pending = None;
                    }
                    Err(e) => log::debug!("stdio path {} still unavailable: {}", path, e),
                }
            }
        }
    }

    /// Temporarily widen the log threshold while handling an event for a
    /// job that asked for debugging.
    fn with_job_debug<F: FnOnce(&mut Self, usize)>(&mut self, idx: usize, f: F) {
        let debug = self.jobs.get(idx).map(|j| j.debug).unwrap_or(false);
        if !debug {
            return f(self, idx);
        }
        let old = log::max_level();
        log::set_max_level(log::LevelFilter::Debug);
        f(self, idx);
        log::set_max_level(old);
    }

    /// The event loop. Returns when shutdown completes or, in on-demand
    /// mode, after the idle timeout with an empty registry.
    pub async fn run(mut self) -> std::io::Result<()> {
        let mut exits = self.exit_rx.take().expect("run() called twice");
        let mut events = self.event_rx.take().expect("run() called twice");
        let mut requests = self.ipc_rx.take().expect("run() called twice");

        spawn_mounts_watcher(self.event_tx.clone());

        loop {
            if self.shutdown_in_progress && self.total_children == 0 {
                log::info!("last child reaped, exiting");
                return Ok(());
            }

            let idle =
                !self.cfg.system && self.jobs.is_empty() && !self.shutdown_in_progress;

            tokio::select! {
                biased;
                Some(notice) = exits.recv() => self.handle_exit(notice),
                Some(ev) = events.recv() => self.handle_event(ev),
                Some(req) = requests.recv() => self.handle_ipc(req),
                _ = tokio::time::sleep(IDLE_EXIT_TIMEOUT), if idle => {
                    log::info!("no jobs and nothing to wait for, exiting");
                    return Ok(());
                }
            }
        }
    }
}

/// Watch the mount table for changes so deferred stdio redirections can
/// be retried once their target filesystem shows up.
fn spawn_mounts_watcher(tx: mpsc::UnboundedSender<Event>) {
    use tokio::io::unix::AsyncFd;
    use tokio::io::Interest;

    let file = match std::fs::File::open("/proc/self/mounts") {
        Ok(f) => f,
        Err(e) => {
            log::debug!("mount table unavailable: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        let afd = match AsyncFd::with_interest(file, Interest::PRIORITY) {
            Ok(a) => a,
            Err(e) => {
                log::debug!("cannot watch mount table: {}", e);
                return;
            }
        };
        loop {
            match afd.ready(Interest::PRIORITY).await {
                Ok(mut guard) => {
                    guard.clear_ready();
                    if tx.send(Event::MountsChanged).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
            // Mount storms pulse; let them settle.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    });
}

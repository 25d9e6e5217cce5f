//! Control-plane request handlers.
//!
//! A message is either a bare verb string or a mapping from verb to
//! argument; the first verb with a handler produces the reply. The match
//! below is the authoritative verb table - adding a verb means adding an
//! arm, and an unknown verb falls out as "not implemented".

use nix::errno::Errno;

use crate::manifest::keys;
use crate::protocol::verbs;
use crate::wire::Value;

use super::{ConnId, Supervisor, MIN_JOB_RUN_TIME};

impl Supervisor {
    pub(super) fn dispatch(&mut self, conn: ConnId, msg: &mut Value) -> Value {
        match msg {
            Value::Str(verb) => {
                let verb = verb.clone();
                self.dispatch_verb(conn, &verb, None)
                    .unwrap_or_else(|| Value::errno(Errno::ENOSYS))
            }
            Value::Dict(_) => {
                let verbs: Vec<String> = msg
                    .as_dict()
                    .unwrap()
                    .iter()
                    .map(|(k, _)| k.clone())
                    .collect();
                for verb in verbs {
                    let arg = msg.get_mut(&verb);
                    if let Some(resp) = self.dispatch_verb(conn, &verb, arg) {
                        return resp;
                    }
                }
                Value::errno(Errno::ENOSYS)
            }
            _ => Value::errno(Errno::EINVAL),
        }
    }

    fn dispatch_verb(
        &mut self,
        conn: ConnId,
        verb: &str,
        arg: Option<&mut Value>,
    ) -> Option<Value> {
        let resp = match verb {
            verbs::SUBMIT_JOB => match arg {
                Some(Value::Array(batch)) => {
                    let results = batch.iter_mut().map(|t| self.load_job(t)).collect();
                    Value::Array(results)
                }
                Some(tree @ Value::Dict(_)) => self.load_job(tree),
                _ => Value::errno(Errno::EINVAL),
            },

            verbs::START_JOB | verbs::STOP_JOB | verbs::REMOVE_JOB => {
                let Some(label) = arg.and_then(|a| a.as_str().map(str::to_string)) else {
                    return Some(Value::errno(Errno::EINVAL));
                };
                match self.find_job(&label) {
                    None => Value::errno(Errno::ESRCH),
                    Some(idx) => {
                        match verb {
                            verbs::START_JOB => self.start_job(idx),
                            verbs::STOP_JOB => self.stop_job(idx),
                            _ => self.remove_job(idx),
                        }
                        Value::ok()
                    }
                }
            }

            verbs::GET_JOB => match arg.and_then(|a| a.as_str().map(str::to_string)) {
                Some(label) => match self.job(&label) {
                    Some(job) => job.manifest.value().copy_revoking_fds(),
                    None => Value::errno(Errno::ESRCH),
                },
                None => self.all_jobs_scrubbed(),
            },

            verbs::GET_JOB_WITH_HANDLES => {
                let Some(label) = arg.and_then(|a| a.as_str().map(str::to_string)) else {
                    return Some(Value::errno(Errno::EINVAL));
                };
                match self.job(&label) {
                    // Fd slots stay live; the wire layer transfers them.
                    Some(job) => job.manifest.value().clone(),
                    None => Value::errno(Errno::ESRCH),
                }
            }

            verbs::GET_JOBS => self.all_jobs_scrubbed(),

            verbs::CHECK_IN => self.check_in(conn),

            verbs::SET_USER_ENV => match arg {
                Some(Value::Dict(vars)) => {
                    for (key, value) in vars.iter() {
                        if let Value::Str(s) = value {
                            std::env::set_var(key, s);
                        }
                    }
                    Value::ok()
                }
                _ => Value::errno(Errno::EINVAL),
            },

            verbs::GET_USER_ENV => Value::Dict(
                std::env::vars()
                    .map(|(k, v)| (k, Value::Str(v)))
                    .collect(),
            ),

            verbs::UNSET_USER_ENV => match arg.and_then(|a| a.as_str().map(str::to_string)) {
                Some(key) => {
                    std::env::remove_var(key);
                    Value::ok()
                }
                None => Value::errno(Errno::EINVAL),
            },

            verbs::SET_RLIMITS => match arg {
                Some(Value::Opaque(bytes)) => {
                    let system = self.config().system;
                    self.rlimits.apply(bytes, system);
                    Value::Opaque(self.rlimits.encode())
                }
                _ => Value::errno(Errno::EINVAL),
            },

            verbs::GET_RLIMITS => Value::Opaque(self.rlimits.encode()),

            verbs::SET_LOG_MASK => match arg.and_then(|a| a.as_integer()) {
                Some(level) => {
                    let old = log::max_level();
                    log::set_max_level(level_from_int(level));
                    Value::Integer(level_to_int(old))
                }
                None => Value::errno(Errno::EINVAL),
            },

            verbs::GET_LOG_MASK => Value::Integer(level_to_int(log::max_level())),

            verbs::SET_UMASK => match arg.and_then(|a| a.as_integer()) {
                Some(mask) => {
                    let old = unsafe { libc::umask(mask as libc::mode_t) };
                    Value::Integer(old as i64)
                }
                None => Value::errno(Errno::EINVAL),
            },

            verbs::GET_UMASK => {
                let old = unsafe { libc::umask(0) };
                unsafe { libc::umask(old) };
                Value::Integer(old as i64)
            }

            verbs::GET_RUSAGE_SELF => rusage_opaque(libc::RUSAGE_SELF),
            verbs::GET_RUSAGE_CHILDREN => rusage_opaque(libc::RUSAGE_CHILDREN),

            verbs::SET_STDOUT => self.set_stdio(libc::STDOUT_FILENO, arg),
            verbs::SET_STDERR => self.set_stdio(libc::STDERR_FILENO, arg),

            verbs::BATCH_CONTROL => match arg.and_then(|a| a.as_bool()) {
                Some(enable) => {
                    self.batch_enable(enable, conn);
                    Value::ok()
                }
                None => Value::errno(Errno::EINVAL),
            },

            verbs::BATCH_QUERY => Value::Bool(self.batch_disabler_count == 0),

            verbs::SHUTDOWN => {
                self.do_shutdown();
                Value::ok()
            }

            verbs::RELOAD_TTYS => {
                // The console respawn table lives outside the core.
                log::info!("tty reload requested");
                Value::ok()
            }

            verbs::WORKAROUND_BONJOUR => match arg {
                Some(Value::Dict(attachments)) => {
                    for (label, fds) in attachments.iter_mut() {
                        let Some(idx) = self.find_job(label) else {
                            log::warn!("{}: bonjour fds for unknown job", label);
                            continue;
                        };
                        self.jobs[idx]
                            .manifest
                            .value_mut()
                            .insert(keys::BONJOUR_FDS, fds.clone());
                        // The job owns the descriptors now; keep the
                        // message teardown away from them.
                        fds.revoke_fds();
                    }
                    Value::ok()
                }
                _ => Value::errno(Errno::EINVAL),
            },

            _ => return None,
        };
        Some(resp)
    }

    /// Only legal on the trusted connection the launcher created for a
    /// service-ipc child. Returns the owning job's manifest, descriptors
    /// included, with a default timeout merged in.
    fn check_in(&mut self, conn: ConnId) -> Value {
        let associated = self
            .conns
            .get(&conn)
            .and_then(|c| c.associated_job.clone());
        let Some(label) = associated else {
            return Value::errno(Errno::EACCES);
        };
        let Some(idx) = self.find_job(&label) else {
            return Value::errno(Errno::ESRCH);
        };

        let job = &mut self.jobs[idx];
        job.checked_in = true;
        log::debug!("{}: checked in", label);

        let mut copy = job.manifest.value().clone();
        if copy.get(keys::TIMEOUT).is_none() {
            copy.insert(
                keys::TIMEOUT,
                Value::Integer(MIN_JOB_RUN_TIME.as_secs() as i64),
            );
        }
        copy
    }

    fn all_jobs_scrubbed(&self) -> Value {
        Value::Dict(
            self.jobs()
                .map(|j| (j.label.clone(), j.manifest.value().copy_revoking_fds()))
                .collect(),
        )
    }

    /// Path arguments wait for the next mount event (the target volume
    /// may not exist yet); descriptor arguments take effect at once.
    fn set_stdio(&mut self, target: libc::c_int, arg: Option<&mut Value>) -> Value {
        match arg {
            Some(Value::Str(path)) => {
                let slot = if target == libc::STDOUT_FILENO {
                    &mut self.pending_stdout
                } else {
                    &mut self.pending_stderr
                };
                *slot = Some(path.clone());
                Value::ok()
            }
            Some(Value::Fd(fd)) if *fd != -1 => {
                unsafe { libc::dup2(*fd, target) };
                Value::ok()
            }
            _ => Value::errno(Errno::EINVAL),
        }
    }
}

fn rusage_opaque(who: libc::c_int) -> Value {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(who, &mut usage) } != 0 {
        return Value::errno(Errno::last());
    }
    let bytes = unsafe {
        std::slice::from_raw_parts(
            (&usage as *const libc::rusage).cast::<u8>(),
            std::mem::size_of::<libc::rusage>(),
        )
    };
    Value::Opaque(bytes.to_vec())
}

fn level_to_int(level: log::LevelFilter) -> i64 {
    match level {
        log::LevelFilter::Off => 0,
        log::LevelFilter::Error => 1,
        log::LevelFilter::Warn => 2,
        log::LevelFilter::Info => 3,
        log::LevelFilter::Debug => 4,
        log::LevelFilter::Trace => 5,
    }
}

fn level_from_int(level: i64) -> log::LevelFilter {
    match level {
        i64::MIN..=0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

//! Child launcher: argv/env/fd assembly, fork, per-child attribute setup,
//! exec.
//!
//! Everything the child needs between fork and exec is resolved up front
//! and moved into the `pre_exec` closure as owned data; the closure is a
//! straight line of raw syscalls and ends in either success (the exec
//! follows) or an errno the parent sees as the spawn error.

use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::Command as StdCommand;

use tokio::process::{Child, Command};

use crate::manifest::{keys, Manifest};
use crate::protocol::TRUSTED_FD_ENV;
use crate::wire::Value;

use super::rlimits::LIMIT_KINDS;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("job has no program to exec")]
    NoProgram,

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("failed to create trusted socket pair: {0}")]
    TrustedPair(std::io::Error),

    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

impl SpawnError {
    /// Fork-level resource exhaustion is worth waiting out; anything
    /// else is a per-job fatal (a bad path, bad credentials, a manifest
    /// error) and the job should go away.
    pub fn is_transient(&self) -> bool {
        match self {
            SpawnError::Spawn(e) => matches!(
                e.raw_os_error(),
                Some(libc::EAGAIN) | Some(libc::ENOMEM) | Some(libc::EMFILE) | Some(libc::ENFILE)
            ),
            _ => false,
        }
    }
}

/// A successfully launched child.
pub struct Spawned {
    pub child: Child,
    pub pid: i32,
    /// Supervisor end of the service-ipc trust channel, when declared.
    pub trusted: Option<UnixStream>,
}

struct Credentials {
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    init_groups: Option<(CString, libc::gid_t)>,
}

fn resolve_credentials(manifest: &Manifest) -> Result<Credentials, SpawnError> {
    let mut creds = Credentials {
        uid: None,
        gid: None,
        init_groups: None,
    };

    if let Some(group) = manifest.str_key(keys::GROUP_NAME) {
        match nix::unistd::Group::from_name(group) {
            Ok(Some(g)) => creds.gid = Some(g.gid.as_raw()),
            _ => return Err(SpawnError::UnknownGroup(group.to_string())),
        }
    }

    if let Some(user) = manifest.str_key(keys::USER_NAME) {
        let pw = match nix::unistd::User::from_name(user) {
            Ok(Some(pw)) => pw,
            _ => return Err(SpawnError::UnknownUser(user.to_string())),
        };
        creds.uid = Some(pw.uid.as_raw());
        let gid = creds.gid.unwrap_or(pw.gid.as_raw());
        if creds.gid.is_none() {
            creds.gid = Some(pw.gid.as_raw());
        }
        if manifest.bool_key(keys::INIT_GROUPS) {
            let name = CString::new(user).map_err(|_| SpawnError::UnknownUser(user.into()))?;
            creds.init_groups = Some((name, gid));
        }
    }

    Ok(creds)
}

/// Per-job rlimit rows: slots present in the soft/hard mappings merged
/// over the limits the child would otherwise inherit.
fn resolve_job_limits(manifest: &Manifest) -> Vec<(nix::sys::resource::Resource, u64, u64)> {
    let soft = manifest.value().get(keys::SOFT_RESOURCE_LIMITS);
    let hard = manifest.value().get(keys::HARD_RESOURCE_LIMITS);
    if soft.is_none() && hard.is_none() {
        return Vec::new();
    }

    let field = |map: Option<&Value>, key: &str| -> Option<u64> {
        map.and_then(|m| m.get(key))
            .and_then(Value::as_integer)
            .map(|v| v as u64)
    };

    let mut rows = Vec::new();
    for (name, resource) in LIMIT_KINDS {
        let (soft_v, hard_v) = (field(soft, name), field(hard, name));
        if soft_v.is_none() && hard_v.is_none() {
            continue;
        }
        let current = nix::sys::resource::getrlimit(*resource).unwrap_or((u64::MAX, u64::MAX));
        rows.push((
            *resource,
            soft_v.unwrap_or(current.0),
            hard_v.unwrap_or(current.1),
        ));
    }
    rows
}

fn cstring_key(manifest: &Manifest, key: &str) -> Option<CString> {
    manifest.str_key(key).and_then(|s| CString::new(s).ok())
}

/// `session-create` asks for a session of the child's own before the
/// credential switch; inetd-compatibility jobs never get one.
fn wants_own_session(manifest: &Manifest) -> bool {
    manifest.value().get(keys::INETD_COMPATIBILITY).is_none()
        && manifest.bool_key(keys::SESSION_CREATE)
}

/// Launch one child for a job.
pub fn spawn_job(manifest: &Manifest, firstborn: bool) -> Result<Spawned, SpawnError> {
    let file = manifest.file_to_exec().ok_or(SpawnError::NoProgram)?;
    let argv = manifest.program_arguments();

    let mut cmd = StdCommand::new(&file);
    if let Some(first) = argv.first() {
        cmd.arg0(first);
        cmd.args(&argv[1..]);
    }

    for (k, v) in manifest.string_dict(keys::ENVIRONMENT_VARIABLES) {
        cmd.env(k, v);
    }

    // Trust channel for service-ipc children: our end becomes a control
    // connection, theirs is named in the environment.
    let trusted = if manifest.service_ipc() {
        Some(UnixStream::pair().map_err(SpawnError::TrustedPair)?)
    } else {
        None
    };
    let trusted_child_fd = trusted.as_ref().map(|(_, child_end)| child_end.as_raw_fd());
    if let Some(fd) = trusted_child_fd {
        cmd.env(TRUSTED_FD_ENV, fd.to_string());
    }

    // Descriptors the child inherits: every live fd in the manifest
    // (listeners, bonjour attachments) plus the trust channel.
    let mut inherit: Vec<RawFd> = Vec::new();
    manifest.value().for_each_fd(&mut |fd| inherit.push(fd));
    inherit.extend(trusted_child_fd);

    let creds = resolve_credentials(manifest)?;
    let limits = resolve_job_limits(manifest);
    let nice = manifest.int_key(keys::NICE).unwrap_or(0) as libc::c_int;
    let low_prio_io = manifest.bool_key(keys::LOW_PRIORITY_IO);
    let session_create = wants_own_session(manifest);
    let root_dir = cstring_key(manifest, keys::ROOT_DIRECTORY);
    let work_dir = cstring_key(manifest, keys::WORKING_DIRECTORY);
    let umask = manifest.int_key(keys::UMASK).map(|m| m as libc::mode_t);
    let stdout_path = cstring_key(manifest, keys::STDOUT_PATH);
    let stderr_path = cstring_key(manifest, keys::STDERR_PATH);

    unsafe {
        cmd.pre_exec(move || {
            if firstborn {
                libc::setpgid(0, 0);
                if libc::isatty(libc::STDIN_FILENO) == 1 {
                    libc::tcsetpgrp(libc::STDIN_FILENO, libc::getpid());
                }
            }

            if nice != 0 {
                libc::setpriority(libc::PRIO_PROCESS, 0, nice);
            }

            for (resource, soft, hard) in &limits {
                let _ = nix::sys::resource::setrlimit(*resource, *soft, *hard);
            }

            if low_prio_io {
                // ioprio_set(IOPRIO_WHO_PROCESS, self, IDLE class)
                libc::syscall(libc::SYS_ioprio_set, 1, 0, 3i32 << 13);
            }

            if session_create {
                // Session established before credentials change hands;
                // the trailing setsid covers everyone else.
                libc::setsid();
            }

            if let Some(root) = &root_dir {
                if libc::chroot(root.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::chdir(b"/\0".as_ptr().cast());
            }

            if let Some((name, gid)) = &creds.init_groups {
                if libc::initgroups(name.as_ptr(), *gid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if let Some(gid) = creds.gid {
                if libc::setgid(gid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if let Some(uid) = creds.uid {
                if libc::setuid(uid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            if let Some(dir) = &work_dir {
                if libc::chdir(dir.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            if let Some(mask) = umask {
                libc::umask(mask);
            }

            if let Some(path) = &stdout_path {
                redirect(path, libc::STDOUT_FILENO)?;
            }
            if let Some(path) = &stderr_path {
                redirect(path, libc::STDERR_FILENO)?;
            }

            for fd in &inherit {
                clear_cloexec(*fd);
            }

            // Fails when we are already a group leader (firstborn); the
            // child still runs.
            libc::setsid();

            Ok(())
        });
    }

    let mut cmd = Command::from(cmd);
    let child = cmd.spawn()?;
    let pid = child.id().map(|p| p as i32).unwrap_or(0);

    // The child holds its own copy of the trust channel now; keep only
    // our end.
    let trusted = trusted.map(|(ours, _theirs)| ours);

    Ok(Spawned {
        child,
        pid,
        trusted,
    })
}

fn redirect(path: &CString, target: RawFd) -> std::io::Result<()> {
    unsafe {
        let fd = libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT,
            0o666 as libc::c_uint,
        );
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        libc::dup2(fd, target);
        libc::close(fd);
    }
    Ok(())
}

fn clear_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        }
    }
}

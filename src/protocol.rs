//! Control-socket conventions shared by the daemon and its clients.
//!
//! One supervisor instance owns one directory under the socket prefix,
//! named by uid (uid.pid when a private session was requested), holding a
//! single stream socket named `sock`. The directory doubles as the
//! single-instance lock. Clients find the socket through the environment.

use std::path::PathBuf;

/// Default directory under which per-supervisor socket dirs are created.
pub const SOCKET_PREFIX: &str = "/var/run/jobd";

/// Environment variable naming the control socket for clients.
pub const SOCKET_ENV: &str = "JOBD_SOCKET_PATH";

/// Environment variable naming the trusted descriptor handed to
/// service-ipc children.
pub const TRUSTED_FD_ENV: &str = "JOBD_TRUSTED_FD";

/// Label given to the job synthesized from the daemon's own arguments.
pub const FIRSTBORN_LABEL: &str = "jobd.firstborn";

/// Directory holding the control socket for this uid.
///
/// A `session_pid` makes the directory private to one supervisor process.
pub fn socket_dir(prefix: &str, uid: u32, session_pid: Option<u32>) -> PathBuf {
    match session_pid {
        Some(pid) => PathBuf::from(format!("{}/{}.{}", prefix, uid, pid)),
        None => PathBuf::from(format!("{}/{}", prefix, uid)),
    }
}

/// The socket inside a supervisor directory.
pub fn socket_path(dir: &std::path::Path) -> PathBuf {
    dir.join("sock")
}

/// Request verbs accepted on the control socket.
///
/// A message is either a bare string (a verb with no argument) or a
/// mapping from verb to argument. The supervisor's dispatcher matches on
/// these exact strings.
pub mod verbs {
    pub const SUBMIT_JOB: &str = "submit-job";
    pub const START_JOB: &str = "start-job";
    pub const STOP_JOB: &str = "stop-job";
    pub const REMOVE_JOB: &str = "remove-job";
    pub const GET_JOB: &str = "get-job";
    pub const GET_JOB_WITH_HANDLES: &str = "get-job-with-handles";
    pub const GET_JOBS: &str = "get-jobs";
    pub const CHECK_IN: &str = "check-in";
    pub const SET_USER_ENV: &str = "set-user-env";
    pub const GET_USER_ENV: &str = "get-user-env";
    pub const UNSET_USER_ENV: &str = "unset-user-env";
    pub const SET_RLIMITS: &str = "set-rlimits";
    pub const GET_RLIMITS: &str = "get-rlimits";
    pub const SET_LOG_MASK: &str = "set-log-mask";
    pub const GET_LOG_MASK: &str = "get-log-mask";
    pub const SET_UMASK: &str = "set-umask";
    pub const GET_UMASK: &str = "get-umask";
    pub const GET_RUSAGE_SELF: &str = "get-rusage-self";
    pub const GET_RUSAGE_CHILDREN: &str = "get-rusage-children";
    pub const SET_STDOUT: &str = "set-stdout";
    pub const SET_STDERR: &str = "set-stderr";
    pub const BATCH_CONTROL: &str = "batch-control";
    pub const BATCH_QUERY: &str = "batch-query";
    pub const SHUTDOWN: &str = "shutdown";
    pub const RELOAD_TTYS: &str = "reload-ttys";
    pub const WORKAROUND_BONJOUR: &str = "workaround-bonjour";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_dir_per_uid() {
        let dir = socket_dir(SOCKET_PREFIX, 501, None);
        assert_eq!(dir, PathBuf::from("/var/run/jobd/501"));
        assert_eq!(socket_path(&dir), PathBuf::from("/var/run/jobd/501/sock"));
    }

    #[test]
    fn test_socket_dir_per_session() {
        let dir = socket_dir("/tmp/jobd-test", 0, Some(4242));
        assert_eq!(dir, PathBuf::from("/tmp/jobd-test/0.4242"));
    }
}

//! Job manifests: the tagged tree a client submits for one job, plus the
//! typed accessors the supervisor reads it through.
//!
//! The manifest is kept as a [`Value`] tree for its whole life (it is
//! handed back verbatim on `get-job` and `check-in`); this module wraps
//! it with validation and key lookups rather than deserializing it into a
//! struct.

use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::wire::Value;

/// Manifest keys the supervisor interprets. Anything else rides along
/// untouched.
pub mod keys {
    pub const LABEL: &str = "label";
    pub const PROGRAM: &str = "program";
    pub const PROGRAM_ARGUMENTS: &str = "program-arguments";
    pub const ON_DEMAND: &str = "on-demand";
    pub const RUN_AT_LOAD: &str = "run-at-load";
    pub const SERVICE_IPC: &str = "service-ipc";
    pub const INETD_COMPATIBILITY: &str = "inetd-compatibility";
    pub const DEBUG: &str = "debug";
    pub const ENVIRONMENT_VARIABLES: &str = "environment-variables";
    pub const USER_ENVIRONMENT_VARIABLES: &str = "user-environment-variables";
    pub const WORKING_DIRECTORY: &str = "working-directory";
    pub const ROOT_DIRECTORY: &str = "root-directory";
    pub const USER_NAME: &str = "user-name";
    pub const GROUP_NAME: &str = "group-name";
    pub const INIT_GROUPS: &str = "init-groups";
    pub const SESSION_CREATE: &str = "session-create";
    pub const LOW_PRIORITY_IO: &str = "low-priority-io";
    pub const UMASK: &str = "umask";
    pub const NICE: &str = "nice";
    pub const STDOUT_PATH: &str = "stdout-path";
    pub const STDERR_PATH: &str = "stderr-path";
    pub const SOFT_RESOURCE_LIMITS: &str = "soft-resource-limits";
    pub const HARD_RESOURCE_LIMITS: &str = "hard-resource-limits";
    pub const SOCKETS: &str = "sockets";
    pub const WATCH_PATHS: &str = "watch-paths";
    pub const QUEUE_DIRECTORIES: &str = "queue-directories";
    pub const START_INTERVAL: &str = "start-interval";
    pub const START_CALENDAR_INTERVAL: &str = "start-calendar-interval";
    pub const TIMEOUT: &str = "timeout";
    /// Reserved: fd array attached by the `workaround-bonjour` verb.
    pub const BONJOUR_FDS: &str = "bonjour-fds";

    pub const CAL_MINUTE: &str = "minute";
    pub const CAL_HOUR: &str = "hour";
    pub const CAL_DAY: &str = "day";
    pub const CAL_WEEKDAY: &str = "weekday";
    pub const CAL_MONTH: &str = "month";

    pub const SOCK_TYPE: &str = "type";
    pub const SOCK_PATHNAME: &str = "pathname";
    pub const SOCK_PORT: &str = "port";
    pub const SOCK_HOST: &str = "host";
    pub const SOCK_PASSIVE: &str = "passive";
    /// Descriptors realized from a socket entry, in creation order.
    pub const SOCK_FDS: &str = "fds";
}

/// Resource-limit keys inside the soft/hard limit mappings, paired with
/// the limit kind they map to. Order matches [`crate::supervisor::rlimits`].
pub const RESOURCE_LIMIT_KEYS: &[&str] = &[
    "core", "cpu", "data", "fsize", "memlock", "nofile", "nproc", "rss", "stack",
];

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest is not a mapping")]
    NotADict,

    #[error("manifest has no label")]
    MissingLabel,

    #[error("manifest has neither program nor program-arguments")]
    MissingProgram,

    #[error("socket entry for {0}: {1}")]
    Listener(String, std::io::Error),
}

/// A validated job manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    tree: Value,
}

impl Manifest {
    /// Validate and take ownership of a submitted tree. The caller is
    /// expected to have copied it; fd slots now belong to this manifest.
    ///
    /// `on-demand` defaults to true and is materialized into the tree so
    /// clients reading the job back see the effective policy.
    pub fn new(tree: Value) -> Result<Manifest, ManifestError> {
        if tree.as_dict().is_none() {
            return Err(ManifestError::NotADict);
        }

        let mut m = Manifest { tree };

        if m.str_key(keys::LABEL).is_none() {
            return Err(ManifestError::MissingLabel);
        }
        if m.str_key(keys::PROGRAM).is_none() && m.tree.get(keys::PROGRAM_ARGUMENTS).is_none() {
            return Err(ManifestError::MissingProgram);
        }

        if m.tree.get(keys::ON_DEMAND).is_none() {
            m.tree.insert(keys::ON_DEMAND, Value::Bool(true));
        }

        Ok(m)
    }

    pub fn label(&self) -> &str {
        self.str_key(keys::LABEL).unwrap_or_default()
    }

    pub fn value(&self) -> &Value {
        &self.tree
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.tree
    }

    pub fn into_value(self) -> Value {
        self.tree
    }

    pub fn str_key(&self, key: &str) -> Option<&str> {
        self.tree.get(key).and_then(Value::as_str)
    }

    pub fn int_key(&self, key: &str) -> Option<i64> {
        self.tree.get(key).and_then(Value::as_integer)
    }

    /// Missing or mistyped keys read as false, as the original accessors
    /// do.
    pub fn bool_key(&self, key: &str) -> bool {
        self.tree
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn on_demand(&self) -> bool {
        self.bool_key(keys::ON_DEMAND)
    }

    /// inetd-compatibility implies the trusted-fd check-in channel.
    pub fn service_ipc(&self) -> bool {
        self.bool_key(keys::SERVICE_IPC) || self.tree.get(keys::INETD_COMPATIBILITY).is_some()
    }

    pub fn program_arguments(&self) -> Vec<String> {
        match self.tree.get(keys::PROGRAM_ARGUMENTS) {
            Some(Value::Array(a)) => a
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The file handed to exec: `program` when present, else argv[0].
    pub fn file_to_exec(&self) -> Option<String> {
        if let Some(p) = self.str_key(keys::PROGRAM) {
            return Some(p.to_string());
        }
        self.program_arguments().into_iter().next()
    }

    /// String entries of an array-valued key.
    pub fn string_array(&self, key: &str) -> Vec<String> {
        match self.tree.get(key) {
            Some(Value::Array(a)) => a
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// String-to-string pairs of a dict-valued key; mistyped values are
    /// skipped.
    pub fn string_dict(&self, key: &str) -> Vec<(String, String)> {
        match self.tree.get(key) {
            Some(Value::Dict(d)) => d
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Every live descriptor anywhere under `sockets`, in tree order.
    pub fn socket_fds(&self) -> Vec<RawFd> {
        let mut fds = Vec::new();
        if let Some(sockets) = self.tree.get(keys::SOCKETS) {
            sockets.for_each_fd(&mut |fd| fds.push(fd));
        }
        fds
    }

    /// Realize socket specs into open descriptors.
    ///
    /// Entries that already carry descriptors (submitted over the wire by
    /// a client that opened them itself) are left alone; entries that
    /// describe an address are opened here and the resulting descriptors
    /// recorded under the entry's `fds` key.
    pub fn open_listeners(&mut self) -> Result<(), ManifestError> {
        let Some(sockets) = self.tree.get_mut(keys::SOCKETS) else {
            return Ok(());
        };
        let Value::Dict(groups) = sockets else {
            return Ok(());
        };

        for (group, entries) in groups.iter_mut() {
            match entries {
                Value::Array(list) => {
                    for entry in list.iter_mut() {
                        open_listener_entry(group, entry)?;
                    }
                }
                Value::Dict(_) => open_listener_entry(group, entries)?,
                _ => {}
            }
        }

        Ok(())
    }
}

fn entry_has_fds(entry: &Value) -> bool {
    let mut seen = false;
    entry.for_each_fd(&mut |_| seen = true);
    seen
}

fn open_listener_entry(group: &str, entry: &mut Value) -> Result<(), ManifestError> {
    if entry.as_dict().is_none() || entry_has_fds(entry) {
        return Ok(());
    }

    let sock_type = entry
        .get(keys::SOCK_TYPE)
        .and_then(Value::as_str)
        .unwrap_or("stream")
        .to_string();
    let passive = entry
        .get(keys::SOCK_PASSIVE)
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let fd = if let Some(path) = entry.get(keys::SOCK_PATHNAME).and_then(Value::as_str) {
        open_unix(path, &sock_type, passive)
    } else if let Some(port) = entry.get(keys::SOCK_PORT).and_then(Value::as_integer) {
        let host = entry
            .get(keys::SOCK_HOST)
            .and_then(Value::as_str)
            .unwrap_or("0.0.0.0");
        open_inet(host, port as u16, &sock_type, passive)
    } else {
        // Nothing to open; a later submit may attach descriptors.
        log::debug!("socket group {}: entry has neither pathname nor port", group);
        return Ok(());
    }
    .map_err(|e| ManifestError::Listener(group.to_string(), e))?;

    log::debug!("socket group {}: opened fd {}", group, fd);
    entry.insert(keys::SOCK_FDS, Value::Array(vec![Value::Fd(fd)]));
    Ok(())
}

fn open_unix(path: &str, sock_type: &str, passive: bool) -> std::io::Result<RawFd> {
    use std::os::unix::net::{UnixDatagram, UnixListener, UnixStream};

    if passive {
        // Stale socket files from a previous run would fail the bind.
        let _ = std::fs::remove_file(path);
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match (sock_type, passive) {
        ("dgram", true) => {
            let sock = UnixDatagram::bind(path)?;
            Ok(steal_fd(sock))
        }
        ("dgram", false) => {
            let sock = UnixDatagram::unbound()?;
            sock.connect(path)?;
            Ok(steal_fd(sock))
        }
        (_, true) => {
            let listener = UnixListener::bind(path)?;
            Ok(steal_fd(listener))
        }
        (_, false) => {
            let stream = UnixStream::connect(path)?;
            Ok(steal_fd(stream))
        }
    }
}

fn open_inet(host: &str, port: u16, sock_type: &str, passive: bool) -> std::io::Result<RawFd> {
    use std::net::{TcpListener, TcpStream, UdpSocket};

    let addr = format!("{}:{}", host, port);
    match (sock_type, passive) {
        ("dgram", true) => Ok(steal_fd(UdpSocket::bind(&addr)?)),
        ("dgram", false) => {
            let sock = UdpSocket::bind("0.0.0.0:0")?;
            sock.connect(&addr)?;
            Ok(steal_fd(sock))
        }
        (_, true) => Ok(steal_fd(TcpListener::bind(&addr)?)),
        (_, false) => Ok(steal_fd(TcpStream::connect(&addr)?)),
    }
}

/// Take the raw fd out of a socket wrapper without closing it on drop.
/// The manifest tree is the owner from here on.
fn steal_fd<T: AsRawFd>(sock: T) -> RawFd {
    let fd = sock.as_raw_fd();
    mem::forget(sock);
    fd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    fn minimal(label: &str) -> Value {
        dict(vec![
            (keys::LABEL, Value::string(label)),
            (keys::PROGRAM, Value::string("/bin/true")),
        ])
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            Manifest::new(Value::Integer(3)),
            Err(ManifestError::NotADict)
        ));
        assert!(matches!(
            Manifest::new(dict(vec![(keys::PROGRAM, Value::string("/bin/true"))])),
            Err(ManifestError::MissingLabel)
        ));
        assert!(matches!(
            Manifest::new(dict(vec![(keys::LABEL, Value::string("x"))])),
            Err(ManifestError::MissingProgram)
        ));
        assert!(Manifest::new(minimal("x")).is_ok());
    }

    #[test]
    fn test_on_demand_defaults_true() {
        let m = Manifest::new(minimal("x")).unwrap();
        assert!(m.on_demand());
        // The default is written back into the tree.
        assert_eq!(m.value().get(keys::ON_DEMAND), Some(&Value::Bool(true)));

        let mut explicit = minimal("y");
        explicit.insert(keys::ON_DEMAND, Value::Bool(false));
        let m = Manifest::new(explicit).unwrap();
        assert!(!m.on_demand());
    }

    #[test]
    fn test_inetd_compat_implies_service_ipc() {
        let mut tree = minimal("x");
        tree.insert(keys::INETD_COMPATIBILITY, Value::Dict(vec![]));
        let m = Manifest::new(tree).unwrap();
        assert!(m.service_ipc());
        assert!(!m.bool_key(keys::SERVICE_IPC));
    }

    #[test]
    fn test_file_to_exec_prefers_program() {
        let mut tree = minimal("x");
        tree.insert(
            keys::PROGRAM_ARGUMENTS,
            Value::Array(vec![Value::string("cat"), Value::string("-u")]),
        );
        let m = Manifest::new(tree).unwrap();
        assert_eq!(m.file_to_exec().as_deref(), Some("/bin/true"));
        assert_eq!(m.program_arguments(), vec!["cat", "-u"]);

        let argv_only = dict(vec![
            (keys::LABEL, Value::string("y")),
            (
                keys::PROGRAM_ARGUMENTS,
                Value::Array(vec![Value::string("/bin/echo"), Value::string("hi")]),
            ),
        ]);
        let m = Manifest::new(argv_only).unwrap();
        assert_eq!(m.file_to_exec().as_deref(), Some("/bin/echo"));
    }

    #[test]
    fn test_open_listeners_unix_stream() {
        let path = format!("/tmp/jobd-manifest-test-{}.sock", std::process::id());
        let mut tree = minimal("x");
        tree.insert(
            keys::SOCKETS,
            dict(vec![(
                "listener",
                Value::Array(vec![dict(vec![
                    (keys::SOCK_TYPE, Value::string("stream")),
                    (keys::SOCK_PATHNAME, Value::string(path.as_str())),
                    (keys::SOCK_PASSIVE, Value::Bool(true)),
                ])]),
            )]),
        );

        let mut m = Manifest::new(tree).unwrap();
        m.open_listeners().unwrap();

        let fds = m.socket_fds();
        assert_eq!(fds.len(), 1);
        assert!(fds[0] >= 0);

        // Connecting proves the descriptor is a live listener.
        std::os::unix::net::UnixStream::connect(&path).unwrap();

        m.value_mut().close_fds();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_open_listeners_skips_entries_with_fds() {
        let mut tree = minimal("x");
        tree.insert(
            keys::SOCKETS,
            dict(vec![(
                "given",
                Value::Array(vec![dict(vec![(keys::SOCK_FDS, Value::Array(vec![Value::Fd(42)]))])]),
            )]),
        );
        let mut m = Manifest::new(tree).unwrap();
        m.open_listeners().unwrap();
        assert_eq!(m.socket_fds(), vec![42]);
    }
}

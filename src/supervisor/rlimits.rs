//! Process-wide resource-limit mirror.
//!
//! The supervisor keeps its own copy of every rlimit tuple so clients can
//! read the effective limits without a syscall storm, and so a set
//! request can detect which slots actually changed. The kernel may clamp
//! what we ask for, so every write is followed by a re-read.

use nix::sys::resource::{getrlimit, setrlimit, Resource};

/// Limit kinds carried in the mirror, in wire order. Matches
/// [`crate::manifest::RESOURCE_LIMIT_KEYS`].
pub const LIMIT_KINDS: &[(&str, Resource)] = &[
    ("core", Resource::RLIMIT_CORE),
    ("cpu", Resource::RLIMIT_CPU),
    ("data", Resource::RLIMIT_DATA),
    ("fsize", Resource::RLIMIT_FSIZE),
    ("memlock", Resource::RLIMIT_MEMLOCK),
    ("nofile", Resource::RLIMIT_NOFILE),
    ("nproc", Resource::RLIMIT_NPROC),
    ("rss", Resource::RLIMIT_RSS),
    ("stack", Resource::RLIMIT_STACK),
];

/// The kernel will not clamp the global process maximum for us.
const NPROC_HARD_CEILING: u64 = 2048 + 20;

/// Mirror of the supervisor's own limits, one `(soft, hard)` per kind.
pub struct RlimitMirror {
    limits: Vec<(u64, u64)>,
}

impl Default for RlimitMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl RlimitMirror {
    /// Read every limit from the kernel.
    pub fn new() -> RlimitMirror {
        let limits = LIMIT_KINDS
            .iter()
            .map(|(name, res)| match getrlimit(*res) {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("getrlimit({}): {}", name, e);
                    (u64::MAX, u64::MAX)
                }
            })
            .collect();
        RlimitMirror { limits }
    }

    pub fn get(&self, index: usize) -> Option<(u64, u64)> {
        self.limits.get(index).copied()
    }

    /// Opaque wire form: `(soft, hard)` u64 pairs in `LIMIT_KINDS` order.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.limits.len() * 16);
        for (soft, hard) in &self.limits {
            out.extend_from_slice(&soft.to_ne_bytes());
            out.extend_from_slice(&hard.to_ne_bytes());
        }
        out
    }

    /// Apply a client-submitted limit array.
    ///
    /// Oversized input is truncated with a warning; each changed slot is
    /// pushed to the kernel (preceded by the matching system-wide knobs
    /// when running as the system supervisor) and then re-read, since the
    /// kernel may clamp.
    pub fn apply(&mut self, bytes: &[u8], system: bool) {
        let mut count = bytes.len() / 16;
        if count > self.limits.len() {
            log::warn!("too much rlimit data sent");
            count = self.limits.len();
        }

        for i in 0..count {
            let soft = u64::from_ne_bytes(bytes[i * 16..i * 16 + 8].try_into().unwrap());
            let hard = u64::from_ne_bytes(bytes[i * 16 + 8..i * 16 + 16].try_into().unwrap());

            if (soft, hard) == self.limits[i] {
                continue;
            }

            let (name, resource) = LIMIT_KINDS[i];

            if system {
                adjust_kernel_knobs(name, soft, hard);
            }

            if let Err(e) = setrlimit(resource, soft, hard) {
                log::warn!("setrlimit({}, {}, {}): {}", name, soft, hard, e);
            }
            match getrlimit(resource) {
                Ok(pair) => self.limits[i] = pair,
                Err(e) => log::warn!("getrlimit({}): {}", name, e),
            }
        }
    }
}

/// Raise the matching system-wide ceilings before a per-process limit
/// change, the way the system supervisor is expected to.
fn adjust_kernel_knobs(name: &str, soft: u64, hard: u64) {
    let knobs: &[(&str, u64)] = match name {
        "nofile" => &[
            ("/proc/sys/fs/file-max", hard),
            ("/proc/sys/fs/nr_open", soft),
        ],
        "nproc" => {
            let ceiling = hard.min(NPROC_HARD_CEILING);
            return write_knob("/proc/sys/kernel/threads-max", ceiling);
        }
        _ => return,
    };
    for (path, value) in knobs {
        write_knob(path, *value);
    }
}

fn write_knob(path: &str, value: u64) {
    if let Err(e) = std::fs::write(path, value.to_string()) {
        log::warn!("writing {} to {}: {}", value, path, e);
    }
}

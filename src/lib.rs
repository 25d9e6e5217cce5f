//! jobd - per-host job supervisor
//!
//! A single-process daemon that:
//! - Loads job manifests over a local control socket
//! - Owns the lifecycle of every child process it spawns
//! - Starts on-demand jobs from activation sources (sockets, watched
//!   paths, queue directories, interval and calendar timers)
//! - Contains crashing children with a minimum-runtime throttle and a
//!   failure-count removal policy
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                      jobd                        │
//! ├──────────────────────────────────────────────────┤
//! │  Wire codec  │  Job registry  │  Control socket  │
//! ├──────────────────────────────────────────────────┤
//! │        Event loop (exits > events > IPC)         │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod ipc;
pub mod manifest;
pub mod protocol;
pub mod supervisor;
pub mod wire;

pub use manifest::Manifest;
pub use supervisor::{Supervisor, SupervisorConfig};
pub use wire::Value;

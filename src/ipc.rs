//! The local control plane: socket directory setup, the accept loop, and
//! per-connection request/reply tasks.
//!
//! One supervisor owns one directory under the socket prefix, guarded by
//! an exclusive advisory lock on the directory descriptor; a second
//! supervisor for the same uid/session finds the lock held and bows out.
//! Connections are served by spawned tasks that decode framed messages,
//! hand them to the supervisor, and write the reply back - queued behind
//! the socket's writability when the peer is slow to drain.

use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{self, SOCKET_ENV};
use crate::supervisor::{ConnId, IpcEvent};
use crate::wire::{MessageReader, MessageWriter, ReadOutcome, Value};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// The bound control socket plus the lock that makes it exclusive.
pub struct ControlServer {
    listener: UnixListener,
    /// Held open for the advisory lock on the socket directory.
    _lock: std::fs::File,
    dir: PathBuf,
    sock: PathBuf,
}

impl ControlServer {
    /// Create the per-uid socket directory, take the single-instance
    /// lock, bind the socket under a restrictive umask, and publish the
    /// path in the environment.
    ///
    /// A lock already held by another supervisor surfaces as
    /// `WouldBlock`; the caller is expected to exit successfully.
    pub fn bind(prefix: &str, create_session: bool) -> io::Result<ControlServer> {
        let uid = nix::unistd::getuid().as_raw();
        let session = create_session.then(std::process::id);
        let dir = protocol::socket_dir(prefix, uid, session);

        let mut builder = std::fs::DirBuilder::new();
        builder.mode(0o755);
        match builder.create(prefix) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        let mut builder = std::fs::DirBuilder::new();
        builder.mode(0o700);
        match builder.create(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !dir.is_dir() {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }

        let lock = std::fs::File::open(&dir)?;
        let rc = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    format!("another supervisor owns {}", dir.display()),
                ));
            }
            return Err(err);
        }

        let sock = protocol::socket_path(&dir);
        match std::fs::remove_file(&sock) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let old_umask = unsafe { libc::umask(0o077) };
        let listener = UnixListener::bind(&sock);
        unsafe { libc::umask(old_umask) };
        let listener = listener?;

        std::env::set_var(SOCKET_ENV, &sock);
        log::info!("listening on {}", sock.display());

        Ok(ControlServer {
            listener,
            _lock: lock,
            dir,
            sock,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.sock
    }

    /// Accept connections forever, one task per client.
    pub async fn serve(self, tx: mpsc::UnboundedSender<IpcEvent>) -> io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => spawn_connection(stream, None, tx.clone()),
                Err(e) => log::error!("accept error: {}", e),
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.sock);
        let _ = std::fs::remove_dir(&self.dir);
    }
}

/// Register and serve one connection.
///
/// `associated_job` is set only by the child launcher for the trusted
/// end of a service-ipc socket pair; it is what entitles the peer to
/// `check-in`.
pub fn spawn_connection(
    stream: UnixStream,
    associated_job: Option<String>,
    tx: mpsc::UnboundedSender<IpcEvent>,
) {
    let conn = ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed));
    tokio::spawn(async move {
        let _ = tx.send(IpcEvent::Opened {
            conn,
            associated_job,
        });
        if let Err(e) = serve_connection(&stream, conn, &tx).await {
            log::debug!("connection {}: {}", conn.0, e);
        }
        let _ = tx.send(IpcEvent::Closed { conn });
    });
}

async fn serve_connection(
    stream: &UnixStream,
    conn: ConnId,
    tx: &mpsc::UnboundedSender<IpcEvent>,
) -> io::Result<()> {
    let fd = stream.as_raw_fd();
    let mut reader = MessageReader::new();

    loop {
        // A single chunk can carry more than one frame.
        let outcome = match reader.poll_buffered()? {
            ReadOutcome::Message(msg) => ReadOutcome::Message(msg),
            _ => {
                stream.readable().await?;
                match stream.try_io(Interest::READABLE, || reader.read_once(fd)) {
                    Ok(outcome) => outcome,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            }
        };

        match outcome {
            ReadOutcome::Closed => return Ok(()),
            ReadOutcome::Incomplete => continue,
            ReadOutcome::Message(msg) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx
                    .send(IpcEvent::Request {
                        conn,
                        msg,
                        reply: reply_tx,
                    })
                    .is_err()
                {
                    return Ok(());
                }
                let Ok(resp) = reply_rx.await else {
                    return Ok(());
                };
                write_message(stream, &resp).await?;
            }
        }
    }
}

/// Write one frame, waiting out `EAGAIN` on the socket's writability.
pub async fn write_message(stream: &UnixStream, value: &Value) -> io::Result<()> {
    let fd = stream.as_raw_fd();
    let mut writer = MessageWriter::new(value);
    loop {
        stream.writable().await?;
        match stream.try_io(Interest::WRITABLE, || writer.write_once(fd)) {
            Ok(true) => return Ok(()),
            Ok(false) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Read one frame from a client-side connection.
pub async fn read_message(stream: &UnixStream) -> io::Result<Value> {
    let fd = stream.as_raw_fd();
    let mut reader = MessageReader::new();
    loop {
        match reader.poll_buffered()? {
            ReadOutcome::Message(msg) => return Ok(msg),
            _ => {}
        }
        stream.readable().await?;
        match stream.try_io(Interest::READABLE, || reader.read_once(fd)) {
            Ok(ReadOutcome::Message(msg)) => return Ok(msg),
            Ok(ReadOutcome::Closed) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed before replying",
                ))
            }
            Ok(ReadOutcome::Incomplete) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// One request/reply exchange, the client calling convention.
pub async fn request(stream: &UnixStream, msg: &Value) -> io::Result<Value> {
    write_message(stream, msg).await?;
    read_message(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_prefix(tag: &str) -> String {
        format!("/tmp/jobd-ipc-test-{}-{}", tag, std::process::id())
    }

    #[tokio::test]
    async fn test_bind_creates_dir_and_socket() {
        let prefix = test_prefix("bind");
        let server = ControlServer::bind(&prefix, true).unwrap();
        assert!(server.socket_path().exists());

        let dir = server.socket_path().parent().unwrap().to_path_buf();
        drop(server);
        assert!(!dir.exists());
        let _ = std::fs::remove_dir_all(&prefix);
    }

    #[tokio::test]
    async fn test_second_bind_would_block() {
        let prefix = test_prefix("lock");
        // Same uid, no session suffix: both binds contend for one dir.
        let first = ControlServer::bind(&prefix, false).unwrap();
        let second = ControlServer::bind(&prefix, false);
        match second {
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::WouldBlock),
            Ok(_) => panic!("lock was not exclusive"),
        }
        drop(first);
        let _ = std::fs::remove_dir_all(&prefix);
    }

    #[tokio::test]
    async fn test_request_reply_over_socketpair() {
        let (client, server) = UnixStream::pair().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_connection(server, None, tx);

        // A minimal supervisor stand-in: echo the verb back.
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if let IpcEvent::Request { msg, reply, .. } = ev {
                    let _ = reply.send(Value::Dict(vec![("echo".into(), msg)]));
                }
            }
        });

        let resp = request(&client, &Value::string("get-jobs")).await.unwrap();
        assert_eq!(
            resp.get("echo").and_then(Value::as_str),
            Some("get-jobs")
        );
    }
}

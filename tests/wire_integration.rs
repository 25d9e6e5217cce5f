//! Wire-level tests: framed messages with descriptor transfer over real
//! sockets.

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

use jobd::wire::{MessageReader, MessageWriter, ReadOutcome, Value};

/// Pump one frame across a blocking socketpair.
fn transfer(value: &Value) -> Value {
    let (tx_sock, rx_sock) = UnixStream::pair().unwrap();

    let mut writer = MessageWriter::new(value);
    loop {
        if writer.write_once(tx_sock.as_raw_fd()).unwrap() {
            break;
        }
    }

    let mut reader = MessageReader::new();
    loop {
        match reader.read_once(rx_sock.as_raw_fd()).unwrap() {
            ReadOutcome::Message(v) => return v,
            ReadOutcome::Incomplete => continue,
            ReadOutcome::Closed => panic!("peer closed mid-frame"),
        }
    }
}

#[test]
fn test_tree_survives_socket_transfer() {
    let tree = Value::Dict(vec![
        ("label".into(), Value::string("org.example.svc")),
        ("on-demand".into(), Value::Bool(true)),
        (
            "program-arguments".into(),
            Value::Array(vec![Value::string("/bin/cat"), Value::string("-")]),
        ),
        ("nice".into(), Value::Integer(-5)),
        ("weight".into(), Value::Real(1.5)),
        ("blob".into(), Value::Opaque(vec![1, 2, 3])),
        ("status".into(), Value::Errno(0)),
    ]);
    assert_eq!(transfer(&tree), tree);
}

#[test]
fn test_fd_transfer_produces_working_descriptor() {
    let (pipe_r, pipe_w) = nix::unistd::pipe().unwrap();
    let pipe_w_raw = pipe_w.into_raw_fd();

    let msg = Value::Dict(vec![
        ("verb".into(), Value::string("set-stdout")),
        ("fd".into(), Value::Fd(pipe_w_raw)),
    ]);
    let received = transfer(&msg);

    let got_fd = match received.get("fd") {
        Some(Value::Fd(fd)) => *fd,
        other => panic!("fd slot lost: {:?}", other),
    };
    // Same process, but the kernel still installs a fresh descriptor.
    assert_ne!(got_fd, pipe_w_raw);

    // Received descriptors come with close-on-exec set.
    let flags = unsafe { libc::fcntl(got_fd, libc::F_GETFD) };
    assert!(flags >= 0 && (flags & libc::FD_CLOEXEC) != 0);

    // And the descriptor actually reaches the original pipe.
    let mut received_end = unsafe { std::fs::File::from_raw_fd(got_fd) };
    received_end.write_all(b"through the wire").unwrap();
    drop(received_end);
    unsafe { libc::close(pipe_w_raw) };

    let mut buf = Vec::new();
    let mut reader = std::fs::File::from(OwnedFd::from(pipe_r));
    reader.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, b"through the wire");
}

#[test]
fn test_two_frames_in_one_buffer() {
    let (tx_sock, rx_sock) = UnixStream::pair().unwrap();

    for label in ["first", "second"] {
        let mut writer = MessageWriter::new(&Value::string(label));
        loop {
            if writer.write_once(tx_sock.as_raw_fd()).unwrap() {
                break;
            }
        }
    }

    let mut reader = MessageReader::new();
    let mut seen = Vec::new();
    while seen.len() < 2 {
        // Frames may arrive together; drain buffered ones first.
        match reader.poll_buffered().unwrap() {
            ReadOutcome::Message(v) => {
                seen.push(v);
                continue;
            }
            _ => {}
        }
        match reader.read_once(rx_sock.as_raw_fd()).unwrap() {
            ReadOutcome::Message(v) => seen.push(v),
            ReadOutcome::Incomplete => continue,
            ReadOutcome::Closed => break,
        }
    }
    assert_eq!(seen, vec![Value::string("first"), Value::string("second")]);
}

#[test]
fn test_revoked_fds_cross_as_revoked() {
    let msg = Value::Array(vec![Value::Fd(-1), Value::string("tail")]);
    assert_eq!(transfer(&msg), msg);
}

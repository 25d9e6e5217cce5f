//! Tagged data tree and wire codec for the control protocol.
//!
//! Every control message is one `Value`: a tree whose leaves are null,
//! bool, integer, real, string, opaque bytes, errno, file descriptor or
//! port reference, and whose interior nodes are arrays and ordered
//! mappings. On the wire a message is a fixed header followed by the
//! encoded tree; descriptors travel out-of-band as `SCM_RIGHTS` ancillary
//! data on the same stream socket, with an in-band index token reserving
//! each slot's position.
//!
//! Integers and tags are host-endian; the socket never leaves the host.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

/// Sent at the start of every frame.
pub const WIRE_MAGIC: u32 = 0x6a6f_6264; // "jobd"

/// Frame header: magic, payload length, descriptor count.
pub const HEADER_LEN: usize = 12;

/// Upper bound on a single payload; a peer claiming more is broken.
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Upper bound on descriptors per message.
pub const MAX_FDS: usize = 32;

const TAG_NULL: u32 = 1;
const TAG_BOOL: u32 = 2;
const TAG_INTEGER: u32 = 3;
const TAG_REAL: u32 = 4;
const TAG_STRING: u32 = 5;
const TAG_OPAQUE: u32 = 6;
const TAG_ERRNO: u32 = 7;
const TAG_FD: u32 = 8;
const TAG_PORT: u32 = 9;
const TAG_ARRAY: u32 = 10;
const TAG_DICT: u32 = 11;

/// Index token meaning "this fd slot is revoked" (-1, nothing sent).
const FD_NONE: u32 = u32::MAX;

/// One node of the tagged data tree.
///
/// `Dict` preserves insertion order; lookup is a linear scan. Fd slots
/// hold raw descriptor numbers; -1 marks a revoked slot. The tree does
/// not close descriptors on drop - ownership is explicit via
/// [`Value::close_fds`] / [`Value::revoke_fds`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Str(String),
    Opaque(Vec<u8>),
    Errno(i32),
    Fd(RawFd),
    Port(i64),
    Array(Vec<Value>),
    Dict(Vec<(String, Value)>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    /// Success reply, conventionally errno 0.
    pub fn ok() -> Value {
        Value::Errno(0)
    }

    pub fn errno(e: nix::errno::Errno) -> Value {
        Value::Errno(e as i32)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_errno(&self) -> Option<i32> {
        match self {
            Value::Errno(e) => Some(*e),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Linear lookup in a `Dict`; `None` for other variants.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(d) => d.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        match self {
            Value::Dict(d) => d.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Insert or replace a `Dict` entry. No-op on other variants.
    pub fn insert(&mut self, key: &str, value: Value) {
        if let Value::Dict(d) = self {
            if let Some(slot) = d.iter_mut().find(|(k, _)| k == key) {
                slot.1 = value;
            } else {
                d.push((key.to_string(), value));
            }
        }
    }

    /// Visit every live fd slot in the tree.
    pub fn for_each_fd(&self, f: &mut dyn FnMut(RawFd)) {
        match self {
            Value::Fd(fd) if *fd != -1 => f(*fd),
            Value::Array(a) => {
                for v in a {
                    v.for_each_fd(f);
                }
            }
            Value::Dict(d) => {
                for (_, v) in d {
                    v.for_each_fd(f);
                }
            }
            _ => {}
        }
    }

    /// Mark every fd slot revoked without closing anything.
    pub fn revoke_fds(&mut self) {
        match self {
            Value::Fd(fd) => *fd = -1,
            Value::Array(a) => {
                for v in a {
                    v.revoke_fds();
                }
            }
            Value::Dict(d) => {
                for (_, v) in d {
                    v.revoke_fds();
                }
            }
            _ => {}
        }
    }

    /// Close every live fd slot, then revoke it.
    pub fn close_fds(&mut self) {
        self.for_each_fd(&mut |fd| {
            unsafe { libc::close(fd) };
        });
        self.revoke_fds();
    }

    /// Deep copy with every fd slot revoked; what `get-job` hands out.
    pub fn copy_revoking_fds(&self) -> Value {
        let mut copy = self.clone();
        copy.revoke_fds();
        copy
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("truncated message")]
    Truncated,

    #[error("unknown type tag {0}")]
    BadTag(u32),

    #[error("string is not valid UTF-8")]
    BadString,

    #[error("fd token {0} out of range ({1} received)")]
    BadFdIndex(u32, usize),

    #[error("trailing garbage after value")]
    TrailingBytes,

    #[error("bad frame header")]
    BadHeader,
}

/// Encode a tree into payload bytes plus the descriptors to send, in
/// slot order. Revoked slots encode as `FD_NONE` and send nothing.
pub fn encode(value: &Value) -> (Vec<u8>, Vec<RawFd>) {
    let mut buf = Vec::with_capacity(128);
    let mut fds = Vec::new();
    encode_into(value, &mut buf, &mut fds);
    (buf, fds)
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn encode_into(value: &Value, buf: &mut Vec<u8>, fds: &mut Vec<RawFd>) {
    match value {
        Value::Null => put_u32(buf, TAG_NULL),
        Value::Bool(b) => {
            put_u32(buf, TAG_BOOL);
            buf.push(*b as u8);
        }
        Value::Integer(i) => {
            put_u32(buf, TAG_INTEGER);
            buf.extend_from_slice(&i.to_ne_bytes());
        }
        Value::Real(r) => {
            put_u32(buf, TAG_REAL);
            buf.extend_from_slice(&r.to_ne_bytes());
        }
        Value::Str(s) => {
            put_u32(buf, TAG_STRING);
            put_str(buf, s);
        }
        Value::Opaque(bytes) => {
            put_u32(buf, TAG_OPAQUE);
            put_u32(buf, bytes.len() as u32);
            buf.extend_from_slice(bytes);
        }
        Value::Errno(e) => {
            put_u32(buf, TAG_ERRNO);
            buf.extend_from_slice(&e.to_ne_bytes());
        }
        Value::Fd(fd) => {
            put_u32(buf, TAG_FD);
            if *fd == -1 {
                put_u32(buf, FD_NONE);
            } else {
                put_u32(buf, fds.len() as u32);
                fds.push(*fd);
            }
        }
        Value::Port(p) => {
            put_u32(buf, TAG_PORT);
            buf.extend_from_slice(&p.to_ne_bytes());
        }
        Value::Array(a) => {
            put_u32(buf, TAG_ARRAY);
            put_u32(buf, a.len() as u32);
            for v in a {
                encode_into(v, buf, fds);
            }
        }
        Value::Dict(d) => {
            put_u32(buf, TAG_DICT);
            put_u32(buf, d.len() as u32);
            for (k, v) in d {
                put_str(buf, k);
                encode_into(v, buf, fds);
            }
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.bytes.len() {
            return Err(WireError::Truncated);
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn str(&mut self) -> Result<String, WireError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        let nul = self.take(1)?;
        if nul[0] != 0 {
            return Err(WireError::BadString);
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadString)
    }
}

/// Decode a payload, installing the received descriptors into their
/// reserved slots. Descriptor identity changes in transit; only type and
/// position survive.
pub fn decode(bytes: &[u8], fds: &[RawFd]) -> Result<Value, WireError> {
    let mut cur = Cursor { bytes, pos: 0 };
    let v = decode_value(&mut cur, fds)?;
    if cur.pos != bytes.len() {
        return Err(WireError::TrailingBytes);
    }
    Ok(v)
}

fn decode_value(cur: &mut Cursor, fds: &[RawFd]) -> Result<Value, WireError> {
    match cur.u32()? {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => Ok(Value::Bool(cur.take(1)?[0] != 0)),
        TAG_INTEGER => Ok(Value::Integer(cur.i64()?)),
        TAG_REAL => Ok(Value::Real(f64::from_ne_bytes(
            cur.take(8)?.try_into().unwrap(),
        ))),
        TAG_STRING => Ok(Value::Str(cur.str()?)),
        TAG_OPAQUE => {
            let len = cur.u32()? as usize;
            Ok(Value::Opaque(cur.take(len)?.to_vec()))
        }
        TAG_ERRNO => Ok(Value::Errno(cur.i32()?)),
        TAG_FD => {
            let idx = cur.u32()?;
            if idx == FD_NONE {
                return Ok(Value::Fd(-1));
            }
            match fds.get(idx as usize) {
                Some(fd) => Ok(Value::Fd(*fd)),
                None => Err(WireError::BadFdIndex(idx, fds.len())),
            }
        }
        TAG_PORT => Ok(Value::Port(cur.i64()?)),
        TAG_ARRAY => {
            let count = cur.u32()? as usize;
            let mut out = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                out.push(decode_value(cur, fds)?);
            }
            Ok(Value::Array(out))
        }
        TAG_DICT => {
            let count = cur.u32()? as usize;
            let mut out = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let key = cur.str()?;
                out.push((key, decode_value(cur, fds)?));
            }
            Ok(Value::Dict(out))
        }
        tag => Err(WireError::BadTag(tag)),
    }
}

fn frame_header(payload_len: usize, fd_count: usize) -> [u8; HEADER_LEN] {
    let mut hdr = [0u8; HEADER_LEN];
    hdr[0..4].copy_from_slice(&WIRE_MAGIC.to_ne_bytes());
    hdr[4..8].copy_from_slice(&(payload_len as u32).to_ne_bytes());
    hdr[8..12].copy_from_slice(&(fd_count as u32).to_ne_bytes());
    hdr
}

/// Outgoing frame with partial-write state.
///
/// The first chunk that makes it onto the socket carries every descriptor
/// in its ancillary data; a later resume sends plain bytes only.
pub struct MessageWriter {
    buf: Vec<u8>,
    fds: Vec<RawFd>,
    off: usize,
}

impl MessageWriter {
    pub fn new(value: &Value) -> MessageWriter {
        let (payload, fds) = encode(value);
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&frame_header(payload.len(), fds.len()));
        buf.extend_from_slice(&payload);
        MessageWriter { buf, fds, off: 0 }
    }

    /// One write attempt. `Ok(true)` when the frame is fully flushed;
    /// `WouldBlock` passes through for the caller's writable-event wait.
    pub fn write_once(&mut self, fd: RawFd) -> io::Result<bool> {
        let remaining = &self.buf[self.off..];
        let iov = [IoSlice::new(remaining)];
        let cmsg = [ControlMessage::ScmRights(&self.fds)];
        let cmsgs: &[ControlMessage] = if self.fds.is_empty() { &[] } else { &cmsg };

        let n = sendmsg::<()>(fd, &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None)
            .map_err(io::Error::from)?;

        // Ancillary data went out with the first byte; never resend it.
        self.fds.clear();
        self.off += n;
        Ok(self.off == self.buf.len())
    }
}

/// Result of one read attempt on a connection.
pub enum ReadOutcome {
    /// A complete frame was decoded.
    Message(Value),
    /// More bytes needed.
    Incomplete,
    /// Peer closed the stream.
    Closed,
}

/// Incoming frame accumulator for a stream socket.
///
/// Descriptors received with any chunk are queued in arrival order and
/// consumed by the decoder when the frame completes; the kernel sets
/// close-on-exec on each via `MSG_CMSG_CLOEXEC`.
pub struct MessageReader {
    buf: Vec<u8>,
    fds: Vec<RawFd>,
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageReader {
    pub fn new() -> MessageReader {
        MessageReader {
            buf: Vec::new(),
            fds: Vec::new(),
        }
    }

    /// One `recvmsg` attempt followed by a frame-completion check.
    pub fn read_once(&mut self, fd: RawFd) -> io::Result<ReadOutcome> {
        let mut chunk = [0u8; 8192];
        let mut iov = [IoSliceMut::new(&mut chunk)];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS]);

        let msg = recvmsg::<()>(
            fd,
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(io::Error::from)?;

        let n = msg.bytes;
        if let Ok(cmsgs) = msg.cmsgs() {
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    self.fds.extend(received);
                }
            }
        }

        if n == 0 {
            // Descriptors without a frame to own them would leak.
            for fd in self.fds.drain(..) {
                unsafe { libc::close(fd) };
            }
            return Ok(ReadOutcome::Closed);
        }

        self.buf.extend_from_slice(&chunk[..n]);
        self.try_extract()
    }

    /// Extract a frame already sitting in the buffer, if any, without
    /// touching the socket. Callers drain these before blocking again,
    /// since two frames can arrive in one chunk.
    pub fn poll_buffered(&mut self) -> io::Result<ReadOutcome> {
        self.try_extract()
    }

    fn try_extract(&mut self) -> io::Result<ReadOutcome> {
        if self.buf.len() < HEADER_LEN {
            return Ok(ReadOutcome::Incomplete);
        }

        let magic = u32::from_ne_bytes(self.buf[0..4].try_into().unwrap());
        let payload_len = u32::from_ne_bytes(self.buf[4..8].try_into().unwrap()) as usize;
        let fd_count = u32::from_ne_bytes(self.buf[8..12].try_into().unwrap()) as usize;

        if magic != WIRE_MAGIC || payload_len > MAX_PAYLOAD || fd_count > MAX_FDS {
            return Err(io::Error::new(io::ErrorKind::InvalidData, WireError::BadHeader));
        }

        if self.buf.len() < HEADER_LEN + payload_len || self.fds.len() < fd_count {
            return Ok(ReadOutcome::Incomplete);
        }

        let payload: Vec<u8> = self.buf.drain(..HEADER_LEN + payload_len).collect();
        let frame_fds: Vec<RawFd> = self.fds.drain(..fd_count).collect();

        match decode(&payload[HEADER_LEN..], &frame_fds) {
            Ok(v) => Ok(ReadOutcome::Message(v)),
            Err(e) => {
                for fd in frame_fds {
                    unsafe { libc::close(fd) };
                }
                Err(io::Error::new(io::ErrorKind::InvalidData, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: &Value) -> Value {
        let (bytes, fds) = encode(v);
        decode(&bytes, &fds).unwrap()
    }

    #[test]
    fn roundtrip_scalars() {
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Integer(-42),
            Value::Integer(i64::MAX),
            Value::Real(2.5),
            Value::Str("hello".into()),
            Value::Str("".into()),
            Value::Opaque(vec![0, 1, 2, 255]),
            Value::Errno(libc::ESRCH),
            Value::Port(7),
        ] {
            assert_eq!(roundtrip(&v), v);
        }
    }

    #[test]
    fn roundtrip_nested() {
        let tree = Value::Dict(vec![
            (
                "submit-job".into(),
                Value::Dict(vec![
                    ("label".into(), Value::string("org.example.echo")),
                    ("on-demand".into(), Value::Bool(true)),
                    (
                        "program-arguments".into(),
                        Value::Array(vec![Value::string("/bin/cat"), Value::string("-u")]),
                    ),
                    ("nice".into(), Value::Integer(5)),
                ]),
            ),
            ("weight".into(), Value::Real(0.25)),
        ]);
        assert_eq!(roundtrip(&tree), tree);
    }

    #[test]
    fn fd_slots_preserve_position_not_identity() {
        let tree = Value::Array(vec![
            Value::Fd(5),
            Value::Str("between".into()),
            Value::Dict(vec![("s".into(), Value::Fd(7))]),
        ]);
        let (bytes, fds) = encode(&tree);
        assert_eq!(fds, vec![5, 7]);

        // The receiving side installs different descriptor numbers.
        let decoded = decode(&bytes, &[9, 11]).unwrap();
        let expect = Value::Array(vec![
            Value::Fd(9),
            Value::Str("between".into()),
            Value::Dict(vec![("s".into(), Value::Fd(11))]),
        ]);
        assert_eq!(decoded, expect);
    }

    #[test]
    fn revoked_fd_sends_nothing() {
        let tree = Value::Array(vec![Value::Fd(-1), Value::Fd(3)]);
        let (bytes, fds) = encode(&tree);
        assert_eq!(fds, vec![3]);
        let decoded = decode(&bytes, &fds).unwrap();
        assert_eq!(decoded, tree);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode(&[1, 2], &[]), Err(WireError::Truncated)));
        let (mut bytes, _) = encode(&Value::Null);
        bytes.push(0);
        assert!(matches!(decode(&bytes, &[]), Err(WireError::TrailingBytes)));
        let bad_tag = 99u32.to_ne_bytes().to_vec();
        assert!(matches!(decode(&bad_tag, &[]), Err(WireError::BadTag(99))));
    }

    #[test]
    fn decode_rejects_missing_fd() {
        let tree = Value::Fd(4);
        let (bytes, _) = encode(&tree);
        assert!(matches!(
            decode(&bytes, &[]),
            Err(WireError::BadFdIndex(0, 0))
        ));
    }

    #[test]
    fn dict_insert_replaces_in_place() {
        let mut d = Value::Dict(vec![("a".into(), Value::Integer(1))]);
        d.insert("a", Value::Integer(2));
        d.insert("b", Value::Integer(3));
        assert_eq!(d.get("a").and_then(Value::as_integer), Some(2));
        assert_eq!(d.get("b").and_then(Value::as_integer), Some(3));
        assert_eq!(d.as_dict().unwrap().len(), 2);
    }

    #[test]
    fn revoke_and_copy() {
        let tree = Value::Dict(vec![
            ("fd".into(), Value::Fd(10)),
            ("keep".into(), Value::Integer(1)),
        ]);
        let scrubbed = tree.copy_revoking_fds();
        assert_eq!(scrubbed.get("fd"), Some(&Value::Fd(-1)));
        // Original untouched.
        assert_eq!(tree.get("fd"), Some(&Value::Fd(10)));

        let mut fds = Vec::new();
        scrubbed.for_each_fd(&mut |fd| fds.push(fd));
        assert!(fds.is_empty());
    }
}

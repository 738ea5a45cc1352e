//! Minimal netlink plumbing over raw sockets: message framing, attribute
//! walking, and request/dump round trips.

pub mod sock_diag;
pub mod taskstats;

use std::cell::Cell;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::errno::Errno;

use crate::error::{CloakError, Result};

pub use sock_diag::{NetlinkSocketDumper, PROTOCOLS, ProtocolEntry, lookup_protocol};
pub use taskstats::TaskStatsClient;

pub const NLMSG_HDRLEN: usize = 16;
pub const NLA_HDRLEN: usize = 4;

const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

pub const NLM_F_REQUEST: u16 = 0x1;
pub const NLM_F_DUMP: u16 = 0x300;

const NLA_TYPE_MASK: u16 = 0x3fff;
const RECV_BUFFER: usize = 32 * 1024;

pub fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// One received message, header split from payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// Builds a complete netlink message.
pub fn build_message(msg_type: u16, flags: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
    let len = NLMSG_HDRLEN + payload.len();
    let mut buf = Vec::with_capacity(align4(len));
    buf.extend_from_slice(&(len as u32).to_ne_bytes());
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.resize(align4(len), 0);
    buf
}

/// Appends a `type, value` attribute, padded to 4 bytes.
pub fn push_attr(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    let len = NLA_HDRLEN + value.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(value);
    buf.resize(buf.len() + align4(len) - len, 0);
}

pub fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    buf.get(offset..offset + 2).map(|b| u16::from_ne_bytes([b[0], b[1]]))
}

pub fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

/// Splits a buffer of concatenated netlink messages.
pub fn parse_messages(buf: &[u8]) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let len = read_u32(buf, offset).unwrap_or(0) as usize;
        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            return Err(CloakError::Netlink(format!("truncated message at offset {offset}")));
        }
        messages.push(Message {
            msg_type: read_u16(buf, offset + 4).unwrap_or(0),
            flags: read_u16(buf, offset + 6).unwrap_or(0),
            seq: read_u32(buf, offset + 8).unwrap_or(0),
            payload: buf[offset + NLMSG_HDRLEN..offset + len].to_vec(),
        });
        offset += align4(len);
    }
    Ok(messages)
}

/// `(type, value)` pairs of a flat attribute list.
pub fn parse_attrs(buf: &[u8]) -> Vec<(u16, &[u8])> {
    let mut attrs = Vec::new();
    let mut offset = 0;

    while offset + NLA_HDRLEN <= buf.len() {
        let len = read_u16(buf, offset).unwrap_or(0) as usize;
        let attr_type = read_u16(buf, offset + 2).unwrap_or(0) & NLA_TYPE_MASK;
        if len < NLA_HDRLEN || offset + len > buf.len() {
            break;
        }
        attrs.push((attr_type, &buf[offset + NLA_HDRLEN..offset + len]));
        offset += align4(len);
    }
    attrs
}

/// A netlink socket talking to the kernel. Closed on drop.
pub struct NetlinkSocket {
    fd: OwnedFd,
    seq: Cell<u32>,
}

impl NetlinkSocket {
    pub fn open(protocol: i32) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                protocol,
            )
        };
        if fd < 0 {
            return Err(Errno::last().into());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            seq: Cell::new(1),
        })
    }

    pub fn next_seq(&self) -> u32 {
        let seq = self.seq.get();
        self.seq.set(seq.wrapping_add(1));
        seq
    }

    pub fn send(&self, message: &[u8]) -> Result<()> {
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

        let sent = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                message.as_ptr() as *const libc::c_void,
                message.len(),
                0,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(Errno::last().into());
        }
        Ok(())
    }

    fn recv_batch(&self) -> Result<Vec<Message>> {
        let mut buf = vec![0u8; RECV_BUFFER];
        let received = loop {
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(errno.into());
            }
        };
        parse_messages(&buf[..received])
    }

    /// Sends `message` and collects the replies with sequence number `seq`.
    /// Dumps are read until `NLMSG_DONE`; plain requests stop after the
    /// first batch. A kernel error reply is returned as `Err`.
    pub fn request(&self, message: &[u8], seq: u32, dump: bool) -> Result<Vec<Message>> {
        self.send(message)?;
        let mut replies = Vec::new();

        loop {
            let batch = self.recv_batch()?;
            if batch.is_empty() {
                return Ok(replies);
            }
            for msg in batch {
                if msg.seq != seq {
                    continue;
                }
                match msg.msg_type {
                    NLMSG_NOOP => {}
                    NLMSG_DONE => return Ok(replies),
                    NLMSG_ERROR => {
                        let code = read_u32(&msg.payload, 0).unwrap_or(0) as i32;
                        if code == 0 {
                            return Ok(replies);
                        }
                        return Err(Errno::from_raw(-code).into());
                    }
                    _ => replies.push(msg),
                }
            }
            if !dump {
                return Ok(replies);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_framing() {
        let msg = build_message(20, NLM_F_REQUEST | NLM_F_DUMP, 7, &[1, 2, 3]);
        assert_eq!(msg.len(), 20);
        assert_eq!(read_u32(&msg, 0), Some(19));

        let parsed = parse_messages(&msg).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].msg_type, 20);
        assert_eq!(parsed[0].flags, 0x301);
        assert_eq!(parsed[0].seq, 7);
        assert_eq!(parsed[0].payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_attribute_walk() {
        let mut buf = Vec::new();
        push_attr(&mut buf, 2, b"TASKSTATS\0");
        push_attr(&mut buf, 1, &22u16.to_ne_bytes());
        assert_eq!(buf.len() % 4, 0);

        let attrs = parse_attrs(&buf);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0], (2, &b"TASKSTATS\0"[..]));
        assert_eq!(read_u16(attrs[1].1, 0), Some(22));
    }

    #[test]
    fn test_truncated_message_is_rejected() {
        let mut msg = build_message(20, 0, 1, &[0; 8]);
        msg.truncate(18);
        assert!(parse_messages(&msg).is_err());
    }
}

//! Socket table dumps through `NETLINK_SOCK_DIAG`.

use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::debug;

use super::{
    NLM_F_DUMP, NLM_F_REQUEST, NetlinkSocket, build_message, parse_attrs, read_u16, read_u32,
};
use crate::channel::SocketDumper;
use crate::error::{CloakError, Result};
use crate::models::SocketRecord;

const SOCK_DIAG_BY_FAMILY: u16 = 20;

const INET_DIAG_REQ_V2_LEN: usize = 56;
const INET_DIAG_MSG_LEN: usize = 72;
const PACKET_DIAG_REQ_LEN: usize = 20;
const PACKET_DIAG_MSG_LEN: usize = 16;

const PACKET_SHOW_INFO: u32 = 0x1;
const PACKET_DIAG_INFO: u16 = 1;
const PACKET_DIAG_UID: u16 = 5;

const ALL_STATES: u32 = 0xffff_ffff;

pub const AF_INET: u8 = libc::AF_INET as u8;
pub const AF_INET6: u8 = libc::AF_INET6 as u8;
pub const AF_PACKET: u8 = libc::AF_PACKET as u8;

const IPPROTO_ICMP: u8 = libc::IPPROTO_ICMP as u8;
const IPPROTO_IGMP: u8 = libc::IPPROTO_IGMP as u8;
const IPPROTO_TCP: u8 = libc::IPPROTO_TCP as u8;
const IPPROTO_UDP: u8 = libc::IPPROTO_UDP as u8;
const IPPROTO_DCCP: u8 = libc::IPPROTO_DCCP as u8;
const IPPROTO_SCTP: u8 = libc::IPPROTO_SCTP as u8;
const IPPROTO_UDPLITE: u8 = libc::IPPROTO_UDPLITE as u8;
const IPPROTO_RAW: u8 = libc::IPPROTO_RAW as u8;

/// A protocol name as accepted on the command line.
#[derive(Debug, PartialEq, Eq)]
pub struct ProtocolEntry {
    pub name: &'static str,
    pub protocol: u8,
    pub family: u8,
    /// Matching `/proc/net` table, when the kernel has one.
    pub proc_net: Option<&'static str>,
}

const fn entry(name: &'static str, protocol: u8, family: u8, proc_net: Option<&'static str>) -> ProtocolEntry {
    ProtocolEntry {
        name,
        protocol,
        family,
        proc_net,
    }
}

pub static PROTOCOLS: &[ProtocolEntry] = &[
    entry("tcp", IPPROTO_TCP, AF_INET, Some("tcp")),
    entry("tcp6", IPPROTO_TCP, AF_INET6, Some("tcp6")),
    entry("udp", IPPROTO_UDP, AF_INET, Some("udp")),
    entry("udp6", IPPROTO_UDP, AF_INET6, Some("udp6")),
    // for AF_PACKET the protocol selects the socket type: UDP means SOCK_DGRAM
    entry("udp-raw", IPPROTO_UDP, AF_PACKET, None),
    entry("icmp", IPPROTO_ICMP, AF_INET, Some("icmp")),
    entry("icmp6", IPPROTO_ICMP, AF_INET6, Some("icmp6")),
    entry("udplite", IPPROTO_UDPLITE, AF_INET, Some("udplite")),
    entry("udplite6", IPPROTO_UDPLITE, AF_INET6, Some("udplite6")),
    entry("dccp", IPPROTO_DCCP, AF_INET, None),
    entry("dccp6", IPPROTO_DCCP, AF_INET6, None),
    entry("sctp", IPPROTO_SCTP, AF_INET, None),
    entry("sctp6", IPPROTO_SCTP, AF_INET6, None),
    // /proc/net/igmp and igmp6 list multicast groups per device, not sockets
    entry("igmp", IPPROTO_IGMP, AF_INET, None),
    entry("igmp6", IPPROTO_IGMP, AF_INET6, None),
    entry("raw", IPPROTO_RAW, AF_INET, None),
    entry("raw6", IPPROTO_RAW, AF_INET6, None),
    entry("packet", IPPROTO_RAW, AF_PACKET, None),
];

pub fn lookup_protocol(name: &str) -> Result<&'static ProtocolEntry> {
    PROTOCOLS
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| CloakError::UnknownProtocol(name.to_string()))
}

pub fn protocol_name(family: u8, protocol: u8) -> &'static str {
    PROTOCOLS
        .iter()
        .find(|p| p.family == family && p.protocol == protocol)
        .map(|p| p.name)
        .unwrap_or("unknown")
}

/// TCP state names, indexed by the kernel state number.
pub fn state_name(state: u8) -> &'static str {
    const STATES: [&str; 13] = [
        "",
        "established",
        "syn_sent",
        "syn_recv",
        "fin_wait1",
        "fin_wait2",
        "time_wait",
        "close",
        "close_wait",
        "last_ack",
        "listen",
        "closing",
        "new_syn_recv",
    ];
    STATES.get(state as usize).copied().unwrap_or("unknown")
}

pub fn interface_name(index: u32) -> String {
    if index == 0 {
        return String::new();
    }
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    let ret = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if ret.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// `inet_diag_req_v2` for every socket of `family`/`protocol`.
pub fn inet_request(family: u8, protocol: u8) -> Vec<u8> {
    let mut req = vec![0u8; INET_DIAG_REQ_V2_LEN];
    req[0] = family;
    req[1] = protocol;
    // raw sockets are selected by the protocol stored in the pad byte
    if protocol == IPPROTO_RAW {
        req[3] = IPPROTO_RAW;
    }
    req[4..8].copy_from_slice(&ALL_STATES.to_ne_bytes());
    req
}

pub fn packet_request() -> Vec<u8> {
    let mut req = vec![0u8; PACKET_DIAG_REQ_LEN];
    req[0] = AF_PACKET;
    req[8..12].copy_from_slice(&PACKET_SHOW_INFO.to_ne_bytes());
    req
}

fn address(family: u8, raw: &[u8]) -> IpAddr {
    if family == AF_INET6 {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&raw[..16]);
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
    }
}

/// Decodes one `inet_diag_msg`.
pub fn parse_inet_msg(protocol: u8, payload: &[u8]) -> Result<SocketRecord> {
    if payload.len() < INET_DIAG_MSG_LEN {
        return Err(CloakError::Netlink(format!(
            "short inet_diag_msg ({} bytes)",
            payload.len()
        )));
    }
    let family = payload[0];
    let be16 = |offset: usize| u16::from_be_bytes([payload[offset], payload[offset + 1]]);
    let ifindex = read_u32(payload, 40).unwrap_or(0);

    Ok(SocketRecord {
        protocol: protocol_name(family, protocol).to_string(),
        family,
        state: payload[1],
        local_port: be16(4),
        remote_port: be16(6),
        local: address(family, &payload[8..24]),
        remote: address(family, &payload[24..40]),
        uid: read_u32(payload, 64).unwrap_or(0),
        inode: read_u32(payload, 68).unwrap_or(0),
        ifindex,
        ifname: interface_name(ifindex),
        owner: None,
    })
}

/// Decodes one `packet_diag_msg` plus its attributes.
pub fn parse_packet_msg(protocol: u8, payload: &[u8]) -> Result<SocketRecord> {
    if payload.len() < PACKET_DIAG_MSG_LEN {
        return Err(CloakError::Netlink(format!(
            "short packet_diag_msg ({} bytes)",
            payload.len()
        )));
    }
    let mut uid = 0;
    let mut ifindex = 0;
    for (attr_type, value) in parse_attrs(&payload[PACKET_DIAG_MSG_LEN..]) {
        match attr_type {
            PACKET_DIAG_UID => uid = read_u32(value, 0).unwrap_or(0),
            PACKET_DIAG_INFO => ifindex = read_u32(value, 0).unwrap_or(0),
            _ => {}
        }
    }

    Ok(SocketRecord {
        protocol: protocol_name(AF_PACKET, protocol).to_string(),
        family: AF_PACKET,
        state: 0,
        local: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        local_port: read_u16(payload, 2).map(u16::from_be).unwrap_or(0),
        remote: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        remote_port: 0,
        inode: read_u32(payload, 4).unwrap_or(0),
        uid,
        ifindex,
        ifname: interface_name(ifindex),
        owner: None,
    })
}

/// Socket type an `AF_PACKET` entry of the table stands for.
fn packet_type(protocol: u8) -> u8 {
    if protocol == IPPROTO_UDP {
        libc::SOCK_DGRAM as u8
    } else {
        libc::SOCK_RAW as u8
    }
}

/// [`SocketDumper`] over a fresh `NETLINK_SOCK_DIAG` socket per dump.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetlinkSocketDumper;

impl SocketDumper for NetlinkSocketDumper {
    fn dump(&self, family: u8, protocol: u8) -> Result<Vec<SocketRecord>> {
        let socket = NetlinkSocket::open(libc::NETLINK_SOCK_DIAG)?;
        let seq = socket.next_seq();
        let request = if family == AF_PACKET {
            packet_request()
        } else {
            inet_request(family, protocol)
        };
        let message = build_message(SOCK_DIAG_BY_FAMILY, NLM_F_REQUEST | NLM_F_DUMP, seq, &request);

        let replies = socket.request(&message, seq, true)?;
        debug!("sock_diag family {} proto {}: {} replies", family, protocol, replies.len());

        let mut sockets = Vec::with_capacity(replies.len());
        for reply in replies {
            if family == AF_PACKET {
                if reply.payload.get(1).copied() != Some(packet_type(protocol)) {
                    continue;
                }
                sockets.push(parse_packet_msg(protocol, &reply.payload)?);
            } else {
                sockets.push(parse_inet_msg(protocol, &reply.payload)?);
            }
        }
        Ok(sockets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inet_msg(family: u8, sport: u16, inode: u32, uid: u32) -> Vec<u8> {
        let mut msg = vec![0u8; INET_DIAG_MSG_LEN];
        msg[0] = family;
        msg[1] = 10;
        msg[4..6].copy_from_slice(&sport.to_be_bytes());
        msg[8..12].copy_from_slice(&[127, 0, 0, 1]);
        msg[64..68].copy_from_slice(&uid.to_ne_bytes());
        msg[68..72].copy_from_slice(&inode.to_ne_bytes());
        msg
    }

    #[test]
    fn test_table_lookup() {
        let tcp6 = lookup_protocol("tcp6").unwrap();
        assert_eq!(tcp6.family, AF_INET6);
        assert_eq!(tcp6.proc_net, Some("tcp6"));
        assert!(lookup_protocol("packet").unwrap().proc_net.is_none());
        assert!(lookup_protocol("igmp").unwrap().proc_net.is_none());
        assert!(lookup_protocol("igmp6").unwrap().proc_net.is_none());
        assert!(matches!(lookup_protocol("quic"), Err(CloakError::UnknownProtocol(_))));
        assert_eq!(PROTOCOLS.len(), 18);
    }

    #[test]
    fn test_inet_request_layout() {
        let req = inet_request(AF_INET, IPPROTO_TCP);
        assert_eq!(req.len(), 56);
        assert_eq!(req[0], AF_INET);
        assert_eq!(req[1], IPPROTO_TCP);
        assert_eq!(read_u32(&req, 4), Some(ALL_STATES));

        let raw = inet_request(AF_INET6, IPPROTO_RAW);
        assert_eq!(raw[3], IPPROTO_RAW);
    }

    #[test]
    fn test_parse_listening_socket() {
        let record = parse_inet_msg(IPPROTO_TCP, &inet_msg(AF_INET, 22, 20931, 0)).unwrap();
        assert_eq!(record.protocol, "tcp");
        assert_eq!(record.local, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(record.local_port, 22);
        assert_eq!(record.inode, 20931);
        assert_eq!(state_name(record.state), "listen");
    }

    #[test]
    fn test_short_message_is_rejected() {
        assert!(parse_inet_msg(IPPROTO_TCP, &[0u8; 10]).is_err());
        assert!(parse_packet_msg(IPPROTO_RAW, &[0u8; 4]).is_err());
    }

    #[test]
    fn test_parse_packet_socket() {
        let mut msg = vec![0u8; PACKET_DIAG_MSG_LEN];
        msg[0] = AF_PACKET;
        msg[1] = libc::SOCK_RAW as u8;
        msg[2..4].copy_from_slice(&0x0003u16.to_be_bytes());
        msg[4..8].copy_from_slice(&555u32.to_ne_bytes());
        crate::netlink::push_attr(&mut msg, PACKET_DIAG_UID, &1000u32.to_ne_bytes());

        let record = parse_packet_msg(IPPROTO_RAW, &msg).unwrap();
        assert_eq!(record.protocol, "packet");
        assert_eq!(record.inode, 555);
        assert_eq!(record.uid, 1000);
        assert_eq!(record.local_port, 3);
    }
}

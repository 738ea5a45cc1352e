//! Pid existence checks through the generic netlink `TASKSTATS` family.

use log::debug;
use nix::errno::Errno;

use super::{NLM_F_REQUEST, NetlinkSocket, build_message, parse_attrs, push_attr, read_u16};
use crate::channel::TaskStatsLookup;
use crate::error::{CloakError, Result};

const GENL_ID_CTRL: u16 = 0x10;
const GENL_HDRLEN: usize = 4;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;

const TASKSTATS_FAMILY: &[u8] = b"TASKSTATS\0";
const TASKSTATS_CMD_GET: u8 = 1;
const TASKSTATS_CMD_ATTR_PID: u16 = 1;
const TASKSTATS_GENL_VERSION: u8 = 1;

/// `genlmsghdr` followed by one attribute.
fn genl_payload(cmd: u8, version: u8, attr_type: u16, value: &[u8]) -> Vec<u8> {
    let mut payload = vec![cmd, version, 0, 0];
    push_attr(&mut payload, attr_type, value);
    payload
}

/// Family id carried by a `CTRL_CMD_GETFAMILY` reply.
pub fn family_id(reply: &[u8]) -> Option<u16> {
    let attrs = reply.get(GENL_HDRLEN..)?;
    parse_attrs(attrs)
        .into_iter()
        .find(|(attr_type, _)| *attr_type == CTRL_ATTR_FAMILY_ID)
        .and_then(|(_, value)| read_u16(value, 0))
}

/// Netlink client asking the kernel for a task's accounting record.
pub struct TaskStatsClient {
    socket: NetlinkSocket,
    family: u16,
}

impl TaskStatsClient {
    /// Opens a generic netlink socket and resolves the `TASKSTATS` family.
    pub fn open() -> Result<Self> {
        let socket = NetlinkSocket::open(libc::NETLINK_GENERIC)?;
        let seq = socket.next_seq();
        let payload = genl_payload(
            CTRL_CMD_GETFAMILY,
            1,
            CTRL_ATTR_FAMILY_NAME,
            TASKSTATS_FAMILY,
        );
        let message = build_message(GENL_ID_CTRL, NLM_F_REQUEST, seq, &payload);

        let replies = socket.request(&message, seq, false)?;
        let family = replies
            .iter()
            .find_map(|reply| family_id(&reply.payload))
            .ok_or_else(|| CloakError::Netlink("TASKSTATS family not registered".to_string()))?;
        debug!("taskstats family id {}", family);

        Ok(Self { socket, family })
    }
}

impl TaskStatsLookup for TaskStatsClient {
    fn task_exists(&self, pid: i32) -> Result<bool> {
        let seq = self.socket.next_seq();
        let payload = genl_payload(
            TASKSTATS_CMD_GET,
            TASKSTATS_GENL_VERSION,
            TASKSTATS_CMD_ATTR_PID,
            &(pid as u32).to_ne_bytes(),
        );
        let message = build_message(self.family, NLM_F_REQUEST, seq, &payload);

        match self.socket.request(&message, seq, false) {
            Ok(replies) => Ok(!replies.is_empty()),
            Err(CloakError::Errno(Errno::ESRCH)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_getfamily_payload() {
        let payload = genl_payload(CTRL_CMD_GETFAMILY, 1, CTRL_ATTR_FAMILY_NAME, TASKSTATS_FAMILY);
        assert_eq!(&payload[..4], &[3, 1, 0, 0]);
        let attrs = parse_attrs(&payload[GENL_HDRLEN..]);
        assert_eq!(attrs, vec![(CTRL_ATTR_FAMILY_NAME, TASKSTATS_FAMILY)]);
    }

    #[test]
    fn test_family_id_from_reply() {
        let mut reply = vec![1, 2, 0, 0];
        push_attr(&mut reply, CTRL_ATTR_FAMILY_NAME, TASKSTATS_FAMILY);
        push_attr(&mut reply, CTRL_ATTR_FAMILY_ID, &23u16.to_ne_bytes());
        assert_eq!(family_id(&reply), Some(23));
        assert_eq!(family_id(&[1, 2]), None);
    }
}

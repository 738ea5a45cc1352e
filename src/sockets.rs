//! Socket reconciliation: the kernel's socket tables as dumped over netlink,
//! compared with what `/proc/net/<proto>` shows to userland.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info, warn};

use crate::channel::{ContentReader, KernelIterators, SocketDumper};
use crate::config::HostPaths;
use crate::error::Result;
use crate::models::{FileHandleRecord, SocketOwner, SocketRecord};
use crate::netlink::sock_diag::state_name;
use crate::netlink::{PROTOCOLS, ProtocolEntry, lookup_protocol};
use crate::procs::status::exe_of;
use crate::verdict::Verdict;

/// Resolves protocol names; an empty list selects every known protocol.
pub fn select_protocols(names: &[String]) -> Result<Vec<&'static ProtocolEntry>> {
    if names.is_empty() {
        return Ok(PROTOCOLS.iter().collect());
    }
    names.iter().map(|name| lookup_protocol(name)).collect()
}

/// True when `inode` appears as a whole whitespace-separated token.
pub fn inode_listed(content: &str, inode: u32) -> bool {
    let needle = inode.to_string();
    content.split_whitespace().any(|token| token == needle)
}

/// One line per socket, with its owner on a second line.
pub fn format_socket(socket: &SocketRecord) -> String {
    let (pid, ppid, host, comm, exe) = match &socket.owner {
        Some(owner) => (
            owner.pid.to_string(),
            owner.ppid.to_string(),
            owner.host.as_str(),
            owner.comm.as_str(),
            owner.exe.as_str(),
        ),
        None => (String::new(), String::new(), "", "", ""),
    };
    format!(
        "{:<8} {:<12} {:<8} {:<8} {:<8} {:<6} {:<16} {:>16} {:<6} {:<8} {:<8} {:<12}\n\tcomm={} exe={}",
        socket.protocol,
        state_name(socket.state).to_uppercase(),
        socket.inode,
        socket.uid,
        socket.ifname,
        socket.local_port,
        socket.local,
        socket.remote,
        socket.remote_port,
        pid,
        ppid,
        host,
        comm,
        exe,
    )
}

pub fn socket_header() -> String {
    format!(
        "{:<8} {:<12} {:<8} {:<8} {:<8} {:<6} {:<16} {:>16} {:<6} {:<8} {:<8} {:<12}",
        "Proto", "State", "Inode", "Uid", "Ifname", "Sport", "Source", "Dst", "Dport", "Pid", "Ppid", "Host"
    )
}

#[derive(Debug, Default)]
pub struct SocketReport {
    pub sockets: Vec<SocketRecord>,
    pub hidden: Vec<SocketRecord>,
}

impl SocketReport {
    pub fn verdict(&self) -> Verdict {
        if self.hidden.is_empty() {
            Verdict::Ok
        } else {
            Verdict::ConnHidden
        }
    }
}

pub struct SocketScanner<'a> {
    paths: &'a HostPaths,
    dumper: &'a dyn SocketDumper,
    iterators: &'a dyn KernelIterators,
}

impl<'a> SocketScanner<'a> {
    pub fn new(paths: &'a HostPaths, dumper: &'a dyn SocketDumper, iterators: &'a dyn KernelIterators) -> Self {
        Self {
            paths,
            dumper,
            iterators,
        }
    }

    /// Open socket descriptors keyed by inode. Empty without the iterator.
    fn socket_owners(&self) -> HashMap<u64, FileHandleRecord> {
        match self.iterators.live_open_files() {
            Ok(files) => files
                .into_iter()
                .filter(|f| f.file.starts_with("socket:"))
                .map(|f| (f.inode, f))
                .collect(),
            Err(e) => {
                debug!("socket owners not available: {}", e);
                HashMap::new()
            }
        }
    }

    fn owner_of(&self, handle: &FileHandleRecord) -> SocketOwner {
        let exe = if handle.exe.is_empty() {
            exe_of(&self.paths.proc_pid(handle.pid))
        } else {
            handle.exe.clone()
        };
        SocketOwner {
            pid: handle.pid,
            ppid: handle.ppid,
            comm: handle.comm.clone(),
            exe,
            host: handle.host.clone(),
        }
    }

    /// Dumps every protocol in `protocols` and attributes each socket to
    /// the task holding it. A protocol that fails to dump is skipped.
    pub fn netstat(&self, protocols: &[&ProtocolEntry]) -> Vec<SocketRecord> {
        let owners = self.socket_owners();
        let mut sockets = Vec::new();

        for proto in protocols {
            match self.dumper.dump(proto.family, proto.protocol) {
                Ok(dumped) => {
                    debug!("{}: {} sockets", proto.name, dumped.len());
                    sockets.extend(dumped.into_iter().map(|mut socket| {
                        socket.protocol = proto.name.to_string();
                        socket.owner = owners.get(&u64::from(socket.inode)).map(|h| self.owner_of(h));
                        socket
                    }));
                }
                Err(e) => warn!("unable to dump {} sockets: {}", proto.name, e),
            }
        }
        sockets
    }

    /// Looks every dumped socket up in `/proc/net/<proto>` read through
    /// `reader`. Protocols without a proc file, or whose file cannot be
    /// read, are listed but not reconciled.
    pub fn check_hidden(&self, protocols: &[&ProtocolEntry], reader: &dyn ContentReader) -> SocketReport {
        let sockets = self.netstat(protocols);
        let mut tables: BTreeMap<&str, Option<String>> = BTreeMap::new();
        let mut hidden = Vec::new();

        info!("{}", socket_header());
        for socket in &sockets {
            info!("{}", format_socket(socket));

            let Some(proto) = protocols.iter().find(|p| p.name == socket.protocol) else {
                continue;
            };
            let Some(file) = proto.proc_net else {
                continue;
            };
            let table = tables.entry(file).or_insert_with(|| {
                let path = self.paths.proc_net.join(file);
                match reader.read(&path) {
                    Ok(content) => Some(String::from_utf8_lossy(&content).into_owned()),
                    Err(e) => {
                        warn!("[{}] unable to read {}: {}", reader.name(), path.display(), e);
                        None
                    }
                }
            });
            if let Some(content) = table
                && !inode_listed(content, socket.inode)
            {
                hidden.push(socket.clone());
            }
        }

        SocketReport { sockets, hidden }
    }
}

pub fn report_sockets(report: &SocketReport) {
    if report.hidden.is_empty() {
        info!("No hidden sockets found ({} checked).", report.sockets.len());
        return;
    }
    warn!(target: "detection", "[!] {} HIDDEN connections found", report.hidden.len());
    for socket in &report.hidden {
        warn!(target: "detection", "{}", format_socket(socket));
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::Path;

    use super::*;
    use crate::error::CloakError;
    use crate::models::{KernelModuleRecord, ProcessRecord};
    use crate::netlink::sock_diag::{AF_INET, AF_INET6};

    fn socket(inode: u32) -> SocketRecord {
        SocketRecord {
            protocol: String::new(),
            family: AF_INET,
            state: 10,
            local: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port: 4444,
            remote: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            remote_port: 0,
            inode,
            uid: 0,
            ifindex: 0,
            ifname: String::new(),
            owner: None,
        }
    }

    struct FixedDumper(Vec<u32>);

    impl SocketDumper for FixedDumper {
        fn dump(&self, family: u8, _protocol: u8) -> Result<Vec<SocketRecord>> {
            if family == AF_INET6 {
                return Err(CloakError::Netlink("no ipv6".into()));
            }
            Ok(self.0.iter().map(|inode| socket(*inode)).collect())
        }
    }

    struct OpenSockets;

    impl KernelIterators for OpenSockets {
        fn live_tasks(&self) -> Result<Vec<ProcessRecord>> {
            Ok(Vec::new())
        }

        fn live_modules(&self) -> Result<BTreeMap<String, KernelModuleRecord>> {
            Ok(BTreeMap::new())
        }

        fn live_open_files(&self) -> Result<Vec<FileHandleRecord>> {
            Ok(vec![FileHandleRecord {
                pid: 812,
                ppid: 1,
                fd: 3,
                inode: 20931,
                uid: 0,
                gid: 0,
                host: "web01".into(),
                file: "socket:[20931]".into(),
                comm: "backdoor".into(),
                exe: "/tmp/.x/backdoor".into(),
            }])
        }
    }

    struct ProcNet(&'static str);

    impl ContentReader for ProcNet {
        fn name(&self) -> &str {
            "cat"
        }

        fn read(&self, _path: &Path) -> Result<Vec<u8>> {
            Ok(self.0.as_bytes().to_vec())
        }
    }

    const TCP_TABLE: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
   0: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1209318 1 0000000000000000 100 0 0 10 0\n";

    #[test]
    fn test_whole_token_match() {
        assert!(inode_listed(TCP_TABLE, 1209318));
        assert!(!inode_listed(TCP_TABLE, 120931));
        assert!(!inode_listed(TCP_TABLE, 20931));
    }

    #[test]
    fn test_protocol_selection() {
        assert_eq!(select_protocols(&[]).unwrap().len(), PROTOCOLS.len());
        let picked = select_protocols(&["tcp".to_string(), "udp6".to_string()]).unwrap();
        assert_eq!(picked.len(), 2);
        assert!(select_protocols(&["bogus".to_string()]).is_err());
    }

    #[test]
    fn test_socket_missing_from_proc_net_is_hidden() {
        let paths = HostPaths::default();
        let dumper = FixedDumper(vec![1209318, 20931]);
        let scanner = SocketScanner::new(&paths, &dumper, &OpenSockets);
        let protocols = select_protocols(&["tcp".to_string()]).unwrap();

        let report = scanner.check_hidden(&protocols, &ProcNet(TCP_TABLE));
        assert_eq!(report.sockets.len(), 2);
        assert_eq!(report.hidden.len(), 1);
        assert_eq!(report.verdict(), Verdict::ConnHidden);

        let hidden = &report.hidden[0];
        assert_eq!(hidden.inode, 20931);
        assert_eq!(hidden.protocol, "tcp");
        let owner = hidden.owner.as_ref().unwrap();
        assert_eq!(owner.pid, 812);
        assert_eq!(owner.ppid, 1);
        assert_eq!(owner.exe, "/tmp/.x/backdoor");
    }

    #[test]
    fn test_protocols_without_proc_file_are_not_reconciled() {
        let paths = HostPaths::default();
        let dumper = FixedDumper(vec![20931]);
        let scanner = SocketScanner::new(&paths, &dumper, &OpenSockets);
        let protocols = select_protocols(&["packet".to_string(), "tcp6".to_string()]).unwrap();

        let report = scanner.check_hidden(&protocols, &ProcNet(""));
        assert_eq!(report.sockets.len(), 1);
        assert_eq!(report.verdict(), Verdict::Ok);

        // /proc/net/igmp has no socket inodes to match against
        let protocols = select_protocols(&["igmp".to_string(), "igmp6".to_string()]).unwrap();
        let report = scanner.check_hidden(&protocols, &ProcNet("Idx\tDevice    : Count Querier\tGroup    Users Timer\tReporter\n"));
        assert_eq!(report.sockets.len(), 1);
        assert!(report.hidden.is_empty());
        assert_eq!(report.verdict(), Verdict::Ok);
    }
}

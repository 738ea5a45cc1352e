use std::fs;
use std::path::{Path, PathBuf};

use crate::channel::ListTool;
use crate::models::Depth;
use crate::utils;

/// Default `pid_max` ceiling when `/proc/sys/kernel/pid_max` is unreadable.
pub const PID_MAX_LIMIT: u32 = 4_194_304;

/// Where the kernel exposes the files the analyzers read.
///
/// `Default` points at the live system; tests point every field into a
/// fixture tree.
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub proc_root: PathBuf,
    pub mounts: PathBuf,
    pub pid_max: PathBuf,
    pub tainted: PathBuf,
    pub proc_modules: PathBuf,
    pub kallsyms: PathBuf,
    pub sys_module: PathBuf,
    pub enabled_functions: PathBuf,
    pub touched_functions: PathBuf,
    pub cgroup_root: PathBuf,
    pub proc_net: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            mounts: PathBuf::from("/proc/self/mountinfo"),
            pid_max: PathBuf::from("/proc/sys/kernel/pid_max"),
            tainted: PathBuf::from("/proc/sys/kernel/tainted"),
            proc_modules: PathBuf::from("/proc/modules"),
            kallsyms: PathBuf::from("/proc/kallsyms"),
            sys_module: PathBuf::from("/sys/module"),
            enabled_functions: resolve_tracefs_path("enabled_functions"),
            touched_functions: resolve_tracefs_path("touched_functions"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            proc_net: PathBuf::from("/proc/net"),
        }
    }
}

impl HostPaths {
    /// Every path rebased under `root`, e.g. `root/proc`, `root/sys/module`.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let tracing = root.join("sys/kernel/tracing");
        Self {
            proc_root: root.join("proc"),
            mounts: root.join("proc/self/mountinfo"),
            pid_max: root.join("proc/sys/kernel/pid_max"),
            tainted: root.join("proc/sys/kernel/tainted"),
            proc_modules: root.join("proc/modules"),
            kallsyms: root.join("proc/kallsyms"),
            sys_module: root.join("sys/module"),
            enabled_functions: tracing.join("enabled_functions"),
            touched_functions: tracing.join("touched_functions"),
            cgroup_root: root.join("sys/fs/cgroup"),
            proc_net: root.join("proc/net"),
        }
    }

    /// `/proc/<pid>` under the configured proc root.
    pub fn proc_pid(&self, pid: i32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }
}

fn resolve_tracefs_path(file: &str) -> PathBuf {
    let tracefs = Path::new("/sys/kernel/tracing").join(file);
    if tracefs.exists() {
        return tracefs;
    }
    Path::new("/sys/kernel/debug/tracing").join(file)
}

/// Per-invocation switches, filled from the command line.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub tool: ListTool,
    pub depth: Depth,
    pub brute_force: bool,
    pub unmount_overlays: bool,
    /// Directory holding the compiled iterator objects. `None` uses the
    /// objects built alongside the binary.
    pub bpf_dir: Option<PathBuf>,
    pub pin_iterators: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            tool: ListTool::Find,
            depth: Depth::Shallow,
            brute_force: false,
            unmount_overlays: false,
            bpf_dir: None,
            pin_iterators: false,
        }
    }
}

/// Persistence and tampering locations checked by `scan system`. A `*`
/// segment matches every entry of its directory.
pub static SYSTEM_PATHS: &[&str] = &[
    "/etc/ld.so.preload",
    "/etc/ld.so.conf",
    "/etc/passwd",
    "/etc/shadow",
    "/etc/motd",
    "/etc/update-motd.d/*",
    "/etc/modules",
    "/etc/modules-load.d/*",
    "/etc/udev/rules.d/*",
    "/etc/cron.d/*",
    "/etc/crontab",
    "/etc/xdg/autostart/*",
    "/etc/rc.local",
    "/etc/systemd/*",
    "/usr/lib/modules-load.d/*",
    "/var/spool/*",
    "/home/*/.bashrc",
    "/home/*/.config/autostart/*",
    "/tmp/*",
    "/lib/*",
    "/proc/net/*",
    "/proc/",
];

/// What `scan system` compares: directories get their listings
/// reconciled, regular files their content.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SystemTargets {
    pub dirs: Vec<String>,
    pub files: Vec<PathBuf>,
}

/// Expands `patterns` against the live filesystem. The directory holding a
/// trailing `*` is listed as well, so entries hidden from the expansion
/// still surface in the listing comparison.
pub fn system_targets(patterns: &[&str]) -> SystemTargets {
    let mut targets = SystemTargets::default();

    for pattern in patterns {
        if let Some(parent) = pattern.strip_suffix("/*") {
            for dir in utils::expand_glob(parent) {
                push_unique(&mut targets.dirs, dir.to_string_lossy().into_owned());
            }
        }
        for path in utils::expand_glob(pattern) {
            match fs::symlink_metadata(&path) {
                Ok(md) if md.is_dir() => push_unique(&mut targets.dirs, path.to_string_lossy().into_owned()),
                Ok(md) if md.is_file() => {
                    if !targets.files.contains(&path) {
                        targets.files.push(path);
                    }
                }
                _ => {}
            }
        }
    }
    targets
}

fn push_unique(list: &mut Vec<String>, value: String) {
    let value = utils::normalize_path(&value);
    if !list.contains(&value) {
        list.push(value);
    }
}

//! Pid enumeration through the cgroup hierarchy.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use log::debug;
use walkdir::WalkDir;

const PROCS_FILE: &str = "cgroup.procs";

/// Union of every `cgroup.procs` file below `root`. Unreadable files are
/// skipped.
pub fn cgroup_pids(root: &Path) -> BTreeSet<i32> {
    let mut pids = BTreeSet::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("cgroup walk: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() || entry.file_name() != PROCS_FILE {
            continue;
        }
        match fs::read_to_string(entry.path()) {
            Ok(content) => pids.extend(
                content
                    .lines()
                    .filter_map(|line| line.trim().parse::<i32>().ok()),
            ),
            Err(e) => debug!("unable to read {}: {}", entry.path().display(), e),
        }
    }
    pids
}

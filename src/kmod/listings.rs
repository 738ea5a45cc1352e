//! Module name sets as seen by the userland-facing kernel listings.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use log::debug;
use procfs::{FromRead, KernelModules};

/// Module names from `/proc/modules`, or `None` when it cannot be read
/// or parsed.
pub fn read_proc_modules(path: &Path) -> Option<BTreeSet<String>> {
    match KernelModules::from_file(path) {
        Ok(modules) => Some(modules.0.into_keys().collect()),
        Err(e) => {
            debug!("unable to read {}: {}", path.display(), e);
            None
        }
    }
}

/// The `[module]` annotation of a symbol line, if any.
fn bracketed(line: &str) -> Option<&str> {
    let start = line.find('[')?;
    let rest = &line[start + 1..];
    let end = rest.find(']')?;
    let name = rest[..end].trim();
    (!name.is_empty()).then_some(name)
}

/// Module names annotated in `/proc/kallsyms` (`addr type symbol\t[module]`).
pub fn parse_kallsyms_modules(content: &str) -> BTreeSet<String> {
    content
        .lines()
        .filter_map(bracketed)
        .map(str::to_string)
        .collect()
}

/// Module annotations in the ftrace `enabled_functions`/`touched_functions`
/// tables, mapped to the first hooked function seen for each module.
pub fn parse_ftrace_modules(content: &str) -> BTreeMap<String, String> {
    let mut modules = BTreeMap::new();
    for line in content.lines() {
        let Some(module) = bracketed(line) else {
            continue;
        };
        let function = line.split_whitespace().next().unwrap_or("").to_string();
        modules.entry(module.to_string()).or_insert(function);
    }
    modules
}

/// `None` when the file cannot be read, so callers can tell "unavailable"
/// apart from "empty".
pub fn read_listing(path: &Path, parse: fn(&str) -> BTreeSet<String>) -> Option<BTreeSet<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Some(parse(&content)),
        Err(e) => {
            debug!("unable to read {}: {}", path.display(), e);
            None
        }
    }
}

/// Modules under `sys_module` with a non-empty `taint` file, with its flags.
pub fn tainted_sys_modules(sys_module: &Path) -> BTreeMap<String, String> {
    let mut tainted = BTreeMap::new();
    let entries = match fs::read_dir(sys_module) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("unable to read {}: {}", sys_module.display(), e);
            return tainted;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let taint_path = entry.path().join("taint");
        debug!("checking kmod {}", taint_path.display());
        let Ok(flags) = fs::read_to_string(&taint_path) else {
            continue;
        };
        let flags = flags.trim();
        if !flags.is_empty() {
            tainted.insert(name, flags.to_string());
        }
    }
    tainted
}

pub fn sys_module_exists(sys_module: &Path, name: &str) -> bool {
    sys_module.join(name).symlink_metadata().is_ok()
}

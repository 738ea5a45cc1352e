//! Line records printed by the iterator programs.
//!
//! Each program prints one record per line as space separated `key=value`
//! pairs, always with the same keys in the same order:
//!
//! ```text
//! tasks: pid=<i32> ppid=<i32> inode=<u64> uid=<u32> gid=<u32> comm=<str> exe=<str>
//! kmods: addr=0x<hex> atype=<char> func=<str> name=<str> type=<MOD|FTRACE_MOD|BPF|KPROBE>
//! files: pid=<i32> ppid=<i32> fd=<u32> inode=<u64> uid=<u32> gid=<u32> host=<str> file=<str> comm=<str> exe=<str>
//! ```
//!
//! A value runs until the next expected ` key=`, so values may contain
//! spaces. The last value takes the rest of the line. Lines that do not
//! start with the first key (headers, blank lines) are skipped.

use std::collections::BTreeMap;
use std::str::FromStr;

use log::debug;

use crate::error::{CloakError, Result};
use crate::models::{FileHandleRecord, HookInfo, KernelModuleRecord, ProcessRecord, Provenance, SymbolKind};
use crate::utils;

pub const TASK_KEYS: &[&str] = &["pid", "ppid", "inode", "uid", "gid", "comm", "exe"];
pub const KMOD_KEYS: &[&str] = &["addr", "atype", "func", "name", "type"];
pub const FILE_KEYS: &[&str] = &[
    "pid", "ppid", "fd", "inode", "uid", "gid", "host", "file", "comm", "exe",
];

/// Splits `line` into the values of `keys`, in order.
pub fn split_fields<'a>(line: &'a str, keys: &[&str]) -> Result<Vec<&'a str>> {
    let mut rest = line.trim_start();
    let mut values = Vec::with_capacity(keys.len());

    for (i, key) in keys.iter().enumerate() {
        rest = rest
            .strip_prefix(*key)
            .and_then(|r| r.strip_prefix('='))
            .ok_or_else(|| CloakError::Parse(format!("expected `{key}=` in {line:?}")))?;

        match keys.get(i + 1) {
            Some(next) => {
                let marker = format!(" {next}=");
                let end = rest
                    .find(&marker)
                    .ok_or_else(|| CloakError::Parse(format!("missing `{next}=` in {line:?}")))?;
                values.push(&rest[..end]);
                rest = &rest[end + 1..];
            }
            None => values.push(rest.trim_end()),
        }
    }
    Ok(values)
}

fn number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| CloakError::Parse(format!("bad {key} value {value:?}")))
}

fn hex(key: &str, value: &str) -> Result<u64> {
    let digits = value.trim().trim_start_matches("0x");
    u64::from_str_radix(digits, 16).map_err(|_| CloakError::Parse(format!("bad {key} value {value:?}")))
}

pub fn parse_task(line: &str) -> Result<ProcessRecord> {
    let v = split_fields(line, TASK_KEYS)?;
    Ok(ProcessRecord {
        pid: number("pid", v[0])?,
        ppid: number("ppid", v[1])?,
        inode: number("inode", v[2])?,
        uid: number("uid", v[3])?,
        gid: number("gid", v[4])?,
        comm: utils::escape_printable(v[5]),
        exe: utils::escape_printable(v[6]),
        provenance: Provenance::KernelIterator,
    })
}

/// Parses a ksym record. Kernel-internal pseudo modules (`<none>`, local
/// `__builtin*` symbols) yield `None`.
pub fn parse_kmod(line: &str) -> Result<Option<KernelModuleRecord>> {
    let v = split_fields(line, KMOD_KEYS)?;
    let name = v[3].trim();
    let symbol_type = v[1].trim().chars().next().unwrap_or('?');

    if name == "<none>" || (name.starts_with("__builtin") && symbol_type == 't') {
        return Ok(None);
    }

    let kind = v[4].split_whitespace().next().unwrap_or("");
    Ok(Some(KernelModuleRecord {
        name: name.to_string(),
        taint: 0,
        hook: Some(HookInfo {
            addr: hex("addr", v[0])?,
            symbol_type,
            function: v[2].trim().to_string(),
            kind: SymbolKind::from_str(kind)?,
        }),
    }))
}

pub fn parse_file(line: &str) -> Result<FileHandleRecord> {
    let v = split_fields(line, FILE_KEYS)?;
    Ok(FileHandleRecord {
        pid: number("pid", v[0])?,
        ppid: number("ppid", v[1])?,
        fd: number("fd", v[2])?,
        inode: number("inode", v[3])?,
        uid: number("uid", v[4])?,
        gid: number("gid", v[5])?,
        host: utils::escape_printable(v[6]),
        file: utils::escape_printable(v[7]),
        comm: utils::escape_printable(v[8]),
        exe: utils::escape_printable(v[9]),
    })
}

/// Parses every record line of an iterator dump. Lines not starting with
/// `first_key=` are skipped silently; malformed records are logged.
pub fn parse_lines<T>(output: &str, first_key: &str, parse: fn(&str) -> Result<T>) -> Vec<T> {
    let prefix = format!("{first_key}=");
    output
        .lines()
        .map(str::trim_start)
        .filter(|line| line.starts_with(&prefix))
        .filter_map(|line| match parse(line) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("skipping record: {}", e);
                None
            }
        })
        .collect()
}

pub fn parse_tasks(output: &str) -> Vec<ProcessRecord> {
    parse_lines(output, TASK_KEYS[0], parse_task)
}

/// First record seen per module name.
pub fn parse_kmods(output: &str) -> BTreeMap<String, KernelModuleRecord> {
    let mut modules = BTreeMap::new();
    for record in parse_lines(output, KMOD_KEYS[0], parse_kmod).into_iter().flatten() {
        modules.entry(record.name.clone()).or_insert(record);
    }
    modules
}

pub fn parse_files(output: &str) -> Vec<FileHandleRecord> {
    parse_lines(output, FILE_KEYS[0], parse_file)
}

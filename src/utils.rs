use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};

use crate::models::{FileMeta, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, StatBlock};

const BYTES_PER_ROW: usize = 16;

/// Hex + ASCII rendering of `content`, one line per 16 bytes.
pub fn hexdump(content: &[u8]) -> Vec<String> {
    let mut lines = Vec::with_capacity(content.len().div_ceil(BYTES_PER_ROW));
    for (i, chunk) in content.chunks(BYTES_PER_ROW).enumerate() {
        let mut hex_line = format!("0x{:08x}: ", i * BYTES_PER_ROW);

        for (j, byte) in chunk.iter().enumerate() {
            hex_line.push_str(&format!("{:02x} ", byte));
            if j == 7 {
                hex_line.push(' ');
            }
        }

        if chunk.len() < BYTES_PER_ROW {
            let spaces = (BYTES_PER_ROW - chunk.len()) * 3 + if chunk.len() <= 8 { 1 } else { 0 };
            hex_line.push_str(&" ".repeat(spaces));
        }

        hex_line.push_str(" | ");
        for &byte in chunk {
            if (32..=126).contains(&byte) {
                hex_line.push(byte as char);
            } else {
                hex_line.push('.');
            }
        }
        lines.push(hex_line);
    }
    lines
}

pub fn print_content(label: &str, content: &[u8]) {
    warn!(target: "detection", "{} ({} bytes):", label, content.len());
    for line in hexdump(content) {
        warn!(target: "detection", "\t{}", line);
    }
}

/// Escapes control characters so paths and command names print on one line.
/// Printable unicode is left alone, as `ls` and `find` do.
pub fn escape_printable(raw: &str) -> String {
    raw.escape_debug().to_string()
}

pub fn readlink_escaped(path: impl AsRef<Path>) -> io::Result<String> {
    let target = fs::read_link(path)?;
    Ok(escape_printable(&target.to_string_lossy()))
}

/// Drops a trailing slash, except for `/` itself.
pub fn normalize_path(path: &str) -> String {
    if path.len() > 1 {
        path.trim_end_matches('/').to_string()
    } else {
        path.to_string()
    }
}

/// `dir/name`, without doubling the slash when `dir` is `/`.
pub fn join_entry(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

pub fn self_pid() -> i32 {
    std::process::id() as i32
}

/// `/proc/<our pid>` under the given proc root, as a normalized string.
pub fn self_proc_path(proc_root: &Path) -> String {
    normalize_path(&proc_root.join(self_pid().to_string()).to_string_lossy())
}

pub fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path).ok().map(|val| val.trim().to_string())
}

pub fn read_number<T: std::str::FromStr>(path: impl AsRef<Path>) -> Option<T> {
    read_trimmed(path).and_then(|val| val.parse::<T>().ok())
}

/// `ls -l` style mode string.
pub fn mode_string(mode: u32) -> String {
    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        S_IFREG => '-',
        0o020000 => 'c',
        0o060000 => 'b',
        0o010000 => 'p',
        0o140000 => 's',
        _ => '?',
    };

    let mut out = String::with_capacity(10);
    out.push(kind);
    const BITS: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    for (bit, ch) in BITS {
        out.push(if mode & bit != 0 { ch } else { '-' });
    }
    out
}

pub fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Single-line `mode size mtime path` rendering used by listings.
pub fn describe_entry(path: &str, meta: &FileMeta) -> String {
    format!(
        "{}\t{}\t{}\t{}",
        mode_string(meta.mode),
        meta.size,
        format_time(&meta.modified),
        path
    )
}

pub fn describe_stat(stat: &StatBlock) -> String {
    format!(
        "Size: {} \tBlock size: {} \tBlocks: {}\n\tDevice: {} \tRdev: {} \tInode: {} \tLinks: {}\n\tUID: {} GID: {}\n\tAccess: {}\n\tModify: {}\n\tChange: {}",
        stat.size,
        stat.blksize,
        stat.blocks,
        stat.dev,
        stat.rdev,
        stat.ino,
        stat.nlink,
        stat.uid,
        stat.gid,
        format_time(&stat.atime),
        format_time(&stat.mtime),
        format_time(&stat.ctime),
    )
}

/// Expands `*` path segments against the live filesystem. Patterns without
/// wildcards are returned when they exist.
pub fn expand_glob(pattern: &str) -> Vec<PathBuf> {
    let mut current = vec![PathBuf::from("/")];
    let absolute = pattern.starts_with('/');
    if !absolute {
        current = vec![PathBuf::from(".")];
    }

    for segment in pattern.split('/').filter(|s| !s.is_empty()) {
        let mut next = Vec::new();
        for base in &current {
            if segment.contains('*') {
                let entries = match fs::read_dir(base) {
                    Ok(entries) => entries,
                    Err(e) => {
                        debug!("glob: unable to read {}: {}", base.display(), e);
                        continue;
                    }
                };
                let mut names: Vec<String> = entries
                    .flatten()
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .filter(|name| wildcard_match(segment, name))
                    .collect();
                names.sort();
                next.extend(names.into_iter().map(|name| base.join(name)));
            } else {
                let candidate = base.join(segment);
                if candidate.symlink_metadata().is_ok() {
                    next.push(candidate);
                }
            }
        }
        current = next;
    }
    current
}

/// Shell-style match supporting `*` only. Hidden names need an explicit dot.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    if name.starts_with('.') && !pattern.starts_with('.') {
        return false;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let mut rest = name;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

//! External-command channel: what an administrator sees with `ls`, `find`
//! and `cat`. These programs go through the C library, which is what
//! userland rootkits usually hook.

use std::fs;
use std::path::Path;
use std::process::Command;

use log::{debug, warn};

use super::{ContentReader, FileLister, ListTool};
use crate::error::{CloakError, Result};
use crate::models::{Depth, FileMeta, FileRecord, FileSet};
use crate::utils;

#[derive(Debug, Clone, Copy)]
pub struct ExternalCommand {
    tool: ListTool,
}

impl ExternalCommand {
    pub fn new(tool: ListTool) -> Self {
        Self { tool }
    }

    pub fn tool(&self) -> ListTool {
        self.tool
    }

    fn list_args(&self, root: &str, depth: Depth) -> Vec<String> {
        match (self.tool, depth) {
            (ListTool::Ls, Depth::Shallow) => vec![root.into(), "-A".into()],
            (ListTool::Ls, Depth::Recursive) => vec![root.into(), "-A".into(), "-R".into()],
            // -H follows a symlinked root, so listing a link to a directory
            // returns its content instead of the link itself.
            (ListTool::Find, Depth::Shallow) => {
                vec!["-H".into(), root.into(), "-maxdepth".into(), "1".into()]
            }
            (ListTool::Find, Depth::Recursive) => vec!["-H".into(), root.into()],
        }
    }
}

/// Runs `program args...` and returns stdout. A non-zero exit with some
/// output is kept (e.g. `ls -R` hitting one unreadable directory); a spawn
/// failure is an error because the channel could not be observed at all.
fn run(program: &str, args: &[String]) -> Result<Vec<u8>> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| CloakError::Command {
            command: program.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        warn!(
            "`{} {}` exited with {}: {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

fn lstat_record(path: String) -> FileRecord {
    let meta = match fs::symlink_metadata(&path) {
        Ok(md) => Some(FileMeta::from(&md)),
        Err(e) => {
            debug!("unable to stat {}: {}", path, e);
            None
        }
    };
    FileRecord::new(path, meta)
}

/// Paths listed by `ls -A [-R] <root>`.
///
/// Recursive output is a sequence of `<dir>:` headers, each followed by the
/// names in that directory and a blank line. Headers are recognised by an
/// absolute path ending in `:`, since plain names never contain a slash.
pub fn parse_ls_output(root: &str, output: &str) -> Vec<String> {
    let mut current_dir = root.to_string();
    let mut paths = Vec::new();

    for line in output.lines() {
        let line = line.trim_matches(|c| c == ' ' || c == '\t');
        if line.is_empty() {
            continue;
        }
        if line.starts_with('/') && line.ends_with(':') {
            current_dir = utils::normalize_path(&line[..line.len() - 1]);
            continue;
        }
        let name = line.rsplit('/').next().unwrap_or(line);
        paths.push(utils::join_entry(&current_dir, name));
    }
    paths
}

/// Paths printed by `find`, one per line, minus the root itself.
pub fn parse_find_output(root: &str, output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .map(utils::normalize_path)
        .filter(|path| path != root)
        .collect()
}

impl FileLister for ExternalCommand {
    fn name(&self) -> &str {
        self.tool.command()
    }

    fn list(&self, root: &str, depth: Depth) -> Result<FileSet> {
        let root = utils::normalize_path(root);
        let args = self.list_args(&root, depth);
        debug!("listing {} with `{} {}`", root, self.tool, args.join(" "));

        let stdout = run(self.tool.command(), &args)?;
        let output = String::from_utf8_lossy(&stdout);
        let paths = match self.tool {
            ListTool::Ls => parse_ls_output(&root, &output),
            ListTool::Find => parse_find_output(&root, &output),
        };

        let mut files: FileSet = paths.into_iter().map(lstat_record).collect();
        files.remove(&root);
        Ok(files)
    }
}

/// Reads files with `cat`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CatReader;

impl ContentReader for CatReader {
    fn name(&self) -> &str {
        "cat"
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let output = Command::new("cat")
            .arg(path)
            .output()
            .map_err(|e| CloakError::Command {
                command: "cat".into(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(CloakError::Command {
                command: format!("cat {}", path.display()),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

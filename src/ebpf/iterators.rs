use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use libbpf_rs::{Iter, Link, Object, ObjectBuilder};
use log::{debug, error, info, warn};

use super::records;
use crate::channel::KernelIterators;
use crate::error::{CloakError, Result};
use crate::models::{FileHandleRecord, KernelModuleRecord, ProcessRecord};

/// Pinned iterator links live here when pinning is requested.
pub const PIN_DIR: &str = "/sys/fs/bpf/cloakscan";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IterProgram {
    Tasks,
    Kmods,
    Files,
}

impl IterProgram {
    pub const ALL: [IterProgram; 3] = [IterProgram::Tasks, IterProgram::Kmods, IterProgram::Files];

    pub fn prog_name(self) -> &'static str {
        match self {
            IterProgram::Tasks => "dump_tasks",
            IterProgram::Kmods => "dump_kmods",
            IterProgram::Files => "dump_files",
        }
    }

    pub fn object_file(self) -> String {
        format!("{}.bpf.o", self.prog_name())
    }

    /// File name under [`PIN_DIR`].
    pub fn pin_name(self) -> &'static str {
        match self {
            IterProgram::Tasks => "tasks",
            IterProgram::Kmods => "kmods",
            IterProgram::Files => "files",
        }
    }

    fn unavailable(self) -> CloakError {
        CloakError::IteratorUnavailable(self.pin_name())
    }
}

/// Where `build.rs` leaves the compiled programs.
pub fn default_object_dir() -> PathBuf {
    PathBuf::from(env!("OUT_DIR"))
}

struct LoadedIter {
    link: Link,
    // keeps the program loaded while the link exists
    _object: Object,
}

/// Kernel iterator programs, loaded once and read on demand.
///
/// Programs that fail to load are simply absent; reading them reports
/// [`CloakError::IteratorUnavailable`].
pub struct BpfIterators {
    iters: BTreeMap<IterProgram, LoadedIter>,
}

impl BpfIterators {
    pub fn load(object_dir: Option<&Path>, pin: bool) -> Self {
        let dir = object_dir.map(Path::to_path_buf).unwrap_or_else(default_object_dir);
        let mut iters = BTreeMap::new();

        for program in IterProgram::ALL {
            debug!("Loading ebpf module {}", program.prog_name());
            match Self::load_one(&dir, program) {
                Ok(loaded) => {
                    iters.insert(program, loaded);
                }
                Err(e) => warn!("[eBPF] {} not available: {}", program.prog_name(), e),
            }
        }

        let mut runtime = Self { iters };
        if pin {
            runtime.pin_all();
        }
        debug!("[eBPF] loaded {} iterators", runtime.iters.len());
        runtime
    }

    fn load_one(dir: &Path, program: IterProgram) -> Result<LoadedIter> {
        let path = dir.join(program.object_file());
        if !path.exists() {
            return Err(CloakError::BpfNotFound(path.display().to_string()));
        }

        let mut object = ObjectBuilder::default().open_file(&path)?.load()?;
        let link = object
            .progs_mut()
            .find(|prog| prog.name() == program.prog_name())
            .ok_or_else(|| CloakError::BpfNotFound(program.prog_name().to_string()))?
            .attach()?;

        Ok(LoadedIter {
            link,
            _object: object,
        })
    }

    pub fn is_loaded(&self, program: IterProgram) -> bool {
        self.iters.contains_key(&program)
    }

    /// Pins every loaded iterator so its output can be read with `cat`.
    fn pin_all(&mut self) {
        if let Err(e) = fs::create_dir_all(PIN_DIR) {
            error!("[eBPF] unable to create {}: {}", PIN_DIR, e);
            return;
        }
        for (program, loaded) in self.iters.iter_mut() {
            let path = Path::new(PIN_DIR).join(program.pin_name());
            let _ = fs::remove_file(&path);
            match loaded.link.pin(&path) {
                Ok(()) => info!("[eBPF] {} pinned at {}", program.prog_name(), path.display()),
                Err(e) => error!("[eBPF] pinning {} error: {}", program.prog_name(), e),
            }
        }
    }

    /// Runs the iterator once and returns everything it printed.
    pub fn read(&self, program: IterProgram) -> Result<String> {
        let loaded = self.iters.get(&program).ok_or_else(|| program.unavailable())?;
        let mut iter = Iter::new(&loaded.link)?;
        let mut output = String::new();
        iter.read_to_string(&mut output)
            .map_err(|e| CloakError::io(Path::new(PIN_DIR).join(program.pin_name()), e))?;

        if output.is_empty() {
            warn!("[eBPF] kernel {} empty (check previous errors).", program.pin_name());
        }
        Ok(output)
    }

    pub fn stop(&mut self) {
        self.iters.clear();
    }
}

impl Drop for BpfIterators {
    fn drop(&mut self) {
        self.stop();
    }
}

impl KernelIterators for BpfIterators {
    fn live_tasks(&self) -> Result<Vec<ProcessRecord>> {
        Ok(records::parse_tasks(&self.read(IterProgram::Tasks)?))
    }

    fn live_modules(&self) -> Result<BTreeMap<String, KernelModuleRecord>> {
        Ok(records::parse_kmods(&self.read(IterProgram::Kmods)?))
    }

    fn live_open_files(&self) -> Result<Vec<FileHandleRecord>> {
        Ok(records::parse_files(&self.read(IterProgram::Files)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_objects_leave_iterators_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let iterators = BpfIterators::load(Some(dir.path()), false);

        for program in IterProgram::ALL {
            assert!(!iterators.is_loaded(program));
        }
        assert!(matches!(
            iterators.live_tasks(),
            Err(CloakError::IteratorUnavailable("tasks"))
        ));
        assert!(iterators.live_modules().is_err());
        assert!(iterators.live_open_files().is_err());
    }

    #[test]
    fn test_program_names() {
        assert_eq!(IterProgram::Kmods.object_file(), "dump_kmods.bpf.o");
        assert_eq!(IterProgram::Files.pin_name(), "files");
    }
}

//! Hidden kernel module detection.
//!
//! A tainted kernel means some module changed state at some point. The
//! analyzer looks for the module responsible and checks that every listing
//! userland can query agrees it exists.

pub mod listings;
pub mod taint;

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, error, info, warn};

use crate::channel::KernelIterators;
use crate::config::HostPaths;
use crate::models::{HookInfo, KernelModuleRecord, SymbolKind};
use crate::verdict::Verdict;

pub use listings::{parse_ftrace_modules, parse_kallsyms_modules, read_proc_modules};
pub use taint::{TAINT_FLAGS, TaintBit, TaintFlag, check_tainted, decode_taint, read_taint};

/// Where a suspicious module name came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    /// `/sys/module/<name>/taint`, with the flags it reported.
    SysModuleTaint(String),
    KernelIterator(HookInfo),
    /// Ftrace hook table, with the hooked function.
    FtraceTable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFinding {
    pub name: String,
    pub source: ModuleSource,
    pub missing_from_proc_modules: bool,
    pub missing_from_kallsyms: bool,
    pub missing_from_sys_module: bool,
}

impl ModuleFinding {
    pub fn is_hidden(&self) -> bool {
        self.missing_from_proc_modules || self.missing_from_kallsyms || self.missing_from_sys_module
    }

    /// Not visible through any userland listing at all.
    pub fn is_fully_hidden(&self) -> bool {
        self.missing_from_proc_modules && self.missing_from_kallsyms && self.missing_from_sys_module
    }
}

#[derive(Debug, Clone, Default)]
pub struct KmodReport {
    pub taint: u64,
    pub flags: Vec<TaintBit>,
    pub tainted_modules: BTreeMap<String, String>,
    pub findings: Vec<ModuleFinding>,
    pub verdict: Verdict,
}

impl KmodReport {
    pub fn hidden(&self) -> impl Iterator<Item = &ModuleFinding> {
        self.findings.iter().filter(|finding| finding.is_hidden())
    }
}

/// The listings a module is checked against. `None` means the listing could
/// not be read, and that comparison is skipped.
struct Listings {
    proc_modules: Option<BTreeSet<String>>,
    kallsyms: Option<BTreeSet<String>>,
}

impl Listings {
    fn missing(set: &Option<BTreeSet<String>>, name: &str) -> bool {
        set.as_ref().is_some_and(|names| !names.contains(name))
    }
}

pub struct KmodAnalyzer<'a> {
    paths: &'a HostPaths,
    iterators: &'a dyn KernelIterators,
}

impl<'a> KmodAnalyzer<'a> {
    pub fn new(paths: &'a HostPaths, iterators: &'a dyn KernelIterators) -> Self {
        Self { paths, iterators }
    }

    pub fn analyze(&self) -> KmodReport {
        let taint = match check_tainted(self.paths) {
            Ok(value) => value,
            Err(e) => {
                error!("kernel taint state unavailable: {}", e);
                return KmodReport {
                    verdict: Verdict::Error,
                    ..KmodReport::default()
                };
            }
        };

        let mut report = KmodReport {
            taint,
            flags: decode_taint(taint),
            ..KmodReport::default()
        };
        if taint == 0 {
            return report;
        }

        info!("Checking loaded kernel modules");
        let listings = Listings {
            proc_modules: read_proc_modules(&self.paths.proc_modules),
            kallsyms: listings::read_listing(&self.paths.kallsyms, parse_kallsyms_modules),
        };

        report.tainted_modules = listings::tainted_sys_modules(&self.paths.sys_module);
        for (name, flags) in &report.tainted_modules {
            warn!(target: "detection", "tainted: {}, {}", name, flags);
            let finding = self.check(name, ModuleSource::SysModuleTaint(flags.clone()), &listings);
            report.findings.push(finding);
        }

        self.check_iterator(&listings, &mut report);
        self.check_ftrace(&listings, &mut report);

        for finding in report.hidden() {
            log_finding(finding);
        }

        if report.tainted_modules.is_empty() && report.hidden().next().is_none() {
            warn!(
                target: "detection",
                "WARNING: the kernel is tainted, but we haven't found any kmod tainting the kernel. REVIEW"
            );
        }

        report.verdict = if report.hidden().next().is_some() {
            Verdict::KmodHidden
        } else {
            Verdict::Ok
        };
        report
    }

    fn check(&self, name: &str, source: ModuleSource, listings: &Listings) -> ModuleFinding {
        ModuleFinding {
            name: name.to_string(),
            source,
            missing_from_proc_modules: Listings::missing(&listings.proc_modules, name),
            missing_from_kallsyms: Listings::missing(&listings.kallsyms, name),
            missing_from_sys_module: !listings::sys_module_exists(&self.paths.sys_module, name),
        }
    }

    fn already_checked(report: &KmodReport, name: &str) -> bool {
        report.findings.iter().any(|finding| finding.name == name)
    }

    fn check_iterator(&self, listings: &Listings, report: &mut KmodReport) {
        let modules = match self.iterators.live_modules() {
            Ok(modules) => modules,
            Err(e) => {
                debug!("ksym iterator unavailable: {}", e);
                return;
            }
        };

        for KernelModuleRecord { name, hook, .. } in modules.into_values() {
            let Some(hook) = hook else {
                continue;
            };
            if !matches!(hook.kind, SymbolKind::Module | SymbolKind::FtraceModule) {
                continue;
            }
            if Self::already_checked(report, &name) {
                continue;
            }
            let finding = self.check(&name, ModuleSource::KernelIterator(hook), listings);
            // A module present everywhere is just a loaded module.
            if finding.is_hidden() {
                report.findings.push(finding);
            }
        }
    }

    fn check_ftrace(&self, listings: &Listings, report: &mut KmodReport) {
        let mut hooked = BTreeMap::new();
        for path in [&self.paths.enabled_functions, &self.paths.touched_functions] {
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    for (module, function) in parse_ftrace_modules(&content) {
                        hooked.entry(module).or_insert(function);
                    }
                }
                Err(e) => debug!("unable to read {}: {}", path.display(), e),
            }
        }

        for (name, function) in hooked {
            if Self::already_checked(report, &name) {
                continue;
            }
            let finding = self.check(&name, ModuleSource::FtraceTable(function), listings);
            if finding.is_fully_hidden() {
                report.findings.push(finding);
            }
        }
    }
}

fn log_finding(finding: &ModuleFinding) {
    if finding.is_fully_hidden() {
        warn!(
            target: "detection",
            "\tWARNING: \"{}\" kmod HIDDEN from /proc/modules, /proc/kallsyms and /sys/module",
            finding.name
        );
    } else {
        if finding.missing_from_proc_modules {
            warn!(target: "detection", "\tWARNING: \"{}\" kmod HIDDEN from /proc/modules", finding.name);
        }
        if finding.missing_from_kallsyms {
            warn!(target: "detection", "\tWARNING: \"{}\" kmod HIDDEN from /proc/kallsyms", finding.name);
        }
        if finding.missing_from_sys_module {
            warn!(target: "detection", "\tWARNING: \"{}\" kmod HIDDEN from /sys/module", finding.name);
        }
    }

    match &finding.source {
        ModuleSource::SysModuleTaint(flags) => {
            warn!(target: "detection", "\t  found via /sys/module taint ({})", flags)
        }
        ModuleSource::KernelIterator(hook) => warn!(
            target: "detection",
            "\t  found via ksym iterator: addr=0x{:x} atype={} func={} type={}",
            hook.addr, hook.symbol_type, hook.function, hook.kind
        ),
        ModuleSource::FtraceTable(function) => {
            warn!(target: "detection", "\t  found via ftrace hook on {}", function)
        }
    }
}

//! Kernel taint bitmask decoding.

use std::fmt;

use log::{info, warn};

use crate::config::HostPaths;
use crate::error::{CloakError, Result};
use crate::utils;

#[derive(Debug, PartialEq, Eq)]
pub struct TaintFlag {
    pub bit: u8,
    pub letter: &'static str,
    pub reason: &'static str,
}

pub static TAINT_FLAGS: &[TaintFlag] = &[
    TaintFlag {
        bit: 0,
        letter: "G/P",
        reason: "proprietary module was loaded (G means all modules GPL; P means a proprietary module exists)",
    },
    TaintFlag {
        bit: 1,
        letter: "F",
        reason: "module was force loaded (insmod -f)",
    },
    TaintFlag {
        bit: 2,
        letter: "S",
        reason: "kernel running on an out-of-spec system / unsupported SMP/hardware configuration",
    },
    TaintFlag {
        bit: 3,
        letter: "R",
        reason: "module was force unloaded (rmmod -f)",
    },
    TaintFlag {
        bit: 4,
        letter: "M",
        reason: "processor reported a Machine Check Exception (MCE)",
    },
    TaintFlag {
        bit: 5,
        letter: "B",
        reason: "bad page referenced / unexpected page flags (possible hardware or kernel bug)",
    },
    TaintFlag {
        bit: 6,
        letter: "U",
        reason: "taint requested by userspace",
    },
    TaintFlag {
        bit: 7,
        letter: "D",
        reason: "kernel has died recently (there was an OOPS or BUG)",
    },
    TaintFlag {
        bit: 8,
        letter: "A",
        reason: "ACPI table overridden by user",
    },
    TaintFlag {
        bit: 9,
        letter: "W",
        reason: "kernel issued warning",
    },
    TaintFlag {
        bit: 10,
        letter: "C",
        reason: "staging driver was loaded",
    },
    TaintFlag {
        bit: 11,
        letter: "I",
        reason: "workaround for bug in platform firmware applied",
    },
    TaintFlag {
        bit: 12,
        letter: "O",
        reason: "externally-built ('out-of-tree') module was loaded",
    },
    TaintFlag {
        bit: 13,
        letter: "E",
        reason: "unsigned module loaded on a kernel that supports module signatures",
    },
    TaintFlag {
        bit: 14,
        letter: "L",
        reason: "soft lockup occurred",
    },
    TaintFlag {
        bit: 15,
        letter: "K",
        reason: "kernel has been live patched",
    },
    TaintFlag {
        bit: 16,
        letter: "X",
        reason: "auxiliary taint, distro-defined",
    },
    TaintFlag {
        bit: 17,
        letter: "T",
        reason: "kernel built with randstruct plugin (set at build time)",
    },
    TaintFlag {
        bit: 18,
        letter: "N",
        reason: "an in-kernel test (e.g. KUnit) has been run",
    },
];

/// One set bit of the taint mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaintBit {
    pub bit: u8,
    pub flag: Option<&'static TaintFlag>,
}

impl fmt::Display for TaintBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.flag {
            Some(flag) => write!(f, "({}) {}", flag.letter, flag.reason),
            None => write!(f, "(bit {}) unknown taint flag", self.bit),
        }
    }
}

/// Set bits of `value`, lowest first.
pub fn decode_taint(value: u64) -> Vec<TaintBit> {
    (0..u64::BITS as u8)
        .filter(|bit| value & (1u64 << bit) != 0)
        .map(|bit| TaintBit {
            bit,
            flag: TAINT_FLAGS.iter().find(|flag| flag.bit == bit),
        })
        .collect()
}

pub fn read_taint(paths: &HostPaths) -> Result<u64> {
    let raw = utils::read_trimmed(&paths.tainted).ok_or_else(|| {
        CloakError::Other(format!("unable to read {}", paths.tainted.display()))
    })?;
    raw.parse::<u64>()
        .map_err(|e| CloakError::Parse(format!("{}: {raw:?}: {e}", paths.tainted.display())))
}

/// Reads and logs the kernel taint state. Returns the raw mask.
pub fn check_tainted(paths: &HostPaths) -> Result<u64> {
    info!("Checking kernel integrity");

    let value = read_taint(paths)?;
    if value == 0 {
        info!("kernel not tainted");
        return Ok(0);
    }

    warn!(target: "detection", "WARNING: kernel tainted ({})", value);
    for bit in decode_taint(value) {
        warn!(target: "detection", "\t{}", bit);
    }
    Ok(value)
}

//! eBPF iterator programs: tasks, kernel symbols and open files as the
//! kernel itself enumerates them.

pub mod iterators;
pub mod records;

pub use iterators::{BpfIterators, IterProgram, PIN_DIR};

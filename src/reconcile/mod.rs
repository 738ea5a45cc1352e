//! Set reconciliation between channel snapshots.

pub mod content;
pub mod files;

pub use content::{
    ContentComparison, ContentViews, check_content, compare_content, reconcile_views,
    scan_hidden_content,
};
pub use files::{
    FileReconciliation, SizeMismatch, check_hidden_files, reconcile_files, report_files,
    scan_hidden_files,
};

//! Scan outcomes and the exit codes they map to.

use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Verdict {
    #[default]
    Ok,
    Error,
    FilesHidden,
    KmodHidden,
    ContentHidden,
    PidBindMount,
    ProcHidden,
    ConnHidden,
}

impl Verdict {
    pub fn exit_code(self) -> i32 {
        match self {
            Verdict::Ok => 0,
            Verdict::Error => 1,
            Verdict::FilesHidden => 50,
            Verdict::KmodHidden => 51,
            Verdict::ContentHidden => 52,
            Verdict::PidBindMount => 53,
            Verdict::ProcHidden => 54,
            Verdict::ConnHidden => 55,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Verdict::Ok
    }

    pub fn is_detection(self) -> bool {
        !matches!(self, Verdict::Ok | Verdict::Error)
    }

    /// Folds a later result into this one. A later detection replaces the
    /// current value; `Error` only replaces `Ok`, so a failed step never
    /// masks a detection already made.
    pub fn and_then(self, later: Verdict) -> Verdict {
        match later {
            Verdict::Ok => self,
            Verdict::Error if self.is_detection() => self,
            _ => later,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verdict::Ok => "ok",
            Verdict::Error => "error",
            Verdict::FilesHidden => "files hidden",
            Verdict::KmodHidden => "kernel module hidden",
            Verdict::ContentHidden => "content hidden",
            Verdict::PidBindMount => "pid hidden by bind mount",
            Verdict::ProcHidden => "process hidden",
            Verdict::ConnHidden => "connection hidden",
        };
        f.pad(name)
    }
}

impl FromIterator<Verdict> for Verdict {
    fn from_iter<I: IntoIterator<Item = Verdict>>(iter: I) -> Self {
        iter.into_iter().fold(Verdict::Ok, Verdict::and_then)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(Verdict::Ok.exit_code(), 0);
        assert_eq!(Verdict::Error.exit_code(), 1);
        assert_eq!(Verdict::FilesHidden.exit_code(), 50);
        assert_eq!(Verdict::KmodHidden.exit_code(), 51);
        assert_eq!(Verdict::ContentHidden.exit_code(), 52);
        assert_eq!(Verdict::PidBindMount.exit_code(), 53);
        assert_eq!(Verdict::ProcHidden.exit_code(), 54);
        assert_eq!(Verdict::ConnHidden.exit_code(), 55);
    }

    #[test]
    fn later_detection_wins() {
        assert_eq!(Verdict::Ok.and_then(Verdict::Ok), Verdict::Ok);
        assert_eq!(Verdict::FilesHidden.and_then(Verdict::Ok), Verdict::FilesHidden);
        assert_eq!(
            Verdict::FilesHidden.and_then(Verdict::ProcHidden),
            Verdict::ProcHidden
        );

        let folded: Verdict = [Verdict::Ok, Verdict::PidBindMount, Verdict::Ok]
            .into_iter()
            .collect();
        assert_eq!(folded, Verdict::PidBindMount);
    }

    #[test]
    fn error_never_masks_a_detection() {
        assert_eq!(Verdict::Ok.and_then(Verdict::Error), Verdict::Error);
        assert_eq!(Verdict::FilesHidden.and_then(Verdict::Error), Verdict::FilesHidden);
        assert_eq!(Verdict::Error.and_then(Verdict::KmodHidden), Verdict::KmodHidden);

        let folded: Verdict = [Verdict::FilesHidden, Verdict::Error].into_iter().collect();
        assert_eq!(folded, Verdict::FilesHidden);
        assert_eq!(folded.exit_code(), 50);

        let folded: Verdict = [Verdict::ProcHidden, Verdict::KmodHidden, Verdict::Error]
            .into_iter()
            .collect();
        assert_eq!(folded, Verdict::KmodHidden);

        let folded: Verdict = [Verdict::Ok, Verdict::Error, Verdict::Ok].into_iter().collect();
        assert_eq!(folded, Verdict::Error);
    }
}

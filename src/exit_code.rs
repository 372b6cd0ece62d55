//! Process exit codes.
//!
//! Each fatal start-up cause has its own code so deployment tooling can tell
//! a missing config from a missing weights entry or a reference that never
//! locked.

use std::process::ExitCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeExit {
    Success = 0,
    /// Runtime failure not covered below.
    Failure = 1,
    ConfigNotFound = 2,
    ConfigParse = 3,
    /// Config I/O error other than not-found, or validation failure.
    ConfigUnexpected = 4,
    WeightsNotFound = 5,
    WeightsParse = 6,
    /// Reference clock did not lock or device setup failed.
    HardwareBringUp = 7,
}

impl NodeExit {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl From<NodeExit> for ExitCode {
    fn from(exit: NodeExit) -> Self {
        Self::from(exit.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let all = [
            NodeExit::Success,
            NodeExit::Failure,
            NodeExit::ConfigNotFound,
            NodeExit::ConfigParse,
            NodeExit::ConfigUnexpected,
            NodeExit::WeightsNotFound,
            NodeExit::WeightsParse,
            NodeExit::HardwareBringUp,
        ];
        let mut codes: Vec<u8> = all.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert_eq!(NodeExit::ConfigNotFound.code(), 2);
    }
}

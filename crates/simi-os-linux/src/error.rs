use crate::DiscoveryPhase;

/// Error types for Linux operations.
#[derive(thiserror::Error, Debug)]
pub enum LinuxError {
    /// Corrupted struct.
    #[error("Corrupted struct: {0}")]
    CorruptedStruct(&'static str),

    /// A discovery heuristic ran out of its iteration budget.
    #[error("{phase:?}: iteration ceiling exceeded ({detail})")]
    HeuristicCeilingExceeded {
        /// The phase that gave up.
        phase: DiscoveryPhase,

        /// What was searched for and what was found.
        detail: String,
    },

    /// A layout field required by the operation is not known.
    #[error("Kernel layout is incomplete: {0} is missing")]
    LayoutIncomplete(&'static str),

    /// A layout field was assigned a second, different value.
    #[error("Kernel layout field {field} already set to {current:#x}, refusing {value:#x}")]
    LayoutFieldReassigned {
        /// The field name.
        field: &'static str,

        /// The value already recorded.
        current: u64,

        /// The value that was refused.
        value: u64,
    },

    /// The persisted layout was written by an incompatible version.
    #[error("Kernel layout version {found} does not match {expected}")]
    LayoutVersionMismatch {
        /// The version found in the file.
        found: u32,

        /// The version this crate writes.
        expected: u32,
    },

    /// The persisted layout belongs to another kernel image.
    #[error("Kernel layout is for image {found:?}, expected {expected:?}")]
    LayoutImageMismatch {
        /// The image key found in the file.
        found: String,

        /// The image key asked for.
        expected: String,
    },

    /// The syscall name is not in the table.
    #[error("Unknown syscall: {0}")]
    UnknownSyscall(String),

    /// A syscall table line could not be parsed.
    #[error("Invalid syscall table line: {0:?}")]
    InvalidSyscallTable(String),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A (de)serialization error occurred.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<LinuxError> for simi_core::SimError {
    fn from(value: LinuxError) -> Self {
        simi_core::SimError::Os(value.into())
    }
}

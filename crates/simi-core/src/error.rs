use crate::{BreakpointHandle, Pa, Va};

/// Errors raised while reading or steering a simulated target.
#[derive(thiserror::Error, Debug)]
pub enum SimError {
    /// The simulator binding rejected a request.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error>),

    /// Guest OS interpretation failed.
    #[error(transparent)]
    Os(Box<dyn std::error::Error>),

    /// Reading or writing a host file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Translation stopped at a non-present entry.
    #[error("Page not present ({:?}, len: {})", .0[0], .0.len())]
    PageFault(PageFaults),

    /// The frame lies outside simulated RAM.
    #[error("Physical address {0} is not backed")]
    Unmapped(Pa),

    /// Pointer widths other than 4 and 8 bytes.
    #[error("Invalid address width")]
    InvalidAddressWidth,

    /// The simulator binding cannot do this.
    #[error("Operation not supported")]
    NotSupported,

    /// A read ran past the end of a frame.
    #[error("Out of bounds")]
    OutOfBounds,

    /// The simulator does not know this breakpoint.
    #[error("Breakpoint {0} not found")]
    BreakpointNotFound(BreakpointHandle),

    /// Anything else.
    #[error("{0}")]
    Other(&'static str),
}

/// A virtual address that failed to translate under `root`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageFault {
    /// The untranslatable address.
    pub address: Va,

    /// Root of the address space it was looked up in.
    pub root: Pa,
}

/// Most reads fault on a single page.
pub type PageFaults = smallvec::SmallVec<[PageFault; 1]>;

impl From<(Va, Pa)> for PageFault {
    fn from((address, root): (Va, Pa)) -> Self {
        Self { address, root }
    }
}

impl SimError {
    /// Wraps a single page fault.
    pub fn page_fault(pf: impl Into<PageFault>) -> Self {
        Self::PageFault(smallvec::smallvec![pf.into()])
    }
}

use serde::{Deserialize, Serialize};

use super::{Pa, Va};
use crate::PagingMode;

/// A virtual address bound to the address space that resolves it.
///
/// User addresses only make sense under the translation root of the task
/// that was running when they were captured, so the root and page table
/// format travel with the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressContext {
    /// The address itself.
    pub va: Va,

    /// CR3 on x86, TTBR0 on ARM.
    pub root: Pa,

    /// Page table format in effect under `root`.
    pub mode: PagingMode,
}

impl AddressContext {
    /// Binds `va` to the address space rooted at `root`.
    pub fn new(va: impl Into<Va>, root: impl Into<Pa>, mode: PagingMode) -> Self {
        Self {
            va: va.into(),
            root: root.into(),
            mode,
        }
    }
}

impl std::fmt::Display for AddressContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} @ {}", self.va, self.root)
    }
}

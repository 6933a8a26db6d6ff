use serde::{Deserialize, Serialize};

use crate::{AddressContext, Pa};

/// Where a guest read is directed.
///
/// Page table entries are read straight from physical memory. Everything
/// else is read through the translation of the task that owns the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessContext {
    /// A physical address, read without translation.
    Physical(Pa),

    /// A virtual address, translated before it is read.
    Virtual(AddressContext),
}

impl AccessContext {
    /// Reads from physical memory at `address`.
    pub fn direct(address: impl Into<Pa>) -> Self {
        Self::Physical(address.into())
    }

    /// Returns the raw address, physical or virtual.
    pub fn address(&self) -> u64 {
        match self {
            Self::Physical(pa) => pa.0,
            Self::Virtual(ctx) => ctx.va.0,
        }
    }
}

impl From<Pa> for AccessContext {
    fn from(value: Pa) -> Self {
        Self::Physical(value)
    }
}

impl From<AddressContext> for AccessContext {
    fn from(value: AddressContext) -> Self {
        Self::Virtual(value)
    }
}

impl std::ops::Add<u64> for AccessContext {
    type Output = AccessContext;

    fn add(self, rhs: u64) -> Self::Output {
        match self {
            Self::Physical(pa) => Self::Physical(pa + rhs),
            Self::Virtual(ctx) => Self::Virtual(AddressContext {
                va: ctx.va + rhs,
                ..ctx
            }),
        }
    }
}

impl std::ops::AddAssign<u64> for AccessContext {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl std::fmt::Display for AccessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Physical(pa) => write!(f, "{pa} (phys)"),
            Self::Virtual(ctx) => write!(f, "{ctx} ({:?})", ctx.mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PagingMode, Va};

    #[test]
    fn offset_keeps_translation() {
        let ctx = AccessContext::from(AddressContext::new(
            0xc000_0ff8u64,
            0x1000u64,
            PagingMode::Pae,
        ));

        let moved = ctx + 0x10;
        assert_eq!(moved.address(), 0xc000_1008);
        match moved {
            AccessContext::Virtual(inner) => {
                assert_eq!(inner.root, Pa(0x1000));
                assert_eq!(inner.mode, PagingMode::Pae);
            }
            AccessContext::Physical(_) => panic!("translation dropped"),
        }
    }

    #[test]
    fn physical_offset_wraps() {
        let mut ctx = AccessContext::direct(u64::MAX - 1);
        ctx += 4;
        assert_eq!(ctx, AccessContext::Physical(Pa(2)));
        assert!(!Va(ctx.address()).is_null());
    }
}

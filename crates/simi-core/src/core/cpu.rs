use serde::{Deserialize, Serialize};

/// Identifies a simulated processor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CpuId(pub u16);

impl From<u16> for CpuId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<CpuId> for u16 {
    fn from(value: CpuId) -> Self {
        value.0
    }
}

impl std::fmt::Display for CpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

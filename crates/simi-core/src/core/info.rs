use serde::{Deserialize, Serialize};

use crate::Gfn;

/// Machine geometry reported by the simulator once it is attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimInfo {
    /// Bytes per page.
    pub page_size: u64,

    /// `log2(page_size)`.
    pub page_shift: u64,

    /// Last frame backed by simulated RAM.
    pub max_gfn: Gfn,

    /// Processors in the simulated machine.
    pub cpus: u16,
}

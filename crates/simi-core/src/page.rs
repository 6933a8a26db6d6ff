use std::{ops::Deref, rc::Rc};

/// A snapshot of one guest frame.
///
/// The simulator copies the frame out when it is read, so the snapshot is
/// only valid until the guest runs again. Clones share the same bytes.
#[derive(Clone)]
pub struct SimMappedPage(Rc<[u8]>);

impl SimMappedPage {
    /// Wraps bytes copied out of the simulator.
    pub fn new(bytes: impl Into<Rc<[u8]>>) -> Self {
        Self(bytes.into())
    }
}

impl Deref for SimMappedPage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SimMappedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SimMappedPage({} bytes)", self.0.len())
    }
}

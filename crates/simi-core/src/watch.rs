//! Breakpoint ownership.
//!
//! Every component that installs breakpoints keeps them in its own
//! [`WatchRegistry`], so that it can recognize its events and tear all of
//! them down deterministically. Removal is idempotent: an event may still
//! arrive for a handle that was just removed, and removing it again is not
//! an error.

use std::{cell::Cell, fmt::Debug, rc::Rc};

use indexmap::IndexMap;

use crate::{BreakpointHandle, BreakpointRequest, SimCore, SimDriver, SimError};

/// A breakpoint installed on behalf of a component.
#[derive(Debug, Clone)]
pub struct Watch<Tag> {
    /// The request the breakpoint was installed with.
    pub request: BreakpointRequest,

    /// Component-specific metadata.
    pub tag: Tag,
}

/// Breakpoints installed by one component.
#[derive(Debug)]
pub struct WatchRegistry<Tag> {
    /// * Key: handle returned by the simulator
    /// * Value: request and metadata
    watches: IndexMap<BreakpointHandle, Watch<Tag>>,
}

impl<Tag> Default for WatchRegistry<Tag> {
    fn default() -> Self {
        Self {
            watches: IndexMap::new(),
        }
    }
}

impl<Tag> WatchRegistry<Tag>
where
    Tag: Debug,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a breakpoint and records it.
    pub fn insert<Driver>(
        &mut self,
        vmi: &SimCore<Driver>,
        request: BreakpointRequest,
        tag: Tag,
    ) -> Result<BreakpointHandle, SimError>
    where
        Driver: SimDriver,
    {
        let handle = vmi.set_breakpoint(request)?;
        tracing::trace!(%handle, ?request, ?tag, "watch installed");
        self.watches.insert(handle, Watch { request, tag });
        Ok(handle)
    }

    /// Removes a breakpoint.
    ///
    /// Returns the watch if it was present. A handle the simulator no longer
    /// knows is dropped from the registry all the same.
    pub fn remove<Driver>(
        &mut self,
        vmi: &SimCore<Driver>,
        handle: BreakpointHandle,
    ) -> Result<Option<Watch<Tag>>, SimError>
    where
        Driver: SimDriver,
    {
        let Some(watch) = self.watches.shift_remove(&handle) else {
            return Ok(None);
        };

        match vmi.remove_breakpoint(handle) {
            Ok(()) | Err(SimError::BreakpointNotFound(_)) => {}
            Err(err) => return Err(err),
        }

        tracing::trace!(%handle, tag = ?watch.tag, "watch removed");
        Ok(Some(watch))
    }

    /// Returns the watch for a handle.
    pub fn get(&self, handle: BreakpointHandle) -> Option<&Watch<Tag>> {
        self.watches.get(&handle)
    }

    /// Returns the watch for a handle, mutably.
    pub fn get_mut(&mut self, handle: BreakpointHandle) -> Option<&mut Watch<Tag>> {
        self.watches.get_mut(&handle)
    }

    /// Checks whether the handle belongs to this registry.
    pub fn contains(&self, handle: BreakpointHandle) -> bool {
        self.watches.contains_key(&handle)
    }

    /// Returns the handles whose watch matches `predicate`.
    pub fn handles_where(&self, predicate: impl Fn(&Watch<Tag>) -> bool) -> Vec<BreakpointHandle> {
        self.watches
            .iter()
            .filter(|(_, watch)| predicate(watch))
            .map(|(handle, _)| *handle)
            .collect()
    }

    /// Returns the number of installed watches.
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    /// Checks whether no watch is installed.
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Iterates over installed watches.
    pub fn iter(&self) -> impl Iterator<Item = (BreakpointHandle, &Watch<Tag>)> {
        self.watches.iter().map(|(handle, watch)| (*handle, watch))
    }

    /// Removes every breakpoint.
    ///
    /// Attempts all removals and returns the first error encountered.
    pub fn clear<Driver>(&mut self, vmi: &SimCore<Driver>) -> Result<(), SimError>
    where
        Driver: SimDriver,
    {
        let mut result = Ok(());

        for (handle, watch) in self.watches.drain(..) {
            match vmi.remove_breakpoint(handle) {
                Ok(()) | Err(SimError::BreakpointNotFound(_)) => {}
                Err(err) => {
                    tracing::warn!(%handle, tag = ?watch.tag, ?err, "failed to remove watch");
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }

        result
    }
}

/// A liveness flag shared between a component and the handles it gives out.
///
/// Once revoked, the component ignores any event that still arrives.
#[derive(Debug, Clone)]
pub struct Liveness(Rc<Cell<bool>>);

impl Default for Liveness {
    fn default() -> Self {
        Self(Rc::new(Cell::new(true)))
    }
}

impl Liveness {
    /// Creates a live flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks whether the owner is still live.
    pub fn is_alive(&self) -> bool {
        self.0.get()
    }

    /// Marks the owner as stopped.
    pub fn revoke(&self) {
        self.0.set(false);
    }
}

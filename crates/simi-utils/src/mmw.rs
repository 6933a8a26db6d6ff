//! Missing mapping watcher.
//!
//! Resolves virtual addresses whose translation does not exist yet. When a
//! walk stops at a non-present paging entry, the watcher installs a write
//! breakpoint on that entry and reports the address as pending. Once the
//! guest writes the entry, the address is walked again with the written value
//! substituted for the entry (the write has not reached memory when the
//! breakpoint fires). If the translation is complete, the address is
//! reported as resolved; if a deeper table is still missing, the watch moves
//! to the deeper entry.
//!
//! Addresses blocked by the same entry share one breakpoint.
//!
//! # Example
//!
//! ```no_run
//! # use simi_core::{AddressContext, SimCore, SimDriver, SimError, SimEvent};
//! # use simi_utils::mmw::{MissingMappingWatcher, Resolution};
//! # fn example<Driver: SimDriver>(
//! #     vmi: &SimCore<Driver>,
//! #     ctx: AddressContext,
//! #     event: &SimEvent<Driver::Architecture>,
//! # ) -> Result<(), SimError> {
//! let mut mmw = MissingMappingWatcher::new();
//!
//! if let Resolution::Resolved(pa) = mmw.resolve_address(vmi, ctx, "entry point")? {
//!     println!("{pa}");
//! }
//!
//! // Later, from the event handler:
//! if let Some(breakpoint) = event.breakpoint() {
//!     for resolved in mmw.handle_breakpoint(vmi, breakpoint)? {
//!         println!("{} -> {} ({})", resolved.ctx, resolved.pa, resolved.tag);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::{collections::HashMap, fmt::Debug};

use simi_core::{
    AddressContext, BreakpointHandle, BreakpointRequest, EntryOverride, EventBreakpoint,
    MemoryAccess, Pa, SimCore, SimDriver, SimError, watch::WatchRegistry,
};

/// Tag Type.
pub trait TagType: Debug + Clone {}
impl<T> TagType for T where T: Debug + Clone {}

/// The outcome of [`MissingMappingWatcher::resolve_address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The address is mapped.
    Resolved(Pa),

    /// The address is not mapped yet; a [`MappingResolved`] will be
    /// reported once it is.
    Pending,
}

/// A pending address that became mapped.
#[derive(Debug, Clone)]
pub struct MappingResolved<Tag> {
    /// The resolved address.
    pub ctx: AddressContext,

    /// The physical address it resolved to.
    pub pa: Pa,

    /// The tag the address was registered with.
    pub tag: Tag,
}

#[derive(Debug, Clone)]
struct Dependent<Tag> {
    ctx: AddressContext,
    tag: Tag,
}

#[derive(Debug)]
struct PendingEntry<Tag> {
    handle: BreakpointHandle,
    dependents: Vec<Dependent<Tag>>,
}

/// Missing mapping watcher.
pub struct MissingMappingWatcher<Tag = &'static str>
where
    Tag: TagType,
{
    /// * Key: breakpoint handle
    /// * Value: watched entry address
    watches: WatchRegistry<Pa>,

    /// * Key: watched entry address
    /// * Value: breakpoint and the addresses waiting on the entry
    pending: HashMap<Pa, PendingEntry<Tag>>,
}

impl<Tag> Default for MissingMappingWatcher<Tag>
where
    Tag: TagType,
{
    fn default() -> Self {
        Self {
            watches: WatchRegistry::new(),
            pending: HashMap::new(),
        }
    }
}

impl<Tag> MissingMappingWatcher<Tag>
where
    Tag: TagType,
{
    /// Creates a new missing mapping watcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of addresses waiting for a mapping.
    pub fn pending_addresses(&self) -> usize {
        self.pending
            .values()
            .map(|entry| entry.dependents.len())
            .sum()
    }

    /// Returns the number of watched paging entries.
    pub fn watched_entries(&self) -> usize {
        self.pending.len()
    }

    /// Checks whether the breakpoint belongs to this watcher.
    pub fn owns(&self, handle: BreakpointHandle) -> bool {
        self.watches.contains(handle)
    }

    /// Resolves a virtual address, or starts watching for its mapping.
    ///
    /// Fails only if the watch cannot be installed.
    pub fn resolve_address<Driver>(
        &mut self,
        vmi: &SimCore<Driver>,
        ctx: impl Into<AddressContext>,
        tag: Tag,
    ) -> Result<Resolution, SimError>
    where
        Driver: SimDriver,
    {
        let ctx = ctx.into();
        let walk = vmi.walk(ctx);

        if let Some(pa) = walk.pa() {
            return Ok(Resolution::Resolved(pa));
        }

        let Some(entry) = walk.blocking_entry()
        else {
            return Err(SimError::page_fault((ctx.va, ctx.root)));
        };

        tracing::debug!(%ctx, entry = %entry.address, level = ?entry.level, "mapping pending");
        self.watch_entry(vmi, entry.address, Dependent { ctx, tag })?;
        Ok(Resolution::Pending)
    }

    /// Stops waiting for a virtual address.
    ///
    /// Returns `true` if the address was pending.
    pub fn cancel<Driver>(
        &mut self,
        vmi: &SimCore<Driver>,
        ctx: impl Into<AddressContext>,
    ) -> Result<bool, SimError>
    where
        Driver: SimDriver,
    {
        let ctx = ctx.into();

        let Some(entry_pa) = self
            .pending
            .iter()
            .find(|(_, entry)| entry.dependents.iter().any(|dependent| dependent.ctx == ctx))
            .map(|(entry_pa, _)| *entry_pa)
        else {
            return Ok(false);
        };

        if let Some(entry) = self.pending.get_mut(&entry_pa) {
            entry.dependents.retain(|dependent| dependent.ctx != ctx);
        }

        self.release_if_unused(vmi, entry_pa)?;
        Ok(true)
    }

    /// Handles a breakpoint event.
    ///
    /// Returns the addresses that became mapped. Breakpoints that do not
    /// belong to the watcher are ignored.
    pub fn handle_breakpoint<Driver>(
        &mut self,
        vmi: &SimCore<Driver>,
        breakpoint: &EventBreakpoint,
    ) -> Result<Vec<MappingResolved<Tag>>, SimError>
    where
        Driver: SimDriver,
    {
        let Some(watch) = self.watches.get(breakpoint.handle)
        else {
            return Ok(Vec::new());
        };

        let entry_pa = watch.tag;

        let Some(entry) = self.pending.get(&entry_pa)
        else {
            return Ok(Vec::new());
        };

        let mode = match entry.dependents.first() {
            Some(dependent) => dependent.ctx.mode,
            None => {
                self.release_if_unused(vmi, entry_pa)?;
                return Ok(Vec::new());
            }
        };

        let value = match breakpoint.value {
            Some(value) => value,
            None => vmi.read_uint(entry_pa, mode.entry_size() as usize)?,
        };

        if value == 0 {
            tracing::trace!(%entry_pa, "entry cleared, still waiting");
            return Ok(Vec::new());
        }

        let Some(entry) = self.pending.remove(&entry_pa)
        else {
            return Ok(Vec::new());
        };

        self.watches.remove(vmi, entry.handle)?;

        let entry_override = EntryOverride::new(entry_pa, value);
        let mut result = Vec::new();

        for dependent in entry.dependents {
            let walk = vmi.walk_with(dependent.ctx, entry_override);

            if let Some(pa) = walk.pa() {
                tracing::debug!(ctx = %dependent.ctx, %pa, "mapping resolved");
                result.push(MappingResolved {
                    ctx: dependent.ctx,
                    pa,
                    tag: dependent.tag,
                });
                continue;
            }

            let Some(blocking) = walk.blocking_entry()
            else {
                tracing::warn!(ctx = %dependent.ctx, "walk ended without an entry to watch");
                continue;
            };

            tracing::debug!(
                ctx = %dependent.ctx,
                entry = %blocking.address,
                level = ?blocking.level,
                "mapping still pending"
            );

            self.watch_entry(vmi, blocking.address, dependent)?;
        }

        Ok(result)
    }

    /// Removes every watch.
    pub fn clear<Driver>(&mut self, vmi: &SimCore<Driver>) -> Result<(), SimError>
    where
        Driver: SimDriver,
    {
        self.pending.clear();
        self.watches.clear(vmi)
    }

    fn watch_entry<Driver>(
        &mut self,
        vmi: &SimCore<Driver>,
        entry_pa: Pa,
        dependent: Dependent<Tag>,
    ) -> Result<(), SimError>
    where
        Driver: SimDriver,
    {
        if let Some(entry) = self.pending.get_mut(&entry_pa) {
            entry.dependents.push(dependent);
            return Ok(());
        }

        let request = BreakpointRequest::physical(
            entry_pa,
            MemoryAccess::W,
            dependent.ctx.mode.entry_size(),
        );

        let handle = self.watches.insert(vmi, request, entry_pa)?;
        self.pending.insert(
            entry_pa,
            PendingEntry {
                handle,
                dependents: vec![dependent],
            },
        );

        Ok(())
    }

    fn release_if_unused<Driver>(
        &mut self,
        vmi: &SimCore<Driver>,
        entry_pa: Pa,
    ) -> Result<(), SimError>
    where
        Driver: SimDriver,
    {
        let unused = self
            .pending
            .get(&entry_pa)
            .is_some_and(|entry| entry.dependents.is_empty());

        if unused && let Some(entry) = self.pending.remove(&entry_pa) {
            self.watches.remove(vmi, entry.handle)?;
        }

        Ok(())
    }
}

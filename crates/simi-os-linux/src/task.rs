use simi_core::{Field, SimError, StructReader, Va};

use crate::{TASK_COMM_LEN, TaskOffsets};

/// `LIST_POISON1`, left in `next` by `list_del`.
pub const LIST_POISON1: u64 = 0x0010_0100;

/// `LIST_POISON2`, left in `prev` by `list_del`.
pub const LIST_POISON2: u64 = 0x0020_0200;

/// Raw `next`/`prev` pointers of a `struct list_head`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListLinks {
    /// `list_head.next`
    pub next: Va,

    /// `list_head.prev`
    pub prev: Va,
}

/// Where one `list_head` pointer leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListLink {
    /// The pointer is null.
    Null,

    /// The entry was deleted from its list.
    Poisoned,

    /// The pointer leads back to the list head.
    Head,

    /// The pointer leads to the entry's own field (empty list).
    Unlinked,

    /// The pointer leads to another task.
    Task(Va),
}

impl ListLink {
    /// Resolves a raw list pointer.
    ///
    /// `field` is the address of the `list_head` the pointer was read from,
    /// `head` the address of the list head when known, and `container` the
    /// offset of the `list_head` inside the task the pointer leads to. For a
    /// `children` list the pointer leads to the child's `sibling` field.
    pub fn resolve(raw: Va, field: Va, head: Option<Va>, container: u64) -> Self {
        match raw {
            raw if raw.is_null() => Self::Null,
            Va(LIST_POISON1 | LIST_POISON2) => Self::Poisoned,
            raw if raw == field => Self::Unlinked,
            raw if Some(raw) == head => Self::Head,
            raw => Self::Task(raw - container),
        }
    }

    /// Returns the task the pointer leads to.
    pub fn task(self) -> Option<Va> {
        match self {
            Self::Task(task) => Some(task),
            _ => None,
        }
    }
}

/// A task (thread) as read from guest memory.
///
/// Records are never cached; every read reflects the guest at that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    /// The address of the `task_struct`.
    pub address: Va,

    /// The thread ID.
    pub pid: u32,

    /// The thread group (process) ID.
    pub tgid: u32,

    /// The command name, truncated to 15 characters by the kernel.
    pub comm: String,

    /// The task that created this one.
    pub real_parent: Va,

    /// The task that receives `SIGCHLD`.
    pub parent: Va,

    /// The `tasks` list (every thread group leader).
    pub tasks: ListLinks,

    /// The head of this task's children list.
    pub children: ListLinks,

    /// This task's links in its parent's children list.
    pub sibling: ListLinks,

    /// The `thread_group` list.
    pub thread_group: ListLinks,
}

impl TaskRecord {
    pub(crate) fn from_reader(
        address: Va,
        reader: &StructReader,
        offsets: &TaskOffsets,
    ) -> Result<Self, SimError> {
        let word = offsets.word_size;
        let pointer = |offset| reader.read(Field::new(offset, word)).map(Va);
        let links = |offset| -> Result<ListLinks, SimError> {
            Ok(ListLinks {
                next: pointer(offset)?,
                prev: pointer(offset + word)?,
            })
        };

        Ok(Self {
            address,
            pid: reader.read(Field::new(offsets.pid, 4))? as u32,
            tgid: reader.read(Field::new(offsets.tgid, 4))? as u32,
            comm: reader.read_str(Field::new(offsets.comm, TASK_COMM_LEN))?,
            real_parent: pointer(offsets.real_parent)?,
            parent: pointer(offsets.parent)?,
            tasks: links(offsets.tasks)?,
            children: links(offsets.children)?,
            sibling: links(offsets.sibling)?,
            thread_group: links(offsets.thread_group)?,
        })
    }

    /// Checks whether this task leads its thread group.
    pub fn is_thread_group_leader(&self) -> bool {
        self.pid == self.tgid
    }

    /// Resolves the first child.
    pub fn first_child(&self, offsets: &TaskOffsets) -> ListLink {
        ListLink::resolve(
            self.children.next,
            self.address + offsets.children,
            None,
            offsets.sibling,
        )
    }

    /// Resolves the last child.
    pub fn last_child(&self, offsets: &TaskOffsets) -> ListLink {
        ListLink::resolve(
            self.children.prev,
            self.address + offsets.children,
            None,
            offsets.sibling,
        )
    }

    /// Resolves the next sibling, given the parent that owns the list.
    pub fn next_sibling(&self, offsets: &TaskOffsets, parent: Va) -> ListLink {
        ListLink::resolve(
            self.sibling.next,
            self.address + offsets.sibling,
            Some(parent + offsets.children),
            offsets.sibling,
        )
    }

    /// Resolves the previous sibling, given the parent that owns the list.
    pub fn previous_sibling(&self, offsets: &TaskOffsets, parent: Va) -> ListLink {
        ListLink::resolve(
            self.sibling.prev,
            self.address + offsets.sibling,
            Some(parent + offsets.children),
            offsets.sibling,
        )
    }

    /// Resolves the next task on the `tasks` list.
    ///
    /// The list is headed by the swapper's own `tasks` field, so reaching
    /// the swapper resolves to a task like any other entry.
    pub fn next_task(&self, offsets: &TaskOffsets) -> ListLink {
        ListLink::resolve(
            self.tasks.next,
            self.address + offsets.tasks,
            None,
            offsets.tasks,
        )
    }

    /// Resolves the next thread in the thread group.
    pub fn next_thread(&self, offsets: &TaskOffsets) -> ListLink {
        ListLink::resolve(
            self.thread_group.next,
            self.address + offsets.thread_group,
            None,
            offsets.thread_group,
        )
    }
}

impl std::fmt::Display for TaskRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} pid: {} tgid: {} comm: {:?} parent: {}",
            self.address, self.pid, self.tgid, self.comm, self.real_parent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_pointer_resolution() {
        let field = Va(0xc100_0028);
        let head = Va(0xc200_0020);

        assert_eq!(ListLink::resolve(Va(0), field, Some(head), 0x28), ListLink::Null);
        assert_eq!(
            ListLink::resolve(Va(LIST_POISON2), field, Some(head), 0x28),
            ListLink::Poisoned
        );
        assert_eq!(ListLink::resolve(field, field, Some(head), 0x28), ListLink::Unlinked);
        assert_eq!(ListLink::resolve(head, field, Some(head), 0x28), ListLink::Head);
        assert_eq!(
            ListLink::resolve(Va(0xc300_0028), field, Some(head), 0x28),
            ListLink::Task(Va(0xc300_0000))
        );
    }
}

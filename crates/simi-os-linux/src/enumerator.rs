//! Task enumeration.
//!
//! The task lists are circular and may be caught mid-update, so the walk
//! never follows a list to its end. Instead every task is pushed together
//! with the role it was reached in, and a `(task, role)` pair is expanded at
//! most once.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use simi_core::{Architecture, SimCore, SimDriver, SimError, Va};

use crate::{LinuxKernel, ListLink, TaskRecord};

/// Options for [`LinuxKernel::enumerate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumeratorOptions {
    /// Treat a task with an empty `comm` as the logical end of the branch
    /// it was reached through.
    ///
    /// Tasks that are being created or torn down have no name yet, and their
    /// links are not trustworthy. The swapper, reached last with pid 0, is
    /// exempt.
    pub empty_comm_terminates: bool,

    /// Upper bound on the number of tasks returned.
    pub max_tasks: usize,
}

impl Default for EnumeratorOptions {
    fn default() -> Self {
        Self {
            empty_comm_terminates: true,
            max_tasks: 32768,
        }
    }
}

impl EnumeratorOptions {
    /// Sets [`empty_comm_terminates`](Self::empty_comm_terminates).
    pub fn with_empty_comm_terminates(self, empty_comm_terminates: bool) -> Self {
        Self {
            empty_comm_terminates,
            ..self
        }
    }

    /// Sets [`max_tasks`](Self::max_tasks).
    pub fn with_max_tasks(self, max_tasks: usize) -> Self {
        Self { max_tasks, ..self }
    }
}

/// The way a task was reached during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraversalRole {
    /// Through the `tasks` list; the walk continues along it.
    MainList,

    /// Through the children list of the given parent; the walk continues
    /// along the siblings.
    Sibling(Va),

    /// Through a parent or thread-group pointer; only the task itself and
    /// its children are expanded.
    Probe,
}

impl<Driver> LinuxKernel<Driver>
where
    Driver: SimDriver,
{
    /// Enumerates the live tasks, starting at the swapper.
    ///
    /// Tasks that cannot be read are skipped. The running task is always
    /// included, since it is not guaranteed to be linked yet.
    pub fn enumerate(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
    ) -> Result<IndexMap<Va, TaskRecord>, SimError> {
        self.enumerate_from(vmi, registers, self.offsets.init_task)
    }

    /// Enumerates the live tasks reachable from `start`.
    pub fn enumerate_from(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        start: Va,
    ) -> Result<IndexMap<Va, TaskRecord>, SimError> {
        let offsets = &self.offsets;

        let mut result = IndexMap::new();
        let mut seen = HashSet::new();
        let mut stack = vec![(start, TraversalRole::MainList)];

        while let Some((address, role)) = stack.pop() {
            if result.len() >= self.options.max_tasks {
                tracing::warn!(max_tasks = self.options.max_tasks, "task limit reached");
                break;
            }

            if !seen.insert((address, role)) {
                continue;
            }

            // A task expanded in any role needs no further probing.
            seen.insert((address, TraversalRole::Probe));

            let task = match self.read_task(vmi, registers, address) {
                Ok(task) => task,
                Err(err) => {
                    tracing::warn!(%address, ?role, %err, "unreadable task");
                    continue;
                }
            };

            if self.options.empty_comm_terminates
                && task.comm.is_empty()
                && !(task.pid == 0 && stack.is_empty())
            {
                tracing::debug!(%address, ?role, pid = task.pid, "empty comm, branch ends");
                continue;
            }

            for child in [task.first_child(offsets), task.last_child(offsets)] {
                if let ListLink::Task(child) = child {
                    stack.push((child, TraversalRole::Sibling(address)));
                }
            }

            if !task.real_parent.is_null() {
                stack.push((task.real_parent, TraversalRole::Probe));
            }

            if let ListLink::Task(thread) = task.next_thread(offsets) {
                stack.push((thread, TraversalRole::Probe));
            }

            match role {
                TraversalRole::MainList => {
                    if let ListLink::Task(next) = task.next_task(offsets) {
                        stack.push((next, TraversalRole::MainList));
                    }
                }
                TraversalRole::Sibling(parent) => {
                    for sibling in [
                        task.next_sibling(offsets, parent),
                        task.previous_sibling(offsets, parent),
                    ] {
                        if let ListLink::Task(sibling) = sibling
                            && sibling != parent
                        {
                            stack.push((sibling, TraversalRole::Sibling(parent)));
                        }
                    }
                }
                TraversalRole::Probe => {}
            }

            result.entry(address).or_insert(task);
        }

        match self.current_task(vmi, registers) {
            Ok(current) if !current.is_null() && !result.contains_key(&current) => {
                match self.read_task(vmi, registers, current) {
                    Ok(task) => {
                        tracing::debug!(%task, "running task not linked");
                        result.insert(current, task);
                    }
                    Err(err) => tracing::warn!(%current, %err, "unreadable running task"),
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(%err, "unreadable current task"),
        }

        Ok(result)
    }

    /// Finds a task by its thread ID.
    pub fn find_by_pid(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        pid: u32,
    ) -> Result<Option<TaskRecord>, SimError> {
        Ok(self
            .enumerate(vmi, registers)?
            .into_values()
            .find(|task| task.pid == pid))
    }

    /// Finds the tasks with the given command name.
    pub fn find_by_comm(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        comm: &str,
    ) -> Result<Vec<TaskRecord>, SimError> {
        Ok(self
            .enumerate(vmi, registers)?
            .into_values()
            .filter(|task| task.comm == comm)
            .collect())
    }

    /// Returns the threads of the group led by `leader`, leader first.
    pub fn thread_group(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        leader: Va,
    ) -> Result<Vec<TaskRecord>, SimError> {
        let mut result = Vec::new();
        let mut seen = HashSet::new();
        let mut current = leader;

        while seen.insert(current) && result.len() < self.options.max_tasks {
            let task = self.read_task(vmi, registers, current)?;
            let next = task.next_thread(&self.offsets);
            result.push(task);

            match next {
                ListLink::Task(next) => current = next,
                _ => break,
            }
        }

        Ok(result)
    }

    /// Returns the children of `parent`.
    pub fn children(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        parent: Va,
    ) -> Result<Vec<TaskRecord>, SimError> {
        let parent_task = self.read_task(vmi, registers, parent)?;

        let mut result = Vec::new();
        let mut seen = HashSet::new();
        let mut link = parent_task.first_child(&self.offsets);

        while let ListLink::Task(child) = link {
            if !seen.insert(child) || result.len() >= self.options.max_tasks {
                break;
            }

            let task = self.read_task(vmi, registers, child)?;
            link = task.next_sibling(&self.offsets, parent);
            result.push(task);
        }

        Ok(result)
    }
}

//! Kernel layout discovered for one kernel image.
//!
//! Every field starts unknown and may be assigned exactly once. Discovery
//! fills the layout in pieces; consumers load a complete one from disk.

use std::{fs::File, io::BufWriter, path::Path};

use serde::{Deserialize, Serialize};
use simi_core::Va;

use crate::LinuxError;

/// Version of the persisted layout format.
///
/// Files with a different version are rejected; the layout has to be
/// discovered again.
pub const LAYOUT_VERSION: u32 = 1;

/// How the current-task cell is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CurrentTaskAddressing {
    /// The cell is an offset from the per-CPU segment base.
    SegmentRelative,

    /// The cell is a kernel virtual address.
    Absolute,
}

/// A value that can be stored in a [`KernelLayout`] field.
trait LayoutValue: Copy + PartialEq {
    fn raw(self) -> u64;
}

impl LayoutValue for u64 {
    fn raw(self) -> u64 {
        self
    }
}

impl LayoutValue for i64 {
    fn raw(self) -> u64 {
        self as u64
    }
}

impl LayoutValue for Va {
    fn raw(self) -> u64 {
        self.0
    }
}

impl LayoutValue for CurrentTaskAddressing {
    fn raw(self) -> u64 {
        match self {
            Self::SegmentRelative => 0,
            Self::Absolute => 1,
        }
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, field: &'static str) -> Result<(), LinuxError>
where
    T: LayoutValue,
{
    match *slot {
        None => {
            *slot = Some(value);
            Ok(())
        }
        Some(current) if current == value => Ok(()),
        Some(current) => Err(LinuxError::LayoutFieldReassigned {
            field,
            current: current.raw(),
            value: value.raw(),
        }),
    }
}

macro_rules! kernel_layout {
    (
        required {
            $(
                $(#[$rmeta:meta])*
                $rname:ident: $rtype:ty => $rset:ident,
            )*
        }

        optional {
            $(
                $(#[$ometa:meta])*
                $oname:ident: $otype:ty => $oset:ident,
            )*
        }
    ) => {
        /// Offsets and addresses that describe one kernel image.
        ///
        /// Built once by the [`Discoverer`], persisted, and loaded read-only
        /// afterwards.
        ///
        /// [`Discoverer`]: crate::Discoverer
        #[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct KernelLayout {
            $(
                $(#[$rmeta])*
                $rname: Option<$rtype>,
            )*
            $(
                $(#[$ometa])*
                $oname: Option<$otype>,
            )*
        }

        impl KernelLayout {
            $(
                $(#[$rmeta])*
                pub fn $rname(&self) -> Option<$rtype> {
                    self.$rname
                }

                #[doc = concat!("Records `", stringify!($rname), "`.")]
                ///
                /// Setting a field again to the value it already holds is a
                /// no-op; any other value is refused.
                pub fn $rset(&mut self, value: $rtype) -> Result<(), LinuxError> {
                    set_once(&mut self.$rname, value, stringify!($rname))
                }
            )*

            $(
                $(#[$ometa])*
                pub fn $oname(&self) -> Option<$otype> {
                    self.$oname
                }

                #[doc = concat!("Records `", stringify!($oname), "`.")]
                pub fn $oset(&mut self, value: $otype) -> Result<(), LinuxError> {
                    set_once(&mut self.$oname, value, stringify!($oname))
                }
            )*

            fn missing_required(&self) -> Vec<&'static str> {
                let mut missing = Vec::new();
                $(
                    if self.$rname.is_none() {
                        missing.push(stringify!($rname));
                    }
                )*
                missing
            }
        }
    };
}

kernel_layout! {
    required {
        /// Location of the cell holding the running task's `task_struct`
        /// pointer. Interpreted according to `current_task_addressing`.
        current_task: Va => set_current_task,

        /// Whether `current_task` is segment-relative or absolute.
        current_task_addressing: CurrentTaskAddressing => set_current_task_addressing,

        /// Size of a kernel pointer in bytes.
        word_size: u64 => set_word_size,

        /// Lowest kernel virtual address.
        kernel_base: Va => set_kernel_base,

        /// Address of the swapper (idle) task.
        init_task: Va => set_init_task,

        /// `task_struct.real_parent`
        ts_real_parent: u64 => set_ts_real_parent,

        /// `task_struct.parent`
        ts_parent: u64 => set_ts_parent,

        /// `task_struct.children`
        ts_children: u64 => set_ts_children,

        /// `task_struct.sibling`
        ts_sibling: u64 => set_ts_sibling,

        /// `task_struct.thread_group`
        ts_thread_group: u64 => set_ts_thread_group,

        /// `task_struct.tasks.next`
        ts_next: u64 => set_ts_next,

        /// `task_struct.tasks.prev`
        ts_prev: u64 => set_ts_prev,

        /// `task_struct.pid`
        ts_pid: u64 => set_ts_pid,

        /// `task_struct.tgid`
        ts_tgid: u64 => set_ts_tgid,

        /// `task_struct.comm`
        ts_comm: u64 => set_ts_comm,

        /// Address of the interrupt return instruction on the kernel exit
        /// path.
        iretd: Va => set_iretd,

        /// Address of the fast system call return instruction.
        sysexit: Va => set_sysexit,

        /// Address of the instruction that dispatches through the syscall
        /// table.
        syscall_compute: Va => set_syscall_compute,

        /// Signed base of the syscall table, as the dispatch instruction
        /// computes it.
        syscall_jump: i64 => set_syscall_jump,

        /// First instruction of the page fault handler.
        page_fault: Va => set_page_fault,
    }

    optional {
        /// Entry point of the software interrupt syscall gate.
        sys_entry: Va => set_sys_entry,

        /// Entry point of the fast system call instruction.
        sysenter: Va => set_sysenter,

        /// Offset from the kernel stack pointer at `syscall_compute` to the
        /// saved user return address.
        stack_frame_eip: u64 => set_stack_frame_eip,
    }
}

/// Field offsets needed to read `task_struct` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOffsets {
    /// Size of a kernel pointer in bytes.
    pub word_size: u64,

    /// Address of the swapper task.
    pub init_task: Va,

    /// Location of the current-task cell.
    pub current_task: Va,

    /// Addressing of the current-task cell.
    pub current_task_addressing: CurrentTaskAddressing,

    /// `task_struct.real_parent`
    pub real_parent: u64,

    /// `task_struct.parent`
    pub parent: u64,

    /// `task_struct.children`
    pub children: u64,

    /// `task_struct.sibling`
    pub sibling: u64,

    /// `task_struct.thread_group`
    pub thread_group: u64,

    /// `task_struct.tasks`
    pub tasks: u64,

    /// `task_struct.pid`
    pub pid: u64,

    /// `task_struct.tgid`
    pub tgid: u64,

    /// `task_struct.comm`
    pub comm: u64,
}

/// Length of `task_struct.comm` (`TASK_COMM_LEN`).
pub const TASK_COMM_LEN: u64 = 16;

impl TaskOffsets {
    /// Returns the number of bytes that cover every field.
    pub fn span(&self) -> u64 {
        let word = self.word_size;

        [
            self.real_parent + word,
            self.parent + word,
            self.children + 2 * word,
            self.sibling + 2 * word,
            self.thread_group + 2 * word,
            self.tasks + 2 * word,
            self.pid + 4,
            self.tgid + 4,
            self.comm + TASK_COMM_LEN,
        ]
        .into_iter()
        .max()
        .unwrap_or_default()
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    version: u32,
    image: &'a str,
    layout: &'a KernelLayout,
}

#[derive(Deserialize)]
struct RawEnvelope {
    version: u32,
    image: String,
    layout: serde_json::Value,
}

impl KernelLayout {
    /// Creates an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the names of the fields that are still unknown.
    ///
    /// Either entry point (`sys_entry` or `sysenter`) satisfies the entry
    /// requirement.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = self.missing_required();
        if self.sys_entry.is_none() && self.sysenter.is_none() {
            missing.push("sys_entry");
        }
        missing
    }

    /// Checks whether every required field is known.
    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    /// Returns the offsets needed to read tasks.
    pub fn task_offsets(&self) -> Result<TaskOffsets, LinuxError> {
        use LinuxError::LayoutIncomplete as Missing;

        Ok(TaskOffsets {
            word_size: self.word_size.ok_or(Missing("word_size"))?,
            init_task: self.init_task.ok_or(Missing("init_task"))?,
            current_task: self.current_task.ok_or(Missing("current_task"))?,
            current_task_addressing: self
                .current_task_addressing
                .ok_or(Missing("current_task_addressing"))?,
            real_parent: self.ts_real_parent.ok_or(Missing("ts_real_parent"))?,
            parent: self.ts_parent.ok_or(Missing("ts_parent"))?,
            children: self.ts_children.ok_or(Missing("ts_children"))?,
            sibling: self.ts_sibling.ok_or(Missing("ts_sibling"))?,
            thread_group: self.ts_thread_group.ok_or(Missing("ts_thread_group"))?,
            tasks: self.ts_next.ok_or(Missing("ts_next"))?,
            pid: self.ts_pid.ok_or(Missing("ts_pid"))?,
            tgid: self.ts_tgid.ok_or(Missing("ts_tgid"))?,
            comm: self.ts_comm.ok_or(Missing("ts_comm"))?,
        })
    }

    /// Writes the layout for `image` to `path`.
    ///
    /// Only a complete layout is written. The file is replaced atomically,
    /// so a reader never observes a partially written layout.
    pub fn save(&self, path: impl AsRef<Path>, image: &str) -> Result<(), LinuxError> {
        if let Some(&field) = self.missing().first() {
            return Err(LinuxError::LayoutIncomplete(field));
        }

        let path = path.as_ref();
        let mut temporary = path.as_os_str().to_owned();
        temporary.push(".tmp");

        let file = File::create(&temporary)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(
            &mut writer,
            &Envelope {
                version: LAYOUT_VERSION,
                image,
                layout: self,
            },
        )?;

        let file = writer.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
        std::fs::rename(&temporary, path)?;

        tracing::info!(path = %path.display(), image, "kernel layout saved");
        Ok(())
    }

    /// Reads the layout for `image` from `path`.
    pub fn load(path: impl AsRef<Path>, image: &str) -> Result<Self, LinuxError> {
        let file = File::open(path.as_ref())?;
        let envelope: RawEnvelope = serde_json::from_reader(std::io::BufReader::new(file))?;

        if envelope.version != LAYOUT_VERSION {
            return Err(LinuxError::LayoutVersionMismatch {
                found: envelope.version,
                expected: LAYOUT_VERSION,
            });
        }

        if envelope.image != image {
            return Err(LinuxError::LayoutImageMismatch {
                found: envelope.image,
                expected: image.to_owned(),
            });
        }

        Ok(serde_json::from_value(envelope.layout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_layout() -> Result<KernelLayout, LinuxError> {
        let mut layout = KernelLayout::new();
        layout.set_current_task(Va(0xc17d_0000))?;
        layout.set_current_task_addressing(CurrentTaskAddressing::Absolute)?;
        layout.set_word_size(4)?;
        layout.set_kernel_base(Va(0xc000_0000))?;
        layout.set_init_task(Va(0xc16a_4460))?;
        layout.set_ts_real_parent(0x18)?;
        layout.set_ts_parent(0x1c)?;
        layout.set_ts_children(0x20)?;
        layout.set_ts_sibling(0x28)?;
        layout.set_ts_thread_group(0x38)?;
        layout.set_ts_next(0x10)?;
        layout.set_ts_prev(0x14)?;
        layout.set_ts_pid(0x8)?;
        layout.set_ts_tgid(0xc)?;
        layout.set_ts_comm(0x40)?;
        layout.set_iretd(Va(0xc15b_6d0a))?;
        layout.set_sysexit(Va(0xc15b_6c8e))?;
        layout.set_syscall_compute(Va(0xc15b_6c59))?;
        layout.set_syscall_jump(-0x3e8e_5000)?;
        layout.set_page_fault(Va(0xc15b_7940))?;
        layout.set_sysenter(Va(0xc15b_6bf0))?;
        Ok(layout)
    }

    #[test]
    fn fields_are_set_once() -> Result<(), LinuxError> {
        let mut layout = KernelLayout::new();
        layout.set_ts_pid(0x1a4)?;
        layout.set_ts_pid(0x1a4)?;
        assert!(matches!(
            layout.set_ts_pid(0x1a8),
            Err(LinuxError::LayoutFieldReassigned {
                field: "ts_pid",
                current: 0x1a4,
                value: 0x1a8
            })
        ));
        assert_eq!(layout.ts_pid(), Some(0x1a4));
        Ok(())
    }

    #[test]
    fn entry_point_requirement() -> Result<(), LinuxError> {
        let mut layout = complete_layout()?;
        assert!(layout.is_complete());

        layout.sysenter = None;
        assert_eq!(layout.missing(), ["sys_entry"]);

        layout.set_sys_entry(Va(0xc15b_6d50))?;
        assert!(layout.is_complete());
        Ok(())
    }

    #[test]
    fn persistence_round_trip() -> Result<(), LinuxError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("kernel.layout");

        let layout = complete_layout()?;
        layout.save(&path, "vmlinuz-3.13")?;

        assert_eq!(KernelLayout::load(&path, "vmlinuz-3.13")?, layout);
        assert!(matches!(
            KernelLayout::load(&path, "vmlinuz-4.4"),
            Err(LinuxError::LayoutImageMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn incomplete_layout_is_not_saved() -> Result<(), LinuxError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("kernel.layout");

        let mut layout = KernelLayout::new();
        layout.set_ts_pid(0x1a4)?;
        assert!(matches!(
            layout.save(&path, "vmlinuz"),
            Err(LinuxError::LayoutIncomplete("current_task"))
        ));
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn version_mismatch() -> Result<(), LinuxError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("kernel.layout");
        std::fs::write(&path, r#"{"version": 0, "image": "vmlinuz", "layout": {}}"#)?;

        assert!(matches!(
            KernelLayout::load(&path, "vmlinuz"),
            Err(LinuxError::LayoutVersionMismatch {
                found: 0,
                expected: LAYOUT_VERSION
            })
        ));
        Ok(())
    }
}

//! Syscall argument decoding.
//!
//! Arguments are decoded from the entry frame. Values the kernel produces
//! (descriptors, child pids, output buffers) are filled in at the exit.

use simi_core::{Architecture, Registers as _, SimCore, SimDriver, SimError, Va};
use simi_os_linux::{
    SyscallFrame,
    syscall::socket::{FIONBIO, SocketAddress, SocketArgs, SocketCall, read_socket_address},
};

/// Longest path that is read.
const PATH_MAX: usize = 4096;

/// A decoded syscall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallDetails {
    /// `open(path, flags, mode)`
    Open {
        /// Address of the path string.
        path_address: Va,

        /// The path, once it is readable.
        path: Option<String>,

        /// Open flags.
        flags: u64,

        /// Creation mode.
        mode: u64,

        /// The returned descriptor.
        fd: Option<u64>,
    },

    /// `read(fd, buffer, count)`
    Read {
        /// The descriptor.
        fd: u64,

        /// The destination buffer.
        buffer: Va,

        /// Requested byte count.
        count: u64,
    },

    /// `write(fd, buffer, count)`
    Write {
        /// The descriptor.
        fd: u64,

        /// The source buffer.
        buffer: Va,

        /// Requested byte count.
        count: u64,

        /// The leading bytes of the buffer.
        data: Vec<u8>,
    },

    /// `close(fd)`
    Close {
        /// The descriptor.
        fd: u64,
    },

    /// `dup(fd)`
    Dup {
        /// The duplicated descriptor.
        fd: u64,

        /// The returned descriptor.
        new_fd: Option<u64>,
    },

    /// `dup2(old_fd, new_fd)`
    Dup2 {
        /// The duplicated descriptor.
        old_fd: u64,

        /// The requested descriptor.
        new_fd: u64,
    },

    /// `pipe(fds)` and `pipe2(fds, flags)`
    Pipe {
        /// Address of the descriptor pair.
        fds_address: Va,

        /// The returned read and write descriptors.
        fds: Option<[u32; 2]>,
    },

    /// `socketcall(call, args)` or one of the direct socket syscalls.
    Socket {
        /// The raw sub-call number.
        subcall: u64,

        /// The decoded sub-call.
        call: Option<SocketCall>,

        /// The leading arguments, if readable.
        args: Option<SocketArgs>,
    },

    /// `ioctl(fd, request, arg)`
    Ioctl {
        /// The descriptor.
        fd: u64,

        /// The request.
        request: u64,

        /// For `FIONBIO`, whether non-blocking mode is being enabled.
        nonblocking: Option<bool>,
    },

    /// `gettimeofday(tv, tz)`
    GetTimeOfDay {
        /// Address of the `struct timeval`.
        tv: Va,

        /// The returned seconds and microseconds.
        time: Option<(u32, u32)>,
    },

    /// `_llseek(fd, offset_high, offset_low, result, whence)`
    Llseek {
        /// The descriptor.
        fd: u64,

        /// The requested 64-bit offset.
        offset: u64,

        /// Address of the resulting position.
        result_address: Va,

        /// `SEEK_SET`, `SEEK_CUR` or `SEEK_END`.
        whence: u64,

        /// The returned position.
        position: Option<u64>,
    },

    /// `mmap` and `mmap2`
    Mmap {
        /// Requested address.
        address: u64,

        /// Mapping length.
        length: u64,

        /// Memory protection.
        prot: u64,

        /// Mapping flags.
        flags: u64,

        /// The mapped descriptor.
        fd: u64,

        /// Byte offset into the file.
        offset: u64,
    },

    /// `clone(flags, ...)`
    Clone {
        /// Clone flags.
        flags: u64,

        /// The child pid, as returned to the parent.
        child: Option<u64>,
    },

    /// `fork()` and `vfork()`
    Fork {
        /// The child pid, as returned to the parent.
        child: Option<u64>,
    },

    /// `execve(path, argv, envp)`
    Execve {
        /// The program path, if readable.
        path: Option<String>,
    },

    /// `exit(status)` and `exit_group(status)`
    Exit {
        /// The exit status.
        status: u64,
    },

    /// `sigreturn()` and `rt_sigreturn()`
    SigReturn,

    /// Any syscall without a decoder.
    Other,
}

impl SyscallDetails {
    /// Decodes the arguments of `name` at the entry.
    ///
    /// Returns the address of the `open` path if it is not resident yet.
    pub(super) fn from_entry<Driver>(
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        name: &str,
        frame: &SyscallFrame,
        write_capture: usize,
    ) -> Result<(Self, Option<Va>), SimError>
    where
        Driver: SimDriver,
    {
        let p = |index| frame.param(index);

        let details = match name {
            "open" => {
                let path_address = Va(p(0));
                let path = read_path(vmi, registers, path_address);
                let deferred = (path.is_none() && !path_address.is_null()).then_some(path_address);

                return Ok((
                    Self::Open {
                        path_address,
                        path,
                        flags: p(1),
                        mode: p(2),
                        fd: None,
                    },
                    deferred,
                ));
            }
            "read" => Self::Read {
                fd: p(0),
                buffer: Va(p(1)),
                count: p(2),
            },
            "write" => {
                let length = usize::try_from(p(2)).unwrap_or(usize::MAX).min(write_capture);
                let mut data = vec![0u8; length];
                if let Err(err) = vmi.read(registers.access_context(Va(p(1))), &mut data) {
                    tracing::debug!(%err, buffer = %Va(p(1)), "write buffer not readable");
                    data.clear();
                }

                Self::Write {
                    fd: p(0),
                    buffer: Va(p(1)),
                    count: p(2),
                    data,
                }
            }
            "close" => Self::Close { fd: p(0) },
            "dup" => Self::Dup {
                fd: p(0),
                new_fd: None,
            },
            "dup2" => Self::Dup2 {
                old_fd: p(0),
                new_fd: p(1),
            },
            "pipe" | "pipe2" => Self::Pipe {
                fds_address: Va(p(0)),
                fds: None,
            },
            "socketcall" => {
                let subcall = p(0);
                let call = SocketCall::from_number(subcall);
                let args = match call {
                    Some(call) => read_socket_args(vmi, registers, call, Va(p(1))),
                    None => None,
                };

                Self::Socket {
                    subcall,
                    call,
                    args,
                }
            }
            "ioctl" => {
                let nonblocking = if p(1) == FIONBIO {
                    vmi.read_u32(registers.access_context(Va(p(2))))
                        .ok()
                        .map(|value| value != 0)
                }
                else {
                    None
                };

                Self::Ioctl {
                    fd: p(0),
                    request: p(1),
                    nonblocking,
                }
            }
            "gettimeofday" => Self::GetTimeOfDay {
                tv: Va(p(0)),
                time: None,
            },
            "_llseek" => Self::Llseek {
                fd: p(0),
                offset: (p(1) << 32) | (p(2) & 0xffff_ffff),
                result_address: Va(p(3)),
                whence: p(4),
                position: None,
            },
            "mmap" if registers.address_width() == 4 => {
                // struct mmap_arg_struct
                let mut args = [0u32; 6];
                let mut bytes = [0u8; 24];
                vmi.read(registers.access_context(Va(p(0))), &mut bytes)?;
                for (arg, chunk) in args.iter_mut().zip(bytes.chunks_exact(4)) {
                    *arg = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }

                Self::Mmap {
                    address: args[0] as u64,
                    length: args[1] as u64,
                    prot: args[2] as u64,
                    flags: args[3] as u64,
                    fd: args[4] as u64,
                    offset: args[5] as u64,
                }
            }
            "mmap" | "mmap2" => Self::Mmap {
                address: p(0),
                length: p(1),
                prot: p(2),
                flags: p(3),
                fd: p(4),
                offset: if name == "mmap2" { p(5) << 12 } else { p(5) },
            },
            "clone" => Self::Clone {
                flags: p(0),
                child: None,
            },
            "fork" | "vfork" => Self::Fork { child: None },
            "execve" => Self::Execve {
                path: read_path(vmi, registers, Va(p(0))),
            },
            "exit" | "exit_group" => Self::Exit { status: p(0) },
            "sigreturn" | "rt_sigreturn" => Self::SigReturn,
            name => match SocketCall::from_name(name) {
                Some(call) => Self::Socket {
                    subcall: call.number(),
                    call: Some(call),
                    args: Some(SocketArgs {
                        fd: p(0),
                        arg: p(1),
                        address: if call.takes_address() && p(1) != 0 {
                            read_socket_address(vmi, registers, Va(p(1))).ok()
                        }
                        else {
                            None
                        },
                    }),
                },
                None => Self::Other,
            },
        };

        Ok((details, None))
    }

    /// Fills in the values returned by the kernel.
    ///
    /// Failed syscalls (negative `result`) leave them unset.
    pub(super) fn complete<Driver>(
        &mut self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        result: i64,
    ) where
        Driver: SimDriver,
    {
        if result < 0 {
            return;
        }

        let value = result as u64;

        match self {
            Self::Open { fd, .. } => *fd = Some(value),
            Self::Dup { new_fd, .. } => *new_fd = Some(value),
            Self::Clone { child, .. } | Self::Fork { child } => *child = Some(value),
            Self::Pipe { fds_address, fds } => {
                let mut bytes = [0u8; 8];
                match vmi.read(registers.access_context(*fds_address), &mut bytes) {
                    Ok(()) => {
                        *fds = Some([
                            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                            u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
                        ]);
                    }
                    Err(err) => tracing::warn!(%err, address = %fds_address, "pipe fds not readable"),
                }
            }
            Self::GetTimeOfDay { tv, time } => {
                let seconds = vmi.read_u32(registers.access_context(*tv));
                let microseconds = vmi.read_u32(registers.access_context(*tv + 4));
                if let (Ok(seconds), Ok(microseconds)) = (seconds, microseconds) {
                    *time = Some((seconds, microseconds));
                }
            }
            Self::Llseek {
                result_address,
                position,
                ..
            } => {
                *position = vmi.read_u64(registers.access_context(*result_address)).ok();
            }
            _ => {}
        }
    }

    /// Returns the file descriptor argument.
    pub fn fd(&self) -> Option<u64> {
        match self {
            Self::Read { fd, .. }
            | Self::Write { fd, .. }
            | Self::Close { fd }
            | Self::Dup { fd, .. }
            | Self::Ioctl { fd, .. }
            | Self::Llseek { fd, .. }
            | Self::Mmap { fd, .. } => Some(*fd),
            Self::Dup2 { old_fd, .. } => Some(*old_fd),
            Self::Socket {
                call: Some(call),
                args: Some(args),
                ..
            } if *call != SocketCall::Socket && *call != SocketCall::SocketPair => Some(args.fd),
            _ => None,
        }
    }

    /// Returns the socket sub-call.
    pub fn socket_call(&self) -> Option<SocketCall> {
        match self {
            Self::Socket { call, .. } => *call,
            _ => None,
        }
    }

    /// Returns the socket address argument.
    pub fn socket_address(&self) -> Option<&SocketAddress> {
        match self {
            Self::Socket {
                args: Some(args), ..
            } => args.address.as_ref(),
            _ => None,
        }
    }

    /// Returns the text that patterns are matched against.
    pub fn subject(&self) -> Option<String> {
        match self {
            Self::Open { path, .. } | Self::Execve { path } => path.clone(),
            Self::Socket { .. } => self.socket_address().map(ToString::to_string),
            _ => None,
        }
    }
}

fn read_path<Driver>(
    vmi: &SimCore<Driver>,
    registers: &<Driver::Architecture as Architecture>::Registers,
    va: Va,
) -> Option<String>
where
    Driver: SimDriver,
{
    if va.is_null() {
        return None;
    }

    match vmi.read_string_limited(registers.access_context(va), PATH_MAX) {
        Ok(path) => Some(path),
        Err(err) => {
            tracing::debug!(%va, %err, "path not resident");
            None
        }
    }
}

fn read_socket_args<Driver>(
    vmi: &SimCore<Driver>,
    registers: &<Driver::Architecture as Architecture>::Registers,
    call: SocketCall,
    params: Va,
) -> Option<SocketArgs>
where
    Driver: SimDriver,
{
    match SocketArgs::read(vmi, registers, call, params) {
        Ok(args) => Some(args),
        Err(err) => {
            tracing::warn!(%call, %params, %err, "socketcall arguments not readable");
            None
        }
    }
}

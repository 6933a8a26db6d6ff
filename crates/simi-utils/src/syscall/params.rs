use regex::Regex;
use serde::{Deserialize, Serialize};
use simi_os_linux::syscall::socket::{AF_INET, SocketCall};

use super::SyscallDetails;

bitflags::bitflags! {
    /// Socket address conditions of a [`CallParams`].
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ParamFlags: u8 {
        /// The address must be an IPv4 address outside loopback and
        /// `0.0.0.0/16`.
        const ROUTABLE = 1 << 0;

        /// The address must be an IPv4 address. A matching `BIND` puts the
        /// socket under watch.
        const AF_INET = 1 << 1;
    }
}

/// A condition on the arguments of a syscall.
#[derive(Debug, Clone)]
pub enum MatchParam {
    /// The file descriptor argument equals the value.
    Fd(u64),

    /// The path or socket address matches the expression.
    ///
    /// Socket addresses are matched in their `ip:port` or path form.
    Pattern(Regex),

    /// The data passed to `write` contains the text.
    Text(String),
}

/// Match criteria for tracked syscalls.
///
/// Every condition that is set must hold.
#[derive(Debug, Clone, Default)]
pub struct CallParams {
    /// The syscall name, or any syscall.
    pub syscall: Option<String>,

    /// The `socketcall` sub-call.
    pub subcall: Option<SocketCall>,

    /// The argument condition.
    pub param: Option<MatchParam>,

    /// Socket address conditions.
    pub flags: ParamFlags,

    /// Report only the n-th (one-based) syscall that satisfies the
    /// conditions.
    pub nth: Option<u64>,

    /// Ask the consumer to halt the simulation on a match.
    pub break_simulation: bool,
}

impl CallParams {
    /// Creates criteria that match any syscall.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates criteria for one syscall.
    pub fn for_syscall(name: impl Into<String>) -> Self {
        Self {
            syscall: Some(name.into()),
            ..Self::default()
        }
    }

    /// Sets [`subcall`](Self::subcall).
    pub fn with_subcall(self, subcall: SocketCall) -> Self {
        Self {
            subcall: Some(subcall),
            ..self
        }
    }

    /// Sets [`param`](Self::param).
    pub fn with_param(self, param: MatchParam) -> Self {
        Self {
            param: Some(param),
            ..self
        }
    }

    /// Sets [`flags`](Self::flags).
    pub fn with_flags(self, flags: ParamFlags) -> Self {
        Self { flags, ..self }
    }

    /// Sets [`nth`](Self::nth).
    pub fn with_nth(self, nth: u64) -> Self {
        Self {
            nth: Some(nth),
            ..self
        }
    }

    /// Sets [`break_simulation`](Self::break_simulation).
    pub fn with_break_simulation(self, break_simulation: bool) -> Self {
        Self {
            break_simulation,
            ..self
        }
    }

    /// Checks the conditions against a decoded syscall.
    pub fn matches(&self, name: &str, details: &SyscallDetails) -> bool {
        if let Some(syscall) = &self.syscall
            && syscall != name
        {
            return false;
        }

        if let Some(subcall) = self.subcall
            && details.socket_call() != Some(subcall)
        {
            return false;
        }

        if !self.flags.is_empty() {
            let Some(address) = details.socket_address()
            else {
                return false;
            };

            if self.flags.contains(ParamFlags::AF_INET) && address.family() != AF_INET {
                return false;
            }

            if self.flags.contains(ParamFlags::ROUTABLE) && !address.is_routable() {
                return false;
            }
        }

        match &self.param {
            None => true,
            Some(MatchParam::Fd(fd)) => details.fd() == Some(*fd),
            Some(MatchParam::Pattern(pattern)) => details
                .subject()
                .is_some_and(|subject| pattern.is_match(&subject)),
            Some(MatchParam::Text(text)) => match details {
                SyscallDetails::Write { data, .. } => {
                    let needle = text.as_bytes();
                    needle.is_empty() || data.windows(needle.len()).any(|window| window == needle)
                }
                _ => false,
            },
        }
    }

    /// Checks whether a match of these criteria puts the socket under
    /// watch.
    pub(super) fn watches_socket(&self, details: &SyscallDetails) -> bool {
        self.flags.contains(ParamFlags::AF_INET)
            && details.socket_call() == Some(SocketCall::Bind)
    }
}

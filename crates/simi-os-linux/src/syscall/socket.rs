//! `socketcall` multiplexing and socket address decoding.

use std::{fmt, net::Ipv4Addr};

use serde::{Deserialize, Serialize};
use simi_core::{Architecture, Registers as _, SimCore, SimDriver, SimError, Va};

/// `AF_UNIX` / `AF_LOCAL`.
pub const AF_UNIX: u16 = 1;

/// `AF_INET`.
pub const AF_INET: u16 = 2;

/// Bits of the `socket()` type argument that select the socket type.
pub const SOCK_TYPE_MASK: u64 = 0xf;

/// `ioctl` request that toggles non-blocking I/O.
pub const FIONBIO: u64 = 0x5421;

/// Longest `sun_path` that is read.
const UNIX_PATH_MAX: usize = 256;

/// Sub-calls of the `socketcall` multiplexer.
#[expect(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SocketCall {
    Socket = 1,
    Bind,
    Connect,
    Listen,
    Accept,
    GetSockName,
    GetPeerName,
    SocketPair,
    Send,
    Recv,
    SendTo,
    RecvFrom,
    Shutdown,
    SetSockOpt,
    GetSockOpt,
    SendMsg,
    RecvMsg,
    Accept4,
    RecvMmsg,
    SendMmsg,
}

impl SocketCall {
    const ALL: [Self; 20] = [
        Self::Socket,
        Self::Bind,
        Self::Connect,
        Self::Listen,
        Self::Accept,
        Self::GetSockName,
        Self::GetPeerName,
        Self::SocketPair,
        Self::Send,
        Self::Recv,
        Self::SendTo,
        Self::RecvFrom,
        Self::Shutdown,
        Self::SetSockOpt,
        Self::GetSockOpt,
        Self::SendMsg,
        Self::RecvMsg,
        Self::Accept4,
        Self::RecvMmsg,
        Self::SendMmsg,
    ];

    /// Decodes the first `socketcall` argument.
    pub fn from_number(number: u64) -> Option<Self> {
        let index = usize::try_from(number.checked_sub(1)?).ok()?;
        Self::ALL.get(index).copied()
    }

    /// Looks a sub-call up by its name, e.g. `"CONNECT"`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|call| call.name().eq_ignore_ascii_case(name))
    }

    /// Returns the sub-call number.
    pub fn number(self) -> u64 {
        self as u64
    }

    /// Returns the `SYS_` name without the prefix.
    pub fn name(self) -> &'static str {
        match self {
            Self::Socket => "SOCKET",
            Self::Bind => "BIND",
            Self::Connect => "CONNECT",
            Self::Listen => "LISTEN",
            Self::Accept => "ACCEPT",
            Self::GetSockName => "GETSOCKNAME",
            Self::GetPeerName => "GETPEERNAME",
            Self::SocketPair => "SOCKETPAIR",
            Self::Send => "SEND",
            Self::Recv => "RECV",
            Self::SendTo => "SENDTO",
            Self::RecvFrom => "RECVFROM",
            Self::Shutdown => "SHUTDOWN",
            Self::SetSockOpt => "SETSOCKOPT",
            Self::GetSockOpt => "GETSOCKOPT",
            Self::SendMsg => "SENDMSG",
            Self::RecvMsg => "RECVMSG",
            Self::Accept4 => "ACCEPT4",
            Self::RecvMmsg => "RECVMMSG",
            Self::SendMmsg => "SENDMMSG",
        }
    }

    /// Checks whether the second argument is a `struct sockaddr *`.
    pub fn takes_address(self) -> bool {
        matches!(self, Self::Bind | Self::Connect)
    }

    /// Checks whether the sub-call operates on an already bound socket,
    /// so that a watched socket carries over to it.
    pub fn uses_bound_socket(self) -> bool {
        matches!(
            self,
            Self::Listen
                | Self::Accept
                | Self::Accept4
                | Self::Send
                | Self::SendTo
                | Self::SendMsg
                | Self::SendMmsg
                | Self::Recv
                | Self::RecvFrom
                | Self::RecvMsg
                | Self::RecvMmsg
        )
    }
}

impl fmt::Display for SocketCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returns the name of an address family.
pub fn family_name(family: u16) -> Option<&'static str> {
    Some(match family {
        0 => "AF_UNSPEC",
        1 => "AF_LOCAL",
        2 => "AF_INET",
        3 => "AF_AX25",
        4 => "AF_IPX",
        5 => "AF_APPLETALK",
        6 => "AF_NETROM",
        7 => "AF_BRIDGE",
        8 => "AF_ATMPVC",
        9 => "AF_X25",
        10 => "AF_INET6",
        11 => "AF_ROSE",
        12 => "AF_DECnet",
        13 => "AF_NETBEUI",
        14 => "AF_SECURITY",
        15 => "AF_KEY",
        16 => "AF_NETLINK",
        17 => "AF_PACKET",
        _ => return None,
    })
}

/// A decoded `struct sockaddr`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocketAddress {
    /// `struct sockaddr_un`.
    Unix {
        /// The socket path.
        path: String,
    },

    /// `struct sockaddr_in`.
    Inet {
        /// The address.
        ip: Ipv4Addr,

        /// The port, in host order.
        port: u16,
    },

    /// Any other family.
    Other {
        /// The `sa_family` value.
        family: u16,
    },
}

impl SocketAddress {
    /// Returns the address family.
    pub fn family(&self) -> u16 {
        match self {
            Self::Unix { .. } => AF_UNIX,
            Self::Inet { .. } => AF_INET,
            Self::Other { family } => *family,
        }
    }

    /// Checks whether the address is an IPv4 address outside `0.0.0.0/16`
    /// and `127.0.0.0/8`.
    pub fn is_routable(&self) -> bool {
        match self {
            Self::Inet { ip, .. } => {
                let [a, b, ..] = ip.octets();
                !(a == 127 || (a == 0 && b == 0))
            }
            _ => false,
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unix { path } => f.write_str(path),
            Self::Inet { ip, port } => write!(f, "{ip}:{port}"),
            Self::Other { family } => match family_name(*family) {
                Some(name) => f.write_str(name),
                None => write!(f, "family {family}"),
            },
        }
    }
}

/// Leading arguments of a `socketcall` argument block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketArgs {
    /// The socket descriptor (or the domain, for `SOCKET`).
    pub fd: u64,

    /// The second argument.
    pub arg: u64,

    /// The decoded address, for sub-calls that take one.
    pub address: Option<SocketAddress>,
}

impl SocketArgs {
    /// Reads the argument block that `socketcall` receives a pointer to.
    pub fn read<Driver>(
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        call: SocketCall,
        params: Va,
    ) -> Result<Self, SimError>
    where
        Driver: SimDriver,
    {
        let word = registers.address_width() as u64;

        let fd = vmi.read_uint(registers.access_context(params), word as usize)?;
        let arg = vmi.read_uint(registers.access_context(params + word), word as usize)?;

        let address = if call.takes_address() && arg != 0 {
            Some(read_socket_address(vmi, registers, Va(arg))?)
        }
        else {
            None
        };

        Ok(Self { fd, arg, address })
    }
}

/// Reads a `struct sockaddr`.
pub fn read_socket_address<Driver>(
    vmi: &SimCore<Driver>,
    registers: &<Driver::Architecture as Architecture>::Registers,
    va: Va,
) -> Result<SocketAddress, SimError>
where
    Driver: SimDriver,
{
    let family = vmi.read_u16(registers.access_context(va))?;

    match family {
        AF_UNIX => {
            let path = vmi.read_string_limited(registers.access_context(va + 2), UNIX_PATH_MAX)?;
            Ok(SocketAddress::Unix { path })
        }
        AF_INET => {
            let mut buffer = [0u8; 6];
            vmi.read(registers.access_context(va + 2), &mut buffer)?;

            // sin_port and sin_addr are in network order.
            let port = u16::from_be_bytes([buffer[0], buffer[1]]);
            let ip = Ipv4Addr::new(buffer[2], buffer[3], buffer[4], buffer[5]);

            Ok(SocketAddress::Inet { ip, port })
        }
        family => Ok(SocketAddress::Other { family }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcall_numbers() {
        assert_eq!(SocketCall::from_number(1), Some(SocketCall::Socket));
        assert_eq!(SocketCall::from_number(3), Some(SocketCall::Connect));
        assert_eq!(SocketCall::from_number(20), Some(SocketCall::SendMmsg));
        assert_eq!(SocketCall::from_number(0), None);
        assert_eq!(SocketCall::from_number(21), None);

        assert_eq!(SocketCall::from_name("bind"), Some(SocketCall::Bind));
        assert_eq!(SocketCall::Accept4.number(), 18);
    }

    #[test]
    fn routable() {
        let inet = |a, b, c, d| SocketAddress::Inet {
            ip: Ipv4Addr::new(a, b, c, d),
            port: 80,
        };

        assert!(inet(10, 0, 0, 1).is_routable());
        assert!(inet(0, 1, 0, 0).is_routable());
        assert!(!inet(127, 0, 0, 1).is_routable());
        assert!(!inet(0, 0, 0, 0).is_routable());
        assert!(!SocketAddress::Unix { path: "/tmp/s".into() }.is_routable());

        assert_eq!(inet(10, 0, 0, 1).to_string(), "10.0.0.1:80");
        assert_eq!(SocketAddress::Other { family: 10 }.to_string(), "AF_INET6");
    }
}

#[cfg(all(test, feature = "arch-x86"))]
mod read_tests {
    use simi_arch_x86::Registers;

    use super::*;
    use crate::mock::{MockDriver, make_vmi};

    #[test]
    fn connect_args() -> Result<(), SimError> {
        let driver = MockDriver::new();

        // { fd = 3, addr = 0x2100, addrlen = 16 }
        driver.write_u32(0x2000, 3);
        driver.write_u32(0x2004, 0x2100);
        driver.write_u32(0x2008, 16);

        // AF_INET, port 8080, 192.168.1.7
        driver.write(0x2100, &[2, 0, 0x1f, 0x90, 192, 168, 1, 7]);

        let vmi = make_vmi(driver);
        let registers = Registers::default();

        let args = SocketArgs::read(&vmi, &registers, SocketCall::Connect, Va(0x2000))?;
        assert_eq!(args.fd, 3);
        assert_eq!(
            args.address,
            Some(SocketAddress::Inet {
                ip: Ipv4Addr::new(192, 168, 1, 7),
                port: 8080,
            })
        );
        assert!(args.address.is_some_and(|address| address.is_routable()));

        Ok(())
    }

    #[test]
    fn unix_path() -> Result<(), SimError> {
        let driver = MockDriver::new();
        driver.write(0x3000, &[1, 0]);
        driver.write(0x3002, b"/tmp/sock\0");

        let vmi = make_vmi(driver);
        let registers = Registers::default();

        let address = read_socket_address(&vmi, &registers, Va(0x3000))?;
        assert_eq!(address.to_string(), "/tmp/sock");
        assert_eq!(address.family(), AF_UNIX);

        Ok(())
    }
}

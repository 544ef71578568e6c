//! Land drivers are the raw, unreliable datagram transports underneath the
//! datagram driver.

use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
};

use thiserror::Error;

pub use memory::{MemoryLand, MemoryNetwork};
pub use udp::UdpLand;

mod memory;
mod udp;

/// Default port of listening hosts.
pub const DEFAULT_HOST_PORT: u16 = 26000;

/// Handle of a socket opened by a land driver. The handle is only meaningful
/// to the land driver which opened the socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LandSocket(u32);

impl LandSocket {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for LandSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket {}", self.0)
    }
}

/// An unreliable and unordered datagram transport.
///
/// All operations are non-blocking.
pub trait LandDriver: Send {
    fn name(&self) -> &str;

    /// Initializes the driver and opens its control socket, which is used
    /// for host discovery. The control socket is returned.
    fn init(&mut self) -> Result<LandSocket, LandError>;

    /// Closes all sockets opened by the driver.
    fn shutdown(&mut self);

    /// Opens (`true`) or closes (`false`) the accept socket bound to the
    /// host port.
    fn listen(&mut self, state: bool) -> Result<(), LandError>;

    /// Returns the accept socket if the driver is listening.
    fn accept_socket(&self) -> Option<LandSocket>;

    /// Opens a new socket. Port 0 means a system (driver) assigned port.
    fn open_socket(&mut self, port: u16) -> Result<LandSocket, LandError>;

    fn close_socket(&mut self, socket: LandSocket);

    /// Receives a single datagram if there is one waiting.
    ///
    /// Returns length of the datagram and its source. The datagram is
    /// truncated to the length of `buf`.
    fn read(
        &mut self,
        socket: LandSocket,
        buf: &mut [u8],
    ) -> Result<Option<(usize, SocketAddr)>, LandError>;

    /// Sends a single datagram to a single target.
    fn write(
        &mut self,
        socket: LandSocket,
        data: &[u8],
        target: SocketAddr,
    ) -> Result<(), LandError>;

    /// Sends a single datagram to the host port of every host on the local
    /// network.
    fn broadcast(&mut self, socket: LandSocket, data: &[u8]) -> Result<(), LandError>;

    /// Address of a socket as seen by other hosts.
    fn socket_addr(&self, socket: LandSocket) -> Result<SocketAddr, LandError>;

    /// Address of this host (with the host port).
    fn local_addr(&self) -> SocketAddr;

    /// Translates a host name (`host`, `host:port`, `ip` or `ip:port`) to an
    /// address. Host port is used when the name contains no port.
    fn resolve(&self, name: &str) -> Option<SocketAddr>;

    fn host_port(&self) -> u16;

    /// Changes the host port. It takes effect the next time the driver
    /// starts listening.
    fn set_host_port(&mut self, port: u16);
}

#[derive(Error, Debug)]
pub enum LandError {
    #[error("an IO error occurred")]
    Io(#[from] io::Error),
    #[error("only {0} of {1} bytes sent")]
    PartialSend(usize, usize),
    #[error("{0} is not open")]
    UnknownSocket(LandSocket),
    #[error("address {0} is already in use")]
    AddrInUse(SocketAddr),
}

/// Parses a numeric address with an optional port.
pub(crate) fn parse_addr(name: &str, default_port: u16) -> Option<SocketAddr> {
    let name = name.trim();
    if let Ok(addr) = name.parse::<SocketAddr>() {
        return Some(addr);
    }
    name.parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, default_port))
}

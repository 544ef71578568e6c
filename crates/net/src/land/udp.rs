use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use ahash::AHashMap;
use async_std::{
    net::{ToSocketAddrs, UdpSocket},
    task,
};
use futures_lite::future;
use tracing::{info, warn};

use super::{parse_addr, LandDriver, LandError, LandSocket};

/// Land driver based on UDP sockets.
///
/// Sockets are driven by the async-std reactor and polled exactly once on
/// every read, thus no call blocks waiting for the network.
pub struct UdpLand {
    bind: IpAddr,
    local: IpAddr,
    host_port: u16,
    next_socket: u32,
    sockets: AHashMap<LandSocket, UdpSocket>,
    control: Option<LandSocket>,
    accept: Option<LandSocket>,
}

impl UdpLand {
    /// # Arguments
    ///
    /// * `bind` - IP address all sockets are bound to. Use
    ///   [`Ipv4Addr::UNSPECIFIED`] to bind to all interfaces.
    ///
    /// * `host_port` - port of the accept socket.
    pub fn new(bind: IpAddr, host_port: u16) -> Self {
        Self {
            bind,
            local: bind,
            host_port,
            next_socket: 0,
            sockets: AHashMap::new(),
            control: None,
            accept: None,
        }
    }

    fn socket(&self, socket: LandSocket) -> Result<&UdpSocket, LandError> {
        self.sockets
            .get(&socket)
            .ok_or(LandError::UnknownSocket(socket))
    }
}

impl LandDriver for UdpLand {
    fn name(&self) -> &str {
        "UDP"
    }

    fn init(&mut self) -> Result<LandSocket, LandError> {
        self.local = if self.bind.is_unspecified() {
            match local_ip_address::local_ip() {
                Ok(ip) => ip,
                Err(error) => {
                    warn!("Failed to determine local IP address: {error}");
                    IpAddr::V4(Ipv4Addr::LOCALHOST)
                }
            }
        } else {
            self.bind
        };

        let control = self.open_socket(0)?;
        self.socket(control)?.set_broadcast(true)?;
        self.control = Some(control);

        info!("UDP land initialized, local address {}", self.local);
        Ok(control)
    }

    fn shutdown(&mut self) {
        self.control = None;
        self.accept = None;
        self.sockets.clear();
    }

    fn listen(&mut self, state: bool) -> Result<(), LandError> {
        if state {
            if self.accept.is_none() {
                self.accept = Some(self.open_socket(self.host_port)?);
            }
        } else if let Some(accept) = self.accept.take() {
            self.close_socket(accept);
        }
        Ok(())
    }

    fn accept_socket(&self) -> Option<LandSocket> {
        self.accept
    }

    fn open_socket(&mut self, port: u16) -> Result<LandSocket, LandError> {
        let socket = task::block_on(UdpSocket::bind(SocketAddr::new(self.bind, port)))?;
        let handle = LandSocket::new(self.next_socket);
        self.next_socket = self.next_socket.wrapping_add(1);
        self.sockets.insert(handle, socket);
        Ok(handle)
    }

    fn close_socket(&mut self, socket: LandSocket) {
        self.sockets.remove(&socket);
    }

    fn read(
        &mut self,
        socket: LandSocket,
        buf: &mut [u8],
    ) -> Result<Option<(usize, SocketAddr)>, LandError> {
        let socket = self.socket(socket)?;
        match task::block_on(future::poll_once(socket.recv_from(buf))) {
            None => Ok(None),
            Some(Ok((len, source))) => Ok(Some((len.min(buf.len()), source))),
            // ICMP port unreachable of a previous send is reported this way
            // on some platforms.
            Some(Err(error)) if error.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Some(Err(error)) => Err(error.into()),
        }
    }

    fn write(
        &mut self,
        socket: LandSocket,
        data: &[u8],
        target: SocketAddr,
    ) -> Result<(), LandError> {
        let socket = self.socket(socket)?;
        let n = task::block_on(socket.send_to(data, target))?;
        if n < data.len() {
            Err(LandError::PartialSend(n, data.len()))
        } else {
            Ok(())
        }
    }

    fn broadcast(&mut self, socket: LandSocket, data: &[u8]) -> Result<(), LandError> {
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.host_port);
        self.write(socket, data, target)
    }

    fn socket_addr(&self, socket: LandSocket) -> Result<SocketAddr, LandError> {
        let mut addr = self.socket(socket)?.local_addr()?;
        if addr.ip().is_unspecified() {
            addr.set_ip(self.local);
        }
        Ok(addr)
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local, self.host_port)
    }

    fn resolve(&self, name: &str) -> Option<SocketAddr> {
        if let Some(addr) = parse_addr(name, self.host_port) {
            return Some(addr);
        }

        let name = name.trim();
        let lookup = if name.contains(':') {
            task::block_on(name.to_socket_addrs())
        } else {
            task::block_on((name, self.host_port).to_socket_addrs())
        };
        match lookup {
            Ok(mut addrs) => addrs.find(|addr| addr.is_ipv4()),
            Err(error) => {
                warn!("Failed to resolve {name}: {error}");
                None
            }
        }
    }

    fn host_port(&self) -> u16 {
        self.host_port
    }

    fn set_host_port(&mut self, port: u16) {
        self.host_port = port;
    }
}

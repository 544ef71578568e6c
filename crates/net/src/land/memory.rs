use std::{
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ahash::AHashMap;
use tracing::trace;

use super::{parse_addr, LandDriver, LandError, LandSocket};

const FIRST_EPHEMERAL_PORT: u16 = 49152;

type Filter = Box<dyn FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + Send>;

/// In-process datagram network shared by any number of [`MemoryLand`]
/// drivers, each of them representing a single host.
///
/// Datagrams are delivered instantly and in order unless a loss rate or a
/// filter is configured. Clones share the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    fabric: Arc<Mutex<Fabric>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a land driver of a host with IP address `ip` connected to
    /// this network.
    pub fn land(&self, ip: Ipv4Addr, host_port: u16) -> MemoryLand {
        MemoryLand {
            network: self.clone(),
            ip,
            host_port,
            next_socket: 0,
            sockets: AHashMap::new(),
            control: None,
            accept: None,
        }
    }

    /// Randomly drops the given fraction of all datagrams. The loss is
    /// deterministic for a given seed.
    pub fn set_loss(&self, probability: f64, seed: u64) {
        self.lock().loss = Some(Loss {
            probability,
            rng: fastrand::Rng::with_seed(seed),
        });
    }

    /// Installs a filter called with source, target and data of every
    /// datagram. The datagram is dropped if the filter returns false.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + Send + 'static,
    {
        self.lock().filter = Some(Box::new(filter));
    }

    /// Removes the loss and the filter.
    pub fn reset_faults(&self) {
        let mut fabric = self.lock();
        fabric.loss = None;
        fabric.filter = None;
    }

    /// Number of datagrams waiting to be read by the socket bound to `addr`.
    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.lock().queues.get(&addr).map_or(0, VecDeque::len)
    }

    fn lock(&self) -> MutexGuard<'_, Fabric> {
        self.fabric.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct Fabric {
    queues: AHashMap<SocketAddr, VecDeque<Datagram>>,
    next_port: u16,
    loss: Option<Loss>,
    filter: Option<Filter>,
}

impl Fabric {
    fn bind(&mut self, ip: Ipv4Addr, port: u16) -> Result<SocketAddr, LandError> {
        let port = if port == 0 {
            self.ephemeral_port(ip)
        } else {
            port
        };

        let addr = SocketAddr::new(IpAddr::V4(ip), port);
        if self.queues.contains_key(&addr) {
            return Err(LandError::AddrInUse(addr));
        }
        self.queues.insert(addr, VecDeque::new());
        Ok(addr)
    }

    fn ephemeral_port(&mut self, ip: Ipv4Addr) -> u16 {
        loop {
            if self.next_port < FIRST_EPHEMERAL_PORT {
                self.next_port = FIRST_EPHEMERAL_PORT;
            }
            let port = self.next_port;
            self.next_port = self.next_port.wrapping_add(1);

            if !self
                .queues
                .contains_key(&SocketAddr::new(IpAddr::V4(ip), port))
            {
                return port;
            }
        }
    }

    fn deliver(&mut self, source: SocketAddr, target: SocketAddr, data: &[u8]) {
        if let Some(filter) = self.filter.as_mut() {
            if !filter(source, target, data) {
                trace!("Datagram {source} -> {target} filtered out");
                return;
            }
        }
        if let Some(loss) = self.loss.as_mut() {
            if loss.rng.f64() < loss.probability {
                trace!("Datagram {source} -> {target} lost");
                return;
            }
        }

        if let Some(queue) = self.queues.get_mut(&target) {
            queue.push_back(Datagram {
                source,
                data: data.to_vec(),
            });
        }
    }
}

struct Loss {
    probability: f64,
    rng: fastrand::Rng,
}

struct Datagram {
    source: SocketAddr,
    data: Vec<u8>,
}

/// A single host connected to a [`MemoryNetwork`].
pub struct MemoryLand {
    network: MemoryNetwork,
    ip: Ipv4Addr,
    host_port: u16,
    next_socket: u32,
    sockets: AHashMap<LandSocket, SocketAddr>,
    control: Option<LandSocket>,
    accept: Option<LandSocket>,
}

impl MemoryLand {
    fn addr(&self, socket: LandSocket) -> Result<SocketAddr, LandError> {
        self.sockets
            .get(&socket)
            .copied()
            .ok_or(LandError::UnknownSocket(socket))
    }
}

impl LandDriver for MemoryLand {
    fn name(&self) -> &str {
        "memory"
    }

    fn init(&mut self) -> Result<LandSocket, LandError> {
        let control = self.open_socket(0)?;
        self.control = Some(control);
        Ok(control)
    }

    fn shutdown(&mut self) {
        let sockets: Vec<LandSocket> = self.sockets.keys().copied().collect();
        for socket in sockets {
            self.close_socket(socket);
        }
        self.control = None;
        self.accept = None;
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
        let addr = self.network.lock().bind(self.ip, port)?;
        let socket = LandSocket::new(self.next_socket);
        self.next_socket = self.next_socket.wrapping_add(1);
        self.sockets.insert(socket, addr);
        Ok(socket)
    }

    fn close_socket(&mut self, socket: LandSocket) {
        if let Some(addr) = self.sockets.remove(&socket) {
            self.network.lock().queues.remove(&addr);
        }
    }

    fn read(
        &mut self,
        socket: LandSocket,
        buf: &mut [u8],
    ) -> Result<Option<(usize, SocketAddr)>, LandError> {
        let addr = self.addr(socket)?;
        let datagram = self
            .network
            .lock()
            .queues
            .get_mut(&addr)
            .and_then(VecDeque::pop_front);

        Ok(datagram.map(|datagram| {
            let len = datagram.data.len().min(buf.len());
            buf[..len].copy_from_slice(&datagram.data[..len]);
            (len, datagram.source)
        }))
    }

    fn write(
        &mut self,
        socket: LandSocket,
        data: &[u8],
        target: SocketAddr,
    ) -> Result<(), LandError> {
        let source = self.addr(socket)?;
        self.network.lock().deliver(source, target, data);
        Ok(())
    }

    fn broadcast(&mut self, socket: LandSocket, data: &[u8]) -> Result<(), LandError> {
        let source = self.addr(socket)?;
        let mut fabric = self.network.lock();
        let targets: Vec<SocketAddr> = fabric
            .queues
            .keys()
            .copied()
            .filter(|&addr| addr != source && addr.port() == self.host_port)
            .collect();
        for target in targets {
            fabric.deliver(source, target, data);
        }
        Ok(())
    }

    fn socket_addr(&self, socket: LandSocket) -> Result<SocketAddr, LandError> {
        self.addr(socket)
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.host_port)
    }

    fn resolve(&self, name: &str) -> Option<SocketAddr> {
        parse_addr(name, self.host_port)
    }

    fn host_port(&self) -> u16 {
        self.host_port
    }

    fn set_host_port(&mut self, port: u16) {
        self.host_port = port;
    }
}

impl Drop for MemoryLand {
    fn drop(&mut self) {
        self.shutdown();
    }
}

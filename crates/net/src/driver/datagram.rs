use std::{net::SocketAddr, thread, time::Duration};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{Driver, DriverContext, DriverError};
use crate::{
    cancellation::CancelToken,
    clock::Clock,
    control::{ControlError, ControlMessage, Handshake, ServerInfo, PROTOCOL_VERSION},
    header::{HEADER_SIZE, MAX_DATAGRAM_SIZE},
    hostcache::HostEntry,
    land::{LandDriver, LandError, LandSocket},
    pool::{ConnId, Connection, ConnectionPool, Link, Origin},
    protocol::{DatagramSink, Received},
    session::{MessageStatus, SendStatus},
};

const CONNECT_ATTEMPTS: usize = 3;
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(2500);
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Connect requests repeated within this time after the connection was
/// accepted are answered again. Later requests from an already connected
/// address close the stale connection.
const DUPLICATE_CONNECT_WINDOW: Duration = Duration::from_secs(2);

const SERVER_FULL: &str = "Server is full.";
const INCOMPATIBLE_VERSION: &str = "Incompatible version.";

/// Driver implementing the reliable message protocol over any number of
/// land drivers.
pub(crate) struct DatagramDriver {
    lands: Vec<LandSlot>,
    buf: Vec<u8>,
}

struct LandSlot {
    land: Box<dyn LandDriver>,
    initialized: bool,
    control: Option<LandSocket>,
}

/// Datagram path between a connection socket and the remote peer.
struct LandSink<'a> {
    land: &'a mut dyn LandDriver,
    socket: LandSocket,
    addr: SocketAddr,
}

impl LandSink<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, LandError> {
        self.land.read(self.socket, buf)
    }
}

impl DatagramSink for LandSink<'_> {
    fn transmit(&mut self, datagram: &[u8]) -> Result<(), LandError> {
        self.land.write(self.socket, datagram, self.addr)
    }
}

impl DatagramDriver {
    pub(crate) fn new(lands: Vec<Box<dyn LandDriver>>) -> Self {
        Self {
            lands: lands
                .into_iter()
                .map(|land| LandSlot {
                    land,
                    initialized: false,
                    control: None,
                })
                .collect(),
            buf: vec![0; MAX_DATAGRAM_SIZE],
        }
    }

    fn open_link<'a>(
        lands: &'a mut [LandSlot],
        pool: &'a mut ConnectionPool,
        id: ConnId,
    ) -> Option<(&'a mut Connection, LandSink<'a>)> {
        let connection = pool.get_mut(id)?;
        let Link::Datagram { land, socket, addr } = connection.link else {
            return None;
        };
        let slot = lands.get_mut(land)?;
        let sink = LandSink {
            land: slot.land.as_mut(),
            socket,
            addr,
        };
        Some((connection, sink))
    }

    fn connect_land(
        &mut self,
        ctx: &mut DriverContext,
        index: usize,
        addr: SocketAddr,
        cancel: &CancelToken,
    ) -> Result<ConnId, ConnectError> {
        let slot = &mut self.lands[index];
        let socket = slot.land.open_socket(0)?;
        let Some(id) = ctx.pool.allocate(ctx.now) else {
            slot.land.close_socket(socket);
            return Err(ConnectError::NoFreeConnection);
        };

        match handshake(slot.land.as_mut(), &mut self.buf, ctx.clock, socket, addr, cancel) {
            Ok(port) => {
                let remote = SocketAddr::new(addr.ip(), port);
                let now = ctx.clock.now();
                if let Some(connection) = ctx.pool.get_mut(id) {
                    connection.open(
                        ctx.driver,
                        Origin::Initiated,
                        Link::Datagram {
                            land: index,
                            socket,
                            addr: remote,
                        },
                        &remote.to_string(),
                    );
                    connection.last_message_time = now;
                }
                info!("Connection {id} to {remote} accepted");
                Ok(id)
            }
            Err(error) => {
                ctx.pool.release(id);
                slot.land.close_socket(socket);
                Err(error)
            }
        }
    }

    /// Reads and handles a single control datagram from the accept socket
    /// of a land.
    fn check_land(&mut self, ctx: &mut DriverContext, index: usize) -> Option<ConnId> {
        let slot = &mut self.lands[index];
        if !slot.initialized {
            return None;
        }
        let accept = slot.land.accept_socket()?;

        let (len, client) = match slot.land.read(accept, &mut self.buf) {
            Ok(read) => read?,
            Err(error) => {
                error!("Reading from {} accept socket failed: {error}", slot.land.name());
                return None;
            }
        };
        let request = match ControlMessage::decode(&self.buf[..len]) {
            Ok(request) => request,
            Err(error) => {
                debug!("Invalid control datagram from {client}: {error}");
                return None;
            }
        };

        if let ControlMessage::Connect(handshake) = request {
            return self.accept_connection(ctx, index, accept, client, handshake);
        }

        let land = self.lands[index].land.as_mut();
        match request {
            ControlMessage::ServerInfoRequest(handshake) => {
                if handshake.is_same_game() && ctx.host.is_active() {
                    let info = ServerInfo {
                        address: land.local_addr().to_string(),
                        host_name: ctx.host.host_name().to_owned(),
                        level_name: ctx.host.level_name().to_owned(),
                        players: ctx.host.players().len().min(u8::MAX as usize) as u8,
                        max_players: ctx.max_clients,
                        protocol: PROTOCOL_VERSION,
                    };
                    reply(
                        land,
                        &mut self.buf,
                        accept,
                        client,
                        &ControlMessage::ServerInfo(info),
                    );
                }
                None
            }
            ControlMessage::PlayerInfoRequest(number) => {
                if let Some(mut player) = ctx.host.players().into_iter().nth(number as usize) {
                    player.number = number;
                    reply(
                        land,
                        &mut self.buf,
                        accept,
                        client,
                        &ControlMessage::PlayerInfo(player),
                    );
                }
                None
            }
            ControlMessage::RuleInfoRequest(previous) => {
                let rule = ctx.host.rule_after(&previous);
                reply(
                    land,
                    &mut self.buf,
                    accept,
                    client,
                    &ControlMessage::RuleInfo(rule),
                );
                None
            }
            other => {
                debug!("Unexpected control message {other:?} from {client}");
                None
            }
        }
    }

    fn accept_connection(
        &mut self,
        ctx: &mut DriverContext,
        index: usize,
        accept: LandSocket,
        client: SocketAddr,
        handshake: Handshake,
    ) -> Option<ConnId> {
        if !handshake.is_same_game() {
            return None;
        }

        let land = self.lands[index].land.as_mut();
        let buf = &mut self.buf;
        if handshake.protocol != PROTOCOL_VERSION {
            warn!(
                "Connection from {client} rejected: protocol {} is not supported",
                handshake.protocol
            );
            let reject = ControlMessage::Reject(INCOMPATIBLE_VERSION.to_owned());
            reply(land, buf, accept, client, &reject);
            return None;
        }

        let driver = ctx.driver;
        let existing = ctx.pool.active().find(|&id| {
            ctx.pool.get(id).map_or(false, |connection| {
                connection.driver == driver
                    && matches!(
                        connection.link,
                        Link::Datagram { land, addr, .. } if land == index && addr == client
                    )
            })
        });

        if let Some(id) = existing {
            let connection = ctx.pool.get(id)?;
            let Link::Datagram { socket, .. } = connection.link else {
                return None;
            };

            if ctx.now.saturating_duration_since(connection.connect_time)
                < DUPLICATE_CONNECT_WINDOW
            {
                debug!("Duplicate connect request from {client}");
                match land.socket_addr(socket) {
                    Ok(addr) => reply(land, buf, accept, client, &ControlMessage::Accept(addr.port())),
                    Err(error) => error!("Failed to get address of {socket}: {error}"),
                }
            } else {
                info!("Client {client} reconnected, closing its stale connection {id}");
                land.close_socket(socket);
                ctx.pool.release(id);
            }
            return None;
        }

        let Some(id) = ctx.pool.allocate(ctx.now) else {
            warn!("Connection from {client} rejected: server is full");
            let reject = ControlMessage::Reject(SERVER_FULL.to_owned());
            reply(land, buf, accept, client, &reject);
            return None;
        };

        let socket = match land.open_socket(0) {
            Ok(socket) => socket,
            Err(error) => {
                error!("Failed to open connection socket: {error}");
                ctx.pool.release(id);
                return None;
            }
        };
        let port = match land.socket_addr(socket) {
            Ok(addr) => addr.port(),
            Err(error) => {
                error!("Failed to get address of {socket}: {error}");
                land.close_socket(socket);
                ctx.pool.release(id);
                return None;
            }
        };

        if let Some(connection) = ctx.pool.get_mut(id) {
            connection.open(
                driver,
                Origin::Accepted,
                Link::Datagram {
                    land: index,
                    socket,
                    addr: client,
                },
                &client.to_string(),
            );
        }
        reply(land, buf, accept, client, &ControlMessage::Accept(port));
        info!("Connection {id} from {client} accepted");
        Some(id)
    }
}

impl Driver for DatagramDriver {
    fn name(&self) -> &str {
        "datagram"
    }

    fn init(&mut self, _dedicated: bool) -> Result<(), DriverError> {
        for slot in self.lands.iter_mut() {
            match slot.land.init() {
                Ok(control) => {
                    info!("Land driver {} initialized", slot.land.name());
                    slot.control = Some(control);
                    slot.initialized = true;
                }
                Err(error) => {
                    warn!("Land driver {} failed to initialize: {error}", slot.land.name());
                }
            }
        }

        if self.lands.iter().any(|slot| slot.initialized) {
            Ok(())
        } else {
            Err(DriverError::NoLand)
        }
    }

    fn shutdown(&mut self) {
        for slot in self.lands.iter_mut().filter(|slot| slot.initialized) {
            slot.land.shutdown();
            slot.initialized = false;
            slot.control = None;
        }
    }

    fn listen(&mut self, state: bool) -> Result<(), DriverError> {
        for slot in self.lands.iter_mut().filter(|slot| slot.initialized) {
            slot.land.listen(state)?;
        }
        Ok(())
    }

    fn host_port(&self) -> Option<u16> {
        self.lands.first().map(|slot| slot.land.host_port())
    }

    fn set_host_port(&mut self, port: u16) {
        for slot in self.lands.iter_mut() {
            slot.land.set_host_port(port);
        }
    }

    fn search_for_hosts(&mut self, ctx: &mut DriverContext, transmit: bool) {
        for (index, slot) in self.lands.iter_mut().enumerate() {
            if !slot.initialized {
                continue;
            }
            let Some(control) = slot.control else {
                continue;
            };
            let land = slot.land.as_mut();

            if transmit {
                let request = ControlMessage::ServerInfoRequest(Handshake::current());
                match request.encode(&mut self.buf) {
                    Ok(len) => {
                        if let Err(error) = land.broadcast(control, &self.buf[..len]) {
                            warn!("Host search broadcast via {} failed: {error}", land.name());
                        }
                    }
                    Err(error) => error!("Failed to encode server info request: {error}"),
                }
            }

            let own = [
                land.socket_addr(control).ok(),
                land.accept_socket()
                    .and_then(|accept| land.socket_addr(accept).ok()),
            ];

            loop {
                let (len, source) = match land.read(control, &mut self.buf) {
                    Ok(Some(read)) => read,
                    Ok(None) => break,
                    Err(error) => {
                        warn!("Reading host search replies failed: {error}");
                        break;
                    }
                };

                if own.contains(&Some(source)) || ctx.hostcache.is_full() {
                    continue;
                }
                let info = match ControlMessage::decode(&self.buf[..len]) {
                    Ok(ControlMessage::ServerInfo(info)) => info,
                    Ok(other) => {
                        debug!("Unexpected host search reply {other:?} from {source}");
                        continue;
                    }
                    Err(error) => {
                        debug!("Invalid host search reply from {source}: {error}");
                        continue;
                    }
                };

                let addr = land.resolve(&info.address).unwrap_or(source);
                if ctx.hostcache.contains_addr(addr) {
                    continue;
                }

                let name = if info.protocol == PROTOCOL_VERSION {
                    info.host_name
                } else {
                    format!("*{}", info.host_name)
                };
                let entry = HostEntry::new(
                    name,
                    info.level_name,
                    addr.to_string(),
                    info.players,
                    info.max_players,
                )
                .with_origin(ctx.driver, Some(addr));
                debug!("Host {entry} found at {addr}");
                ctx.hostcache.add(entry);
            }
        }
    }

    fn connect(
        &mut self,
        ctx: &mut DriverContext,
        host: &str,
        cancel: &CancelToken,
    ) -> Option<ConnId> {
        for index in 0..self.lands.len() {
            if !self.lands[index].initialized {
                continue;
            }
            let Some(addr) = self.lands[index].land.resolve(host) else {
                debug!("Host {host} could not be resolved by {}", self.lands[index].land.name());
                continue;
            };

            match self.connect_land(ctx, index, addr, cancel) {
                Ok(id) => return Some(id),
                Err(ConnectError::Cancelled) => {
                    info!("Connecting to {addr} cancelled");
                    return None;
                }
                Err(error) => warn!("Connecting to {addr} failed: {error}"),
            }
        }
        None
    }

    fn check_new_connections(&mut self, ctx: &mut DriverContext) -> Option<ConnId> {
        (0..self.lands.len()).find_map(|index| self.check_land(ctx, index))
    }

    fn get_message(&mut self, ctx: &mut DriverContext, id: ConnId) -> MessageStatus {
        let Some((connection, mut sink)) = Self::open_link(&mut self.lands, ctx.pool, id) else {
            return MessageStatus::Dead;
        };

        if let Err(error) = connection.resend_if_due(ctx.now, &mut sink, ctx.stats) {
            error!("Re-sending to {} failed: {error}", connection.address);
            return MessageStatus::Dead;
        }

        let status = loop {
            let (len, source) = match sink.read(&mut self.buf) {
                Ok(Some(read)) => read,
                Ok(None) => break MessageStatus::NoData,
                Err(error) => {
                    error!("Reading from {} failed: {error}", connection.address);
                    return MessageStatus::Dead;
                }
            };

            if source != sink.addr {
                debug!(
                    "Forged datagram from {source} on connection to {} ignored",
                    sink.addr
                );
                continue;
            }
            if len < HEADER_SIZE {
                ctx.stats.short_packet_count += 1;
                continue;
            }
            ctx.stats.packets_received += 1;

            match connection.process(&self.buf[..len], &mut sink, ctx.stats, ctx.message) {
                Ok(None) => continue,
                Ok(Some(Received::Reliable)) => break MessageStatus::Reliable,
                Ok(Some(Received::Unreliable)) => break MessageStatus::Unreliable,
                Err(error) => {
                    warn!("Connection to {} broken: {error}", connection.address);
                    return MessageStatus::Dead;
                }
            }
        };

        if connection.send_next {
            if let Err(error) = connection.send_next_fragment(ctx.now, &mut sink, ctx.stats) {
                error!("Sending to {} failed: {error}", connection.address);
                return MessageStatus::Dead;
            }
        }
        status
    }

    fn send_message(&mut self, ctx: &mut DriverContext, id: ConnId, data: &[u8]) -> SendStatus {
        let Some((connection, mut sink)) = Self::open_link(&mut self.lands, ctx.pool, id) else {
            return SendStatus::Dead;
        };

        match connection.send_reliable(ctx.now, data, &mut sink, ctx.stats) {
            Ok(()) => SendStatus::Sent,
            Err(error) => {
                error!("Sending to {} failed: {error}", connection.address);
                SendStatus::Dead
            }
        }
    }

    fn send_unreliable_message(
        &mut self,
        ctx: &mut DriverContext,
        id: ConnId,
        data: &[u8],
    ) -> SendStatus {
        let Some((connection, mut sink)) = Self::open_link(&mut self.lands, ctx.pool, id) else {
            return SendStatus::Dead;
        };

        match connection.send_unreliable(data, &mut sink, ctx.stats) {
            Ok(()) => SendStatus::Sent,
            Err(error) => {
                error!("Sending to {} failed: {error}", connection.address);
                SendStatus::Dead
            }
        }
    }

    fn can_send(&self, pool: &ConnectionPool, id: ConnId) -> bool {
        pool.get(id)
            .map_or(false, |connection| !connection.disconnected && connection.can_send)
    }

    fn can_send_unreliable(&self, pool: &ConnectionPool, id: ConnId) -> bool {
        pool.get(id)
            .map_or(false, |connection| !connection.disconnected)
    }

    fn close(&mut self, ctx: &mut DriverContext, id: ConnId) {
        let Some(connection) = ctx.pool.get(id) else {
            return;
        };
        if let Link::Datagram { land, socket, .. } = connection.link {
            if let Some(slot) = self.lands.get_mut(land) {
                slot.land.close_socket(socket);
            }
        }
    }
}

/// Sends connect requests to `addr` and waits for a reply.
///
/// Returns the port of the connection socket allocated by the remote host.
fn handshake(
    land: &mut dyn LandDriver,
    buf: &mut [u8],
    clock: &dyn Clock,
    socket: LandSocket,
    addr: SocketAddr,
    cancel: &CancelToken,
) -> Result<u16, ConnectError> {
    let len = ControlMessage::Connect(Handshake::current()).encode(buf)?;
    let request = buf[..len].to_vec();

    for attempt in 1..=CONNECT_ATTEMPTS {
        info!("Connecting to {addr} (attempt {attempt} of {CONNECT_ATTEMPTS})");
        land.write(socket, &request, addr)?;

        let start = clock.now();
        loop {
            if cancel.cancelled() {
                return Err(ConnectError::Cancelled);
            }

            let Some((len, source)) = land.read(socket, buf)? else {
                if clock.now().saturating_duration_since(start) >= CONNECT_ATTEMPT_TIMEOUT {
                    break;
                }
                thread::sleep(CONNECT_POLL_INTERVAL);
                continue;
            };

            if source != addr {
                debug!("Datagram from unexpected address {source} ignored");
                continue;
            }
            match ControlMessage::decode(&buf[..len]) {
                Ok(ControlMessage::Accept(port)) => return Ok(port),
                Ok(ControlMessage::Reject(reason)) => return Err(ConnectError::Rejected(reason)),
                Ok(other) => {
                    debug!("Unexpected connect reply {other:?}");
                    return Err(ConnectError::BadResponse);
                }
                Err(error) => debug!("Invalid datagram from {source}: {error}"),
            }
        }
    }

    Err(ConnectError::NoResponse)
}

/// Encodes a control message and sends it from `socket` to `target`.
/// Failures are only logged since replies are best effort.
fn reply(
    land: &mut dyn LandDriver,
    buf: &mut [u8],
    socket: LandSocket,
    target: SocketAddr,
    message: &ControlMessage,
) {
    let len = match message.encode(buf) {
        Ok(len) => len,
        Err(error) => {
            error!("Failed to encode control reply: {error}");
            return;
        }
    };
    if let Err(error) = land.write(socket, &buf[..len], target) {
        warn!("Failed to send control reply to {target}: {error}");
    }
}

#[derive(Error, Debug)]
enum ConnectError {
    #[error(transparent)]
    Land(#[from] LandError),
    #[error("failed to encode connect request")]
    Control(#[from] ControlError),
    #[error("no free connection")]
    NoFreeConnection,
    #[error("connection rejected: {0}")]
    Rejected(String),
    #[error("no response")]
    NoResponse,
    #[error("bad response")]
    BadResponse,
    #[error("cancelled")]
    Cancelled,
}

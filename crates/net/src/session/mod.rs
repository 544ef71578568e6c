use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use self::discovery::Discovery;
use crate::{
    clock::{Clock, SystemClock},
    driver::{DatagramDriver, Driver, DriverContext, LoopbackDriver},
    header::MAX_FRAGMENT_SIZE,
    host::{HostInfo, StaticHostInfo},
    hostcache::HostCache,
    land::LandDriver,
    pool::{ConnId, ConnectionPool, Origin, MAX_MESSAGE_SIZE},
    scheduler::Scheduler,
    stats::NetStats,
};

mod broadcast;
mod discovery;

pub use self::discovery::DISCOVERY_BUDGET;

/// Connections without any received message for this long are closed.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_CLIENTS: u8 = 4;

type Procedure = Box<dyn FnOnce(&mut Session) + Send>;

/// Result of sending a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// The connection is no longer usable (and has been closed).
    Dead,
    /// A reliable message is still waiting for acknowledgment. Nothing was
    /// sent.
    Busy,
    /// The message was accepted for delivery.
    Sent,
}

impl SendStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Dead => -1,
            Self::Busy => 0,
            Self::Sent => 1,
        }
    }
}

/// Result of receiving a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageStatus {
    /// The connection is no longer usable (and has been closed).
    Dead,
    NoData,
    /// A complete reliable message was received.
    Reliable,
    Unreliable,
}

impl MessageStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Dead => -1,
            Self::NoData => 0,
            Self::Reliable => 1,
            Self::Unreliable => 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Maximum number of remote clients. One more connection is reserved
    /// for the local client unless the session is dedicated.
    pub max_clients: u8,
    /// Dedicated sessions have no local (loopback) client.
    pub dedicated: bool,
    pub message_timeout: Duration,
    /// Start listening for new connections right away.
    pub listen: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_clients: DEFAULT_MAX_CLIENTS,
            dedicated: false,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            listen: false,
        }
    }
}

pub struct SessionBuilder {
    config: SessionConfig,
    clock: Box<dyn Clock>,
    host: Box<dyn HostInfo>,
    loopback: bool,
    lands: Vec<Box<dyn LandDriver>>,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            clock: Box::new(SystemClock),
            host: Box::new(StaticHostInfo::inactive()),
            loopback: true,
            lands: Vec::new(),
        }
    }

    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn host_info<H: HostInfo + 'static>(mut self, host: H) -> Self {
        self.host = Box::new(host);
        self
    }

    /// Disables the local (loopback) driver.
    pub fn without_loopback(mut self) -> Self {
        self.loopback = false;
        self
    }

    /// Adds a land driver to the datagram driver.
    pub fn land<L: LandDriver + 'static>(mut self, land: L) -> Self {
        self.lands.push(Box::new(land));
        self
    }

    /// Creates the session and initializes all its drivers.
    pub fn build(self) -> Session {
        let mut drivers: Vec<Box<dyn Driver>> = Vec::new();
        if self.loopback {
            drivers.push(Box::new(LoopbackDriver::default()));
        }
        if !self.lands.is_empty() {
            drivers.push(Box::new(DatagramDriver::new(self.lands)));
        }

        let local = usize::from(!self.config.dedicated);
        let capacity = usize::from(self.config.max_clients) + local;
        let now = self.clock.now();

        let mut session = Session {
            drivers: drivers
                .into_iter()
                .map(|driver| DriverSlot {
                    driver,
                    initialized: false,
                })
                .collect(),
            clock: self.clock,
            host: self.host,
            pool: ConnectionPool::new(capacity, now),
            hostcache: HostCache::default(),
            message: Vec::with_capacity(MAX_MESSAGE_SIZE),
            stats: NetStats::default(),
            scheduler: Scheduler::new(),
            discovery: Discovery::new(now),
            listening: false,
            net_time: now,
            config: self.config,
        };

        let dedicated = session.config.dedicated;
        for slot in session.drivers.iter_mut() {
            match slot.driver.init(dedicated) {
                Ok(()) => {
                    info!("Driver {} initialized", slot.driver.name());
                    slot.initialized = true;
                }
                Err(error) => info!("Driver {} not available: {error}", slot.driver.name()),
            }
        }

        if session.config.listen {
            session.listen(true);
        }
        session
    }
}

struct DriverSlot {
    driver: Box<dyn Driver>,
    initialized: bool,
}

/// The session layer: all connections of the local host and all drivers
/// moving their messages.
///
/// Every public operation reads the clock exactly once; the time is used
/// for all timeout checks of the operation.
pub struct Session {
    config: SessionConfig,
    drivers: Vec<DriverSlot>,
    clock: Box<dyn Clock>,
    host: Box<dyn HostInfo>,
    pool: ConnectionPool,
    hostcache: HostCache,
    message: Vec<u8>,
    stats: NetStats,
    scheduler: Scheduler<Procedure>,
    discovery: Discovery,
    listening: bool,
    net_time: Instant,
}

impl Session {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    fn update_time(&mut self) -> Instant {
        self.net_time = self.clock.now();
        self.net_time
    }

    /// Splits the session into a driver and the context it operates on.
    fn split(&mut self, driver: usize) -> (&mut dyn Driver, DriverContext<'_>) {
        let Self {
            config,
            drivers,
            clock,
            host,
            pool,
            hostcache,
            message,
            stats,
            net_time,
            ..
        } = self;

        let ctx = DriverContext {
            now: *net_time,
            driver,
            clock: &**clock,
            pool,
            hostcache,
            message,
            stats,
            host: &**host,
            max_clients: config.max_clients,
        };
        (drivers[driver].driver.as_mut(), ctx)
    }

    fn is_local(&self, driver: usize) -> bool {
        self.drivers[driver].driver.is_local()
    }

    /// Runs all due scheduled procedures. This should be called
    /// periodically, e.g. once per frame.
    pub fn poll(&mut self) {
        let now = self.update_time();
        for procedure in self.scheduler.take_due(now) {
            procedure(self);
        }
    }

    /// Schedules a procedure to be run by [`Self::poll`] after `delay`.
    pub fn schedule<F>(&mut self, delay: Duration, procedure: F)
    where
        F: FnOnce(&mut Session) + Send + 'static,
    {
        let time = self.update_time() + delay;
        self.scheduler.schedule(time, Box::new(procedure));
    }

    /// Number of procedures waiting to be run.
    pub fn scheduled_len(&self) -> usize {
        self.scheduler.len()
    }

    /// Starts or stops accepting remote connections.
    pub fn listen(&mut self, state: bool) {
        for slot in self.drivers.iter_mut().filter(|slot| slot.initialized) {
            if let Err(error) = slot.driver.listen(state) {
                warn!("Driver {} failed to listen: {error}", slot.driver.name());
            }
        }
        if self.listening != state {
            info!("Listening {}", if state { "started" } else { "stopped" });
        }
        self.listening = state;
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    fn local_slots(&self) -> u8 {
        u8::from(!self.config.dedicated)
    }

    /// Limits the number of simultaneously connected remote clients. The
    /// limit is clamped to the number of clients the session was built
    /// for. Already open connections are not affected.
    ///
    /// Returns the limit in effect.
    pub fn set_max_clients(&mut self, max_clients: u8) -> u8 {
        let local = self.local_slots();
        let limit = (self.pool.capacity() - usize::from(local)) as u8;
        let max_clients = max_clients.clamp(1, limit.max(1));
        self.config.max_clients = max_clients;
        self.pool
            .set_max_active(usize::from(max_clients) + usize::from(local));
        max_clients
    }

    pub fn max_clients(&self) -> u8 {
        let limit = self.pool.max_active() - usize::from(self.local_slots());
        limit.min(usize::from(u8::MAX)) as u8
    }

    pub fn host_port(&self) -> Option<u16> {
        self.drivers
            .iter()
            .find_map(|slot| slot.driver.host_port())
    }

    /// Changes the port on which remote connections are accepted. The
    /// accept sockets are re-opened if the session is listening.
    pub fn set_host_port(&mut self, port: u16) {
        let listening = self.listening;
        if listening {
            self.listen(false);
        }
        for slot in self.drivers.iter_mut() {
            slot.driver.set_host_port(port);
        }
        if listening {
            self.listen(true);
        }
    }

    pub fn set_host_info<H: HostInfo + 'static>(&mut self, host: H) {
        self.host = Box::new(host);
    }

    pub fn host_info(&self) -> &dyn HostInfo {
        self.host.as_ref()
    }

    /// Returns a newly accepted connection, if there is one. Remote
    /// connections are accepted only while listening.
    pub fn check_new_connections(&mut self) -> Option<ConnId> {
        self.update_time();
        for index in 0..self.drivers.len() {
            if !self.drivers[index].initialized {
                continue;
            }
            if !self.is_local(index) && !self.listening {
                continue;
            }

            let (driver, mut ctx) = self.split(index);
            if let Some(id) = driver.check_new_connections(&mut ctx) {
                return Some(id);
            }
        }
        None
    }

    /// Receives a single message from a connection. The message is
    /// available via [`Self::message`] until the next call.
    pub fn get_message(&mut self, id: ConnId) -> MessageStatus {
        let now = self.update_time();
        let Some(driver) = self.connection_driver(id) else {
            return MessageStatus::Dead;
        };

        let status = {
            let (driver, mut ctx) = self.split(driver);
            driver.get_message(&mut ctx, id)
        };
        let local = self.is_local(driver);

        match status {
            MessageStatus::NoData => {
                if local {
                    return status;
                }
                let timed_out = self.pool.get(id).map_or(false, |connection| {
                    now.saturating_duration_since(connection.last_message_time)
                        > self.config.message_timeout
                });
                if timed_out {
                    warn!("Connection {id} timed out");
                    self.close(id);
                    return MessageStatus::Dead;
                }
            }
            MessageStatus::Reliable | MessageStatus::Unreliable => {
                if !local {
                    if let Some(connection) = self.pool.get_mut(id) {
                        connection.last_message_time = now;
                    }
                    if status == MessageStatus::Reliable {
                        self.stats.messages_received += 1;
                    } else {
                        self.stats.unreliable_messages_received += 1;
                    }
                }
            }
            MessageStatus::Dead => self.close(id),
        }
        status
    }

    /// The last message received by [`Self::get_message`].
    pub fn message(&self) -> &[u8] {
        self.message.as_slice()
    }

    /// Sends a reliable message.
    ///
    /// # Panics
    ///
    /// Panics if the message is longer than [`MAX_MESSAGE_SIZE`].
    pub fn send_message(&mut self, id: ConnId, data: &[u8]) -> SendStatus {
        assert!(
            data.len() <= MAX_MESSAGE_SIZE,
            "Max message size is {} got {}.",
            MAX_MESSAGE_SIZE,
            data.len()
        );

        self.update_time();
        let Some(driver) = self.live_driver(id) else {
            self.close(id);
            return SendStatus::Dead;
        };
        if !self.drivers[driver].driver.can_send(&self.pool, id) {
            return SendStatus::Busy;
        }

        let status = {
            let (driver, mut ctx) = self.split(driver);
            driver.send_message(&mut ctx, id, data)
        };
        match status {
            SendStatus::Sent if !self.is_local(driver) => self.stats.messages_sent += 1,
            SendStatus::Dead => self.close(id),
            _ => (),
        }
        status
    }

    /// Sends an unreliable message. It might get lost, duplicated or
    /// delivered out of order.
    ///
    /// # Panics
    ///
    /// Panics if the message is longer than [`MAX_FRAGMENT_SIZE`].
    pub fn send_unreliable_message(&mut self, id: ConnId, data: &[u8]) -> SendStatus {
        assert!(
            data.len() <= MAX_FRAGMENT_SIZE,
            "Max unreliable message size is {} got {}.",
            MAX_FRAGMENT_SIZE,
            data.len()
        );

        self.update_time();
        let Some(driver) = self.live_driver(id) else {
            self.close(id);
            return SendStatus::Dead;
        };

        let status = {
            let (driver, mut ctx) = self.split(driver);
            driver.send_unreliable_message(&mut ctx, id, data)
        };
        match status {
            SendStatus::Sent if !self.is_local(driver) => {
                self.stats.unreliable_messages_sent += 1
            }
            SendStatus::Dead => self.close(id),
            _ => (),
        }
        status
    }

    /// Returns true if a reliable message can be sent right away, i.e. the
    /// connection is alive and the previous reliable message has been
    /// delivered.
    pub fn can_send_message(&mut self, id: ConnId) -> bool {
        self.update_time();
        self.live_driver(id)
            .map_or(false, |driver| self.drivers[driver].driver.can_send(&self.pool, id))
    }

    pub fn can_send_unreliable_message(&mut self, id: ConnId) -> bool {
        self.update_time();
        self.live_driver(id).is_some()
    }

    /// Closes a connection. Closing an already closed connection has no
    /// effect.
    pub fn close(&mut self, id: ConnId) {
        let Some(connection) = self.pool.get(id) else {
            return;
        };
        let driver = connection.driver;
        info!("Closing connection {id} ({})", connection.address);

        self.update_time();
        {
            let (driver, mut ctx) = self.split(driver);
            driver.close(&mut ctx, id);
        }
        self.pool.release(id);
    }

    /// Index of the driver of an open connection.
    fn connection_driver(&self, id: ConnId) -> Option<usize> {
        self.pool
            .get(id)
            .filter(|connection| !connection.disconnected)
            .map(|connection| connection.driver)
    }

    /// Index of the driver of a connection which is still alive, i.e. its
    /// peer is still reachable.
    fn live_driver(&self, id: ConnId) -> Option<usize> {
        let driver = self.connection_driver(id)?;
        self.drivers[driver]
            .driver
            .can_send_unreliable(&self.pool, id)
            .then_some(driver)
    }

    /// Human readable address of the remote peer.
    pub fn address(&self, id: ConnId) -> Option<&str> {
        self.pool.get(id).map(|connection| connection.address.as_str())
    }

    pub fn origin(&self, id: ConnId) -> Option<Origin> {
        self.pool.get(id).map(|connection| connection.origin)
    }

    /// Returns true if the connection goes through the local loopback.
    pub fn is_local_connection(&self, id: ConnId) -> bool {
        self.pool
            .get(id)
            .map_or(false, |connection| self.is_local(connection.driver))
    }

    /// Time elapsed since the connection was opened.
    pub fn connection_age(&self, id: ConnId) -> Option<Duration> {
        self.pool
            .get(id)
            .map(|connection| self.net_time.saturating_duration_since(connection.connect_time))
    }

    /// Handles of all open connections.
    pub fn connections(&self) -> Vec<ConnId> {
        self.pool.active().collect()
    }

    pub fn active_connections(&self) -> usize {
        self.pool.active_len()
    }

    pub fn free_connections(&self) -> usize {
        self.pool.free_len()
    }

    pub fn stats(&self) -> &NetStats {
        &self.stats
    }

    pub fn hostcache(&self) -> &HostCache {
        &self.hostcache
    }

    /// Closes all connections and shuts down all drivers.
    pub fn shutdown(&mut self) {
        for id in self.connections() {
            self.close(id);
        }
        for slot in self.drivers.iter_mut().filter(|slot| slot.initialized) {
            debug!("Shutting down driver {}", slot.driver.name());
            slot.driver.shutdown();
            slot.initialized = false;
        }
        self.scheduler.clear();
        self.listening = false;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

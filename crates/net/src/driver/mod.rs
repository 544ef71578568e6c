//! Transport drivers. Every connection is owned by exactly one driver, which
//! moves its datagrams.

use std::time::Instant;

use thiserror::Error;

pub(crate) use datagram::DatagramDriver;
pub(crate) use loopback::LoopbackDriver;

use crate::{
    cancellation::CancelToken,
    clock::Clock,
    host::HostInfo,
    hostcache::HostCache,
    land::LandError,
    pool::{ConnId, ConnectionPool},
    session::{MessageStatus, SendStatus},
    stats::NetStats,
};

mod datagram;
mod loopback;

/// Session state lent to a driver for the duration of a single driver call.
pub(crate) struct DriverContext<'a> {
    /// Network time of the current session operation.
    pub(crate) now: Instant,
    /// Index of the called driver.
    pub(crate) driver: usize,
    pub(crate) clock: &'a dyn Clock,
    pub(crate) pool: &'a mut ConnectionPool,
    pub(crate) hostcache: &'a mut HostCache,
    /// Buffer of the last received message.
    pub(crate) message: &'a mut Vec<u8>,
    pub(crate) stats: &'a mut NetStats,
    pub(crate) host: &'a dyn HostInfo,
    pub(crate) max_clients: u8,
}

pub(crate) trait Driver: Send {
    fn name(&self) -> &str;

    /// Returns true for the in-process loopback driver. Messages of local
    /// connections never time out and are not accounted in the statistics.
    fn is_local(&self) -> bool {
        false
    }

    fn init(&mut self, dedicated: bool) -> Result<(), DriverError>;

    fn shutdown(&mut self);

    /// Starts or stops accepting new connections.
    fn listen(&mut self, state: bool) -> Result<(), DriverError>;

    fn host_port(&self) -> Option<u16> {
        None
    }

    fn set_host_port(&mut self, _port: u16) {}

    /// Adds hosts found by the driver to the host cache.
    ///
    /// # Arguments
    ///
    /// * `transmit` - if false, only answers to previously sent queries are
    ///   collected.
    fn search_for_hosts(&mut self, ctx: &mut DriverContext, transmit: bool);

    /// Opens a connection to a host. This might block until the host
    /// responds, a time limit is reached or `cancel` is cancelled.
    fn connect(
        &mut self,
        ctx: &mut DriverContext,
        host: &str,
        cancel: &CancelToken,
    ) -> Option<ConnId>;

    /// Returns a newly accepted connection, if there is one.
    fn check_new_connections(&mut self, ctx: &mut DriverContext) -> Option<ConnId>;

    /// Receives a single message (written to [`DriverContext::message`]).
    fn get_message(&mut self, ctx: &mut DriverContext, id: ConnId) -> MessageStatus;

    /// Sends a reliable message. The connection must be able to send (see
    /// [`Self::can_send`]).
    fn send_message(&mut self, ctx: &mut DriverContext, id: ConnId, data: &[u8]) -> SendStatus;

    fn send_unreliable_message(
        &mut self,
        ctx: &mut DriverContext,
        id: ConnId,
        data: &[u8],
    ) -> SendStatus;

    /// Returns true if a reliable message might be sent over the
    /// connection.
    fn can_send(&self, pool: &ConnectionPool, id: ConnId) -> bool;

    fn can_send_unreliable(&self, pool: &ConnectionPool, id: ConnId) -> bool;

    /// Releases all driver resources of the connection. The connection
    /// itself is released by the caller.
    fn close(&mut self, ctx: &mut DriverContext, id: ConnId);
}

#[derive(Error, Debug)]
pub(crate) enum DriverError {
    #[error("driver is not available in this configuration")]
    Unavailable,
    #[error("no land driver could be initialized")]
    NoLand,
    #[error(transparent)]
    Land(#[from] LandError),
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Instant;

    use super::DriverContext;
    use crate::{
        clock::ManualClock, host::StaticHostInfo, hostcache::HostCache, pool::ConnectionPool,
        stats::NetStats,
    };

    /// Owned session state for driver tests.
    pub(crate) struct TestContext {
        pub(crate) clock: ManualClock,
        pub(crate) pool: ConnectionPool,
        pub(crate) hostcache: HostCache,
        pub(crate) message: Vec<u8>,
        pub(crate) stats: NetStats,
        pub(crate) host: StaticHostInfo,
    }

    impl TestContext {
        pub(crate) fn new(capacity: usize) -> Self {
            let clock = ManualClock::new();
            Self {
                pool: ConnectionPool::new(capacity, Instant::now()),
                clock,
                hostcache: HostCache::default(),
                message: Vec::new(),
                stats: NetStats::default(),
                host: StaticHostInfo::new("arena", "start"),
            }
        }

        pub(crate) fn ctx(&mut self, driver: usize) -> DriverContext<'_> {
            use crate::clock::Clock;

            DriverContext {
                now: self.clock.now(),
                driver,
                clock: &self.clock,
                pool: &mut self.pool,
                hostcache: &mut self.hostcache,
                message: &mut self.message,
                stats: &mut self.stats,
                host: &self.host,
                max_clients: 4,
            }
        }
    }
}

use std::collections::VecDeque;

use ahash::AHashMap;
use tracing::{debug, info, warn};

use super::{Driver, DriverContext, DriverError};
use crate::{
    cancellation::CancelToken,
    host::DEFAULT_HOST_NAME,
    hostcache::HostEntry,
    pool::{ConnId, ConnectionPool, Link, Origin, MAX_MESSAGE_SIZE},
    session::{MessageStatus, SendStatus},
};

/// Name of the local host.
pub(crate) const LOCAL_HOST: &str = "local";
const CLIENT_ADDRESS: &str = "localhost";
const SERVER_ADDRESS: &str = "LOCAL";
/// Bookkeeping bytes of every queued message (kind and length).
const MESSAGE_OVERHEAD: usize = 3;

/// In-process driver connecting the local client to the local server.
#[derive(Default)]
pub(crate) struct LoopbackDriver {
    client: Option<ConnId>,
    server: Option<ConnId>,
    /// True if the server side of the last local connection has not been
    /// returned from [`Driver::check_new_connections`] yet.
    connect_pending: bool,
    inboxes: AHashMap<ConnId, Inbox>,
}

#[derive(Default)]
struct Inbox {
    messages: VecDeque<(MessageStatus, Vec<u8>)>,
    size: usize,
}

impl Inbox {
    fn push(&mut self, status: MessageStatus, data: &[u8]) -> bool {
        let size = self.size + data.len() + MESSAGE_OVERHEAD;
        if size > MAX_MESSAGE_SIZE {
            return false;
        }
        self.size = size;
        self.messages.push_back((status, data.to_vec()));
        true
    }

    fn pop(&mut self) -> Option<(MessageStatus, Vec<u8>)> {
        let message = self.messages.pop_front()?;
        self.size -= message.1.len() + MESSAGE_OVERHEAD;
        Some(message)
    }
}

impl LoopbackDriver {
    fn peer(pool: &ConnectionPool, id: ConnId) -> Option<ConnId> {
        match pool.get(id)?.link {
            Link::Loopback { peer } => peer,
            _ => None,
        }
    }

    /// Returns the still valid `existing` connection or allocates a new
    /// one.
    fn reuse_or_allocate(
        ctx: &mut DriverContext,
        existing: Option<ConnId>,
    ) -> Option<(ConnId, bool)> {
        match existing.filter(|&id| ctx.pool.get(id).is_some()) {
            Some(id) => Some((id, false)),
            None => ctx.pool.allocate(ctx.now).map(|id| (id, true)),
        }
    }

    fn send(
        &mut self,
        ctx: &mut DriverContext,
        id: ConnId,
        data: &[u8],
        status: MessageStatus,
    ) -> SendStatus {
        let Some(peer) = Self::peer(ctx.pool, id) else {
            return SendStatus::Dead;
        };

        let inbox = self.inboxes.entry(peer).or_default();
        if !inbox.push(status, data) {
            return match status {
                MessageStatus::Reliable => SendStatus::Busy,
                _ => {
                    debug!("Loopback inbox of {peer} is full, unreliable message dropped");
                    ctx.stats.dropped_datagrams += 1;
                    SendStatus::Sent
                }
            };
        }

        if status == MessageStatus::Reliable {
            if let Some(connection) = ctx.pool.get_mut(id) {
                connection.can_send = false;
            }
        }
        SendStatus::Sent
    }
}

impl Driver for LoopbackDriver {
    fn name(&self) -> &str {
        "loopback"
    }

    fn is_local(&self) -> bool {
        true
    }

    fn init(&mut self, dedicated: bool) -> Result<(), DriverError> {
        if dedicated {
            return Err(DriverError::Unavailable);
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.client = None;
        self.server = None;
        self.connect_pending = false;
        self.inboxes.clear();
    }

    fn listen(&mut self, _state: bool) -> Result<(), DriverError> {
        Ok(())
    }

    fn search_for_hosts(&mut self, ctx: &mut DriverContext, _transmit: bool) {
        if !ctx.host.is_active() {
            return;
        }
        if ctx
            .hostcache
            .entries()
            .iter()
            .any(|entry| entry.driver() == ctx.driver)
        {
            return;
        }

        let name = match ctx.host.host_name() {
            DEFAULT_HOST_NAME => LOCAL_HOST,
            name => name,
        };
        let entry = HostEntry::new(
            name.to_owned(),
            ctx.host.level_name().to_owned(),
            LOCAL_HOST.to_owned(),
            ctx.host.players().len().min(u8::MAX as usize) as u8,
            ctx.max_clients,
        )
        .with_origin(ctx.driver, None);
        ctx.hostcache.add(entry);
    }

    fn connect(
        &mut self,
        ctx: &mut DriverContext,
        host: &str,
        _cancel: &CancelToken,
    ) -> Option<ConnId> {
        if host != LOCAL_HOST {
            return None;
        }

        let Some((client, new_client)) = Self::reuse_or_allocate(ctx, self.client) else {
            warn!("Loopback connect failed: no free connection");
            return None;
        };
        let Some((server, _)) = Self::reuse_or_allocate(ctx, self.server) else {
            warn!("Loopback connect failed: no free connection");
            if new_client {
                ctx.pool.release(client);
            }
            return None;
        };

        for (id, peer, origin, address) in [
            (client, server, Origin::Initiated, CLIENT_ADDRESS),
            (server, client, Origin::Accepted, SERVER_ADDRESS),
        ] {
            if let Some(connection) = ctx.pool.get_mut(id) {
                connection.reset(ctx.now);
                connection.open(
                    ctx.driver,
                    origin,
                    Link::Loopback { peer: Some(peer) },
                    address,
                );
            }
            self.inboxes.insert(id, Inbox::default());
        }

        self.client = Some(client);
        self.server = Some(server);
        self.connect_pending = true;
        info!("Local connection {client} <-> {server} opened");
        Some(client)
    }

    fn check_new_connections(&mut self, ctx: &mut DriverContext) -> Option<ConnId> {
        if !self.connect_pending {
            return None;
        }
        self.connect_pending = false;

        let server = self.server.filter(|&id| ctx.pool.get(id).is_some())?;
        if let Some(connection) = ctx.pool.get_mut(server) {
            connection.can_send = true;
        }
        if let Some(inbox) = self.inboxes.get_mut(&server) {
            *inbox = Inbox::default();
        }
        Some(server)
    }

    fn get_message(&mut self, ctx: &mut DriverContext, id: ConnId) -> MessageStatus {
        if ctx.pool.get(id).is_none() {
            return MessageStatus::Dead;
        }

        let Some((status, data)) = self.inboxes.get_mut(&id).and_then(Inbox::pop) else {
            return match Self::peer(ctx.pool, id) {
                Some(_) => MessageStatus::NoData,
                None => MessageStatus::Dead,
            };
        };

        ctx.message.clear();
        ctx.message.extend_from_slice(&data);

        if status == MessageStatus::Reliable {
            if let Some(peer) = Self::peer(ctx.pool, id) {
                if let Some(connection) = ctx.pool.get_mut(peer) {
                    connection.can_send = true;
                }
            }
        }
        status
    }

    fn send_message(&mut self, ctx: &mut DriverContext, id: ConnId, data: &[u8]) -> SendStatus {
        self.send(ctx, id, data, MessageStatus::Reliable)
    }

    fn send_unreliable_message(
        &mut self,
        ctx: &mut DriverContext,
        id: ConnId,
        data: &[u8],
    ) -> SendStatus {
        self.send(ctx, id, data, MessageStatus::Unreliable)
    }

    fn can_send(&self, pool: &ConnectionPool, id: ConnId) -> bool {
        Self::peer(pool, id).is_some() && pool.get(id).map_or(false, |c| c.can_send)
    }

    fn can_send_unreliable(&self, pool: &ConnectionPool, id: ConnId) -> bool {
        Self::peer(pool, id).is_some()
    }

    fn close(&mut self, ctx: &mut DriverContext, id: ConnId) {
        if let Some(peer) = Self::peer(ctx.pool, id) {
            if let Some(connection) = ctx.pool.get_mut(peer) {
                connection.link = Link::Loopback { peer: None };
            }
        }
        if let Some(connection) = ctx.pool.get_mut(id) {
            connection.link = Link::Loopback { peer: None };
            connection.can_send = true;
        }
        self.inboxes.remove(&id);

        if self.client == Some(id) {
            self.client = None;
        } else if self.server == Some(id) {
            self.server = None;
            self.connect_pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::TestContext;

    #[test]
    fn test_local_connection() {
        let mut state = TestContext::new(3);
        let mut driver = LoopbackDriver::default();
        driver.init(false).unwrap();

        let mut ctx = state.ctx(0);
        assert!(driver
            .connect(&mut ctx, "remote", &CancelToken::never())
            .is_none());
        let client = driver
            .connect(&mut ctx, LOCAL_HOST, &CancelToken::never())
            .unwrap();
        let server = driver.check_new_connections(&mut ctx).unwrap();
        assert!(driver.check_new_connections(&mut ctx).is_none());
        assert_eq!(ctx.pool.get(server).unwrap().origin, Origin::Accepted);

        assert_eq!(
            driver.send_message(&mut ctx, client, &[1, 2]),
            SendStatus::Sent
        );
        assert!(!driver.can_send(ctx.pool, client));
        assert_eq!(
            driver.send_unreliable_message(&mut ctx, client, &[3]),
            SendStatus::Sent
        );

        assert_eq!(driver.get_message(&mut ctx, server), MessageStatus::Reliable);
        assert_eq!(ctx.message.as_slice(), &[1, 2]);
        assert!(driver.can_send(ctx.pool, client));
        assert_eq!(
            driver.get_message(&mut ctx, server),
            MessageStatus::Unreliable
        );
        assert_eq!(ctx.message.as_slice(), &[3]);
        assert_eq!(driver.get_message(&mut ctx, server), MessageStatus::NoData);

        driver.close(&mut ctx, client);
        ctx.pool.release(client);
        assert_eq!(driver.get_message(&mut ctx, server), MessageStatus::Dead);
        assert_eq!(
            driver.send_message(&mut ctx, server, &[1]),
            SendStatus::Dead
        );
        assert!(!driver.can_send_unreliable(ctx.pool, server));
    }

    #[test]
    fn test_unreliable_overflow() {
        let mut state = TestContext::new(2);
        let mut driver = LoopbackDriver::default();

        let mut ctx = state.ctx(0);
        let client = driver
            .connect(&mut ctx, LOCAL_HOST, &CancelToken::never())
            .unwrap();
        let data = [0u8; 500];
        for _ in 0..20 {
            assert_eq!(
                driver.send_unreliable_message(&mut ctx, client, &data),
                SendStatus::Sent
            );
        }
        // 16 * 503 bytes fit into the inbox.
        assert_eq!(ctx.stats.dropped_datagrams, 4);
        assert_eq!(
            driver.send_message(&mut ctx, client, &[1; 200]),
            SendStatus::Busy
        );
    }

    #[test]
    fn test_search() {
        let mut state = TestContext::new(2);
        let mut driver = LoopbackDriver::default();

        let mut ctx = state.ctx(0);
        driver.search_for_hosts(&mut ctx, true);
        driver.search_for_hosts(&mut ctx, false);
        assert_eq!(ctx.hostcache.len(), 1);
        let entry = &ctx.hostcache.entries()[0];
        assert_eq!(entry.name, "arena");
        assert_eq!(entry.cname, LOCAL_HOST);
        assert_eq!(entry.max_users, 4);
        drop(ctx);

        state.hostcache.clear();
        state.host.set_active(false);
        let mut ctx = state.ctx(0);
        driver.search_for_hosts(&mut ctx, true);
        assert!(ctx.hostcache.is_empty());
    }
}

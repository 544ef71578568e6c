use std::{fmt, net::SocketAddr, time::Instant};

use tracing::trace;

use crate::land::LandSocket;

/// Maximum size of a single reliable message.
pub const MAX_MESSAGE_SIZE: usize = 8192;

const UNSET_ADDRESS: &str = "UNSET ADDRESS";

/// Handle of a connection.
///
/// Handles are generational: once a connection is closed, all its handles
/// become invalid, even after the underlying pool slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// How a connection came to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// The connection was accepted by this (listening) host.
    Accepted,
    /// The connection was opened by this host via connect.
    Initiated,
}

/// Driver specific addressing of the remote peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Link {
    Unset,
    Loopback {
        peer: Option<ConnId>,
    },
    Datagram {
        land: usize,
        socket: LandSocket,
        addr: SocketAddr,
    },
}

/// A single logical session with a peer.
pub(crate) struct Connection {
    pub(crate) address: String,
    pub(crate) driver: usize,
    pub(crate) origin: Origin,
    pub(crate) link: Link,
    pub(crate) disconnected: bool,

    pub(crate) connect_time: Instant,
    pub(crate) last_message_time: Instant,
    pub(crate) last_send_time: Instant,

    pub(crate) can_send: bool,
    /// True if a fragment of the pending message was acknowledged and the
    /// next fragment has not been sent yet.
    pub(crate) send_next: bool,
    pub(crate) ack_sequence: u32,
    pub(crate) send_sequence: u32,
    pub(crate) unreliable_send_sequence: u32,
    /// Not yet acknowledged part of the pending reliable message.
    pub(crate) send_buffer: Vec<u8>,

    pub(crate) receive_sequence: u32,
    pub(crate) unreliable_receive_sequence: u32,
    /// Fragments of a partially received reliable message.
    pub(crate) receive_buffer: Vec<u8>,
}

impl Connection {
    fn new(now: Instant) -> Self {
        Self {
            address: String::from(UNSET_ADDRESS),
            driver: 0,
            origin: Origin::Initiated,
            link: Link::Unset,
            disconnected: true,
            connect_time: now,
            last_message_time: now,
            last_send_time: now,
            can_send: true,
            send_next: false,
            ack_sequence: 0,
            send_sequence: 0,
            unreliable_send_sequence: 0,
            send_buffer: Vec::with_capacity(MAX_MESSAGE_SIZE),
            receive_sequence: 0,
            unreliable_receive_sequence: 0,
            receive_buffer: Vec::with_capacity(MAX_MESSAGE_SIZE),
        }
    }

    pub(crate) fn reset(&mut self, now: Instant) {
        self.address.clear();
        self.address.push_str(UNSET_ADDRESS);
        self.driver = 0;
        self.origin = Origin::Initiated;
        self.link = Link::Unset;
        self.disconnected = false;
        self.connect_time = now;
        self.last_message_time = now;
        self.last_send_time = now;
        self.can_send = true;
        self.send_next = false;
        self.ack_sequence = 0;
        self.send_sequence = 0;
        self.unreliable_send_sequence = 0;
        self.send_buffer.clear();
        self.receive_sequence = 0;
        self.unreliable_receive_sequence = 0;
        self.receive_buffer.clear();
    }

    /// Fills in identity of a freshly allocated connection.
    pub(crate) fn open(&mut self, driver: usize, origin: Origin, link: Link, address: &str) {
        self.driver = driver;
        self.origin = origin;
        self.link = link;
        self.address.clear();
        self.address.push_str(address);
    }
}

/// Fixed capacity arena of connections.
///
/// Every slot is either free or active. Slots are allocated in LIFO order
/// from a stack of free indices and their active set membership is tracked
/// with a position index, thus both allocation and release are O(1).
pub(crate) struct ConnectionPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    active: Vec<u32>,
    max_active: usize,
}

struct Slot {
    generation: u32,
    /// Position within the active set or None if the slot is free.
    position: Option<usize>,
    connection: Connection,
}

impl ConnectionPool {
    /// Preallocates all `capacity` connections.
    pub(crate) fn new(capacity: usize, now: Instant) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                position: None,
                connection: Connection::new(now),
            })
            .collect();
        // Reversed so that lower indices are allocated first.
        let free = (0..capacity as u32).rev().collect();

        Self {
            slots,
            free,
            active: Vec::with_capacity(capacity),
            max_active: capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn max_active(&self) -> usize {
        self.max_active
    }

    /// Limits number of simultaneously active connections. The limit is
    /// clamped to the capacity of the pool. Already active connections are
    /// not affected.
    pub(crate) fn set_max_active(&mut self, max_active: usize) {
        self.max_active = max_active.min(self.capacity());
    }

    pub(crate) fn active_len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Takes a connection from the free set, resets it and moves it to the
    /// active set. None is returned if the pool is exhausted or if the
    /// maximum number of active connections has been reached.
    pub(crate) fn allocate(&mut self, now: Instant) -> Option<ConnId> {
        if self.active.len() >= self.max_active {
            return None;
        }
        let index = self.free.pop()?;

        let slot = &mut self.slots[index as usize];
        slot.position = Some(self.active.len());
        slot.connection.reset(now);
        self.active.push(index);

        let id = ConnId {
            index,
            generation: slot.generation,
        };
        trace!("Connection {id} allocated");
        Some(id)
    }

    /// Moves a connection from the active set to the free set and marks it
    /// as disconnected. All handles of the connection become invalid.
    ///
    /// # Panics
    ///
    /// Panics if the connection is not active. This indicates a corrupted
    /// free/active partitioning.
    pub(crate) fn release(&mut self, id: ConnId) {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            panic!("Released connection {id} does not exist.");
        };
        if slot.generation != id.generation {
            panic!("Released connection {id} is not active.");
        }
        let Some(position) = slot.position.take() else {
            panic!("Released connection {id} is not active.");
        };

        slot.connection.disconnected = true;
        slot.generation = slot.generation.wrapping_add(1);

        let removed = self.active.swap_remove(position);
        debug_assert_eq!(removed, id.index);
        if let Some(&moved) = self.active.get(position) {
            self.slots[moved as usize].position = Some(position);
        }
        self.free.push(id.index);
        trace!("Connection {id} released");
    }

    /// Returns an active connection or None if the handle is no longer
    /// valid.
    pub(crate) fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.position.is_some())
            .map(|slot| &slot.connection)
    }

    pub(crate) fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.position.is_some())
            .map(|slot| &mut slot.connection)
    }

    /// Iterates over handles of all active connections.
    pub(crate) fn active(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.active.iter().map(|&index| ConnId {
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    #[cfg(test)]
    fn is_free(&self, index: u32) -> bool {
        self.free.contains(&index)
    }

    #[cfg(test)]
    fn is_active(&self, index: u32) -> bool {
        self.active.contains(&index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partitioned(pool: &ConnectionPool) {
        for index in 0..pool.capacity() as u32 {
            assert!(
                pool.is_free(index) ^ pool.is_active(index),
                "slot {index} must be either free or active"
            );
        }
        assert_eq!(pool.free_len() + pool.active_len(), pool.capacity());
    }

    #[test]
    fn test_allocate_release() {
        let now = Instant::now();
        let mut pool = ConnectionPool::new(3, now);
        assert_partitioned(&pool);

        let free_before = pool.free.clone();
        let id = pool.allocate(now).unwrap();
        assert_eq!(id.index, 0);
        assert_partitioned(&pool);

        let connection = pool.get(id).unwrap();
        assert!(!connection.disconnected);
        assert!(connection.can_send);
        assert_eq!(connection.address, UNSET_ADDRESS);
        assert_eq!(connection.send_sequence, 0);
        assert_eq!(connection.connect_time, now);

        pool.release(id);
        assert_partitioned(&pool);
        assert_eq!(pool.free, free_before);
        assert!(pool.get(id).is_none());

        // The same slot is reused but the old handle stays invalid.
        let again = pool.allocate(now).unwrap();
        assert_eq!(again.index, id.index);
        assert_ne!(again, id);
        assert!(pool.get(id).is_none());
        assert!(pool.get(again).is_some());
    }

    #[test]
    fn test_exhaustion() {
        let now = Instant::now();
        // 4 clients + 1 local.
        let mut pool = ConnectionPool::new(5, now);

        let ids: Vec<ConnId> = (0..5).map(|_| pool.allocate(now).unwrap()).collect();
        assert!(pool.allocate(now).is_none());
        assert_partitioned(&pool);

        pool.release(ids[2]);
        assert_partitioned(&pool);
        let replacement = pool.allocate(now).unwrap();
        assert_eq!(replacement.index, ids[2].index);
        assert!(pool.allocate(now).is_none());

        // Middle removal keeps position index consistent.
        pool.release(ids[0]);
        pool.release(ids[4]);
        pool.release(replacement);
        assert_partitioned(&pool);
        let mut active: Vec<ConnId> = pool.active().collect();
        active.sort_by_key(|id| id.index);
        assert_eq!(active, vec![ids[1], ids[3]]);
    }

    #[test]
    fn test_max_active() {
        let now = Instant::now();
        let mut pool = ConnectionPool::new(4, now);
        pool.set_max_active(2);
        assert!(pool.allocate(now).is_some());
        assert!(pool.allocate(now).is_some());
        assert!(pool.allocate(now).is_none());

        pool.set_max_active(100);
        assert_eq!(pool.max_active(), 4);
        assert!(pool.allocate(now).is_some());
    }

    #[test]
    #[should_panic(expected = "is not active")]
    fn test_double_release() {
        let now = Instant::now();
        let mut pool = ConnectionPool::new(2, now);
        let id = pool.allocate(now).unwrap();
        pool.release(id);
        pool.release(id);
    }
}

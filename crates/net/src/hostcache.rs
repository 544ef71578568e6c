use std::{fmt, net::SocketAddr};

use tracing::debug;

/// Maximum number of hosts remembered by a single discovery.
pub const HOSTCACHE_SIZE: usize = 8;

const MAX_NAME_LEN: usize = 15;

/// A host found by discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostEntry {
    /// Display name of the host, unique within the cache.
    pub name: String,
    pub map: String,
    /// Address to be used for connecting to the host.
    pub cname: String,
    pub users: u8,
    pub max_users: u8,
    /// Index of the driver which found the host.
    pub(crate) driver: usize,
    pub(crate) addr: Option<SocketAddr>,
}

impl HostEntry {
    pub(crate) fn new(name: String, map: String, cname: String, users: u8, max_users: u8) -> Self {
        Self {
            name,
            map,
            cname,
            users,
            max_users,
            driver: 0,
            addr: None,
        }
    }

    pub(crate) fn with_origin(mut self, driver: usize, addr: Option<SocketAddr>) -> Self {
        self.driver = driver;
        self.addr = addr;
        self
    }

    pub fn driver(&self) -> usize {
        self.driver
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }
}

impl fmt::Display for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<15} {:<15} {:>2}/{:>2}",
            self.name, self.map, self.users, self.max_users
        )
    }
}

/// Bounded list of hosts found by discovery.
#[derive(Default)]
pub struct HostCache {
    entries: Vec<HostEntry>,
}

impl HostCache {
    pub fn entries(&self) -> &[HostEntry] {
        self.entries.as_slice()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= HOSTCACHE_SIZE
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Returns true if a host with the address is already cached.
    pub(crate) fn contains_addr(&self, addr: SocketAddr) -> bool {
        self.entries.iter().any(|entry| entry.addr == Some(addr))
    }

    /// Returns true if a host with the (case-sensitive) name is cached.
    pub(crate) fn contains_name(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.name == name)
    }

    /// Appends a host to the cache.
    ///
    /// The entry is dropped if the cache is full or if a host with the same
    /// address is already cached. The name of the entry is altered while it
    /// conflicts with a name of a cached host.
    ///
    /// Returns true if the entry was added.
    pub(crate) fn add(&mut self, mut entry: HostEntry) -> bool {
        if self.is_full() {
            debug!("Host cache is full, {} dropped", entry.name);
            return false;
        }
        if let Some(addr) = entry.addr {
            if self.contains_addr(addr) {
                return false;
            }
        }

        while self.contains_name(&entry.name) {
            bump_name(&mut entry.name);
        }
        self.entries.push(entry);
        true
    }

    /// Returns connect address of a host with the given display name. The
    /// name is matched case-insensitively.
    pub fn cname_of(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
            .map(|entry| entry.cname.as_str())
    }
}

/// Makes a name different by appending a digit or by incrementing its last
/// character.
fn bump_name(name: &mut String) {
    let len = name.chars().count();
    match name.pop() {
        Some(last) if len < MAX_NAME_LEN && last > '8' => {
            name.push(last);
            name.push('0');
        }
        Some(last) => {
            let next = char::from_u32(last as u32 + 1).unwrap_or('0');
            name.push(next);
        }
        None => name.push('0'),
    }
}

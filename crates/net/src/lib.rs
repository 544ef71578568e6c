//! Session layer of the Arena network stack.
//!
//! A [`Session`] owns a fixed pool of connections and a set of drivers
//! which move their messages: a loopback driver connecting the local
//! client with the local server and a datagram driver implementing a
//! reliable protocol on top of unreliable datagram transports
//! ([`LandDriver`]).
//!
//! The session is driven from a single thread. Connecting and
//! [`Session::send_to_all`] block the calling thread; everything else
//! returns right away.

pub use cancellation::{cancellation, CancelHandle, CancelToken};
pub use clock::{Clock, ManualClock, SystemClock};
pub use control::{PlayerInfo, Rule, ServerInfo, GAME_ID, PROTOCOL_VERSION};
pub use header::{MAX_DATAGRAM_SIZE, MAX_FRAGMENT_SIZE};
pub use host::{HostInfo, StaticHostInfo, DEFAULT_HOST_NAME};
pub use hostcache::{HostCache, HostEntry, HOSTCACHE_SIZE};
pub use land::{
    LandDriver, LandError, LandSocket, MemoryLand, MemoryNetwork, UdpLand, DEFAULT_HOST_PORT,
};
pub use pool::{ConnId, Origin, MAX_MESSAGE_SIZE};
pub use session::{
    MessageStatus, SendStatus, Session, SessionBuilder, SessionConfig, DEFAULT_MAX_CLIENTS,
    DEFAULT_MESSAGE_TIMEOUT, DISCOVERY_BUDGET,
};
pub use stats::NetStats;

mod cancellation;
mod clock;
mod control;
mod driver;
mod header;
mod host;
mod hostcache;
mod land;
mod pool;
mod protocol;
mod scheduler;
mod session;
mod stats;

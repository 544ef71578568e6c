//! Host discovery and connecting by host name.

use std::{
    thread,
    time::{Duration, Instant},
};

use tracing::{info, warn};

use super::Session;
use crate::{cancellation::CancelToken, pool::ConnId};

const LOCAL_HOST: &str = "local";

/// Server info requests are re-broadcast after this interval...
const SEND_INTERVAL: Duration = Duration::from_millis(750);
/// ...while less than this time passed since the start of the discovery.
const SEND_WINDOW: Duration = Duration::from_millis(500);
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);
/// Replies are collected for this long.
const DISCOVERY_DURATION: Duration = Duration::from_millis(1500);
/// Maximum time a connect call waits for a discovery to finish.
pub const DISCOVERY_BUDGET: Duration = Duration::from_secs(2);
const WAIT_INTERVAL: Duration = Duration::from_millis(1);

pub(super) struct Discovery {
    in_progress: bool,
    /// Silent discoveries do not log found hosts.
    silent: bool,
    include_local: bool,
    start: Instant,
    /// Stale procedures of previous discoveries do nothing.
    generation: u64,
    /// Number of already reported hosts.
    reported: usize,
}

impl Discovery {
    pub(super) fn new(now: Instant) -> Self {
        Self {
            in_progress: false,
            silent: false,
            include_local: true,
            start: now,
            generation: 0,
            reported: 0,
        }
    }
}

impl Session {
    /// Starts a discovery of hosts on the local network (and the local host
    /// if `include_local` is true). Found hosts are logged and available
    /// via [`Self::hostcache`] once the discovery finishes.
    ///
    /// Nothing happens if a discovery is already in progress.
    pub fn start_discovery(&mut self, include_local: bool) {
        if self.discovery.in_progress {
            return;
        }
        self.discovery.include_local = include_local;
        self.start_search(false);
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.in_progress
    }

    fn start_search(&mut self, silent: bool) {
        if self.discovery.in_progress {
            return;
        }

        let start = self.update_time();
        self.discovery.in_progress = true;
        self.discovery.silent = silent;
        self.discovery.start = start;
        self.discovery.reported = 0;
        self.hostcache.clear();

        if !silent {
            info!("Looking for hosts...");
        }

        let generation = self.discovery.generation;
        self.schedule(Duration::ZERO, move |session| {
            session.send_probes(generation)
        });
        self.schedule(COLLECT_INTERVAL, move |session| {
            session.collect_replies(generation)
        });
    }

    fn finish_search(&mut self) {
        self.discovery.in_progress = false;
        self.discovery.silent = false;
        self.discovery.include_local = true;
        self.discovery.generation = self.discovery.generation.wrapping_add(1);
    }

    fn search_drivers(&self) -> Vec<usize> {
        (0..self.drivers.len())
            .filter(|&index| self.drivers[index].initialized)
            .filter(|&index| self.discovery.include_local || !self.is_local(index))
            .collect()
    }

    fn send_probes(&mut self, generation: u64) {
        if !self.discovery.in_progress || self.discovery.generation != generation {
            return;
        }

        for index in self.search_drivers() {
            let (driver, mut ctx) = self.split(index);
            driver.search_for_hosts(&mut ctx, true);
        }

        if self.net_time.saturating_duration_since(self.discovery.start) < SEND_WINDOW {
            self.schedule(SEND_INTERVAL, move |session| {
                session.send_probes(generation)
            });
        }
    }

    fn collect_replies(&mut self, generation: u64) {
        if !self.discovery.in_progress || self.discovery.generation != generation {
            return;
        }

        for index in self.search_drivers() {
            let (driver, mut ctx) = self.split(index);
            driver.search_for_hosts(&mut ctx, false);
        }

        if !self.discovery.silent {
            for entry in &self.hostcache.entries()[self.discovery.reported..] {
                info!("{entry}");
            }
            self.discovery.reported = self.hostcache.len();
        }

        if self.net_time.saturating_duration_since(self.discovery.start) < DISCOVERY_DURATION {
            self.schedule(COLLECT_INTERVAL, move |session| {
                session.collect_replies(generation)
            });
            return;
        }

        if !self.discovery.silent {
            if self.hostcache.is_empty() {
                info!("No hosts found");
            } else {
                info!("{} host(s) found", self.hostcache.len());
            }
        }
        self.finish_search();
    }

    /// Opens a connection to a host, see [`Self::connect_with_cancel`].
    pub fn connect(&mut self, host: Option<&str>) -> Option<ConnId> {
        self.connect_with_cancel(host, &CancelToken::never())
    }

    /// Opens a connection to a host.
    ///
    /// This blocks until the connection is established or all drivers
    /// failed to connect.
    ///
    /// # Arguments
    ///
    /// * `host` - `"local"` connects to the local host, a name of a host
    ///   found by the last discovery connects to that host, anything else is
    ///   resolved as an address by the drivers. Unless the host is local or
    ///   already known, a silent discovery is run first. If `host` is None,
    ///   the discovery must find exactly one host which is then connected.
    ///
    /// * `cancel` - aborts both the discovery and the connecting.
    pub fn connect_with_cancel(
        &mut self,
        host: Option<&str>,
        cancel: &CancelToken,
    ) -> Option<ConnId> {
        self.update_time();
        let host = host.map(str::trim).filter(|host| !host.is_empty());

        if let Some(host) = host {
            if host.eq_ignore_ascii_case(LOCAL_HOST) {
                return self.connect_drivers(LOCAL_HOST, true, cancel);
            }
            if let Some(cname) = self.hostcache.cname_of(host) {
                let cname = cname.to_owned();
                return self.connect_drivers(&cname, false, cancel);
            }
        }

        self.start_search(host.is_some());
        let deadline = self.net_time + DISCOVERY_BUDGET;
        while self.discovery.in_progress {
            if cancel.cancelled() {
                info!("Connecting cancelled");
                self.finish_search();
                return None;
            }
            if self.clock.now() >= deadline {
                warn!("Host discovery did not finish in time");
                self.finish_search();
                break;
            }
            self.poll();
            thread::sleep(WAIT_INTERVAL);
        }

        let host = match host {
            Some(host) => self
                .hostcache
                .cname_of(host)
                .unwrap_or(host)
                .to_owned(),
            None => {
                let [entry] = self.hostcache.entries() else {
                    info!(
                        "Exactly one host must be found to connect, found {}",
                        self.hostcache.len()
                    );
                    self.log_hostcache();
                    return None;
                };
                info!("Connecting to {} @ {}", entry.name, entry.cname);
                entry.cname.clone()
            }
        };

        self.connect_drivers(&host, false, cancel)
    }

    fn connect_drivers(
        &mut self,
        host: &str,
        local_only: bool,
        cancel: &CancelToken,
    ) -> Option<ConnId> {
        self.update_time();
        for index in 0..self.drivers.len() {
            if !self.drivers[index].initialized || (local_only && !self.is_local(index)) {
                continue;
            }
            if cancel.cancelled() {
                info!("Connecting to {host} cancelled");
                return None;
            }

            let (driver, mut ctx) = self.split(index);
            if let Some(id) = driver.connect(&mut ctx, host, cancel) {
                info!("Connected to {host} as {id}");
                return Some(id);
            }
        }

        warn!("Failed to connect to {host}");
        self.log_hostcache();
        None
    }

    fn log_hostcache(&self) {
        if self.hostcache.is_empty() {
            return;
        }
        info!("Known hosts:");
        for entry in self.hostcache.entries() {
            info!("{entry}");
        }
    }
}

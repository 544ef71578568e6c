use std::{thread, time::Duration};

use ar_conf::NetworkConf;
use ar_net::{
    ConnId, MessageStatus, Origin, PlayerInfo, SendStatus, Session, SessionConfig,
    StaticHostInfo, UdpLand,
};
use async_std::channel::{Receiver, TryRecvError};
use tracing::{debug, info, warn};

use crate::console::{parse_line, Command};

const TICK: Duration = Duration::from_millis(10);
const LEVEL_NAME: &str = "start";
/// Maximum time a chat message relay waits for acknowledgments of all
/// clients.
const RELAY_TIME_LIMIT: Duration = Duration::from_secs(2);

/// A game host: a server accepting clients and optionally a local client
/// connected to a (local or remote) server.
pub(crate) struct Host {
    session: Session,
    host_name: String,
    /// Connection of the local client to its server.
    client: Option<ConnId>,
    /// Connections of clients to this server.
    peers: Vec<ConnId>,
}

impl Host {
    pub(crate) fn new(conf: &NetworkConf) -> Self {
        let session = Session::builder(SessionConfig {
            max_clients: conf.max_clients(),
            dedicated: conf.dedicated(),
            message_timeout: conf.message_timeout(),
            listen: conf.listen(),
        })
        .host_info(StaticHostInfo::new(conf.host_name(), LEVEL_NAME))
        .land(UdpLand::new(conf.bind(), conf.host_port()))
        .build();

        Self::with_session(session, conf.host_name())
    }

    fn with_session(session: Session, host_name: &str) -> Self {
        Self {
            session,
            host_name: host_name.to_owned(),
            client: None,
            peers: Vec::new(),
        }
    }

    /// Runs the host until the quit command is received.
    pub(crate) fn run(mut self, commands: Receiver<String>) {
        loop {
            match commands.try_recv() {
                Ok(line) => {
                    if !self.execute(&line) {
                        break;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => (),
            }

            self.tick();
            thread::sleep(TICK);
        }
        self.session.shutdown();
    }

    /// Executes a single console line. Returns false if the host should
    /// quit.
    fn execute(&mut self, line: &str) -> bool {
        let command = match parse_line(line) {
            Ok(Some(command)) => command,
            Ok(None) => return true,
            Err(error) => {
                println!("{error}");
                return true;
            }
        };

        match command {
            Command::Listen { state } => match state {
                Some(state) => self.session.listen(state == 1),
                None => println!("\"listen\" is \"{}\"", u8::from(self.session.is_listening())),
            },
            Command::Maxplayers { max_clients } => match max_clients {
                Some(max_clients) => {
                    let max_clients = self.session.set_max_clients(max_clients);
                    println!("\"maxplayers\" set to {max_clients}");
                    self.update_host_info();
                }
                None => println!("\"maxplayers\" is \"{}\"", self.session.max_clients()),
            },
            Command::Port { port } => match port {
                Some(port) => self.session.set_host_port(port),
                None => match self.session.host_port() {
                    Some(port) => println!("\"port\" is \"{port}\""),
                    None => println!("No network driver available"),
                },
            },
            Command::Slist => self.session.start_discovery(true),
            Command::Connect { host } => {
                self.disconnect();
                self.client = self.session.connect(host.as_deref());
            }
            Command::Close => self.disconnect(),
            Command::Say { words } => self.say(&words.join(" ")),
            Command::NetStats => self.print_stats(),
            Command::Quit => return false,
        }
        true
    }

    fn tick(&mut self) {
        self.session.poll();

        let mut changed = false;
        while let Some(id) = self.session.check_new_connections() {
            // A reopened local connection keeps its server side.
            if self.peers.contains(&id) {
                debug!("Client {id} reconnected");
                continue;
            }
            info!(
                "Client {} connected",
                self.session.address(id).unwrap_or_default()
            );
            self.peers.push(id);
            changed = true;
        }

        let mut chat = Vec::new();
        let session = &mut self.session;
        self.peers.retain(|&id| loop {
            match session.get_message(id) {
                MessageStatus::NoData => break true,
                MessageStatus::Dead => {
                    info!("Client {id} disconnected");
                    changed = true;
                    break false;
                }
                MessageStatus::Reliable => {
                    let text = String::from_utf8_lossy(session.message()).into_owned();
                    chat.push(format!("{}: {text}", session.address(id).unwrap_or_default()));
                }
                MessageStatus::Unreliable => (),
            }
        });

        if let Some(id) = self.client {
            loop {
                match self.session.get_message(id) {
                    MessageStatus::NoData => break,
                    MessageStatus::Dead => {
                        info!("Connection to the server lost");
                        self.client = None;
                        break;
                    }
                    MessageStatus::Reliable => {
                        println!("{}", String::from_utf8_lossy(self.session.message()))
                    }
                    MessageStatus::Unreliable => (),
                }
            }
        }

        for text in chat {
            self.relay(text.as_bytes());
        }
        if changed {
            self.update_host_info();
        }
    }

    fn say(&mut self, text: &str) {
        match self.client {
            Some(id) => match self.session.send_message(id, text.as_bytes()) {
                SendStatus::Sent => (),
                SendStatus::Busy => warn!("Previous message not delivered yet, try again"),
                SendStatus::Dead => {
                    info!("Connection to the server lost");
                    self.client = None;
                }
            },
            None => self.relay(format!("{}: {text}", self.host_name).as_bytes()),
        }
    }

    /// Sends a chat message to all connected clients.
    fn relay(&mut self, text: &[u8]) {
        let text = &text[..text.len().min(ar_net::MAX_MESSAGE_SIZE)];
        let failed = self.session.send_to_all(text, RELAY_TIME_LIMIT);
        if failed > 0 {
            warn!("Chat message not delivered to {failed} client(s)");
        }
    }

    fn disconnect(&mut self) {
        if let Some(id) = self.client.take() {
            self.session.close(id);
        }
    }

    /// Publishes the currently connected players to server queries.
    fn update_host_info(&mut self) {
        let mut info = StaticHostInfo::new(self.host_name.as_str(), LEVEL_NAME);
        for (number, &id) in self.peers.iter().enumerate() {
            if self.session.origin(id) != Some(Origin::Accepted) {
                continue;
            }
            let address = self.session.address(id).unwrap_or_default().to_owned();
            info = info.with_player(PlayerInfo {
                number: number.min(u8::MAX as usize) as u8,
                name: address.clone(),
                colors: 0,
                frags: 0,
                connect_secs: self
                    .session
                    .connection_age(id)
                    .map_or(0, |age| age.as_secs().min(u32::MAX as u64) as u32),
                address,
            });
        }
        self.session.set_host_info(info);
    }

    fn print_stats(&self) {
        println!("{}", self.session.stats());
        println!(
            "connections: {} active, {} free",
            self.session.active_connections(),
            self.session.free_connections()
        );
        for id in self.session.connections() {
            let age = self
                .session
                .connection_age(id)
                .unwrap_or_default()
                .as_secs();
            println!(
                "{id} {:?} {} ({age} s)",
                self.session.origin(id).unwrap_or(Origin::Initiated),
                self.session.address(id).unwrap_or_default()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use ar_net::HostInfo;

    use super::*;

    fn local_host() -> Host {
        let session = Session::builder(SessionConfig::default())
            .host_info(StaticHostInfo::new("arena", LEVEL_NAME))
            .build();
        Host::with_session(session, "arena")
    }

    #[test]
    fn test_local_reconnect() {
        let mut host = local_host();

        assert!(host.execute("connect local"));
        host.tick();
        assert!(host.client.is_some());
        assert_eq!(host.peers.len(), 1);
        assert_eq!(host.session.host_info().players().len(), 1);

        assert!(host.execute("connect local"));
        host.tick();
        assert!(host.client.is_some());
        assert_eq!(host.peers.len(), 1);
        assert_eq!(host.session.host_info().players().len(), 1);

        assert!(host.execute("close"));
        host.tick();
        assert!(host.client.is_none());
        assert!(host.peers.is_empty());
        assert!(host.session.host_info().players().is_empty());
        assert!(!host.execute("quit"));
    }
}

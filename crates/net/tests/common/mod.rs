use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use ar_net::{ConnId, MessageStatus, NetStats, Session};

/// Session running in a background thread. Every reliable message received
/// from a remote peer is echoed back to it.
pub struct EchoServer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<EchoReport>,
}

pub struct EchoReport {
    pub received: Vec<Vec<u8>>,
    pub accepted: usize,
    pub stats: NetStats,
}

impl EchoServer {
    pub fn spawn(mut session: Session) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stopped = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let mut peers: Vec<(ConnId, VecDeque<Vec<u8>>)> = Vec::new();
            let mut received = Vec::new();
            let mut accepted = 0;

            while !stopped.load(Ordering::Relaxed) {
                session.poll();
                while let Some(id) = session.check_new_connections() {
                    accepted += 1;
                    peers.push((id, VecDeque::new()));
                }

                peers.retain_mut(|(id, outgoing)| {
                    loop {
                        match session.get_message(*id) {
                            MessageStatus::Dead => return false,
                            MessageStatus::NoData => break,
                            MessageStatus::Reliable => {
                                received.push(session.message().to_vec());
                                outgoing.push_back(session.message().to_vec());
                            }
                            MessageStatus::Unreliable => (),
                        }
                    }

                    if !outgoing.is_empty() && session.can_send_message(*id) {
                        if let Some(message) = outgoing.pop_front() {
                            session.send_message(*id, &message);
                        }
                    }
                    true
                });

                thread::sleep(Duration::from_millis(1));
            }

            EchoReport {
                received,
                accepted,
                stats: session.stats().clone(),
            }
        });

        Self { stop, handle }
    }

    pub fn stop(self) -> EchoReport {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().unwrap()
    }
}

/// Receives messages until a reliable one arrives.
pub fn wait_for_reliable(session: &mut Session, id: ConnId) -> Vec<u8> {
    loop {
        match session.get_message(id) {
            MessageStatus::Reliable => return session.message().to_vec(),
            MessageStatus::Dead => panic!("Connection {id} died."),
            _ => thread::sleep(Duration::from_millis(1)),
        }
    }
}

/// Receives (and discards) messages until a reliable message can be sent.
pub fn wait_for_send(session: &mut Session, id: ConnId) {
    while !session.can_send_message(id) {
        assert_ne!(session.get_message(id), MessageStatus::Dead);
        thread::sleep(Duration::from_millis(1));
    }
}

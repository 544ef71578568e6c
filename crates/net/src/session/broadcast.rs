use std::{thread, time::Duration};

use tracing::{debug, warn};

use super::{MessageStatus, SendStatus, Session};
use crate::pool::{ConnId, Origin};

const ROUND_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Waiting until the message can be sent.
    Sending,
    /// Sent, waiting until it is acknowledged.
    Flushing,
    Done,
    /// The connection died.
    Failed,
}

impl Session {
    /// Reliably sends a message to all accepted connections and waits until
    /// it is delivered to all of them or `time_limit` elapses.
    ///
    /// Messages received from the peers in the meantime are drained and
    /// discarded. Local connections are sent to without waiting.
    ///
    /// Returns the number of peers which did not acknowledge the message in
    /// time (including the peers whose connection died).
    pub fn send_to_all(&mut self, data: &[u8], time_limit: Duration) -> usize {
        let start = self.update_time();

        let mut peers: Vec<(ConnId, Phase)> = Vec::new();
        for id in self.connections() {
            if self.origin(id) != Some(Origin::Accepted) {
                continue;
            }
            if self.is_local_connection(id) {
                if self.send_message(id, data) != SendStatus::Sent {
                    warn!("Failed to send a message to local connection {id}");
                }
                continue;
            }
            peers.push((id, Phase::Sending));
        }

        loop {
            for (id, phase) in peers.iter_mut() {
                *phase = self.advance(*id, *phase, data);
            }

            let pending = peers
                .iter()
                .filter(|(_, phase)| matches!(phase, Phase::Sending | Phase::Flushing))
                .count();
            if pending == 0 {
                break;
            }
            if self.clock.now().saturating_duration_since(start) > time_limit {
                debug!("Send to all timed out with {pending} pending peer(s)");
                break;
            }
            thread::sleep(ROUND_INTERVAL);
        }

        peers
            .iter()
            .filter(|(_, phase)| *phase != Phase::Done)
            .count()
    }

    fn advance(&mut self, id: ConnId, phase: Phase, data: &[u8]) -> Phase {
        if !matches!(phase, Phase::Sending | Phase::Flushing) {
            return phase;
        }
        if self.pool.get(id).is_none() {
            return Phase::Failed;
        }

        if self.can_send_message(id) {
            return match phase {
                Phase::Sending => match self.send_message(id, data) {
                    SendStatus::Sent => Phase::Flushing,
                    SendStatus::Busy => Phase::Sending,
                    SendStatus::Dead => Phase::Failed,
                },
                _ => Phase::Done,
            };
        }

        // Acknowledgments are processed only while receiving.
        match self.get_message(id) {
            MessageStatus::Dead => Phase::Failed,
            _ => phase,
        }
    }
}

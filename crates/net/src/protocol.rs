//! Reliable message protocol of a single connection.
//!
//! At most one reliable message is in flight in each direction. The message
//! is split into fragments, each fragment consumes one sequence number and
//! only a single fragment is outstanding at any time: the next fragment is
//! sent once the previous one is acknowledged.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    header::{DatagramHeader, HeaderError, HEADER_SIZE, MAX_DATAGRAM_SIZE, MAX_FRAGMENT_SIZE},
    land::LandError,
    pool::{Connection, MAX_MESSAGE_SIZE},
    stats::NetStats,
};

/// An unacknowledged fragment is re-sent after this time.
pub(crate) const RESEND_INTERVAL: Duration = Duration::from_secs(1);

/// Destination of outgoing datagrams of a connection.
pub(crate) trait DatagramSink {
    fn transmit(&mut self, datagram: &[u8]) -> Result<(), LandError>;
}

/// A complete message was received and written to the message buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Received {
    Reliable,
    Unreliable,
}

impl Connection {
    /// Starts sending of a reliable message.
    ///
    /// # Panics
    ///
    /// * Panics if a reliable message is still waiting for acknowledgment.
    ///
    /// * Panics if `data` is longer than [`MAX_MESSAGE_SIZE`].
    pub(crate) fn send_reliable<S: DatagramSink>(
        &mut self,
        now: Instant,
        data: &[u8],
        sink: &mut S,
        stats: &mut NetStats,
    ) -> Result<(), LandError> {
        assert!(self.can_send, "A reliable message is already in flight.");
        assert!(
            data.len() <= MAX_MESSAGE_SIZE,
            "Max message size is {} got {}.",
            MAX_MESSAGE_SIZE,
            data.len()
        );

        self.send_buffer.clear();
        self.send_buffer.extend_from_slice(data);
        self.can_send = false;

        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.transmit_fragment(now, sequence, sink)?;
        stats.packets_sent += 1;
        Ok(())
    }

    /// Sends the next fragment of the pending message after the previous
    /// fragment got acknowledged.
    pub(crate) fn send_next_fragment<S: DatagramSink>(
        &mut self,
        now: Instant,
        sink: &mut S,
        stats: &mut NetStats,
    ) -> Result<(), LandError> {
        self.send_next = false;
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.transmit_fragment(now, sequence, sink)?;
        stats.packets_sent += 1;
        Ok(())
    }

    /// Re-sends the outstanding fragment if it has not been acknowledged for
    /// [`RESEND_INTERVAL`].
    pub(crate) fn resend_if_due<S: DatagramSink>(
        &mut self,
        now: Instant,
        sink: &mut S,
        stats: &mut NetStats,
    ) -> Result<(), LandError> {
        if self.can_send || self.send_next {
            return Ok(());
        }
        if now.saturating_duration_since(self.last_send_time) <= RESEND_INTERVAL {
            return Ok(());
        }

        let sequence = self.send_sequence.wrapping_sub(1);
        debug!("Re-sending fragment {sequence} to {}", self.address);
        self.transmit_fragment(now, sequence, sink)?;
        stats.packets_resent += 1;
        Ok(())
    }

    /// Sends a single unreliable datagram.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than [`MAX_FRAGMENT_SIZE`].
    pub(crate) fn send_unreliable<S: DatagramSink>(
        &mut self,
        data: &[u8],
        sink: &mut S,
        stats: &mut NetStats,
    ) -> Result<(), LandError> {
        assert!(
            data.len() <= MAX_FRAGMENT_SIZE,
            "Max unreliable message size is {} got {}.",
            MAX_FRAGMENT_SIZE,
            data.len()
        );

        let mut datagram = [0u8; MAX_DATAGRAM_SIZE];
        let len = HEADER_SIZE + data.len();
        datagram[HEADER_SIZE..len].copy_from_slice(data);
        DatagramHeader::Unreliable(self.unreliable_send_sequence).write(&mut datagram, len);
        self.unreliable_send_sequence = self.unreliable_send_sequence.wrapping_add(1);

        sink.transmit(&datagram[..len])?;
        stats.packets_sent += 1;
        Ok(())
    }

    /// Processes a single datagram received from the peer.
    ///
    /// Data fragments are always acknowledged, even duplicates, since the
    /// previous acknowledgment might have been lost.
    ///
    /// # Arguments
    ///
    /// * `message` - complete received messages are written to this buffer.
    ///
    /// # Returns
    ///
    /// Returns `Some` if a complete message was written to `message`.
    pub(crate) fn process<S: DatagramSink>(
        &mut self,
        datagram: &[u8],
        sink: &mut S,
        stats: &mut NetStats,
        message: &mut Vec<u8>,
    ) -> Result<Option<Received>, ProtocolError> {
        let header = DatagramHeader::read(datagram)?;
        trace!("Received datagram {header} from {}", self.address);
        let payload = &datagram[header.size()..];

        match header {
            DatagramHeader::Control => {
                debug!("Control datagram from {} ignored", self.address);
                Ok(None)
            }
            DatagramHeader::Nak(_) => Ok(None),
            DatagramHeader::Ack(sequence) => {
                self.acknowledged(sequence);
                Ok(None)
            }
            DatagramHeader::Unreliable(sequence) => {
                self.unreliable_received(sequence, stats);
                message.clear();
                message.extend_from_slice(payload);
                Ok(Some(Received::Unreliable))
            }
            DatagramHeader::Data { sequence, eom } => {
                let mut ack = [0u8; HEADER_SIZE];
                DatagramHeader::Ack(sequence).write(&mut ack, HEADER_SIZE);
                sink.transmit(&ack)?;

                if sequence != self.receive_sequence {
                    debug!(
                        "Duplicate fragment {sequence} from {} (expected {})",
                        self.address, self.receive_sequence
                    );
                    stats.received_duplicate_count += 1;
                    return Ok(None);
                }
                self.receive_sequence = self.receive_sequence.wrapping_add(1);

                let len = self.receive_buffer.len() + payload.len();
                if len > MAX_MESSAGE_SIZE {
                    return Err(ProtocolError::Oversized(len));
                }

                if eom {
                    message.clear();
                    message.extend_from_slice(&self.receive_buffer);
                    message.extend_from_slice(payload);
                    self.receive_buffer.clear();
                    Ok(Some(Received::Reliable))
                } else {
                    self.receive_buffer.extend_from_slice(payload);
                    Ok(None)
                }
            }
        }
    }

    fn acknowledged(&mut self, sequence: u32) {
        if sequence != self.send_sequence.wrapping_sub(1) {
            debug!("Stale ack {sequence} from {}", self.address);
            return;
        }
        if sequence != self.ack_sequence {
            debug!("Duplicate ack {sequence} from {}", self.address);
            return;
        }
        self.ack_sequence = self.ack_sequence.wrapping_add(1);

        let fragment = self.send_buffer.len().min(MAX_FRAGMENT_SIZE);
        self.send_buffer.drain(..fragment);
        if self.send_buffer.is_empty() {
            self.can_send = true;
        } else {
            self.send_next = true;
        }
    }

    fn unreliable_received(&mut self, sequence: u32, stats: &mut NetStats) {
        let expected = self.unreliable_receive_sequence;
        if sequence < expected {
            debug!(
                "Out of order unreliable datagram {sequence} from {} (expected {expected})",
                self.address
            );
            return;
        }
        if sequence > expected {
            stats.dropped_datagrams += u64::from(sequence - expected);
        }
        self.unreliable_receive_sequence = sequence.wrapping_add(1);
    }

    fn transmit_fragment<S: DatagramSink>(
        &mut self,
        now: Instant,
        sequence: u32,
        sink: &mut S,
    ) -> Result<(), LandError> {
        let (len, eom) = if self.send_buffer.len() <= MAX_FRAGMENT_SIZE {
            (self.send_buffer.len(), true)
        } else {
            (MAX_FRAGMENT_SIZE, false)
        };

        let mut datagram = [0u8; MAX_DATAGRAM_SIZE];
        let total = HEADER_SIZE + len;
        datagram[HEADER_SIZE..total].copy_from_slice(&self.send_buffer[..len]);
        DatagramHeader::Data { sequence, eom }.write(&mut datagram, total);

        sink.transmit(&datagram[..total])?;
        self.last_send_time = now;
        Ok(())
    }
}

#[derive(Error, Debug)]
pub(crate) enum ProtocolError {
    #[error("malformed datagram: {0}")]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Land(#[from] LandError),
    #[error("reassembled message of {0} bytes is too large")]
    Oversized(usize),
}

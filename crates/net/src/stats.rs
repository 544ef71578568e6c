use std::fmt;

/// Best-effort network statistics of a session.
///
/// Messages sent or received via the loopback driver are not counted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub unreliable_messages_sent: u64,
    pub unreliable_messages_received: u64,
    pub packets_sent: u64,
    pub packets_resent: u64,
    pub packets_received: u64,
    /// Reliable fragments received more than once.
    pub received_duplicate_count: u64,
    /// Datagrams too short to carry a header.
    pub short_packet_count: u64,
    /// Unreliable datagrams which never arrived (inferred from sequence
    /// gaps) or were discarded locally.
    pub dropped_datagrams: u64,
}

impl fmt::Display for NetStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "unreliable messages sent   = {}", self.unreliable_messages_sent)?;
        writeln!(
            f,
            "unreliable messages recv   = {}",
            self.unreliable_messages_received
        )?;
        writeln!(f, "reliable messages sent     = {}", self.messages_sent)?;
        writeln!(f, "reliable messages received = {}", self.messages_received)?;
        writeln!(f, "packets sent               = {}", self.packets_sent)?;
        writeln!(f, "packets resent             = {}", self.packets_resent)?;
        writeln!(f, "packets received           = {}", self.packets_received)?;
        writeln!(
            f,
            "duplicate fragments        = {}",
            self.received_duplicate_count
        )?;
        writeln!(f, "short packets              = {}", self.short_packet_count)?;
        write!(f, "dropped datagrams          = {}", self.dropped_datagrams)
    }
}

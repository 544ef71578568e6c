use std::fmt;

use thiserror::Error;

/// Maximum size of a datagram which might be sent by this crate.
///
/// This is the maximum datagram size "guaranteed" to be deliverable over any
/// reasonable network.
///
/// <https://stackoverflow.com/a/35697810/4448708>
pub const MAX_DATAGRAM_SIZE: usize = 508;

/// Number of bytes (at the beginning of each data, ack or unreliable
/// datagram) used up by the header.
pub(crate) const HEADER_SIZE: usize = 8;
/// Number of bytes used up by the header of a control datagram.
pub(crate) const CONTROL_HEADER_SIZE: usize = 4;

/// Maximum number of payload bytes carried by a single datagram.
pub const MAX_FRAGMENT_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE;

const LENGTH_MASK: u32 = 0x0000_ffff;
/// This bit is set on fragments of reliable messages.
const DATA_BIT: u32 = 0x0001_0000;
/// This bit is set on fragment acknowledgments.
const ACK_BIT: u32 = 0x0002_0000;
const NAK_BIT: u32 = 0x0004_0000;
/// This bit is set on the last fragment of a reliable message.
const EOM_BIT: u32 = 0x0008_0000;
const UNRELIABLE_BIT: u32 = 0x0010_0000;
/// This bit is set on connection control datagrams. It is mutually exclusive
/// with all other bits.
const CONTROL_BIT: u32 = 0x8000_0000;
const LAST_DATA: u32 = DATA_BIT | EOM_BIT;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DatagramHeader {
    Control,
    Data { sequence: u32, eom: bool },
    Ack(u32),
    Nak(u32),
    Unreliable(u32),
}

impl DatagramHeader {
    /// Size of the header in bytes.
    pub(crate) fn size(&self) -> usize {
        match self {
            Self::Control => CONTROL_HEADER_SIZE,
            _ => HEADER_SIZE,
        }
    }

    /// Writes the header to the beginning of a bytes buffer.
    ///
    /// # Arguments
    ///
    /// * `buf` - datagram buffer.
    ///
    /// * `len` - total length of the datagram (header included).
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than `len` or if `len` is smaller than
    /// the header.
    pub(crate) fn write(&self, buf: &mut [u8], len: usize) {
        assert!(buf.len() >= len);
        assert!(len >= self.size());
        assert!(len <= LENGTH_MASK as usize);

        let (flags, sequence) = match *self {
            Self::Control => (CONTROL_BIT, None),
            Self::Data { sequence, eom } => {
                let flags = if eom { LAST_DATA } else { DATA_BIT };
                (flags, Some(sequence))
            }
            Self::Ack(sequence) => (ACK_BIT, Some(sequence)),
            Self::Nak(sequence) => (NAK_BIT, Some(sequence)),
            Self::Unreliable(sequence) => (UNRELIABLE_BIT, Some(sequence)),
        };

        buf[0..4].copy_from_slice(&(flags | len as u32).to_be_bytes());
        if let Some(sequence) = sequence {
            buf[4..HEADER_SIZE].copy_from_slice(&sequence.to_be_bytes());
        }
    }

    /// Reads the header from the beginning of a datagram. The length stored
    /// in the header must match the length of `data`.
    pub(crate) fn read(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < CONTROL_HEADER_SIZE {
            return Err(HeaderError::TooShort(data.len()));
        }

        let word = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let flags = word & !LENGTH_MASK;
        let declared = (word & LENGTH_MASK) as usize;
        if declared != data.len() {
            return Err(HeaderError::LengthMismatch {
                declared,
                actual: data.len(),
            });
        }

        if flags == CONTROL_BIT {
            return Ok(Self::Control);
        }
        if data.len() < HEADER_SIZE {
            return Err(HeaderError::TooShort(data.len()));
        }

        let sequence = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        match flags {
            DATA_BIT => Ok(Self::Data {
                sequence,
                eom: false,
            }),
            LAST_DATA => Ok(Self::Data {
                sequence,
                eom: true,
            }),
            ACK_BIT => Ok(Self::Ack(sequence)),
            NAK_BIT => Ok(Self::Nak(sequence)),
            UNRELIABLE_BIT => Ok(Self::Unreliable(sequence)),
            _ => Err(HeaderError::InvalidFlags(flags)),
        }
    }
}

impl fmt::Display for DatagramHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => write!(f, "Control"),
            Self::Data { sequence, eom } => {
                write!(f, "Data {{ sequence: {sequence}, eom: {eom} }}")
            }
            Self::Ack(sequence) => write!(f, "Ack {{ sequence: {sequence} }}"),
            Self::Nak(sequence) => write!(f, "Nak {{ sequence: {sequence} }}"),
            Self::Unreliable(sequence) => write!(f, "Unreliable {{ sequence: {sequence} }}"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub(crate) enum HeaderError {
    #[error("datagram of {0} bytes is too short")]
    TooShort(usize),
    #[error("header declares {declared} bytes but the datagram has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("invalid header flags {0:#010x}")]
    InvalidFlags(u32),
}

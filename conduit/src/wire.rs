//! Wire framing: the `MessageType` tag and the 5-byte datagram header,
//! per `spec.md` §4.2. Grounded in the teacher's `net::frame::Category`
//! (a small tagged-`u8` enum with an explicit "unknown tag" error path),
//! generalized from four frame kinds to the full channel-family space.

use crate::sequence::SequenceNumber;
use conduit_support::error::WireError;

/// Number of sequenced sub-channels available to each of
/// `UnreliableSequenced`, `ReliableSequenced` and `ReliableOrdered`.
pub const CHANNEL_COUNT: u8 = 16;

/// Size of the fixed header every datagram carries: 1 byte message type
/// + 2 bytes fragment-flag/sequence + 2 bytes payload bit length.
pub const HEADER_OVERHEAD_BYTES: usize = 5;

/// Upper bound on the varint-encoded fragment sub-header (group, index,
/// count), used when sizing how much of the MTU a fragment piece may
/// use for its own payload.
pub const FRAGMENT_HEADER_BUDGET_BYTES: usize = 12;

/// Every kind of message that can appear after the 5-byte header.
///
/// The wire encoding packs the message type into a single byte: channel
/// numbers for the three per-channel families are folded into
/// contiguous byte ranges rather than carried as a separate field, so a
/// header never needs more than one byte to identify both the delivery
/// class and the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Unreliable,
    UnreliableSequenced(u8),
    ReliableUnordered,
    ReliableSequenced(u8),
    ReliableOrdered(u8),

    ConnectRequest,
    ConnectResponse,
    ConnectionEstablished,
    Disconnect,
    Ping,
    Pong,
    Acknowledge,
    Discovery,
    DiscoveryResponse,
    ExpandMtuRequest,
    ExpandMtuSuccess,
    KeyExchangeRequest,
    KeyExchangeResponse,
}

const UNRELIABLE: u8 = 0;
const RELIABLE_UNORDERED: u8 = 1;
const UNRELIABLE_SEQUENCED_BASE: u8 = 2;
const RELIABLE_SEQUENCED_BASE: u8 = UNRELIABLE_SEQUENCED_BASE + CHANNEL_COUNT;
const RELIABLE_ORDERED_BASE: u8 = RELIABLE_SEQUENCED_BASE + CHANNEL_COUNT;
const CONTROL_BASE: u8 = RELIABLE_ORDERED_BASE + CHANNEL_COUNT;

const CONNECT_REQUEST: u8 = CONTROL_BASE;
const CONNECT_RESPONSE: u8 = CONTROL_BASE + 1;
const CONNECTION_ESTABLISHED: u8 = CONTROL_BASE + 2;
const DISCONNECT: u8 = CONTROL_BASE + 3;
const PING: u8 = CONTROL_BASE + 4;
const PONG: u8 = CONTROL_BASE + 5;
const ACKNOWLEDGE: u8 = CONTROL_BASE + 6;
const DISCOVERY: u8 = CONTROL_BASE + 7;
const DISCOVERY_RESPONSE: u8 = CONTROL_BASE + 8;
const EXPAND_MTU_REQUEST: u8 = CONTROL_BASE + 9;
const EXPAND_MTU_SUCCESS: u8 = CONTROL_BASE + 10;
const KEY_EXCHANGE_REQUEST: u8 = CONTROL_BASE + 11;
const KEY_EXCHANGE_RESPONSE: u8 = CONTROL_BASE + 12;

impl MessageType {
    pub fn to_byte(self) -> u8 {
        match self {
            MessageType::Unreliable => UNRELIABLE,
            MessageType::ReliableUnordered => RELIABLE_UNORDERED,
            MessageType::UnreliableSequenced(ch) => UNRELIABLE_SEQUENCED_BASE + ch,
            MessageType::ReliableSequenced(ch) => RELIABLE_SEQUENCED_BASE + ch,
            MessageType::ReliableOrdered(ch) => RELIABLE_ORDERED_BASE + ch,
            MessageType::ConnectRequest => CONNECT_REQUEST,
            MessageType::ConnectResponse => CONNECT_RESPONSE,
            MessageType::ConnectionEstablished => CONNECTION_ESTABLISHED,
            MessageType::Disconnect => DISCONNECT,
            MessageType::Ping => PING,
            MessageType::Pong => PONG,
            MessageType::Acknowledge => ACKNOWLEDGE,
            MessageType::Discovery => DISCOVERY,
            MessageType::DiscoveryResponse => DISCOVERY_RESPONSE,
            MessageType::ExpandMtuRequest => EXPAND_MTU_REQUEST,
            MessageType::ExpandMtuSuccess => EXPAND_MTU_SUCCESS,
            MessageType::KeyExchangeRequest => KEY_EXCHANGE_REQUEST,
            MessageType::KeyExchangeResponse => KEY_EXCHANGE_RESPONSE,
        }
    }

    pub fn from_byte(byte: u8) -> Result<MessageType, WireError> {
        Ok(match byte {
            UNRELIABLE => MessageType::Unreliable,
            RELIABLE_UNORDERED => MessageType::ReliableUnordered,
            b if b >= UNRELIABLE_SEQUENCED_BASE && b < RELIABLE_SEQUENCED_BASE => {
                MessageType::UnreliableSequenced(b - UNRELIABLE_SEQUENCED_BASE)
            }
            b if b >= RELIABLE_SEQUENCED_BASE && b < RELIABLE_ORDERED_BASE => {
                MessageType::ReliableSequenced(b - RELIABLE_SEQUENCED_BASE)
            }
            b if b >= RELIABLE_ORDERED_BASE && b < CONTROL_BASE => {
                MessageType::ReliableOrdered(b - RELIABLE_ORDERED_BASE)
            }
            CONNECT_REQUEST => MessageType::ConnectRequest,
            CONNECT_RESPONSE => MessageType::ConnectResponse,
            CONNECTION_ESTABLISHED => MessageType::ConnectionEstablished,
            DISCONNECT => MessageType::Disconnect,
            PING => MessageType::Ping,
            PONG => MessageType::Pong,
            ACKNOWLEDGE => MessageType::Acknowledge,
            DISCOVERY => MessageType::Discovery,
            DISCOVERY_RESPONSE => MessageType::DiscoveryResponse,
            EXPAND_MTU_REQUEST => MessageType::ExpandMtuRequest,
            EXPAND_MTU_SUCCESS => MessageType::ExpandMtuSuccess,
            KEY_EXCHANGE_REQUEST => MessageType::KeyExchangeRequest,
            KEY_EXCHANGE_RESPONSE => MessageType::KeyExchangeResponse,
            other => return Err(WireError::UnknownMessageType(other)),
        })
    }

    /// Whether this message type carries a selective-repeat sequence
    /// number that must be acknowledged by the receiver.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            MessageType::ReliableUnordered
                | MessageType::ReliableSequenced(_)
                | MessageType::ReliableOrdered(_)
        )
    }

    /// Whether duplicate/out-of-order delivery on this channel must be
    /// collapsed down to "most recent wins" rather than delivered as-is.
    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            MessageType::UnreliableSequenced(_)
                | MessageType::ReliableSequenced(_)
                | MessageType::ReliableOrdered(_)
        )
    }
}

/// The fixed 5-byte header prepended to every datagram: message type (1
/// byte), fragment flag + sequence number (2 bytes, bit-packed as
/// `fragment:1 | sequence:15`), and payload bit length (2 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub fragmented: bool,
    pub sequence: SequenceNumber,
    pub payload_bits: u16,
}

/// Bit offset into a freshly written header where `payload_bits` lives,
/// returned by [`write_header`] so the caller can back-patch it once the
/// payload's actual size is known.
pub type PayloadLenOffset = usize;

pub fn write_header(
    buf: &mut crate::buffer::MessageBuffer,
    message_type: MessageType,
    fragmented: bool,
    sequence: SequenceNumber,
) -> PayloadLenOffset {
    buf.write_u8(message_type.to_byte());
    buf.write_bit(fragmented);
    buf.write_bits(sequence as u64, 15);

    let offset = buf.bit_length();
    buf.write_u16(0); // reserved, back-patched once the payload length is known
    offset
}

pub fn finish_header(buf: &mut crate::buffer::MessageBuffer, offset: PayloadLenOffset, payload_bits: u16) {
    buf.write_at_bits(offset, payload_bits as u64, 16);
}

pub fn read_header(buf: &mut crate::buffer::MessageBuffer) -> Result<Header, WireError> {
    let message_type = MessageType::from_byte(buf.read_u8()?)?;
    let fragmented = buf.read_bit()?;
    let sequence = buf.read_bits(15)? as SequenceNumber;
    let payload_bits = buf.read_u16()?;

    Ok(Header {
        message_type,
        fragmented,
        sequence,
        payload_bits,
    })
}

/// The sub-header prepended to each piece of a fragmented message, per
/// `spec.md` §4.4.6: which reassembly group it belongs to, its index
/// within the group, and the group's total fragment count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub group: u32,
    pub index: u16,
    pub count: u16,
}

pub fn write_fragment_header(buf: &mut crate::buffer::MessageBuffer, header: FragmentHeader) {
    buf.write_var_u64(header.group as u64);
    buf.write_var_u64(header.index as u64);
    buf.write_var_u64(header.count as u64);
}

pub fn read_fragment_header(buf: &mut crate::buffer::MessageBuffer) -> Result<FragmentHeader, WireError> {
    let group = buf.read_var_u64()? as u32;
    let index = buf.read_var_u64()? as u16;
    let count = buf.read_var_u64()? as u16;

    if count == 0 || index >= count {
        return Err(WireError::MalformedFragment);
    }

    Ok(FragmentHeader { group, index, count })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MessageBuffer;
    use proptest::prelude::*;

    fn all_message_types() -> Vec<MessageType> {
        let mut types = vec![
            MessageType::Unreliable,
            MessageType::ReliableUnordered,
            MessageType::ConnectRequest,
            MessageType::ConnectResponse,
            MessageType::ConnectionEstablished,
            MessageType::Disconnect,
            MessageType::Ping,
            MessageType::Pong,
            MessageType::Acknowledge,
            MessageType::Discovery,
            MessageType::DiscoveryResponse,
            MessageType::ExpandMtuRequest,
            MessageType::ExpandMtuSuccess,
            MessageType::KeyExchangeRequest,
            MessageType::KeyExchangeResponse,
        ];
        for ch in 0..CHANNEL_COUNT {
            types.push(MessageType::UnreliableSequenced(ch));
            types.push(MessageType::ReliableSequenced(ch));
            types.push(MessageType::ReliableOrdered(ch));
        }
        types
    }

    #[test]
    fn every_message_type_round_trips_through_a_byte() {
        for mt in all_message_types() {
            assert_eq!(MessageType::from_byte(mt.to_byte()).unwrap(), mt);
        }
    }

    #[test]
    fn unknown_byte_is_rejected() {
        assert!(MessageType::from_byte(255).is_err());
    }

    #[test]
    fn header_round_trips_and_is_five_bytes() {
        let mut buf = MessageBuffer::new();
        let offset = write_header(&mut buf, MessageType::ReliableOrdered(3), false, 1234);
        buf.write_bytes(b"payload");
        finish_header(&mut buf, offset, 7 * 8);

        assert_eq!(buf.byte_length(), 5 + 7);

        let mut reader = MessageBuffer::from_bytes(buf.as_bytes().to_vec(), buf.bit_length());
        let header = read_header(&mut reader).unwrap();
        assert_eq!(header.message_type, MessageType::ReliableOrdered(3));
        assert_eq!(header.fragmented, false);
        assert_eq!(header.sequence, 1234);
        assert_eq!(header.payload_bits, 7 * 8);
        assert_eq!(reader.read_bytes(7).unwrap(), b"payload");
    }

    #[test]
    fn fragment_header_round_trips() {
        let mut buf = MessageBuffer::new();
        write_fragment_header(&mut buf, FragmentHeader { group: 42, index: 1, count: 5 });
        let mut reader = MessageBuffer::from_bytes(buf.as_bytes().to_vec(), buf.bit_length());
        let header = read_fragment_header(&mut reader).unwrap();
        assert_eq!(header, FragmentHeader { group: 42, index: 1, count: 5 });
    }

    #[test]
    fn fragment_header_rejects_index_out_of_range() {
        let mut buf = MessageBuffer::new();
        write_fragment_header(&mut buf, FragmentHeader { group: 1, index: 3, count: 3 });
        let mut reader = MessageBuffer::from_bytes(buf.as_bytes().to_vec(), buf.bit_length());
        assert!(read_fragment_header(&mut reader).is_err());
    }

    proptest! {
        #[test]
        fn header_sequence_and_payload_len_roundtrip(seq in 0u16..crate::sequence::NUM_SEQUENCE_NUMBERS, payload_bits: u16, fragmented: bool) {
            let mut buf = MessageBuffer::new();
            let offset = write_header(&mut buf, MessageType::Unreliable, fragmented, seq);
            finish_header(&mut buf, offset, payload_bits);

            let mut reader = MessageBuffer::from_bytes(buf.as_bytes().to_vec(), buf.bit_length());
            let header = read_header(&mut reader).unwrap();
            prop_assert_eq!(header.sequence, seq);
            prop_assert_eq!(header.payload_bits, payload_bits);
            prop_assert_eq!(header.fragmented, fragmented);
        }
    }
}

//! SACP frame codec
//!
//! Frame layout (little-endian unless noted):
//!
//! ```text
//! 0   2  magic 0xAA 0x55
//! 2   2  length = 6 + payload + 2
//! 4   1  version
//! 5   1  receiver id
//! 6   1  CRC-8 over bytes 0..6
//! 7   1  sender id
//! 8   1  attribute (0 request, 1 ack)
//! 9   2  sequence
//! 11  1  command set
//! 12  1  command id
//! 13  N  payload
//! 13+N 2 checksum over bytes 7..13+N
//! ```

use bytes::{Buf, BytesMut};
use crc::{Crc, CRC_8_SMBUS};
use fablink_core::ProtocolError;

/// Frame start marker
pub const MAGIC: [u8; 2] = [0xAA, 0x55];
/// Protocol version written in every frame
pub const PROTOCOL_VERSION: u8 = 0x01;
/// Bytes before the payload
pub const HEADER_LEN: usize = 13;
/// Bytes after the payload
pub const CHECKSUM_LEN: usize = 2;
/// Header plus trailer
pub const FRAME_OVERHEAD: usize = HEADER_LEN + CHECKSUM_LEN;
/// Largest payload the length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - 8;

/// Fixed part of the length field: bytes 7..13 plus the checksum
const LENGTH_BASE: usize = 8;
/// Bytes up to and including the header CRC
const PREAMBLE_LEN: usize = 7;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Header CRC-8 (polynomial 0x07, initial value 0)
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Ones'-complement sum of big-endian words; an odd tail byte is added as-is
pub fn checksum16(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [tail] = words.remainder() {
        sum += u32::from(*tail);
    }
    while sum > 0xFFFF {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }
    !(sum as u16)
}

/// Command set and command id pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandTag {
    /// Command set.
    pub command_set: u8,
    /// Command id within the set.
    pub command_id: u8,
}

impl CommandTag {
    /// Create a tag
    pub const fn new(command_set: u8, command_id: u8) -> Self {
        Self {
            command_set,
            command_id,
        }
    }
}

impl std::fmt::Display for CommandTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}/{:#04x}", self.command_set, self.command_id)
    }
}

/// Peer addresses on the machine bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerId {
    /// This host.
    Host,
    /// Motion controller.
    Controller,
    /// Touch screen.
    Screen,
    /// Any other address.
    Other(u8),
}

impl PeerId {
    /// Wire value
    pub fn as_u8(self) -> u8 {
        match self {
            PeerId::Host => 0,
            PeerId::Controller => 1,
            PeerId::Screen => 2,
            PeerId::Other(id) => id,
        }
    }

    /// Parse a wire value
    pub fn from_u8(id: u8) -> Self {
        match id {
            0 => PeerId::Host,
            1 => PeerId::Controller,
            2 => PeerId::Screen,
            other => PeerId::Other(other),
        }
    }
}

/// Frame direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    /// A request or push that expects nothing or an ack.
    Request,
    /// A response echoing a request's sequence.
    Ack,
}

impl Attribute {
    fn as_u8(self) -> u8 {
        match self {
            Attribute::Request => 0,
            Attribute::Ack => 1,
        }
    }

    fn from_u8(value: u8) -> Self {
        if value & 0x01 == 0 {
            Attribute::Request
        } else {
            Attribute::Ack
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Addressee.
    pub receiver: PeerId,
    /// Originator.
    pub sender: PeerId,
    /// Request or ack.
    pub attribute: Attribute,
    /// Sequence number; acks echo the request's.
    pub sequence: u16,
    /// Command tag.
    pub tag: CommandTag,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a request from `sender` to `receiver`
    pub fn request(
        tag: CommandTag,
        sender: PeerId,
        receiver: PeerId,
        sequence: u16,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            receiver,
            sender,
            attribute: Attribute::Request,
            sequence,
            tag,
            payload,
        }
    }

    /// Build the ack for this packet, addressed back to its sender
    pub fn ack_for(&self, payload: Vec<u8>) -> Self {
        Self {
            receiver: self.sender,
            sender: self.receiver,
            attribute: Attribute::Ack,
            sequence: self.sequence,
            tag: self.tag,
            payload,
        }
    }

    /// Whether this is an ack
    pub fn is_ack(&self) -> bool {
        self.attribute == Attribute::Ack
    }

    /// Result byte of an ack payload
    pub fn result_code(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Payload after the result byte
    pub fn body(&self) -> &[u8] {
        self.payload.get(1..).unwrap_or(&[])
    }

    /// Encode into a complete frame
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                limit: MAX_PAYLOAD_LEN,
            });
        }

        let length = (LENGTH_BASE + self.payload.len()) as u16;
        let mut frame = Vec::with_capacity(FRAME_OVERHEAD + self.payload.len());
        frame.extend_from_slice(&MAGIC);
        frame.extend_from_slice(&length.to_le_bytes());
        frame.push(PROTOCOL_VERSION);
        frame.push(self.receiver.as_u8());
        frame.push(crc8(&frame[..6]));
        frame.push(self.sender.as_u8());
        frame.push(self.attribute.as_u8());
        frame.extend_from_slice(&self.sequence.to_le_bytes());
        frame.push(self.tag.command_set);
        frame.push(self.tag.command_id);
        frame.extend_from_slice(&self.payload);
        let checksum = checksum16(&frame[PREAMBLE_LEN..]);
        frame.extend_from_slice(&checksum.to_le_bytes());
        Ok(frame)
    }
}

/// Why a candidate frame was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFault {
    /// Header CRC did not match.
    HeaderCrc,
    /// Length field smaller than the fixed part.
    Length,
    /// Body checksum did not match.
    Checksum,
}

impl std::fmt::Display for FrameFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameFault::HeaderCrc => write!(f, "header CRC mismatch"),
            FrameFault::Length => write!(f, "invalid length field"),
            FrameFault::Checksum => write!(f, "checksum mismatch"),
        }
    }
}

/// Incremental frame decoder over an accumulation buffer
///
/// Bytes may arrive split or merged arbitrarily. Garbage before a magic
/// marker is skipped silently; a marker followed by a bad header or body is
/// reported as a [`FrameFault`] and the search resumes after the marker.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    skipped: usize,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes waiting for a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total non-frame bytes discarded so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Next frame, a fault, or `None` when more bytes are needed
    pub fn next_frame(&mut self) -> Option<Result<Packet, FrameFault>> {
        if !self.sync_to_magic() {
            return None;
        }
        if self.buffer.len() < PREAMBLE_LEN {
            return None;
        }
        if crc8(&self.buffer[..6]) != self.buffer[6] {
            self.buffer.advance(1);
            return Some(Err(FrameFault::HeaderCrc));
        }

        let length = usize::from(u16::from_le_bytes([self.buffer[2], self.buffer[3]]));
        if length < LENGTH_BASE {
            self.buffer.advance(1);
            return Some(Err(FrameFault::Length));
        }
        let total = PREAMBLE_LEN + length;
        if self.buffer.len() < total {
            return None;
        }

        let frame = self.buffer.split_to(total);
        let body_end = total - CHECKSUM_LEN;
        let expected = u16::from_le_bytes([frame[body_end], frame[body_end + 1]]);
        if checksum16(&frame[PREAMBLE_LEN..body_end]) != expected {
            return Some(Err(FrameFault::Checksum));
        }

        Some(Ok(Packet {
            receiver: PeerId::from_u8(frame[5]),
            sender: PeerId::from_u8(frame[7]),
            attribute: Attribute::from_u8(frame[8]),
            sequence: u16::from_le_bytes([frame[9], frame[10]]),
            tag: CommandTag::new(frame[11], frame[12]),
            payload: frame[HEADER_LEN..body_end].to_vec(),
        }))
    }

    /// Drop bytes up to the next magic marker. Returns false if none is buffered.
    fn sync_to_magic(&mut self) -> bool {
        let found = self
            .buffer
            .windows(MAGIC.len())
            .position(|window| window == MAGIC);
        match found {
            Some(0) => true,
            Some(start) => {
                self.skip(start);
                true
            }
            None => {
                // Keep a trailing first magic byte; its partner may be in flight.
                let keep = usize::from(self.buffer.last() == Some(&MAGIC[0]));
                let drop = self.buffer.len() - keep;
                self.skip(drop);
                false
            }
        }
    }

    fn skip(&mut self, count: usize) {
        if count > 0 {
            tracing::trace!("Skipping {} non-frame bytes", count);
            self.buffer.advance(count);
            self.skipped += count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(sequence: u16, payload: Vec<u8>) -> Packet {
        Packet::request(
            CommandTag::new(0x01, 0x21),
            PeerId::Host,
            PeerId::Controller,
            sequence,
            payload,
        )
    }

    #[test]
    fn test_frame_layout() {
        let frame = sample(0x0102, vec![0xAB]).encode().unwrap();
        assert_eq!(frame.len(), FRAME_OVERHEAD + 1);
        assert_eq!(&frame[..2], &MAGIC);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 9);
        assert_eq!(frame[4], PROTOCOL_VERSION);
        assert_eq!(frame[5], 1);
        assert_eq!(frame[6], crc8(&frame[..6]));
        assert_eq!(frame[7], 0);
        assert_eq!(frame[8], 0);
        assert_eq!(&frame[9..11], &[0x02, 0x01]);
        assert_eq!(&frame[11..13], &[0x01, 0x21]);
        assert_eq!(frame[13], 0xAB);
    }

    #[test]
    fn test_crc8_known_values() {
        assert_eq!(crc8(&[]), 0);
        assert_eq!(crc8(&[0x01]), 0x07);
        // Standard check value for CRC-8/SMBUS.
        assert_eq!(crc8(b"123456789"), 0xF4);
    }

    #[test]
    fn test_checksum_odd_tail_and_fold() {
        assert_eq!(checksum16(&[]), 0xFFFF);
        assert_eq!(checksum16(&[0x12, 0x34]), !0x1234);
        assert_eq!(checksum16(&[0x12, 0x34, 0x05]), !0x1239);
        // 0xFFFF + 0x0001 folds to 0x0001.
        assert_eq!(checksum16(&[0xFF, 0xFF, 0x00, 0x01]), !0x0001);
    }

    #[test]
    fn test_ack_for_swaps_peers() {
        let request = sample(7, vec![]);
        let ack = request.ack_for(vec![0, 1]);
        assert_eq!(ack.sender, PeerId::Controller);
        assert_eq!(ack.receiver, PeerId::Host);
        assert_eq!(ack.sequence, 7);
        assert!(ack.is_ack());
        assert_eq!(ack.result_code(), Some(0));
        assert_eq!(ack.body(), &[1]);
    }

    #[test]
    fn test_payload_too_large() {
        let err = sample(1, vec![0; MAX_PAYLOAD_LEN + 1]).encode().unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_decoder_skips_garbage_and_handles_split_frames() {
        let frame = sample(3, b"hello".to_vec()).encode().unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.push(b"ok\r\n");
        decoder.push(&frame[..5]);
        assert!(decoder.next_frame().is_none());
        decoder.push(&frame[5..]);
        let packet = decoder.next_frame().unwrap().unwrap();
        assert_eq!(packet.payload, b"hello");
        assert_eq!(decoder.skipped(), 4);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_reports_checksum_fault_then_recovers() {
        let mut bad = sample(1, vec![1, 2, 3]).encode().unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let good = sample(2, vec![4]).encode().unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&bad);
        decoder.push(&good);
        assert_eq!(decoder.next_frame(), Some(Err(FrameFault::Checksum)));
        assert_eq!(decoder.next_frame().unwrap().unwrap().sequence, 2);
    }

    #[test]
    fn test_decoder_reports_header_fault() {
        let mut bad = sample(1, vec![]).encode().unwrap();
        bad[6] ^= 0x01;
        let mut decoder = FrameDecoder::new();
        decoder.push(&bad);
        assert_eq!(decoder.next_frame(), Some(Err(FrameFault::HeaderCrc)));
        // The remaining bytes hold no further marker.
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_decoder_keeps_dangling_magic_byte() {
        let frame = sample(9, vec![]).encode().unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0x00, 0x00, MAGIC[0]]);
        assert!(decoder.next_frame().is_none());
        decoder.push(&frame[1..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap().sequence, 9);
    }

    proptest! {
        #[test]
        fn prop_any_split_decodes_the_same_frames(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..6),
            split in 1usize..32,
        ) {
            let mut stream = Vec::new();
            for (seq, payload) in payloads.iter().enumerate() {
                stream.extend(sample(seq as u16, payload.clone()).encode().unwrap());
            }

            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            for chunk in stream.chunks(split) {
                decoder.push(chunk);
                while let Some(frame) = decoder.next_frame() {
                    decoded.push(frame.unwrap().payload);
                }
            }
            prop_assert_eq!(decoded, payloads);
        }
    }
}

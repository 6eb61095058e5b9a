//! Wire frames for the control bus.
//!
//! Every transfer on the bus is one fixed-size frame:
//!
//! ```text
//! offset 0     address byte (bits 0-4 node address, bits 5-7 reserved)
//! offset 1     command byte on requests, response code on responses
//! offset 2     flag byte (bit 0 request, bit 1 broadcast)
//! offset 3-6   payload, 4 bytes
//! offset 7-8   CRC-16, little-endian
//! ```
//!
//! The checksum covers the whole frame, itself included; a received frame is
//! valid iff the CRC-16 over all nine bytes is zero.

use std::fmt;
use std::io;

use bitvec::prelude::*;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::command::CommandId;
use super::crc::{crc16, crc16_is_valid};
use super::node::Address;
use crate::tracing::prelude::*;

/// Bytes of payload carried by every frame.
pub const PAYLOAD_LEN: usize = 4;

/// Total frame size on the wire, checksum included.
pub const FRAME_LEN: usize = 9;

/// Wrapper for formatting byte slices as space-separated hex.
pub(crate) struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// One decoded bus frame.
///
/// On requests `address` is the target node and `code` holds the command id;
/// on responses `address` is the responder and `code` holds the response
/// code. Broadcast requests set the broadcast flag and leave `address` zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub address: Address,
    pub code: u8,
    pub request: bool,
    pub broadcast: bool,
    pub payload: [u8; PAYLOAD_LEN],
}

impl RawFrame {
    /// Builds a request frame addressed to a single node.
    pub fn unicast_request(id: CommandId, target: Address, payload: [u8; PAYLOAD_LEN]) -> Self {
        Self {
            address: target,
            code: id as u8,
            request: true,
            broadcast: false,
            payload,
        }
    }

    /// Builds a request frame addressed to every node on the bus.
    pub fn broadcast_request(id: CommandId, payload: [u8; PAYLOAD_LEN]) -> Self {
        Self {
            address: Address::new(0).expect("zero is a valid address"),
            code: id as u8,
            request: true,
            broadcast: true,
            payload,
        }
    }

    /// Builds a response frame originating from `source`.
    pub fn response(source: Address, code: u8, payload: [u8; PAYLOAD_LEN]) -> Self {
        Self {
            address: source,
            code,
            request: false,
            broadcast: false,
            payload,
        }
    }

    /// Serializes the frame, appending its CRC-16.
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut bytes = [0u8; FRAME_LEN];

        let addr_bits = bytes[0].view_bits_mut::<Lsb0>();
        addr_bits[0..5].store(self.address.value());

        bytes[1] = self.code;

        let flag_bits = bytes[2].view_bits_mut::<Lsb0>();
        flag_bits.set(0, self.request);
        flag_bits.set(1, self.broadcast);

        bytes[3..3 + PAYLOAD_LEN].copy_from_slice(&self.payload);

        let crc = crc16(&bytes[..FRAME_LEN - 2]);
        bytes[FRAME_LEN - 2..].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Deserializes a frame the checksum of which has already been verified.
    ///
    /// Reserved bits are ignored on receive so future protocol revisions can
    /// repurpose them.
    pub fn from_bytes(bytes: &[u8; FRAME_LEN]) -> Self {
        let addr_bits = bytes[0].view_bits::<Lsb0>();
        let address = Address::new(addr_bits[0..5].load::<u8>())
            .expect("five-bit field is always in range");

        let flag_bits = bytes[2].view_bits::<Lsb0>();

        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&bytes[3..3 + PAYLOAD_LEN]);

        Self {
            address,
            code: bytes[1],
            request: flag_bits[0],
            broadcast: flag_bits[1],
            payload,
        }
    }
}

/// Stream codec for bus frames.
///
/// Used by stream-shaped transports and the offline dissector. The protocol
/// engine itself works on the raw device buffer because its fault handling
/// depends on the validation order, not on a resynchronizing scanner.
#[derive(Default)]
pub struct FrameCodec;

impl Encoder<RawFrame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: RawFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = frame.to_bytes();
        dst.put_slice(&bytes);

        trace!(
            frame = %HexBytes(&bytes),
            "bus tx"
        );

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Returning an error terminates the stream, so a corrupt window is
        // never an error here: advance one byte and ask to be called again
        // until a CRC-valid frame lines up.
        const CALL_AGAIN: Result<Option<RawFrame>, io::Error> = Ok(None);

        while src.len() >= FRAME_LEN {
            if !crc16_is_valid(&src[..FRAME_LEN]) {
                src.advance(1);
                continue;
            }

            let mut bytes = [0u8; FRAME_LEN];
            bytes.copy_from_slice(&src[..FRAME_LEN]);
            src.advance(FRAME_LEN);

            let frame = RawFrame::from_bytes(&bytes);
            trace!(
                frame = %HexBytes(&bytes),
                "bus rx"
            );
            return Ok(Some(frame));
        }

        CALL_AGAIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(raw: u8) -> Address {
        Address::new(raw).unwrap()
    }

    #[test]
    fn serialized_frames_self_verify() {
        let frame = RawFrame::unicast_request(CommandId::BlGetInfo, node(7), [3, 0, 0, 0]);
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), FRAME_LEN);
        assert!(crc16_is_valid(&bytes));
        assert_eq!(RawFrame::from_bytes(&bytes), frame);
    }

    #[test]
    fn broadcast_flag_round_trips() {
        let frame = RawFrame::broadcast_request(CommandId::ResetCpu, [0; 4]);
        let parsed = RawFrame::from_bytes(&frame.to_bytes());
        assert!(parsed.broadcast);
        assert!(parsed.request);
    }

    #[test]
    fn response_frames_carry_the_source_address() {
        let frame = RawFrame::response(node(12), 0, [9, 8, 7, 6]);
        let parsed = RawFrame::from_bytes(&frame.to_bytes());
        assert_eq!(parsed.address, node(12));
        assert!(!parsed.request);
        assert_eq!(parsed.payload, [9, 8, 7, 6]);
    }

    #[test]
    fn codec_round_trips_frames() {
        let frames = [
            RawFrame::unicast_request(CommandId::BlSetBootMagic, node(9), [0xAD, 0x10, 0x07, 0xB0]),
            RawFrame::broadcast_request(CommandId::BlPushWord, [1, 2, 3, 4]),
            RawFrame::response(node(9), 0, [0; 4]),
        ];

        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        for frame in frames {
            codec.encode(frame, &mut buf).unwrap();
        }
        for frame in frames {
            assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
        }
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn codec_resynchronizes_past_noise() {
        let frame = RawFrame::unicast_request(CommandId::GetVersion, node(3), [0; 4]);
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x55, 0x13, 0x37]);
        buf.put_slice(&frame.to_bytes());

        let mut codec = FrameCodec;
        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_waits_for_a_full_frame() {
        let frame = RawFrame::unicast_request(CommandId::GetVersion, node(3), [0; 4]);
        let bytes = frame.to_bytes();

        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&bytes[..FRAME_LEN - 1]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.put_u8(bytes[FRAME_LEN - 1]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
    }
}

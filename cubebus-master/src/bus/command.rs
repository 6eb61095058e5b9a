//! Command set of the control bus.
//!
//! Commands split into two numeric ranges. Application commands (below
//! `0x80`) are served by running node firmware; bootloader commands (`0x80`
//! and up) are only answered while a node sits in its bootloader, and get a
//! longer response timeout because the bootloader polls its flash controller
//! between frames.
//!
//! Each command associates a typed request and response payload through the
//! [`BusCommand`] trait, so a caller cannot send the wrong parameter shape
//! or misinterpret a response. All payloads occupy the fixed 4-byte frame
//! payload; scalars are little-endian.

use std::fmt;
use std::time::Duration;

use strum::FromRepr;
use thiserror::Error;

use super::frame::PAYLOAD_LEN;

/// Response deadline for application commands.
pub const APP_RESPONSE_TIMEOUT: Duration = Duration::from_millis(10);

/// Response deadline for bootloader commands.
pub const BOOTLOADER_RESPONSE_TIMEOUT: Duration = Duration::from_millis(50);

/// Magic value a node must receive right after reset to stay in its
/// bootloader instead of starting the application.
pub const BOOT_MAGIC: u32 = 0xB007_10AD;

/// Command identifiers as they appear in the frame command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum CommandId {
    GetStatus = 0x01,
    GetVersion = 0x02,
    SwapDma = 0x03,
    ResetCpu = 0x04,
    DetectOpenLeds = 0x05,

    BlGetStatus = 0x80,
    BlGetInfo = 0x81,
    BlGetVersion = 0x82,
    BlGetRowCrc = 0x83,
    BlSetBootMagic = 0x84,
    BlFlashErase = 0x85,
    BlResetRowPtr = 0x86,
    BlPushWord = 0x87,
    BlBurnRow = 0x88,
    BlBoot = 0x89,
}

impl CommandId {
    pub fn is_bootloader(self) -> bool {
        (self as u8) >= 0x80
    }

    /// How long to wait for a node's answer before the watchdog fires.
    pub fn response_timeout(self) -> Duration {
        if self.is_bootloader() {
            BOOTLOADER_RESPONSE_TIMEOUT
        } else {
            APP_RESPONSE_TIMEOUT
        }
    }
}

/// Status a node reports in the response byte of a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0x00,
    Unknown = 0x01,
    Again = 0x02,
    InvalidPayload = 0x03,
    InvalidCommand = 0x04,
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "ok",
            Self::Unknown => "unknown error",
            Self::Again => "try again",
            Self::InvalidPayload => "invalid payload",
            Self::InvalidCommand => "invalid command",
        };
        f.write_str(text)
    }
}

/// Raised when a payload cannot be encoded or decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("unknown discriminant 0x{0:02x} in payload")]
    UnknownDiscriminant(u8),
}

/// Fixed-size payload codec.
///
/// Every payload type states how it occupies the 4-byte frame payload.
pub trait Payload: Sized + Send + 'static {
    fn encode(&self) -> [u8; PAYLOAD_LEN];
    fn decode(raw: &[u8; PAYLOAD_LEN]) -> Result<Self, PayloadError>;
}

impl Payload for () {
    fn encode(&self) -> [u8; PAYLOAD_LEN] {
        [0; PAYLOAD_LEN]
    }

    fn decode(_raw: &[u8; PAYLOAD_LEN]) -> Result<Self, PayloadError> {
        Ok(())
    }
}

impl Payload for u32 {
    fn encode(&self) -> [u8; PAYLOAD_LEN] {
        self.to_le_bytes()
    }

    fn decode(raw: &[u8; PAYLOAD_LEN]) -> Result<Self, PayloadError> {
        Ok(u32::from_le_bytes(*raw))
    }
}

impl Payload for u16 {
    fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let mut payload = [0; PAYLOAD_LEN];
        payload[..2].copy_from_slice(&self.to_le_bytes());
        payload
    }

    fn decode(raw: &[u8; PAYLOAD_LEN]) -> Result<Self, PayloadError> {
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }
}

impl Payload for [u8; PAYLOAD_LEN] {
    fn encode(&self) -> [u8; PAYLOAD_LEN] {
        *self
    }

    fn decode(raw: &[u8; PAYLOAD_LEN]) -> Result<Self, PayloadError> {
        Ok(*raw)
    }
}

/// Flash geometry fields queryable through [`BlGetInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum InfoKind {
    PhysStart = 0,
    PhysEnd = 1,
    WordSize = 2,
    RowSize = 3,
    PageSize = 4,
}

impl InfoKind {
    pub const ALL: [InfoKind; 5] = [
        InfoKind::PhysStart,
        InfoKind::PhysEnd,
        InfoKind::WordSize,
        InfoKind::RowSize,
        InfoKind::PageSize,
    ];
}

impl Payload for InfoKind {
    fn encode(&self) -> [u8; PAYLOAD_LEN] {
        [*self as u8, 0, 0, 0]
    }

    fn decode(raw: &[u8; PAYLOAD_LEN]) -> Result<Self, PayloadError> {
        Self::from_repr(raw[0]).ok_or(PayloadError::UnknownDiscriminant(raw[0]))
    }
}

/// Readiness flags reported by a bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootStatus {
    bits: u32,
}

impl BootStatus {
    const READY: u32 = 1 << 0;
    const FAULT: u32 = 1 << 1;

    pub fn ready() -> Self {
        Self { bits: Self::READY }
    }

    pub fn busy() -> Self {
        Self { bits: 0 }
    }

    pub fn faulted() -> Self {
        Self { bits: Self::FAULT }
    }

    /// The node has finished its pending flash operation.
    pub fn is_ready(self) -> bool {
        self.bits & Self::READY != 0
    }

    /// The node's flash controller reported a hardware fault.
    pub fn is_faulted(self) -> bool {
        self.bits & Self::FAULT != 0
    }
}

impl Payload for BootStatus {
    fn encode(&self) -> [u8; PAYLOAD_LEN] {
        self.bits.to_le_bytes()
    }

    fn decode(raw: &[u8; PAYLOAD_LEN]) -> Result<Self, PayloadError> {
        Ok(Self {
            bits: u32::from_le_bytes(*raw),
        })
    }
}

/// One command of the bus protocol: its identifier plus the request and
/// response payload shapes associated with it.
pub trait BusCommand {
    const ID: CommandId;
    type Request: Payload;
    type Response: Payload;
}

// Application commands.

/// Query firmware status flags.
pub struct GetStatus;
impl BusCommand for GetStatus {
    const ID: CommandId = CommandId::GetStatus;
    type Request = ();
    type Response = u32;
}

/// Query the running firmware version.
pub struct GetVersion;
impl BusCommand for GetVersion {
    const ID: CommandId = CommandId::GetVersion;
    type Request = ();
    type Response = u32;
}

/// Flip the front/back frame DMA buffers. Issued as a broadcast so every
/// node swaps on the same bus cycle; no response is expected.
pub struct SwapDma;
impl BusCommand for SwapDma {
    const ID: CommandId = CommandId::SwapDma;
    type Request = ();
    type Response = ();
}

/// Reset the node CPU. Nodes sitting in their bootloader ignore it.
pub struct ResetCpu;
impl BusCommand for ResetCpu {
    const ID: CommandId = CommandId::ResetCpu;
    type Request = ();
    type Response = ();
}

/// Run the open-circuit LED detection and report the result mask.
pub struct DetectOpenLeds;
impl BusCommand for DetectOpenLeds {
    const ID: CommandId = CommandId::DetectOpenLeds;
    type Request = ();
    type Response = u32;
}

// Bootloader commands.

/// Query bootloader readiness.
pub struct BlGetStatus;
impl BusCommand for BlGetStatus {
    const ID: CommandId = CommandId::BlGetStatus;
    type Request = ();
    type Response = BootStatus;
}

/// Query one flash geometry field.
pub struct BlGetInfo;
impl BusCommand for BlGetInfo {
    const ID: CommandId = CommandId::BlGetInfo;
    type Request = InfoKind;
    type Response = u32;
}

/// Query the bootloader version.
pub struct BlGetVersion;
impl BusCommand for BlGetVersion {
    const ID: CommandId = CommandId::BlGetVersion;
    type Request = ();
    type Response = u32;
}

/// Query the CRC-16 the node accumulated over the pushed row words.
pub struct BlGetRowCrc;
impl BusCommand for BlGetRowCrc {
    const ID: CommandId = CommandId::BlGetRowCrc;
    type Request = ();
    type Response = u16;
}

/// Unlock the bootloader with [`BOOT_MAGIC`] so the node does not fall
/// through into the application.
pub struct BlSetBootMagic;
impl BusCommand for BlSetBootMagic {
    const ID: CommandId = CommandId::BlSetBootMagic;
    type Request = u32;
    type Response = ();
}

/// Start a full flash erase. Completion is observed via [`BlGetStatus`].
pub struct BlFlashErase;
impl BusCommand for BlFlashErase {
    const ID: CommandId = CommandId::BlFlashErase;
    type Request = ();
    type Response = ();
}

/// Reset the row word cursor. Broadcast before each group's first row.
pub struct BlResetRowPtr;
impl BusCommand for BlResetRowPtr {
    const ID: CommandId = CommandId::BlResetRowPtr;
    type Request = ();
    type Response = ();
}

/// Append one word to the node's row buffer. Broadcast bus-wide; nodes with
/// an incompatible geometry drop the word silently.
pub struct BlPushWord;
impl BusCommand for BlPushWord {
    const ID: CommandId = CommandId::BlPushWord;
    type Request = [u8; PAYLOAD_LEN];
    type Response = ();
}

/// Commit the buffered row to flash at the given physical address.
pub struct BlBurnRow;
impl BusCommand for BlBurnRow {
    const ID: CommandId = CommandId::BlBurnRow;
    type Request = u32;
    type Response = ();
}

/// Leave the bootloader and start the application.
pub struct BlBoot;
impl BusCommand for BlBoot {
    const ID: CommandId = CommandId::BlBoot;
    type Request = ();
    type Response = ();
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(CommandId::GetStatus, false; "app status")]
    #[test_case(CommandId::ResetCpu, false; "cpu reset")]
    #[test_case(CommandId::BlGetStatus, true; "bootloader status")]
    #[test_case(CommandId::BlBoot, true; "boot")]
    fn command_ranges(id: CommandId, bootloader: bool) {
        assert_eq!(id.is_bootloader(), bootloader);
    }

    #[test]
    fn bootloader_commands_wait_longer() {
        assert!(
            CommandId::BlFlashErase.response_timeout() > CommandId::GetStatus.response_timeout()
        );
    }

    #[test]
    fn scalar_payloads_are_little_endian() {
        assert_eq!(0x1122_3344u32.encode(), [0x44, 0x33, 0x22, 0x11]);
        assert_eq!(0xBEEFu16.encode(), [0xEF, 0xBE, 0, 0]);
        assert_eq!(u32::decode(&[0x44, 0x33, 0x22, 0x11]), Ok(0x1122_3344));
        assert_eq!(u16::decode(&[0xEF, 0xBE, 0, 0]), Ok(0xBEEF));
    }

    #[test]
    fn info_kind_rejects_unknown_discriminants() {
        assert_eq!(InfoKind::decode(&[3, 0, 0, 0]), Ok(InfoKind::RowSize));
        assert_eq!(
            InfoKind::decode(&[9, 0, 0, 0]),
            Err(PayloadError::UnknownDiscriminant(9))
        );
    }

    #[test]
    fn boot_status_flags() {
        assert!(BootStatus::ready().is_ready());
        assert!(!BootStatus::busy().is_ready());
        assert!(BootStatus::faulted().is_faulted());
        assert!(!BootStatus::faulted().is_ready());
    }
}

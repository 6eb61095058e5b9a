//! Physical transports the bus engine can drive.
//!
//! The engine owns exactly one device and is its only user. A device buffers
//! bytes in both directions and reports two events: `ReadyRead` when response
//! bytes arrived, `TransferComplete` when a queued write fully left the
//! adapter. Reads and writes always move whole frames.

use std::io;

use async_trait::async_trait;

pub mod serial;
pub mod sim;

pub use serial::SerialIoDevice;
pub use sim::{SimBus, SimNode};

/// Events a device delivers to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// Received bytes are buffered and readable.
    ReadyRead,
    /// A queued write has been fully transmitted.
    TransferComplete,
}

/// Buffer directions for [`IoDevice::clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Input,
    Output,
    All,
}

/// One half-duplex byte device.
#[async_trait]
pub trait IoDevice: Send {
    /// Waits for the next device event. Pends while the bus is quiet.
    async fn event(&mut self) -> io::Result<IoEvent>;

    /// Bytes currently buffered for reading.
    fn bytes_to_read(&self) -> usize;

    /// Room left in the output buffer.
    fn write_room(&self) -> usize;

    /// Moves buffered received bytes into `dst`, returning the count.
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize>;

    /// Queues bytes for transmission, returning the count accepted.
    fn write(&mut self, src: &[u8]) -> io::Result<usize>;

    /// Discards buffered bytes in the given direction.
    fn clear(&mut self, direction: IoDirection);
}

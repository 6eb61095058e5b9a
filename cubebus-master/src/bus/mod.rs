//! Half-duplex control-bus protocol, master side.

pub mod comm;
pub mod command;
pub mod crc;
pub mod frame;
pub mod node;

// Re-export commonly used types
pub use comm::{Bus, BusError, BusHandle, BusState};
pub use frame::{FrameCodec, RawFrame};
pub use node::Address;

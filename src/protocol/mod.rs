pub mod command;
pub mod frame;

pub use command::{checksum, encode, Command, MemorySpace, LOOPBACK_REPLY};
pub use frame::{ErrorFrameWidth, Frame, FrameDecoder, FrameDecoderConfig, DATA_PREFIX};

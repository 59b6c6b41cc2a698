pub mod can;
pub mod pylon;

pub use can::CanCache;
pub use pylon::{DecodedFrame, SerialFrameClient};

//! tether-core: shared types, discovery wire format, RPC framing and
//! configuration. All other tether crates depend on this one.

pub mod config;
pub mod frame;
pub mod wire;

pub use frame::{decode_frame, Encoder, Frame, FrameEncoder, ProtocolEvent};
pub use wire::{Announce, NodeId, WireError};

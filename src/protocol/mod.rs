//! Wire protocol for the transcription worker boundary.
//!
//! One self-contained JSON object per line; every message carries a protocol
//! version tag. This module only frames and parses; method semantics live in
//! the RPC and session layers.

pub mod codec;
pub mod message;

pub use codec::{encode_frame, FrameDecoder, MAX_FRAME_BYTES};
pub use message::{methods, notifications, Message, Notification, WireError, PROTOCOL_VERSION};

//! # remlink-protocol
//!
//! Wire protocol for the remlink remoting channel.
//!
//! This crate provides:
//! - Handshake preambles, capability bitfield, and wire-mode selection
//! - The `Command` sum type with its binary codec
//! - Chunked framing (15-bit length + continuation flag) and classic
//!   length-prefixed framing
//! - The base64 line codec for text mode
//!
//! Everything here is pure: no I/O, no async. The `remlink-channel` crate
//! drives these codecs over real streams.

pub mod capability;
pub mod chunk;
pub mod codec;
pub mod command;
pub mod error;
pub mod mode;
pub mod preamble;

pub use capability::{Capability, CAPABILITY_PREAMBLE};
pub use chunk::{ChunkAssembler, DEFAULT_FRAME_SIZE, MAX_CHUNK_PAYLOAD};
pub use command::Command;
pub use error::ProtocolError;
pub use mode::{Mode, BINARY_PREAMBLE, TEXT_PREAMBLE};
pub use preamble::{PreambleHit, PreambleMatcher};

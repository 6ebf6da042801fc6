//! # remlink-channel
//!
//! A symmetric, full-duplex command/response multiplexer between two peers
//! over any byte-oriented transport.
//!
//! This crate provides:
//! - Handshake and capability/mode negotiation over raw streams
//! - Correlated request/response calls with cancellation
//! - A reference-counted export table with stale-OID diagnostics
//! - Flow-controlled byte pipes to remote sinks
//! - An ioId-keyed sequencer that orders remote I/O against responses
//!
//! Build a [`Channel`] with [`ChannelBuilder`]; each peer can then invoke
//! the other's [`CallHandler`] and stream bytes into the other's exported
//! sinks, concurrently, over the single underlying connection.

pub mod builder;
pub mod channel;
pub mod config;
pub mod error;
pub mod export;
pub mod flight;
pub mod handshake;
pub mod pipe;
pub mod request;
pub mod sequencer;
pub mod transport;
pub mod window;

pub use builder::ChannelBuilder;
pub use channel::Channel;
pub use config::Tunables;
pub use error::ChannelError;
pub use export::{ErrorPropagating, ExportTable};
pub use pipe::RemotePipe;
pub use request::{
    BoxFuture, CallContext, CallDecorator, CallHandler, PayloadFilter, PendingCall, RoleChecker,
};
pub use window::PipeWindow;

pub use remlink_protocol::{Capability, Mode};

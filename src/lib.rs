//! parley: bidirectional calls and flow-controlled streams over a raw
//! message channel.
//!
//! A raw channel can only deliver discrete structured messages between two
//! named endpoints — no correlation, no flow control, no error typing. This
//! crate layers three protocols on top of that primitive:
//!
//! - fire-and-forget named actions ([`Endpoint::send`]),
//! - calls correlated by id, exposed as a single-resolution async outcome
//!   ([`Endpoint::call`]),
//! - flow-controlled push streams with pull-based, backpressure-aware
//!   consumption and explicit start/pull/cancel acknowledgement
//!   ([`Endpoint::open_stream`], [`StreamSink`]).
//!
//! Everything multiplexes over one raw channel per endpoint pair;
//! demultiplexing is by message shape. Handler failures cross the boundary
//! as wrapped reasons ([`Reason`]/[`WireReason`]); protocol violations are
//! fatal local conditions ([`ProtocolError`]), never replies.

#![deny(unsafe_code)]

mod error;
mod registry;
mod session;
mod sink;
mod stream;
mod transport;
mod wire;

pub use error::{ProtocolError, Reason, WireReason};
pub use session::Endpoint;
pub use sink::StreamSink;
pub use stream::{QueueHints, StreamReader};
pub use transport::{memory_pair, MemoryChannel, RawChannel, TransportError};
pub use wire::{CallId, Envelope, Message, Payload, StreamControl, StreamId};

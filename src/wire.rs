//! Wire-level message shapes.
//!
//! The raw channel delivers these structurally; a byte-oriented channel can
//! frame them with serde. Demultiplexing is by shape alone: a reply tag, a
//! call id, or a stream id/control tag.

use serde::{Deserialize, Serialize};

use crate::error::WireReason;

/// Call ID identifying an in-flight correlated call.
///
/// Call IDs are unique among calls outstanding on one endpoint instance and
/// monotonically increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CallId(pub u64);

impl CallId {
    /// Create a new call ID.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for CallId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call:{}", self.0)
    }
}

/// Stream ID identifying an open stream between two endpoints.
///
/// Stream IDs are an independent sequence from call IDs; no ordering is
/// implied between calls and streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Create a new stream ID.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for StreamId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream:{}", self.0)
    }
}

/// Application payload: opaque bytes plus any buffers whose ownership moves
/// to the receiving endpoint together with the message.
///
/// The sending endpoint must not read a transferred buffer after posting it;
/// move semantics make that structural here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Opaque application data.
    pub data: Vec<u8>,
    /// Buffers transferred to the peer.
    pub transfers: Vec<Vec<u8>>,
}

impl Payload {
    /// An empty payload.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A payload carrying only data bytes.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            transfers: Vec::new(),
        }
    }

    /// A payload carrying data bytes and transferred buffers.
    pub fn with_transfers(data: impl Into<Vec<u8>>, transfers: Vec<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            transfers,
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::bytes(data)
    }
}

/// Addressed container for every message on the raw channel.
///
/// Channels may be shared; an endpoint ignores envelopes whose `target` is
/// not its own name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Name of the sending endpoint.
    pub source: String,
    /// Name of the endpoint this message is addressed to.
    pub target: String,
    /// The message itself.
    pub body: Message,
}

/// Protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Action invocation. With a call id, exactly one [`Message::Reply`]
    /// comes back; without one the action is fire-and-forget.
    Action {
        action: String,
        call_id: Option<CallId>,
        payload: Payload,
    },

    /// Reply to a correlated call. `Ok` is the DATA kind, `Err` the ERROR
    /// kind carrying the wrapped reason.
    Reply {
        call_id: CallId,
        result: Result<Payload, WireReason>,
    },

    /// Open a stream: invoke `action` on the serving endpoint with a sink
    /// seeded with the consumer's reported desired size.
    StreamStart {
        action: String,
        stream_id: StreamId,
        desired_size: i64,
        payload: Payload,
    },

    /// Stream lifecycle control.
    Stream {
        stream_id: StreamId,
        control: StreamControl,
    },
}

/// Control messages for one open stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamControl {
    /// Producer acknowledges stream start, success or wrapped failure.
    StartComplete { result: Result<(), WireReason> },

    /// Consumer requests the next chunk(s), reporting its current desired
    /// size. Never sent while a previous pull is unacknowledged.
    Pull { desired_size: i64 },

    /// Producer acknowledges a pull once its pull work settled.
    PullComplete { result: Result<(), WireReason> },

    /// Producer pushes one chunk, declaring the size it counts against the
    /// consumer's desired size.
    Enqueue { chunk: Payload, size: i64 },

    /// Producer ends the stream normally.
    Close,

    /// Producer ends the stream with a failure.
    Error { reason: WireReason },

    /// Consumer cancels the stream with a reason.
    Cancel { reason: WireReason },

    /// Producer acknowledges cancellation, success or wrapped failure.
    CancelComplete { result: Result<(), WireReason> },
}

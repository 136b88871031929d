//! Consumer-side stream state and the pull-based reader.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::Reason;
use crate::session::Endpoint;
use crate::transport::RawChannel;
use crate::wire::{Payload, StreamId};

/// Hints for the consumer-side buffer, reported to the producer as the
/// initial desired size.
#[derive(Debug, Clone, Copy)]
pub struct QueueHints {
    /// How many chunk size units the consumer wants buffered ahead.
    pub high_water_mark: i64,
}

impl Default for QueueHints {
    fn default() -> Self {
        Self { high_water_mark: 1 }
    }
}

/// One buffered consumer-side event, delivered by the endpoint drive loop.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Chunk(Payload),
    Close,
    Error(Reason),
}

pub(crate) type AckSender = oneshot::Sender<Result<(), Reason>>;
pub(crate) type AckReceiver = oneshot::Receiver<Result<(), Reason>>;

/// Consumer-side controller entry, owned by the endpoint's stream table.
///
/// The entry is released only once it is closed and no acknowledgement slot
/// is outstanding, so a late-arriving ack still finds its slot.
pub(crate) struct StreamEntry {
    pub(crate) events: mpsc::UnboundedSender<StreamEvent>,
    pub(crate) start_ack: Option<AckSender>,
    pub(crate) pull_ack: Option<AckSender>,
    pub(crate) cancel_ack: Option<AckSender>,
    pub(crate) closed: bool,
}

impl StreamEntry {
    pub(crate) fn new(events: mpsc::UnboundedSender<StreamEvent>, start_ack: AckSender) -> Self {
        Self {
            events,
            start_ack: Some(start_ack),
            pull_ack: None,
            cancel_ack: None,
            closed: false,
        }
    }

    /// True once the entry holds no state a late-arriving message could
    /// still need.
    pub(crate) fn settled(&self) -> bool {
        self.closed
            && self.start_ack.is_none()
            && self.pull_ack.is_none()
            && self.cancel_ack.is_none()
    }
}

/// Pull-based reader over a producer-driven sequence of chunks.
///
/// Non-restartable: once the sequence ends (close, error, or cancel) it
/// stays ended. `&mut self` on [`StreamReader::next`] plus awaiting the pull
/// acknowledgement inside it means a second pull is never issued before the
/// previous one is acknowledged.
pub struct StreamReader<C: RawChannel> {
    endpoint: Arc<Endpoint<C>>,
    stream_id: StreamId,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    high_water_mark: i64,
    finished: bool,
}

impl<C: RawChannel> std::fmt::Debug for StreamReader<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("stream_id", &self.stream_id)
            .field("high_water_mark", &self.high_water_mark)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<C: RawChannel> StreamReader<C> {
    pub(crate) fn new(
        endpoint: Arc<Endpoint<C>>,
        stream_id: StreamId,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        high_water_mark: i64,
    ) -> Self {
        Self {
            endpoint,
            stream_id,
            events,
            high_water_mark,
            finished: false,
        }
    }

    /// The stream this reader consumes.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Next chunk of the sequence.
    ///
    /// Returns `Ok(None)` once the producer closed the stream, or the
    /// producer's failure if it errored. When nothing is buffered, one pull
    /// is sent and acknowledged before suspending for the next chunk; a
    /// failed pull acknowledgement errors the sequence.
    pub async fn next(&mut self) -> Result<Option<Payload>, Reason> {
        if self.finished {
            return Ok(None);
        }
        let event = match self.events.try_recv() {
            Ok(event) => event,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.finished = true;
                return Ok(None);
            }
            Err(mpsc::error::TryRecvError::Empty) => {
                if let Err(reason) = self.pull().await {
                    self.finished = true;
                    return Err(reason);
                }
                match self.events.recv().await {
                    Some(event) => event,
                    None => {
                        self.finished = true;
                        return Ok(None);
                    }
                }
            }
        };
        match event {
            StreamEvent::Chunk(chunk) => Ok(Some(chunk)),
            StreamEvent::Close => {
                self.finished = true;
                Ok(None)
            }
            StreamEvent::Error(reason) => {
                self.finished = true;
                Err(reason)
            }
        }
    }

    /// Cancel the stream, notifying the producer and suspending until it
    /// acknowledges. Late chunks already in flight are dropped.
    pub async fn cancel(&mut self, reason: Reason) -> Result<(), Reason> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let Some(ack) = self.endpoint.begin_cancel(self.stream_id) else {
            // Producer already closed the stream; nothing to cancel.
            return Ok(());
        };
        self.endpoint
            .post_stream(
                self.stream_id,
                crate::wire::StreamControl::Cancel {
                    reason: reason.to_wire(),
                },
            )
            .await
            .map_err(|e| Reason::Abort(e.to_string()))?;
        match ack.await {
            Ok(result) => result,
            Err(_) => Err(Reason::Abort("endpoint detached".into())),
        }
    }

    /// Issue one pull and wait for its acknowledgement.
    async fn pull(&mut self) -> Result<(), Reason> {
        // Report remaining buffer capacity; buffered events count against it.
        let desired = self.high_water_mark - self.events.len() as i64;
        let Some(ack) = self.endpoint.begin_pull(self.stream_id) else {
            // Entry already released: a terminal event is queued for us.
            return Ok(());
        };
        self.endpoint
            .post_stream(
                self.stream_id,
                crate::wire::StreamControl::Pull {
                    desired_size: desired,
                },
            )
            .await
            .map_err(|e| Reason::Abort(e.to_string()))?;
        match ack.await {
            Ok(result) => result,
            Err(_) => Err(Reason::Abort("endpoint detached".into())),
        }
    }
}

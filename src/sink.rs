//! Producer-side stream sink.
//!
//! A [`StreamSink`] is created by the endpoint when a stream-start message
//! arrives and is handed to the registered stream handler. The handler pushes
//! chunks through it, gated by the desired size the consumer reports; once
//! cancelled, every operation on the sink is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::Reason;
use crate::registry::StreamFuture;
use crate::session::Endpoint;
use crate::transport::{RawChannel, TransportError};
use crate::wire::{Payload, StreamControl, StreamId};

type PullCallback = Box<dyn Fn() -> StreamFuture + Send + Sync>;
type CancelCallback = Box<dyn FnOnce(Reason) -> StreamFuture + Send>;

/// Readiness of the sink for further enqueues.
#[derive(Debug, Clone)]
pub(crate) enum ReadySignal {
    /// Desired size is positive; enqueue freely.
    Ready,
    /// Desired size is exhausted; wait for the consumer's next pull.
    Blocked,
    /// The consumer cancelled; enqueue-side waits fail with the reason.
    Cancelled(Reason),
}

/// Shared per-stream producer state, owned by the endpoint's sink table.
pub(crate) struct SinkState {
    desired_size: Mutex<i64>,
    cancelled: AtomicBool,
    ready: watch::Sender<ReadySignal>,
    on_pull: Mutex<Option<PullCallback>>,
    on_cancel: Mutex<Option<CancelCallback>>,
}

impl SinkState {
    pub(crate) fn new(desired_size: i64) -> Self {
        let initial = if desired_size > 0 {
            ReadySignal::Ready
        } else {
            ReadySignal::Blocked
        };
        Self {
            desired_size: Mutex::new(desired_size),
            cancelled: AtomicBool::new(false),
            ready: watch::Sender::new(initial),
            on_pull: Mutex::new(None),
            on_cancel: Mutex::new(None),
        }
    }

    /// Apply an inbound pull: resolve readiness if capacity reappeared,
    /// overwrite the tracked size, and return the `on_pull` future if a
    /// callback is installed.
    pub(crate) fn record_pull(&self, reported: i64) -> Option<StreamFuture> {
        {
            let mut desired = self.desired_size.lock();
            if *desired <= 0 && reported > 0 {
                self.ready.send_replace(ReadySignal::Ready);
            }
            *desired = reported;
        }
        self.on_pull.lock().as_ref().map(|f| f())
    }

    /// Apply an inbound cancel: mark cancelled, reject readiness so any
    /// in-flight enqueue-side wait unblocks immediately, and return the
    /// `on_cancel` future if a callback is installed.
    pub(crate) fn record_cancel(&self, reason: Reason) -> Option<StreamFuture> {
        self.cancelled.store(true, Ordering::Release);
        self.ready.send_replace(ReadySignal::Cancelled(reason.clone()));
        self.on_cancel.lock().take().map(|f| f(reason))
    }
}

/// Producer-side handle for pushing chunks into an open stream.
pub struct StreamSink<C: RawChannel> {
    endpoint: Arc<Endpoint<C>>,
    stream_id: StreamId,
    state: Arc<SinkState>,
}

impl<C: RawChannel> Clone for StreamSink<C> {
    fn clone(&self) -> Self {
        Self {
            endpoint: Arc::clone(&self.endpoint),
            stream_id: self.stream_id,
            state: Arc::clone(&self.state),
        }
    }
}

impl<C: RawChannel> StreamSink<C> {
    pub(crate) fn new(
        endpoint: Arc<Endpoint<C>>,
        stream_id: StreamId,
        state: Arc<SinkState>,
    ) -> Self {
        Self {
            endpoint,
            stream_id,
            state,
        }
    }

    /// The stream this sink feeds.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Remaining consumer capacity as last reported or decremented.
    /// Non-positive means the consumer is backpressuring.
    pub fn desired_size(&self) -> i64 {
        *self.state.desired_size.lock()
    }

    /// True once the stream was cancelled, closed, or errored. Never
    /// reverts.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Push one chunk, counting `size` against the consumer's desired size.
    ///
    /// A no-op once cancelled: the producer may not yet know the consumer
    /// stopped, and late chunks are dropped on the far side anyway.
    pub async fn enqueue(&self, chunk: Payload, size: i64) -> Result<(), TransportError> {
        if self.is_cancelled() {
            return Ok(());
        }
        let now_blocked = {
            let mut desired = self.state.desired_size.lock();
            let was_positive = *desired > 0;
            *desired -= size;
            was_positive && *desired <= 0
        };
        if now_blocked {
            self.state.ready.send_replace(ReadySignal::Blocked);
        }
        self.endpoint
            .post_stream(self.stream_id, StreamControl::Enqueue { chunk, size })
            .await
    }

    /// Suspend until the consumer's desired size is positive again.
    ///
    /// Fails with the cancel reason if the stream is cancelled while (or
    /// before) waiting.
    pub async fn ready(&self) -> Result<(), Reason> {
        let mut rx = self.state.ready.subscribe();
        let signal = rx
            .wait_for(|signal| !matches!(signal, ReadySignal::Blocked))
            .await
            .map_err(|_| Reason::Abort("endpoint detached".into()))?;
        match &*signal {
            ReadySignal::Ready => Ok(()),
            ReadySignal::Cancelled(reason) => Err(reason.clone()),
            ReadySignal::Blocked => unreachable!("wait_for skips Blocked"),
        }
    }

    /// End the stream normally. A no-op once cancelled; afterwards every
    /// sink operation is a no-op.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.state.cancelled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.endpoint.remove_sink(self.stream_id);
        self.endpoint
            .post_stream(self.stream_id, StreamControl::Close)
            .await
    }

    /// End the stream with a failure. A no-op once cancelled.
    pub async fn error(&self, reason: Reason) -> Result<(), TransportError> {
        if self.state.cancelled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.endpoint.remove_sink(self.stream_id);
        self.endpoint
            .post_stream(
                self.stream_id,
                StreamControl::Error {
                    reason: reason.to_wire(),
                },
            )
            .await
    }

    /// Install a callback run for each later-arriving pull. Its settled
    /// result becomes the pull acknowledgement.
    pub fn on_pull<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Reason>> + Send + 'static,
    {
        *self.state.on_pull.lock() = Some(Box::new(move || Box::pin(callback())));
    }

    /// Install a callback run when the consumer cancels, receiving the
    /// consumer's reason. Its settled result becomes the cancel
    /// acknowledgement.
    pub fn on_cancel<F, Fut>(&self, callback: F)
    where
        F: FnOnce(Reason) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), Reason>> + Send + 'static,
    {
        *self.state.on_cancel.lock() = Some(Box::new(move |reason| Box::pin(callback(reason))));
    }
}

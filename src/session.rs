//! Endpoint: the multiplexed call/stream session that owns the raw channel.
//!
//! The key invariant is that only [`Endpoint::run`] calls
//! [`RawChannel::recv`] — every inbound envelope is fully routed before the
//! next one is looked at, so the per-endpoint tables need no coordination
//! beyond their mutexes (never held across an await). Handler work runs in
//! spawned tasks so routing stays strictly sequential without waiting on it.
//!
//! ```text
//!                  ┌───────────────────────────────────┐
//!                  │             Endpoint              │
//!                  ├───────────────────────────────────┤
//!                  │  pending:  call id → oneshot      │
//!                  │  streams:  stream id → controller │
//!                  │  sinks:    stream id → sink state │
//!                  │  registry: action name → handler  │
//!                  └────────────────┬──────────────────┘
//!                                   │
//!                              drive loop
//!                                   │
//!        ┌──────────────┬───────────┴──────────┬────────────────┐
//!   stream control?   reply?               action?         stream start?
//!        │              │                      │                │
//!   ack/chunk      settle pending       dispatch handler,   create sink,
//!   routing        call exactly once    reply iff call id   invoke handler
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::error::{ProtocolError, Reason, WireReason};
use crate::registry::{ActionRegistry, Handler};
use crate::sink::{SinkState, StreamSink};
use crate::stream::{AckReceiver, QueueHints, StreamEntry, StreamEvent, StreamReader};
use crate::transport::{RawChannel, TransportError};
use crate::wire::{CallId, Envelope, Message, Payload, StreamControl, StreamId};

enum AckKind {
    Start,
    Pull,
    Cancel,
}

/// One side of a two-party call/stream session.
///
/// An endpoint multiplexes fire-and-forget actions, correlated calls, and
/// flow-controlled streams over one raw channel shared with exactly one
/// named peer. Wrap it in an [`Arc`] and spawn [`Endpoint::run`] to drive
/// inbound routing.
pub struct Endpoint<C: RawChannel> {
    name: String,
    peer: String,
    channel: Arc<C>,

    registry: Mutex<ActionRegistry<C>>,

    /// Pending call outcomes: call id → single-resolution slot. An entry is
    /// removed exactly once, on the first matching reply.
    pending: Mutex<HashMap<CallId, oneshot::Sender<Result<Payload, Reason>>>>,

    /// Consumer-side stream controllers.
    streams: Mutex<HashMap<StreamId, StreamEntry>>,

    /// Producer-side sink states.
    sinks: Mutex<HashMap<StreamId, Arc<SinkState>>>,

    next_call_id: AtomicU64,
    next_stream_id: AtomicU64,

    shutdown: watch::Sender<bool>,
}

impl<C: RawChannel> Endpoint<C> {
    /// Create an endpoint named `name`, talking to the peer endpoint named
    /// `peer` over `channel`.
    pub fn new(name: impl Into<String>, peer: impl Into<String>, channel: Arc<C>) -> Self {
        Self {
            name: name.into(),
            peer: peer.into(),
            channel,
            registry: Mutex::new(ActionRegistry::new()),
            pending: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            next_stream_id: AtomicU64::new(1),
            shutdown: watch::Sender::new(false),
        }
    }

    /// This endpoint's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The peer endpoint's name.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Register an action handler. With a call id on the inbound message the
    /// handler's settled result becomes the reply; without one it is
    /// fire-and-forget.
    ///
    /// # Panics
    ///
    /// Panics if `action` is already registered.
    pub fn register_action<F, Fut>(&self, action: &str, handler: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Payload, Reason>> + Send + 'static,
    {
        self.registry.lock().register_action(action, handler);
    }

    /// Register a stream handler, invoked with the start payload and the
    /// producer-side sink when the peer opens a stream for `action`.
    ///
    /// # Panics
    ///
    /// Panics if `action` is already registered.
    pub fn register_stream<F, Fut>(&self, action: &str, handler: F)
    where
        F: Fn(Payload, StreamSink<C>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Reason>> + Send + 'static,
    {
        self.registry.lock().register_stream(action, handler);
    }

    fn envelope_to(&self, target: &str, body: Message) -> Envelope {
        Envelope {
            source: self.name.clone(),
            target: target.to_owned(),
            body,
        }
    }

    fn envelope(&self, body: Message) -> Envelope {
        self.envelope_to(&self.peer, body)
    }

    /// Post a fire-and-forget action to the peer. No reply is expected.
    pub async fn send(&self, action: &str, payload: Payload) -> Result<(), TransportError> {
        self.channel
            .post(self.envelope(Message::Action {
                action: action.to_owned(),
                call_id: None,
                payload,
            }))
            .await
    }

    /// Post a correlated call and suspend until the peer replies.
    ///
    /// The outcome settles exactly once: with the handler's result, with the
    /// peer's wrapped failure, or immediately if the post itself fails (in
    /// which case nothing is left pending).
    pub async fn call(&self, action: &str, payload: Payload) -> Result<Payload, Reason> {
        let call_id = CallId::new(self.next_call_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(call_id, tx);
        debug!(%call_id, action, "posting correlated call");
        let env = self.envelope(Message::Action {
            action: action.to_owned(),
            call_id: Some(call_id),
            payload,
        });
        if let Err(e) = self.channel.post(env).await {
            self.pending.lock().remove(&call_id);
            return Err(Reason::Abort(e.to_string()));
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Reason::Abort("endpoint detached".into())),
        }
    }

    /// Open a flow-controlled stream for `action` on the peer.
    ///
    /// Suspends until the producer acknowledges the start; a start failure
    /// aborts creation with the producer's reason. The returned reader pulls
    /// chunks with backpressure derived from `hints.high_water_mark`.
    pub async fn open_stream(
        self: &Arc<Self>,
        action: &str,
        payload: Payload,
        hints: QueueHints,
    ) -> Result<StreamReader<C>, Reason> {
        let stream_id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::Relaxed));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (start_tx, start_rx) = oneshot::channel();
        self.streams
            .lock()
            .insert(stream_id, StreamEntry::new(events_tx, start_tx));
        debug!(%stream_id, action, "opening stream");
        let env = self.envelope(Message::StreamStart {
            action: action.to_owned(),
            stream_id,
            desired_size: hints.high_water_mark,
            payload,
        });
        if let Err(e) = self.channel.post(env).await {
            self.streams.lock().remove(&stream_id);
            return Err(Reason::Abort(e.to_string()));
        }
        match start_rx.await {
            Ok(Ok(())) => Ok(StreamReader::new(
                Arc::clone(self),
                stream_id,
                events_rx,
                hints.high_water_mark,
            )),
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err(Reason::Abort("endpoint detached".into())),
        }
    }

    /// Detach from the raw channel: the drive loop exits and every
    /// outstanding wait settles with an abort.
    pub fn detach(&self) {
        self.shutdown.send_replace(true);
    }

    /// Drive inbound routing until the channel closes, [`Endpoint::detach`]
    /// is called, or a fatal protocol violation is detected.
    pub async fn run(self: Arc<Self>) -> Result<(), ProtocolError> {
        let mut shutdown = self.shutdown.subscribe();
        let result = loop {
            let env = tokio::select! {
                _ = shutdown.wait_for(|detached| *detached) => break Ok(()),
                env = self.channel.recv() => match env {
                    Some(env) => env,
                    None => break Ok(()),
                },
            };
            if let Err(e) = self.route(env).await {
                error!("fatal protocol violation: {e}");
                break Err(e);
            }
        };
        self.drain();
        result
    }

    /// Drop every table entry; dangling oneshot senders settle their
    /// receivers with detachment.
    fn drain(&self) {
        self.pending.lock().clear();
        self.streams.lock().clear();
        self.sinks.lock().clear();
    }

    /// Classify and dispatch one inbound envelope.
    async fn route(self: &Arc<Self>, env: Envelope) -> Result<(), ProtocolError> {
        if env.target != self.name {
            // Channels may be shared; foreign traffic is not ours to judge.
            debug!(target = %env.target, "ignoring envelope for another endpoint");
            return Ok(());
        }
        let source = env.source;
        match env.body {
            Message::Stream { stream_id, control } => {
                self.route_stream(stream_id, control).await;
                Ok(())
            }
            Message::Reply { call_id, result } => {
                let waiter = self
                    .pending
                    .lock()
                    .remove(&call_id)
                    .ok_or(ProtocolError::UnknownCallId(call_id))?;
                // The caller may have stopped listening; that settles it too.
                let _ = waiter.send(result.map_err(WireReason::into_reason));
                Ok(())
            }
            Message::Action {
                action,
                call_id,
                payload,
            } => self.route_action(source, action, call_id, payload).await,
            Message::StreamStart {
                action,
                stream_id,
                desired_size,
                payload,
            } => {
                self.accept_stream(action, stream_id, desired_size, payload)
                    .await;
                Ok(())
            }
        }
    }

    async fn route_action(
        self: &Arc<Self>,
        source: String,
        action: String,
        call_id: Option<CallId>,
        payload: Payload,
    ) -> Result<(), ProtocolError> {
        let fut = {
            let registry = self.registry.lock();
            match registry.get(&action) {
                Some(Handler::Action(handler)) => Some(handler(payload)),
                Some(Handler::Stream(_)) | None => None,
            }
        };
        match (fut, call_id) {
            (Some(fut), Some(call_id)) => {
                // Exactly one reply, whether the handler settles now or later.
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let result = fut.await.map_err(|r| r.to_wire());
                    let reply = this.envelope_to(&source, Message::Reply { call_id, result });
                    if let Err(e) = this.channel.post(reply).await {
                        warn!(%call_id, "failed to post reply: {e}");
                    }
                });
                Ok(())
            }
            (Some(fut), None) => {
                tokio::spawn(async move {
                    if let Err(reason) = fut.await {
                        debug!(%reason, "fire-and-forget handler failed");
                    }
                });
                Ok(())
            }
            (None, Some(call_id)) => {
                // Nothing registered, but the caller is waiting: answer with
                // a typed failure instead of leaving the call pending.
                let reason = Reason::Unknown {
                    message: format!("unknown action {action:?}"),
                    details: String::new(),
                };
                let reply = self.envelope_to(
                    &source,
                    Message::Reply {
                        call_id,
                        result: Err(reason.to_wire()),
                    },
                );
                if let Err(e) = self.channel.post(reply).await {
                    warn!(%call_id, "failed to post unknown-action reply: {e}");
                }
                Ok(())
            }
            (None, None) => {
                // No reply channel exists; fatal to this message only.
                error!("{}", ProtocolError::UnknownAction(action));
                Ok(())
            }
        }
    }

    /// A stream-start message arrived: create the producer-side sink and
    /// invoke the stream handler. The handler's settled result becomes the
    /// start acknowledgement.
    async fn accept_stream(
        self: &Arc<Self>,
        action: String,
        stream_id: StreamId,
        desired_size: i64,
        payload: Payload,
    ) {
        let state = Arc::new(SinkState::new(desired_size));
        let fut = {
            let registry = self.registry.lock();
            match registry.get(&action) {
                Some(Handler::Stream(handler)) => {
                    let sink = StreamSink::new(Arc::clone(self), stream_id, Arc::clone(&state));
                    Some(handler(payload, sink))
                }
                Some(Handler::Action(_)) | None => None,
            }
        };
        match fut {
            Some(fut) => {
                self.sinks.lock().insert(stream_id, state);
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let result = fut.await.map_err(|r| r.to_wire());
                    if let Err(e) = this
                        .post_stream(stream_id, StreamControl::StartComplete { result })
                        .await
                    {
                        warn!(%stream_id, "failed to post start acknowledgement: {e}");
                    }
                });
            }
            None => {
                error!("{}", ProtocolError::UnknownAction(action.clone()));
                let reason = Reason::Unknown {
                    message: format!("unknown stream action {action:?}"),
                    details: String::new(),
                };
                let _ = self
                    .post_stream(
                        stream_id,
                        StreamControl::StartComplete {
                            result: Err(reason.to_wire()),
                        },
                    )
                    .await;
            }
        }
    }

    async fn route_stream(self: &Arc<Self>, stream_id: StreamId, control: StreamControl) {
        match control {
            // Producer side: consumer-driven control.
            StreamControl::Pull { desired_size } => {
                let state = self.sinks.lock().get(&stream_id).cloned();
                match state {
                    None => {
                        // Sink already closed; ack immediately so close/pull
                        // races stay idempotent.
                        let _ = self
                            .post_stream(
                                stream_id,
                                StreamControl::PullComplete { result: Ok(()) },
                            )
                            .await;
                    }
                    Some(state) => {
                        let fut = state.record_pull(desired_size);
                        let this = Arc::clone(self);
                        tokio::spawn(async move {
                            let result = match fut {
                                Some(fut) => fut.await,
                                None => Ok(()),
                            }
                            .map_err(|r| r.to_wire());
                            let _ = this
                                .post_stream(stream_id, StreamControl::PullComplete { result })
                                .await;
                        });
                    }
                }
            }
            StreamControl::Cancel { reason } => {
                let Some(state) = self.sinks.lock().remove(&stream_id) else {
                    return;
                };
                let fut = state.record_cancel(reason.into_reason());
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let result = match fut {
                        Some(fut) => fut.await,
                        None => Ok(()),
                    }
                    .map_err(|r| r.to_wire());
                    let _ = this
                        .post_stream(stream_id, StreamControl::CancelComplete { result })
                        .await;
                });
            }

            // Consumer side: producer-driven traffic.
            StreamControl::Enqueue { chunk, size: _ } => {
                let streams = self.streams.lock();
                match streams.get(&stream_id) {
                    Some(entry) if !entry.closed => {
                        let _ = entry.events.send(StreamEvent::Chunk(chunk));
                    }
                    // The producer may not yet know we stopped.
                    _ => debug!(%stream_id, "dropping late chunk"),
                }
            }
            StreamControl::Close => self.finish_stream(stream_id, StreamEvent::Close),
            StreamControl::Error { reason } => {
                self.finish_stream(stream_id, StreamEvent::Error(reason.into_reason()))
            }
            StreamControl::StartComplete { result } => {
                self.settle_ack(stream_id, AckKind::Start, result)
            }
            StreamControl::PullComplete { result } => {
                self.settle_ack(stream_id, AckKind::Pull, result)
            }
            StreamControl::CancelComplete { result } => {
                self.settle_ack(stream_id, AckKind::Cancel, result)
            }
        }
    }

    /// Terminal producer-side event: mark the controller closed, deliver the
    /// event once, release the entry when nothing late can still need it.
    fn finish_stream(&self, stream_id: StreamId, event: StreamEvent) {
        let mut streams = self.streams.lock();
        let Some(entry) = streams.get_mut(&stream_id) else {
            debug!(%stream_id, "dropping terminal event for released stream");
            return;
        };
        if !entry.closed {
            entry.closed = true;
            let _ = entry.events.send(event);
        }
        if entry.settled() {
            streams.remove(&stream_id);
        }
    }

    fn settle_ack(&self, stream_id: StreamId, kind: AckKind, result: Result<(), WireReason>) {
        let result = result.map_err(WireReason::into_reason);
        let mut streams = self.streams.lock();
        let Some(entry) = streams.get_mut(&stream_id) else {
            warn!(%stream_id, "stray acknowledgement for released stream");
            return;
        };
        let slot = match kind {
            AckKind::Start => &mut entry.start_ack,
            AckKind::Pull => &mut entry.pull_ack,
            AckKind::Cancel => &mut entry.cancel_ack,
        };
        match slot.take() {
            Some(tx) => {
                let start_failed = matches!(kind, AckKind::Start) && result.is_err();
                let _ = tx.send(result);
                // A failed start means the stream was never born.
                if start_failed {
                    entry.closed = true;
                }
            }
            None => warn!(%stream_id, "acknowledgement with no pending capability"),
        }
        if entry.settled() {
            streams.remove(&stream_id);
        }
    }

    /// Post one stream-control message to the peer.
    pub(crate) async fn post_stream(
        &self,
        stream_id: StreamId,
        control: StreamControl,
    ) -> Result<(), TransportError> {
        self.channel
            .post(self.envelope(Message::Stream { stream_id, control }))
            .await
    }

    /// Arm the pull acknowledgement slot for a stream, if it still exists.
    pub(crate) fn begin_pull(&self, stream_id: StreamId) -> Option<AckReceiver> {
        let mut streams = self.streams.lock();
        let entry = streams.get_mut(&stream_id)?;
        let (tx, rx) = oneshot::channel();
        entry.pull_ack = Some(tx);
        Some(rx)
    }

    /// Mark a stream closed and arm its cancel acknowledgement slot, if it
    /// still exists.
    pub(crate) fn begin_cancel(&self, stream_id: StreamId) -> Option<AckReceiver> {
        let mut streams = self.streams.lock();
        let entry = streams.get_mut(&stream_id)?;
        entry.closed = true;
        let (tx, rx) = oneshot::channel();
        entry.cancel_ack = Some(tx);
        Some(rx)
    }

    pub(crate) fn remove_sink(&self, stream_id: StreamId) {
        self.sinks.lock().remove(&stream_id);
    }
}

//! Action registry: one name, one handler.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::error::Reason;
use crate::sink::StreamSink;
use crate::transport::RawChannel;
use crate::wire::Payload;

pub(crate) type ActionFuture = Pin<Box<dyn Future<Output = Result<Payload, Reason>> + Send>>;
pub(crate) type StreamFuture = Pin<Box<dyn Future<Output = Result<(), Reason>> + Send>>;

type BoxedActionHandler = Box<dyn Fn(Payload) -> ActionFuture + Send + Sync>;
type BoxedStreamHandler<C> = Box<dyn Fn(Payload, StreamSink<C>) -> StreamFuture + Send + Sync>;

/// A registered handler: either a plain action or a stream producer.
pub(crate) enum Handler<C: RawChannel> {
    Action(BoxedActionHandler),
    Stream(BoxedStreamHandler<C>),
}

/// Maps an action name to exactly one handler.
pub(crate) struct ActionRegistry<C: RawChannel> {
    handlers: HashMap<String, Handler<C>>,
}

impl<C: RawChannel> ActionRegistry<C> {
    pub(crate) fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register an action handler.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered. Registering the same name
    /// twice is a programming error, not a runtime condition.
    pub(crate) fn register_action<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, Reason>> + Send + 'static,
    {
        self.insert(
            name,
            Handler::Action(Box::new(move |payload| Box::pin(handler(payload)))),
        );
    }

    /// Register a stream handler, invoked with the start payload and the
    /// producer-side sink.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered.
    pub(crate) fn register_stream<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Payload, StreamSink<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Reason>> + Send + 'static,
    {
        self.insert(
            name,
            Handler::Stream(Box::new(move |payload, sink| {
                Box::pin(handler(payload, sink))
            })),
        );
    }

    fn insert(&mut self, name: &str, handler: Handler<C>) {
        let prev = self.handlers.insert(name.to_owned(), handler);
        assert!(prev.is_none(), "action {name:?} is already registered");
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Handler<C>> {
        self.handlers.get(name)
    }
}

//! Routing shared by both ends of a link
//!
//! A [`Router`] is bound to one child ID and one [`Transport`]. Outbound data is wrapped
//! into an [`Envelope`] carrying that ID; inbound messages are dispatched to channel
//! listeners only when they carry the same ID.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;

use crate::emitter::{self, ChannelEmitter, Listener, ListenerId};
use crate::envelope::{Channel, Envelope};
use crate::error::Result;
use crate::transport::Transport;
use crate::ChildId;

/// Named-channel router scoped to a single child ID
pub struct Router<T> {
    /// Child whose envelopes this router sends and accepts
    id: ChildId,
    /// Link toward the other side
    transport: T,
    /// Channel listeners
    emitter: ChannelEmitter,
    /// Observers of every inbound message, routed or not
    raw_listeners: Mutex<Vec<Arc<Mutex<Listener>>>>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for Router<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("emitter", &self.emitter)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Router<T> {
    /// Create a new [`Router`] bound to `id`, sending over `transport`
    pub fn new(id: impl Into<ChildId>, transport: T) -> Self {
        Self {
            id: id.into(),
            transport,
            emitter: ChannelEmitter::new(),
            raw_listeners: Mutex::new(Vec::new()),
        }
    }

    /// ID of the child this router is bound to
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Transport underneath this router
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send `data` on `channel` to the other side
    ///
    /// Returns as soon as the message is handed to the transport. Errors from the
    /// transport are returned as-is.
    pub fn send(&self, channel: impl Into<Channel>, data: Option<Value>) -> Result<()> {
        let message = Envelope::new(self.id.as_str(), channel, data).to_message()?;
        self.transport.send_message(&message)
    }

    /// Serialize `data` and send it on `channel` to the other side
    pub fn send_serialized<D: Serialize>(
        &self,
        channel: impl Into<Channel>,
        data: &D,
    ) -> Result<()> {
        self.send(channel, Some(serde_json::to_value(data)?))
    }

    /// Send a message that bypasses routing
    ///
    /// The other side's router ignores it unless it happens to be an envelope, but it is
    /// visible to raw listeners registered with [`Router::on_message`].
    pub fn send_raw(&self, message: &Value) -> Result<()> {
        self.transport.send_message(message)
    }

    /// Listen to every message on `channel`
    pub fn on<F>(&self, channel: impl Into<Channel>, listener: F) -> ListenerId
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.emitter.on(channel, listener)
    }

    /// Listen to the next message on `channel` only
    pub fn once<F>(&self, channel: impl Into<Channel>, listener: F) -> ListenerId
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.emitter.once(channel, listener)
    }

    /// Remove a listener registered with [`Router::on`] or [`Router::once`]
    pub fn off(&self, channel: impl Into<Channel>, id: ListenerId) -> bool {
        self.emitter.off(channel, id)
    }

    /// Number of listeners registered on `channel`
    #[must_use]
    pub fn listener_count(&self, channel: impl Into<Channel>) -> usize {
        self.emitter.listener_count(channel)
    }

    /// Observe every inbound message before routing, including ones for other protocols
    pub fn on_message<F>(&self, listener: F)
    where
        F: FnMut(&Value) + Send + 'static,
    {
        let listener: Listener = Box::new(listener);
        self.raw_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(Mutex::new(listener)));
    }

    /// Handle one inbound message from the transport
    ///
    /// Returns `true` if the message was an envelope bound to this router's ID, in which
    /// case it has been dispatched on its channel. Anything else is dropped silently.
    pub fn route(&self, message: &Value) -> bool {
        let raw_listeners = self
            .raw_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &raw_listeners {
            emitter::invoke(listener, message);
        }

        match Envelope::open(message, &self.id) {
            Some((channel, data)) => {
                self.emitter.emit(&channel, &data);
                true
            }
            None => false,
        }
    }
}

/*!
Links that carry raw messages between a parent and a child.

Routers only need to push a structured value toward the other side, so anything
ordered and reliable can carry the protocol. Two links are provided:

- [`IpcTransport`], over [`ipc-channel`][crate-ipc-channel], used between real processes
- [`MemoryTransport`], over a [`std::sync::mpsc`] channel, for routers living in one process

[crate-ipc-channel]: https://crates.io/crates/ipc-channel
**/

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

use ipc_channel::ipc::{IpcReceiver, IpcSender};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, WtforkError};

/// An ordered, reliable, message-oriented link toward the other side
pub trait Transport: Send + Sync + 'static {
    /// Push a single message onto the link
    ///
    /// This must not wait for the other side to process the message.
    fn send_message(&self, message: &Value) -> Result<()>;
}

/// State of the outbound half of an [`IpcTransport`]
enum LinkState {
    /// Handshake not done yet, messages are held in send order
    Pending(Vec<Vec<u8>>),
    /// Handshake done, messages go straight to the peer
    Connected(IpcSender<Vec<u8>>),
    /// Peer gone or never linked, nothing is accepted any more
    Closed,
}

/// [`Transport`] over an [`ipc-channel`] sender
///
/// Messages are serialized to JSON bytes. A transport created with
/// [`IpcTransport::pending`] queues messages until the link is connected, then flushes
/// them in order.
pub struct IpcTransport {
    /// Outbound half of the link
    state: Mutex<LinkState>,
}

impl std::fmt::Debug for IpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.lock() {
            LinkState::Pending(queued) => format!("pending ({} queued)", queued.len()),
            LinkState::Connected(_) => "connected".into(),
            LinkState::Closed => "closed".into(),
        };
        f.debug_struct("IpcTransport").field("state", &state).finish()
    }
}

impl IpcTransport {
    /// Create a transport that holds messages until [`IpcTransport::connect`] is called
    pub(crate) fn pending() -> Self {
        Self {
            state: Mutex::new(LinkState::Pending(Vec::new())),
        }
    }

    /// Create a transport that sends over an already established link
    pub(crate) fn connected(sender: IpcSender<Vec<u8>>) -> Self {
        Self {
            state: Mutex::new(LinkState::Connected(sender)),
        }
    }

    /// Attach the established link, flushing anything queued so far
    ///
    /// Has no effect if the transport was closed in the meantime.
    pub(crate) fn connect(&self, sender: IpcSender<Vec<u8>>) -> Result<()> {
        let mut state = self.lock();
        let queued = match std::mem::replace(&mut *state, LinkState::Closed) {
            LinkState::Pending(queued) => queued,
            LinkState::Connected(_) | LinkState::Closed => return Ok(()),
        };
        debug!(queued = queued.len(), "flushing queued messages");
        for bytes in queued {
            sender.send(bytes).map_err(WtforkError::transport)?;
        }
        *state = LinkState::Connected(sender);
        Ok(())
    }

    /// Stop accepting messages, dropping any that are still queued
    pub(crate) fn close(&self) {
        *self.lock() = LinkState::Closed;
    }

    /// Close the link once the returned guard is dropped, even on unwind
    pub(crate) fn close_on_drop(&self) -> CloseOnDrop<'_> {
        CloseOnDrop(self)
    }

    /// Whether the link has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(*self.lock(), LinkState::Closed)
    }

    /// Whether the link is still waiting for the handshake
    pub(crate) fn is_pending(&self) -> bool {
        matches!(*self.lock(), LinkState::Pending(_))
    }

    /// Lock the link state, ignoring poisoning
    fn lock(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Closes an [`IpcTransport`] when dropped
pub(crate) struct CloseOnDrop<'a>(
    /// Transport to close
    &'a IpcTransport,
);

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl Transport for IpcTransport {
    fn send_message(&self, message: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(message)?;
        match &mut *self.lock() {
            LinkState::Pending(queued) => {
                queued.push(bytes);
                Ok(())
            }
            LinkState::Connected(sender) => sender.send(bytes).map_err(WtforkError::transport),
            LinkState::Closed => Err(WtforkError::TransportClosed),
        }
    }
}

/// Receive messages from `receiver` until the other side disconnects
///
/// Every message that decodes as JSON is handed to `on_message`, in arrival order.
/// Anything else is skipped.
pub(crate) fn pump<F>(receiver: &IpcReceiver<Vec<u8>>, mut on_message: F)
where
    F: FnMut(Value),
{
    debug!("starting receive loop...");
    while let Ok(bytes) = receiver.recv() {
        if let Ok(message) = serde_json::from_slice::<Value>(&bytes) {
            on_message(message);
        }
    }
    debug!("peer disconnected, receive loop finished");
}

/// [`Transport`] that delivers messages into an in-process channel
///
/// The paired [`Receiver`] is drained by whoever owns the other router, e.g.
///
/// ```
/// # use wtfork::{MemoryTransport, ParentRouter};
/// let (transport, outbound) = MemoryTransport::new();
/// let parent = ParentRouter::new("child-1", transport);
/// parent.send("work", None).unwrap();
/// assert!(outbound.try_recv().is_ok());
/// ```
#[derive(Debug)]
pub struct MemoryTransport {
    /// Sending end, paired with the receiver returned from [`MemoryTransport::new`]
    sender: Mutex<Sender<Value>>,
}

impl MemoryTransport {
    /// Create a new [`MemoryTransport`] along with the receiving end of its messages
    #[must_use]
    pub fn new() -> (Self, Receiver<Value>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }
}

impl Transport for MemoryTransport {
    fn send_message(&self, message: &Value) -> Result<()> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(message.clone())
            .map_err(|_| WtforkError::TransportClosed)
    }
}

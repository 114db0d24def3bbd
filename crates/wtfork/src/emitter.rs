//! Named-channel listener registry

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use serde_json::Value;

use crate::envelope::Channel;

/// Callback invoked with the payload of a message dispatched on a channel
pub type Listener = Box<dyn FnMut(&Value) + Send + 'static>;

/// Handle to a registered listener, used to remove it again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(
    /// Registration sequence number, unique per emitter
    u64,
);

/// A registered listener
struct Entry {
    /// Handle returned at registration
    id: ListenerId,
    /// Removed after its first invocation
    once: bool,
    /// The callback, locked while it runs
    listener: Arc<Mutex<Listener>>,
}

/// Dispatches payloads to the listeners registered for a channel
///
/// Listeners are called in registration order. The registry is not locked while a
/// listener runs, so listeners may register or remove listeners themselves. A listener
/// that is already running (e.g. one that re-enters [`ChannelEmitter::emit`] on its own
/// channel) is skipped rather than called recursively.
#[derive(Default)]
pub struct ChannelEmitter {
    /// Source of [`ListenerId`]s
    next_id: AtomicU64,
    /// Registered listeners, per channel, in registration order
    listeners: Mutex<HashMap<Channel, Vec<Entry>>>,
}

impl std::fmt::Debug for ChannelEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.lock();
        let counts: HashMap<&str, usize> = listeners
            .iter()
            .map(|(channel, entries)| (channel.as_str(), entries.len()))
            .collect();
        f.debug_struct("ChannelEmitter")
            .field("listeners", &counts)
            .finish()
    }
}

impl ChannelEmitter {
    /// Create a new, empty [`ChannelEmitter`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener that is called for every message on `channel`
    pub fn on<F>(&self, channel: impl Into<Channel>, listener: F) -> ListenerId
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.register(channel.into(), false, Box::new(listener))
    }

    /// Register a listener that is called for the next message on `channel` only
    pub fn once<F>(&self, channel: impl Into<Channel>, listener: F) -> ListenerId
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.register(channel.into(), true, Box::new(listener))
    }

    /// Remove a previously registered listener
    ///
    /// Returns whether the listener was still registered.
    pub fn off(&self, channel: impl Into<Channel>, id: ListenerId) -> bool {
        let channel = channel.into();
        let mut listeners = self.lock();
        let Some(entries) = listeners.get_mut(&channel) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(&channel);
        }
        removed
    }

    /// Number of listeners currently registered for `channel`
    #[must_use]
    pub fn listener_count(&self, channel: impl Into<Channel>) -> usize {
        self.lock().get(&channel.into()).map_or(0, Vec::len)
    }

    /// Dispatch `data` to every listener registered for `channel`
    ///
    /// Returns the number of listeners invoked, not counting ones that were skipped
    /// because they are already running.
    pub fn emit(&self, channel: &Channel, data: &Value) -> usize {
        let batch: Vec<Arc<Mutex<Listener>>> = {
            let mut listeners = self.lock();
            let Some(entries) = listeners.get_mut(channel) else {
                return 0;
            };
            let batch = entries
                .iter()
                .map(|entry| Arc::clone(&entry.listener))
                .collect();
            entries.retain(|entry| !entry.once);
            if entries.is_empty() {
                listeners.remove(channel);
            }
            batch
        };

        batch
            .iter()
            .filter(|listener| invoke(listener, data))
            .count()
    }

    /// Add a listener for `channel`
    fn register(&self, channel: Channel, once: bool, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().entry(channel).or_default().push(Entry {
            id,
            once,
            listener: Arc::new(Mutex::new(listener)),
        });
        id
    }

    /// Lock the registry, ignoring poisoning
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Channel, Vec<Entry>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Call `listener` with `data`, unless it is already running further up the stack
///
/// Returns whether the listener was called.
pub(crate) fn invoke(listener: &Mutex<Listener>, data: &Value) -> bool {
    let mut listener = match listener.try_lock() {
        Ok(listener) => listener,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        Err(TryLockError::WouldBlock) => return false,
    };
    (*listener)(data);
    true
}

//! Parent side of the link to a single forked child

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::envelope::Channel;
use crate::router::Router;
use crate::transport::{IpcTransport, Transport};
use crate::ChildId;

/// Router held by the parent for one forked child
///
/// Dereferences to [`Router`] for sending and listening. Clones share the same listeners,
/// transport and ready flag.
#[derive(Debug)]
pub struct ParentRouter<T = IpcTransport> {
    /// Routing core, shared with the background link thread
    router: Arc<Router<T>>,
    /// Set on the first `wtfork:child_ready` from the child, never reset
    ready: Arc<AtomicBool>,
}

impl<T> Clone for ParentRouter<T> {
    fn clone(&self) -> Self {
        Self {
            router: Arc::clone(&self.router),
            ready: Arc::clone(&self.ready),
        }
    }
}

impl<T: Transport> ParentRouter<T> {
    /// Create a new [`ParentRouter`] for the child `id`, reachable over `transport`
    pub fn new(id: impl Into<ChildId>, transport: T) -> Self {
        let router = Arc::new(Router::new(id, transport));
        let ready = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ready);
        let child_id = router.id().to_string();
        router.once(Channel::ChildReady, move |_| {
            debug!(child_id, "child router is ready");
            flag.store(true, Ordering::Release);
        });

        Self { router, ready }
    }
}

impl<T> ParentRouter<T> {
    /// Whether the child has announced that its router is live
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

impl<T> Deref for ParentRouter<T> {
    type Target = Router<T>;

    fn deref(&self) -> &Router<T> {
        &self.router
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use serde_json::json;

    use super::*;
    use crate::envelope::Envelope;
    use crate::transport::MemoryTransport;

    fn ready_message(id: &str) -> serde_json::Value {
        Envelope::new(id, Channel::ChildReady, Some(json!(id)))
            .to_message()
            .unwrap()
    }

    #[test]
    fn ready_flag_is_set_on_first_announcement_only() {
        let (transport, _outbound) = MemoryTransport::new();
        let parent = ParentRouter::new("abc", transport);
        let (tx, rx) = mpsc::channel();
        parent.on(Channel::ChildReady, move |data| tx.send(data.clone()).unwrap());
        assert!(!parent.is_ready());

        assert!(parent.route(&ready_message("abc")));
        assert!(parent.is_ready());
        assert!(parent.route(&ready_message("abc")));
        assert!(parent.is_ready());

        // Application listeners still see every announcement
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![json!("abc"), json!("abc")]);
    }

    #[test]
    fn ready_from_another_child_is_ignored() {
        let (transport, _outbound) = MemoryTransport::new();
        let parent = ParentRouter::new("abc", transport);
        assert!(!parent.route(&ready_message("def")));
        assert!(!parent.is_ready());
    }

    #[test]
    fn clones_share_state() {
        let (transport, _outbound) = MemoryTransport::new();
        let parent = ParentRouter::new("abc", transport);
        let clone = parent.clone();
        clone.on("x", |_| {});

        parent.route(&ready_message("abc"));
        assert!(clone.is_ready());
        assert_eq!(parent.listener_count("x"), 1);
    }

    #[test]
    fn routers_for_different_children_stay_isolated() {
        let (transport_a, _outbound_a) = MemoryTransport::new();
        let (transport_b, _outbound_b) = MemoryTransport::new();
        let child_a = ParentRouter::new("a", transport_a);
        let child_b = ParentRouter::new("b", transport_b);
        let (tx, rx) = mpsc::channel();
        child_b.on("work", move |_| tx.send(()).unwrap());

        let for_a = Envelope::new("a", "work", None).to_message().unwrap();
        assert!(child_a.route(&for_a));
        assert!(!child_b.route(&for_a));
        assert!(rx.try_recv().is_err());
    }
}

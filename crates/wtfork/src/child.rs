//! Child side of the link back to the parent

use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use ipc_channel::ipc::IpcReceiver;
use tracing::debug;

use crate::envelope::Channel;
use crate::error::{Result, WtforkError};
use crate::handshake;
use crate::router::Router;
use crate::transport::{self, IpcTransport, Transport};
use crate::{ChildId, ENV_VAR_CHILD_ID, ENV_VAR_IPC_SERVER};

/// Router held by a forked child, pointing back at its parent
///
/// Application code obtains it once with [`ChildRouter::install`] and keeps it for as
/// long as it talks to the parent. Dereferences to [`Router`].
pub struct ChildRouter<T = IpcTransport> {
    /// Routing core, shared with the receive loop
    router: Arc<Router<T>>,
    /// Inbound half of the link, until the receive loop takes it
    inbound: Arc<Mutex<Option<IpcReceiver<Vec<u8>>>>>,
    /// Receive loop, once started and until joined
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for ChildRouter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildRouter")
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl<T> Clone for ChildRouter<T> {
    fn clone(&self) -> Self {
        Self {
            router: Arc::clone(&self.router),
            inbound: Arc::clone(&self.inbound),
            pump: Arc::clone(&self.pump),
        }
    }
}

impl<T: Transport> ChildRouter<T> {
    /// Bind a router for child `id` to `transport` and announce it to the parent
    ///
    /// Inbound messages must be fed to [`Router::route`] by the caller.
    pub fn attach(id: impl Into<ChildId>, transport: T) -> Result<Self> {
        let child = Self::with_inbound(Router::new(id, transport), None);
        child.announce()?;
        Ok(child)
    }

    /// Wrap `router`, with `inbound` left for [`ChildRouter::listen`] to pump
    fn with_inbound(router: Router<T>, inbound: Option<IpcReceiver<Vec<u8>>>) -> Self {
        Self {
            router: Arc::new(router),
            inbound: Arc::new(Mutex::new(inbound)),
            pump: Arc::new(Mutex::new(None)),
        }
    }

    /// One-shot `wtfork:child_ready` carrying our own ID, never retried
    fn announce(&self) -> Result<()> {
        let id = self.router.id().to_string();
        debug!(child_id = id.as_str(), "announcing child router to parent...");
        self.router.send(Channel::ChildReady, Some(id.into()))
    }
}

impl ChildRouter<IpcTransport> {
    /// Install the router if this process was forked by [`crate::fork`]
    ///
    /// Returns `None` when the process environment carries no child ID, in which case the
    /// process is an ordinary child and nothing is set up.
    pub fn install() -> Result<Option<Self>> {
        Self::install_from_vars(std::env::vars())
    }

    /// Install the router using the given environment variables
    ///
    /// Connects back to the parent, then sends `wtfork:child_ready`. Messages from the
    /// parent are held by the link until [`ChildRouter::listen`] or
    /// [`ChildRouter::wait`] is called, so listeners registered in between miss nothing.
    pub fn install_from_vars(
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Option<Self>> {
        let mut child_id = None;
        let mut ipc_server_name = None;
        for (k, v) in vars {
            match k.as_str() {
                ENV_VAR_CHILD_ID => child_id = Some(v),
                ENV_VAR_IPC_SERVER => ipc_server_name = Some(v),
                _ => {}
            }
        }

        let Some(child_id) = child_id else {
            debug!("no child id in environment, running without a parent router");
            return Ok(None);
        };
        let ipc_server_name = ipc_server_name.ok_or_else(|| {
            WtforkError::Handshake(format!("missing ENV variable [{ENV_VAR_IPC_SERVER}]"))
        })?;

        let (to_parent, from_parent) = handshake::connect_parent(&ipc_server_name, &child_id)?;
        let router = Router::new(child_id, IpcTransport::connected(to_parent));
        let child = Self::with_inbound(router, Some(from_parent));
        child.announce()?;
        Ok(Some(child))
    }

    /// Start dispatching messages from the parent on a background thread
    ///
    /// Calling this more than once has no further effect.
    pub fn listen(&self) -> Result<()> {
        let Some(receiver) = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        let router = Arc::clone(&self.router);
        let handle = std::thread::Builder::new()
            .name(format!("wtfork-child-{}", router.id()))
            .spawn(move || {
                let _closed = router.transport().close_on_drop();
                transport::pump(&receiver, |message| {
                    router.route(&message);
                });
            })
            .map_err(WtforkError::Thread)?;

        *self.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Dispatch messages from the parent until it disconnects
    ///
    /// Fails with [`WtforkError::ReceiveLoopPanicked`] if a listener panicked, in which
    /// case the link has been closed.
    pub fn wait(&self) -> Result<()> {
        self.listen()?;
        let handle = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        match handle.map(JoinHandle::join) {
            Some(Err(_)) => Err(WtforkError::ReceiveLoopPanicked),
            _ => Ok(()),
        }
    }
}

impl<T> Deref for ChildRouter<T> {
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
    use crate::handshake;
    use crate::parent::ParentRouter;
    use crate::transport::MemoryTransport;

    #[test]
    fn install_is_skipped_without_child_id() {
        let vars = vec![("PATH".to_string(), "/usr/bin".to_string())];
        assert!(ChildRouter::install_from_vars(vars).unwrap().is_none());
    }

    #[test]
    fn install_fails_without_server_name() {
        let vars = vec![(ENV_VAR_CHILD_ID.to_string(), "abc".to_string())];
        assert!(matches!(
            ChildRouter::install_from_vars(vars),
            Err(WtforkError::Handshake(_))
        ));
    }

    #[test]
    fn attach_announces_readiness_with_own_id() {
        let (transport, outbound) = MemoryTransport::new();
        let child = ChildRouter::attach("abc", transport).unwrap();
        assert_eq!(child.id(), "abc");
        assert_eq!(
            outbound.try_recv().unwrap(),
            json!({ "wtfork": { "child_id": "abc", "channel": "wtfork:child_ready", "data": "abc" } })
        );
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    fn attach_surfaces_failed_announcement() {
        let (transport, outbound) = MemoryTransport::new();
        drop(outbound);
        assert!(ChildRouter::attach("abc", transport).is_err());
    }

    #[test]
    fn round_trip_between_parent_and_child() {
        let (to_parent, from_child) = MemoryTransport::new();
        let (to_child, from_parent) = MemoryTransport::new();
        let child = ChildRouter::attach("abc", to_parent).unwrap();
        let parent = ParentRouter::new("abc", to_child);

        let (tx, rx) = mpsc::channel();
        let replies = child.clone();
        child.on("ping", move |data| {
            replies.send("pong", Some(data.clone())).unwrap();
        });
        parent.on("pong", move |data| tx.send(data.clone()).unwrap());

        parent.send("ping", Some(json!({ "seq": [1, 2, 3] }))).unwrap();
        parent.send("ping", None).unwrap();

        // flush both directions
        for message in from_parent.try_iter() {
            child.route(&message);
        }
        for message in from_child.try_iter() {
            parent.route(&message);
        }

        assert!(parent.is_ready());
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![json!({ "seq": [1, 2, 3] }), json!({})]
        );
    }

    #[test]
    fn panicking_listener_closes_link_and_fails_wait() {
        let (server, name) = handshake::listen().unwrap();
        let parent = std::thread::spawn(move || handshake::accept_child(server, "abc"));
        let (to_parent, from_parent) = handshake::connect_parent(&name, "abc").unwrap();
        let (to_child, _from_child) = parent.join().unwrap().unwrap();

        let router = Router::new("abc", IpcTransport::connected(to_parent));
        let child = ChildRouter::with_inbound(router, Some(from_parent));
        child.on("boom", |_| panic!("listener failed"));

        let message = Envelope::new("abc", "boom", None).to_message().unwrap();
        to_child.send(serde_json::to_vec(&message).unwrap()).unwrap();

        assert!(matches!(child.wait(), Err(WtforkError::ReceiveLoopPanicked)));
        assert!(child.transport().is_closed());
        assert!(matches!(
            child.send("work", None),
            Err(WtforkError::TransportClosed)
        ));
    }

    #[test]
    fn child_ignores_envelopes_for_other_children() {
        let (transport, _outbound) = MemoryTransport::new();
        let child = ChildRouter::attach("abc", transport).unwrap();
        let (tx, rx) = mpsc::channel();
        child.on("work", move |_| tx.send(()).unwrap());

        let message = Envelope::new("def", "work", None).to_message().unwrap();
        assert!(!child.route(&message));
        assert!(rx.try_recv().is_err());
    }
}

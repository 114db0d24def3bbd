//! Bootstrap of the duplex link between a parent and a freshly forked child
//!
//! The parent hands the name of a one-shot server to the child via ENV. The child
//! connects and answers with the name of its own one-shot server, which the parent
//! connects to in turn. Both sides check the child ID at every step.

use ipc_channel::ipc::{IpcOneShotServer, IpcReceiver, IpcSender};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, WtforkError};
use crate::ChildId;

/// Both halves of an established link
pub(crate) type Link = (IpcSender<Vec<u8>>, IpcReceiver<Vec<u8>>);

/// First message of the handshake, sent by the child to the parent's server
#[derive(Debug, Serialize, Deserialize)]
struct LinkInit {
    /// ID the child found in its environment
    child_id: ChildId,
    /// One-shot server the parent should connect to
    ipc_server_name: String,
}

/// Last message of the handshake, sent by the parent to the child's server
#[derive(Debug, Serialize, Deserialize)]
struct LinkInitComplete {
    /// ID the parent forked the child with
    child_id: ChildId,
}

/// Create the one-shot server a child will connect to
pub(crate) fn listen() -> Result<(IpcOneShotServer<Vec<u8>>, String)> {
    IpcOneShotServer::<Vec<u8>>::new().map_err(WtforkError::Bootstrap)
}

/// Parent side: wait for the child to connect, then complete the link
///
/// Blocks until the child has connected to `server`.
pub(crate) fn accept_child(server: IpcOneShotServer<Vec<u8>>, child_id: &str) -> Result<Link> {
    debug!(child_id, "waiting for child to connect...");
    let (from_child, first_msg) = server.accept().map_err(WtforkError::transport)?;
    let init = serde_json::from_slice::<LinkInit>(&first_msg)?;
    if init.child_id != child_id {
        return Err(WtforkError::Handshake(format!(
            "child announced id [{}], expected [{child_id}]",
            init.child_id
        )));
    }

    debug!(child_id, "connecting to child IPC server...");
    let to_child = IpcSender::<Vec<u8>>::connect(init.ipc_server_name)
        .map_err(WtforkError::transport)?;
    to_child
        .send(serde_json::to_vec(&LinkInitComplete {
            child_id: child_id.into(),
        })?)
        .map_err(WtforkError::transport)?;

    Ok((to_child, from_child))
}

/// Unblock a parent still waiting in [`accept_child`] on the server `ipc_server_name`
///
/// The parent receives an empty first message and fails the handshake. Nothing happens
/// if the server has already accepted a connection.
pub(crate) fn abandon(ipc_server_name: &str) {
    match IpcSender::<Vec<u8>>::connect(ipc_server_name.into()) {
        Ok(sender) => {
            let _ = sender.send(Vec::new());
        }
        Err(err) => debug!(ipc_server_name, %err, "IPC server already gone"),
    }
}

/// Child side: connect to the parent's server and wait for it to connect back
pub(crate) fn connect_parent(ipc_server_name: &str, child_id: &str) -> Result<Link> {
    let (server, server_name) = listen()?;

    debug!(child_id, ipc_server_name, "connecting to parent IPC server...");
    let to_parent = IpcSender::<Vec<u8>>::connect(ipc_server_name.into())
        .map_err(WtforkError::transport)?;
    to_parent
        .send(serde_json::to_vec(&LinkInit {
            child_id: child_id.into(),
            ipc_server_name: server_name,
        })?)
        .map_err(WtforkError::transport)?;

    debug!(child_id, "waiting for parent to complete the link...");
    let (from_parent, first_msg) = server.accept().map_err(WtforkError::transport)?;
    let complete = serde_json::from_slice::<LinkInitComplete>(&first_msg)?;
    if complete.child_id != child_id {
        return Err(WtforkError::Handshake(format!(
            "parent completed link for [{}], expected [{child_id}]",
            complete.child_id
        )));
    }

    Ok((to_parent, from_parent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_and_child_establish_a_duplex_link() {
        let (server, name) = listen().unwrap();
        let parent = std::thread::spawn(move || accept_child(server, "child-1"));

        let (to_parent, from_parent) = connect_parent(&name, "child-1").unwrap();
        let (to_child, from_child) = parent.join().unwrap().unwrap();

        to_parent.send(b"up".to_vec()).unwrap();
        assert_eq!(from_child.recv().unwrap(), b"up".to_vec());
        to_child.send(b"down".to_vec()).unwrap();
        assert_eq!(from_parent.recv().unwrap(), b"down".to_vec());
    }

    #[test]
    fn abandoned_server_stops_waiting_for_child() {
        let (server, name) = listen().unwrap();
        let parent = std::thread::spawn(move || accept_child(server, "child-1"));

        abandon(&name);
        assert!(matches!(parent.join().unwrap(), Err(WtforkError::Json(_))));
    }

    #[test]
    fn parent_rejects_unexpected_child_id() {
        let (server, name) = listen().unwrap();
        let parent = std::thread::spawn(move || accept_child(server, "child-1"));

        // The parent refuses before connecting back, so the child would wait forever;
        // announce a wrong id by hand instead of running the child side.
        let (_child_server, child_server_name) = listen().unwrap();
        let to_parent = IpcSender::<Vec<u8>>::connect(name).unwrap();
        to_parent
            .send(
                serde_json::to_vec(&LinkInit {
                    child_id: "impostor".into(),
                    ipc_server_name: child_server_name,
                })
                .unwrap(),
            )
            .unwrap();

        assert!(matches!(
            parent.join().unwrap(),
            Err(WtforkError::Handshake(_))
        ));
    }
}

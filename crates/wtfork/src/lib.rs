//! Fork child processes and talk to them over named channels.
//!
//! Every forked child shares a single IPC link with its parent. This crate overlays
//! a small routing protocol on that link: each message is wrapped in an envelope
//! carrying the child's identifier and a channel name, and each side only dispatches
//! envelopes bound to its own identifier.
//!
//! In the parent:
//!
//! ```no_run
//! use wtfork::{fork, ForkOptions};
//!
//! # fn main() -> wtfork::Result<()> {
//! let forked = fork("./worker", ["--verbose"], Some(ForkOptions::default()))?;
//! forked.child().on("pong", |data| println!("got pong: {data}"));
//! forked.child().send("ping", Some(serde_json::json!({ "n": 1 })))?;
//! # Ok(())
//! # }
//! ```
//!
//! In the child, the router is installed explicitly and held by the application:
//!
//! ```no_run
//! use wtfork::ChildRouter;
//!
//! # fn main() -> wtfork::Result<()> {
//! if let Some(parent) = ChildRouter::install()? {
//!     let sender = parent.clone();
//!     parent.on("ping", move |data| {
//!         let _ = sender.send("pong", Some(data.clone()));
//!     });
//!     parent.wait()?;
//! }
//! # Ok(())
//! # }
//! ```

#![deny(
    missing_docs,
    clippy::missing_docs_in_private_items,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links,
    rustdoc::missing_crate_level_docs,
    rustdoc::invalid_codeblock_attributes,
    rustdoc::invalid_html_tags,
    rustdoc::invalid_rust_codeblocks,
    rustdoc::bare_urls,
    rustdoc::unescaped_backticks,
    rustdoc::redundant_explicit_links
)]
#![cfg_attr(test, allow(clippy::missing_docs_in_private_items))]

pub mod child;
pub mod emitter;
pub mod envelope;
pub mod error;
pub mod fork;
mod handshake;
pub mod id;
pub mod parent;
pub mod router;
pub mod transport;

pub use child::ChildRouter;
pub use emitter::{ChannelEmitter, ListenerId};
pub use envelope::{Channel, Envelope, CHILD_READY_CHANNEL, PROTOCOL_MARKER};
pub use error::{Result, WtforkError};
pub use fork::{fork, fork_path, ForkOptions, ForkedChild};
pub use parent::ParentRouter;
pub use router::Router;
pub use transport::{IpcTransport, MemoryTransport, Transport};

/// ENV variable that carries the identifier of a forked child
///
/// Its presence is the only signal a child process uses to install a [`ChildRouter`].
pub const ENV_VAR_CHILD_ID: &str = "WTFORK_CHILD";

/// ENV variable that carries the name of the parent's one-shot IPC server
pub const ENV_VAR_IPC_SERVER: &str = "WTFORK_IPC_SERVER";

/// ID of a forked child
///
/// Opaque, unique per fork, and never reused.
pub type ChildId = String;

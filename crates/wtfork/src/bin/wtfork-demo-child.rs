use anyhow::{Context as _, Result};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use wtfork::ChildRouter;

fn main() -> Result<()> {
    tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("failed to build tracing")?;

    let Some(parent) = ChildRouter::install().context("failed to install child router")? else {
        info!("not forked through wtfork, exiting");
        return Ok(());
    };
    info!(child_id = parent.id(), "child router installed");

    let replies = parent.clone();
    parent.on("ping", move |data| {
        let pong = json!({ "child_id": replies.id(), "echo": data });
        if let Err(err) = replies.send("pong", Some(pong)) {
            warn!(%err, "failed to send pong");
        }
    });

    // Messages outside the protocol are answered in kind
    let raw_replies = parent.clone();
    parent.on_message(move |message| {
        if let Some(value) = message.get("raw_ping") {
            if let Err(err) = raw_replies.send_raw(&json!({ "raw_pong": value })) {
                warn!(%err, "failed to send raw pong");
            }
        }
    });

    parent.on("exit", |_| {
        std::process::exit(0);
    });

    parent
        .wait()
        .context("failed to route messages from parent")?;
    info!("parent disconnected, exiting");
    Ok(())
}

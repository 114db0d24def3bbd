use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context as _, Result};
use conv::ValueFrom as _;
use serde_json::json;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_DEMO_DURATION_SECONDS: u64 = 3;

/// How long to wait for the child to announce itself, or to answer a ping
const CHILD_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    tracing_subscriber::Registry::default()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to build tracing")?;

    let bin_path = std::env::var("WTFORK_DEMO_CHILD_BIN_PATH")
        .map(PathBuf::from)
        .context("missing env var WTFORK_DEMO_CHILD_BIN_PATH")?;
    if !bin_path.exists() {
        bail!("missing binary at path [{}]", bin_path.display());
    }
    if !bin_path.metadata().is_ok_and(|m| m.is_file()) {
        bail!("invalid non-binary file at path [{}]", bin_path.display());
    }

    info!("forking child...");
    let mut forked = wtfork::fork_path(&bin_path).context("failed to fork child")?;
    let child_id = forked.id().to_string();

    let (pong_tx, pong_rx) = mpsc::channel();
    forked.child().on("pong", move |data| {
        let _ = pong_tx.send(data.clone());
    });

    info!(child_id, "waiting for child to become ready...");
    let started = Instant::now();
    while !forked.child().is_ready() {
        ensure!(
            started.elapsed() < CHILD_TIMEOUT,
            "child [{child_id}] did not become ready"
        );
        std::thread::sleep(Duration::from_millis(10));
    }

    let demo_duration_seconds = std::env::var("DEMO_DURATION_SECONDS")
        .context("missing env var")
        .and_then(|v| v.parse::<u64>().context("failed to parse"))
        .unwrap_or(DEFAULT_DEMO_DURATION_SECONDS);
    info!("exchanging ping/pong for {demo_duration_seconds} seconds...");

    let deadline = Instant::now() + Duration::from_secs(demo_duration_seconds);
    let mut roundtrips: u64 = 0;
    while Instant::now() < deadline {
        forked
            .child()
            .send("ping", Some(json!({ "seq": roundtrips })))
            .context("failed to send ping")?;
        let pong = pong_rx
            .recv_timeout(CHILD_TIMEOUT)
            .context("failed to receive pong")?;
        ensure!(
            pong["child_id"] == json!(child_id),
            "pong came from unexpected child [{}]",
            pong["child_id"]
        );
        ensure!(
            pong["echo"]["seq"] == json!(roundtrips),
            "pong out of order: {pong}"
        );
        roundtrips += 1;
    }

    info!("asking child to exit...");
    forked.child().send("exit", None).context("failed to send exit")?;
    forked.wait().context("failed to wait for child process")?;

    let roundtrips_per_second = f64::value_from(roundtrips)
        .context("failed to convert roundtrips to f64")?
        / f64::value_from(demo_duration_seconds)
            .context("failed to convert demo duration to f64")?;

    info!(
        roundtrips,
        demo_duration_seconds, roundtrips_per_second, "completed ping-pong round-trips"
    );
    eprintln!("completed [{roundtrips}] ping-pong round-trips in [{demo_duration_seconds}] seconds ([{roundtrips_per_second}] round-trips/second)");
    Ok(())
}

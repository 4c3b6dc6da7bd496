//! poll-daemon: run one or more peers of the single-poller protocol.
//!
//! Peers in one process share an in-memory store; with `--shared-dir` they
//! coordinate through a directory instead, so several daemons on one machine
//! elect a single poller between them.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use poll_daemon::{DirMedium, DirStore, LocalPoll, PeerEvent, PeerHandle, PollCapability, WebSocketPoll, spawn_peer};

use poll_core::{
    CoordinationEngine, CounterTeardown, EngineConfig, InMemoryMedium, InMemoryStore, Namespace, ObservableMedium,
    ObservableStore, SystemClock,
};

#[derive(Parser, Debug)]
#[command(name = "poll-daemon")]
#[command(about = "Elect one poller among peers sharing a namespace")]
struct Args {
    /// Prefix for the shared keys and the broadcast channel
    #[arg(short, long, default_value = "poll_")]
    namespace: String,

    /// Poll endpoint: a ws:// or wss:// URL, or anything else for the built-in fake
    #[arg(short, long, default_value = "local")]
    endpoint: String,

    /// Milliseconds between polls
    #[arg(long, default_value_t = 5000)]
    interval_ms: u64,

    /// Heartbeat age (ms) after which a held lock counts as abandoned [default: 3 intervals]
    #[arg(long, conflicts_with = "no_lease")]
    lease_ms: Option<u64>,

    /// Never treat a held lock as abandoned
    #[arg(long)]
    no_lease: bool,

    /// Remove the peer count on exit so the remaining peers recount
    #[arg(long)]
    reset_count_on_exit: bool,

    /// Number of peers to run in this process
    #[arg(short, long, default_value_t = 1)]
    peers: usize,

    /// Directory shared with other daemons (in-memory when omitted)
    #[arg(long)]
    shared_dir: Option<PathBuf>,

    /// Exit after this many seconds
    #[arg(long)]
    run_for_secs: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn build_config(args: &Args) -> Result<EngineConfig> {
    let namespace = Namespace::new(args.namespace.clone())?;
    let mut config = EngineConfig::new(namespace, args.endpoint.clone())
        .with_poll_interval(Duration::from_millis(args.interval_ms));

    if args.no_lease {
        config = config.with_lock_lease(None);
    } else if let Some(ms) = args.lease_ms {
        config = config.with_lock_lease(Some(Duration::from_millis(ms)));
    }
    if args.reset_count_on_exit {
        config = config.with_counter_teardown(CounterTeardown::Reset);
    }

    config.validate()?;
    Ok(config)
}

/// Start `count` peers, each on a fresh store/medium context from `contexts`.
fn spawn_peers<S, M>(
    count: usize,
    config: &EngineConfig,
    poll: &Arc<dyn PollCapability>,
    events: &mpsc::UnboundedSender<PeerEvent>,
    mut contexts: impl FnMut() -> Result<(S, M)>,
) -> Result<Vec<PeerHandle>>
where
    S: ObservableStore + Clone + 'static,
    M: ObservableMedium + Clone + 'static,
{
    (0..count)
        .map(|_| {
            let (store, medium) = contexts()?;
            let engine = CoordinationEngine::with_entropy(config.clone(), store.clone(), medium)?;
            info!(peer = %engine.peer_id(), "Starting peer");
            let handle = spawn_peer(engine, store, Arc::clone(poll), Arc::new(SystemClock), events.clone())?;
            Ok(handle)
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,poll_core=debug,poll_daemon=debug"
    } else {
        "info,poll_core=info,poll_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = build_config(&args)?;
    info!("Starting poll-daemon");
    info!("Namespace: {}", config.namespace);
    info!("Endpoint: {}", config.endpoint);
    info!("Poll interval: {:?}, lock lease: {:?}", config.poll_interval, config.lock_lease);

    let poll: Arc<dyn PollCapability> = if args.endpoint.starts_with("ws://") || args.endpoint.starts_with("wss://") {
        Arc::new(WebSocketPoll::default())
    } else {
        info!("Using the built-in local endpoint");
        Arc::new(LocalPoll::new(Duration::from_millis(50)))
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let handles = match &args.shared_dir {
        Some(dir) => {
            info!("Coordinating through {:?}", dir);
            let store_dir = dir.join("store");
            let channel = config.namespace.channel_name();
            spawn_peers(args.peers, &config, &poll, &events_tx, || {
                Ok((DirStore::open(&store_dir)?, DirMedium::open(dir, &channel)?))
            })?
        }
        None => {
            let store = InMemoryStore::new();
            let medium = InMemoryMedium::new();
            spawn_peers(args.peers, &config, &poll, &events_tx, || {
                Ok((store.context(), medium.context()))
            })?
        }
    };

    info!("Daemon running with {} peer(s). Press Ctrl+C to stop.", handles.len());

    let deadline = async {
        match args.run_for_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = events_rx.recv() => {
                match event {
                    PeerEvent::Data { peer, data } => {
                        info!(%peer, "Poll result: {}", data);
                    }
                    PeerEvent::ActiveChanged { peer, active } => {
                        if active {
                            info!(%peer, "Now the active poller");
                        } else {
                            info!(%peer, "No longer the active poller");
                        }
                    }
                    PeerEvent::Stopped { peer } => {
                        debug!(%peer, "Peer stopped");
                    }
                }
            }

            _ = &mut deadline => {
                info!("Run time elapsed");
                break;
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    for handle in handles {
        if let Some(status) = handle.status().await {
            debug!(peer = %status.peer_id, state = ?status.state, count = status.peer_count, "Final status");
        }
        handle.shutdown().await;
    }
    Ok(())
}

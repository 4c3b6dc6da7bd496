//! Tokio driver for one peer.
//!
//! Each peer runs as a task owning its `CoordinationEngine`. Storage changes,
//! bus messages, timer expiries and poll completions are all funneled through
//! one unbounded channel, so the engine sees one input at a time. Effects map
//! onto tokio primitives: timers are sleeping tasks (aborted on cancel), polls
//! are spawned requests that report back through the same channel.

use crate::capability::PollCapability;
use poll_core::{
    AttemptId, BroadcastMessage, BusError, Clock, CoordinationEngine, Effect, EngineStatus, ObservableMedium,
    ObservableStore, PeerId, PollError, StoreChange, Subscription, TimerId,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Everything a peer task reacts to.
#[derive(Debug)]
pub enum PeerInput {
    Storage(StoreChange),
    Message(BroadcastMessage),
    Timer(TimerId),
    PollDone {
        attempt: AttemptId,
        result: Result<Value, PollError>,
    },
    Network(Option<bool>),
    Recount,
    Status(oneshot::Sender<EngineStatus>),
    /// Graceful teardown, then exit
    Shutdown,
}

/// What a peer reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    ActiveChanged { peer: PeerId, active: bool },
    Data { peer: PeerId, data: Value },
    Stopped { peer: PeerId },
}

/// Clock driven by tokio's timer, so paused-time tests advance it too.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    base_ms: u64,
    start: Instant,
}

impl TokioClock {
    /// Report `base_ms` now and advance with tokio time from here.
    pub fn new(base_ms: u64) -> Self {
        Self {
            base_ms,
            start: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.base_ms + self.start.elapsed().as_millis() as u64
    }
}

/// Handle to a running peer task.
pub struct PeerHandle {
    peer_id: PeerId,
    input: mpsc::UnboundedSender<PeerInput>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn set_network_available(&self, available: Option<bool>) {
        let _ = self.input.send(PeerInput::Network(available));
    }

    pub fn recount(&self) {
        let _ = self.input.send(PeerInput::Recount);
    }

    /// Current engine status, or `None` if the task has exited.
    pub async fn status(&self) -> Option<EngineStatus> {
        let (tx, rx) = oneshot::channel();
        self.input.send(PeerInput::Status(tx)).ok()?;
        rx.await.ok()
    }

    /// Tear the peer down gracefully and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.input.send(PeerInput::Shutdown);
        let _ = self.task.await;
    }

    /// Kill the task without teardown, like a crashed process.
    pub fn abort(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Wire `engine` to its store and bus and start it on a new task.
///
/// `store` must be the same context the engine writes through, so the peer is
/// not notified about its own writes.
pub fn spawn_peer<S, M>(
    engine: CoordinationEngine<S, M>,
    store: S,
    poll: Arc<dyn PollCapability>,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<PeerEvent>,
) -> Result<PeerHandle, BusError>
where
    S: ObservableStore + Clone + 'static,
    M: ObservableMedium + Clone + 'static,
{
    let peer_id = engine.peer_id();
    let (input, rx) = mpsc::unbounded_channel();

    let storage_tx = input.clone();
    let watch = store.watch(Arc::new(move |change| {
        let _ = storage_tx.send(PeerInput::Storage(change));
    }));
    let message_tx = input.clone();
    let bus = engine.bus().subscribe(move |message| {
        let _ = message_tx.send(PeerInput::Message(message));
    })?;

    let driver = Driver {
        engine,
        peer_id,
        input: input.clone(),
        poll,
        clock,
        events,
        timers: HashMap::new(),
    };
    let task = tokio::spawn(driver.run(rx, vec![watch, bus]));

    Ok(PeerHandle { peer_id, input, task })
}

struct Driver<S, M> {
    engine: CoordinationEngine<S, M>,
    peer_id: PeerId,
    input: mpsc::UnboundedSender<PeerInput>,
    poll: Arc<dyn PollCapability>,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<PeerEvent>,
    timers: HashMap<TimerId, JoinHandle<()>>,
}

impl<S, M> Driver<S, M>
where
    S: ObservableStore + Clone + 'static,
    M: ObservableMedium + Clone + 'static,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PeerInput>, subscriptions: Vec<Subscription>) {
        let out = self.engine.start(self.clock.now_ms());
        self.execute(out);

        while let Some(input) = rx.recv().await {
            let now_ms = self.clock.now_ms();
            let out = match input {
                PeerInput::Storage(change) => self.engine.on_storage_change(&change),
                PeerInput::Message(message) => self.engine.on_message(message),
                PeerInput::Timer(id) => {
                    self.timers.remove(&id);
                    self.engine.on_timer(id, now_ms)
                }
                PeerInput::PollDone { attempt, result } => self.engine.on_poll_complete(attempt, result, now_ms),
                PeerInput::Network(available) => {
                    self.engine.set_network_available(available);
                    Vec::new()
                }
                PeerInput::Recount => {
                    self.engine.recount();
                    Vec::new()
                }
                PeerInput::Status(reply) => {
                    let _ = reply.send(self.engine.status());
                    Vec::new()
                }
                PeerInput::Shutdown => {
                    let out = self.engine.teardown();
                    self.execute(out);
                    break;
                }
            };
            self.execute(out);
        }

        drop(subscriptions);
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        debug!(peer = %self.peer_id, "Peer task finished");
        let _ = self.events.send(PeerEvent::Stopped { peer: self.peer_id });
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartTimer { id, delay, .. } => {
                    let input = self.input.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = input.send(PeerInput::Timer(id));
                    });
                    self.timers.insert(id, handle);
                }
                Effect::CancelTimer { id } => {
                    if let Some(handle) = self.timers.remove(&id) {
                        handle.abort();
                    }
                }
                Effect::Poll {
                    attempt,
                    endpoint,
                    request,
                } => {
                    let input = self.input.clone();
                    let poll = Arc::clone(&self.poll);
                    tokio::spawn(async move {
                        let result = poll.poll(&endpoint, &request).await;
                        let _ = input.send(PeerInput::PollDone { attempt, result });
                    });
                }
                Effect::Deliver { data } => {
                    let _ = self.events.send(PeerEvent::Data {
                        peer: self.peer_id,
                        data,
                    });
                }
                Effect::ActiveChanged { active } => {
                    info!(peer = %self.peer_id, active, "Active poller marker changed");
                    let _ = self.events.send(PeerEvent::ActiveChanged {
                        peer: self.peer_id,
                        active,
                    });
                }
            }
        }
    }
}

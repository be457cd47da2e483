// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Stream multiplexer: many named subscriptions over one reconnecting link.
//!
//! [`StreamMultiplexer`] is a cheap, clonable handle. All state lives in a
//! single control task that owns the [`SubscriptionRegistry`], the current
//! [`Link`] and one slot per subscription; handles talk to it through a
//! command queue and `oneshot` replies.
//!
//! Connection lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                     ^             |
//!                     +-- link lost-+        any state -> Disposed
//! ```
//!
//! On every successful connect the registry is replayed: each registered
//! stream is issued exactly once. After a reconnect the existing views are
//! reset first, so a view never mixes rows from two backlogs.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strand_stream_proto::{ClientIntent, InboundFrame, StreamParams};
use strand_view::ViewSnapshot;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::MultiplexerConfig;
use crate::error::{StreamError, SubscriptionError, TransportError};
use crate::naming::StreamNamer;
use crate::registry::{
    SubscriptionHandle, SubscriptionRegistry, SubscriptionState, SubscriptionStatus,
};
use crate::transport::{Connector, Link};
use crate::worker::{Dispatch, SnapshotTx, WorkerHandle};

/// Connection state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No link and no attempt in progress.
    Disconnected,
    /// Waiting for a connect attempt (first connect or after a loss).
    Connecting,
    /// A link is up.
    Connected,
    /// Terminal; the multiplexer no longer accepts work.
    Disposed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disposed => "disposed",
        };
        f.write_str(label)
    }
}

/// How a restart was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    /// The remote swapped parameters on the live stream.
    InPlace,
    /// The stream was torn down and subscribed again under a new generation.
    Resubscribed,
}

/// Receiver of a subscription's snapshots.
pub type SnapshotWatch = watch::Receiver<Arc<ViewSnapshot>>;

/// Background task feeding a snapshot callback. Stops when dropped.
#[derive(Debug)]
pub struct SnapshotListener {
    task: JoinHandle<()>,
}

impl SnapshotListener {
    /// Stop delivering snapshots.
    pub fn cancel(self) {
        self.task.abort();
    }

    /// True once the subscription went away and the listener ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SnapshotListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Subscribe {
        name: String,
        params: StreamParams,
        reply: oneshot::Sender<SubscriptionHandle>,
    },
    Unsubscribe {
        name: String,
        reply: oneshot::Sender<Option<SubscriptionStatus>>,
    },
    Restart {
        name: String,
        params: StreamParams,
        reply: oneshot::Sender<Result<RestartMode, StreamError>>,
    },
    Status {
        name: String,
        reply: oneshot::Sender<Option<SubscriptionStatus>>,
    },
    List {
        reply: oneshot::Sender<Vec<String>>,
    },
    Workers {
        reply: oneshot::Sender<usize>,
    },
    Watch {
        name: String,
        reply: oneshot::Sender<Option<SnapshotWatch>>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running multiplexer.
#[derive(Clone)]
pub struct StreamMultiplexer {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    namer: Arc<Mutex<StreamNamer>>,
}

impl fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl StreamMultiplexer {
    /// Start a multiplexer over `connector`. Must be called inside a Tokio
    /// runtime. Nothing connects until [`connect`](Self::connect) or the
    /// first [`subscribe`](Self::subscribe).
    pub fn new<C: Connector>(connector: C, config: MultiplexerConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue_depth.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(8);
        let control = Control {
            connector: Arc::new(connector),
            backoff: Backoff::new(config.reconnect.clone()),
            config,
            registry: SubscriptionRegistry::new(),
            slots: HashMap::new(),
            workers: JoinSet::new(),
            link: None,
            state: state_tx,
            attempt: None,
            next_attempt: 0,
            connects: 0,
            connect_waiters: Vec::new(),
            events_tx,
        };
        tokio::spawn(control.run(cmd_rx, events_rx));
        Self {
            commands: cmd_tx,
            state: state_rx,
            namer: Arc::new(Mutex::new(StreamNamer::new())),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, StreamError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| StreamError::Disposed)?;
        rx.await.map_err(|_| StreamError::Disposed)
    }

    /// Open the link and wait until it is up.
    ///
    /// Resolves immediately when already connected. Fails with
    /// [`StreamError::Unavailable`] if bounded retries run out.
    pub async fn connect(&self) -> Result<(), StreamError> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// [`connect`](Self::connect), giving up when `cancel` fires. The
    /// connection keeps being attempted in the background.
    pub async fn connect_with_cancel(&self, cancel: &CancellationToken) -> Result<(), StreamError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StreamError::Cancelled),
            res = self.connect() => res,
        }
    }

    /// Register `name` (or update its parameters) and start the stream once
    /// a link is up. Does not wait for the connection.
    pub async fn subscribe(
        &self,
        name: impl Into<String>,
        params: StreamParams,
    ) -> Result<SubscriptionHandle, StreamError> {
        let name = name.into();
        self.request(|reply| Command::Subscribe {
            name,
            params,
            reply,
        })
        .await
    }

    /// [`subscribe`](Self::subscribe), then wait for the link unless `cancel`
    /// fires first. A cancelled call leaves the subscription registered.
    pub async fn subscribe_with_cancel(
        &self,
        name: impl Into<String>,
        params: StreamParams,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionHandle, StreamError> {
        let handle = self.subscribe(name, params).await?;
        self.connect_with_cancel(cancel).await?;
        Ok(handle)
    }

    /// Stop `name` and drop its view. Returns the final status, or `None`
    /// if the name was not registered.
    pub async fn unsubscribe(&self, name: &str) -> Result<Option<SubscriptionStatus>, StreamError> {
        let name = name.to_owned();
        self.request(|reply| Command::Unsubscribe { name, reply })
            .await
    }

    /// Swap the parameters of a live subscription.
    ///
    /// Streams whose kind supports it restart in place; others are
    /// unsubscribed and subscribed again, and their view starts over.
    pub async fn restart(&self, name: &str, params: StreamParams) -> Result<RestartMode, StreamError> {
        let name = name.to_owned();
        self.request(|reply| Command::Restart {
            name,
            params,
            reply,
        })
        .await?
    }

    /// True while a link is up.
    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes connection state changes.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Whether `name` is registered.
    pub async fn is_subscribed(&self, name: &str) -> bool {
        self.status(name).await.is_some()
    }

    /// Status of `name`, or `None` if unknown (or disposed).
    pub async fn status(&self, name: &str) -> Option<SubscriptionStatus> {
        let name = name.to_owned();
        self.request(|reply| Command::Status { name, reply })
            .await
            .ok()
            .flatten()
    }

    /// Registered stream names, sorted.
    pub async fn subscriptions(&self) -> Vec<String> {
        self.request(|reply| Command::List { reply })
            .await
            .unwrap_or_default()
    }

    /// Number of dispatch workers still running. Workers start on a
    /// stream's first frame and are reaped once closed.
    pub async fn dispatch_workers(&self) -> usize {
        self.request(|reply| Command::Workers { reply })
            .await
            .unwrap_or_default()
    }

    /// Receiver for `name`'s snapshots. The channel closes when the
    /// subscription is removed.
    pub async fn watch(&self, name: &str) -> Result<SnapshotWatch, StreamError> {
        let key = name.to_owned();
        self.request(|reply| Command::Watch { name: key, reply })
            .await?
            .ok_or_else(|| StreamError::NotFound(name.to_owned()))
    }

    /// Latest snapshot of `name`.
    pub async fn snapshot(&self, name: &str) -> Result<Arc<ViewSnapshot>, StreamError> {
        let rx = self.watch(name).await?;
        let snap = Arc::clone(&rx.borrow());
        Ok(snap)
    }

    /// Call `callback` with every new snapshot of `name` until the
    /// subscription goes away or the listener is dropped.
    pub async fn on_snapshot_changed<F>(
        &self,
        name: &str,
        mut callback: F,
    ) -> Result<SnapshotListener, StreamError>
    where
        F: FnMut(Arc<ViewSnapshot>) + Send + 'static,
    {
        let mut rx = self.watch(name).await?;
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snap = Arc::clone(&rx.borrow_and_update());
                callback(snap);
            }
        });
        Ok(SnapshotListener { task })
    }

    /// Unique name for an ad hoc stream, e.g. `query-1718000000000`.
    pub fn ephemeral_name(&self, prefix: &str) -> String {
        self.namer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next(prefix)
    }

    /// Tear everything down: stop reconnecting, drop the link, close every
    /// subscription and wait for in-flight dispatch to finish. Idempotent.
    pub async fn dispose(&self) {
        if self.request(|reply| Command::Dispose { reply }).await.is_err() {
            debug!("dispose on an already disposed multiplexer");
        }
    }
}

enum Event {
    Connected { attempt: u64, link: Link },
    ConnectFailed { attempt: u64, error: TransportError },
}

enum Step {
    Command(Command),
    HandlesGone,
    Event(Event),
    Inbound(Option<InboundFrame>),
    WorkerDone(Result<(), JoinError>),
}

struct PendingAttempt {
    id: u64,
    task: JoinHandle<()>,
}

/// Per-subscription state held by the control task.
struct Slot {
    generation: u64,
    publisher: SnapshotTx,
    worker: Option<WorkerHandle>,
}

impl Slot {
    fn new(generation: u64) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ViewSnapshot::default()));
        Self {
            generation,
            publisher: Arc::new(tx),
            worker: None,
        }
    }

    fn close_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.close();
        }
    }
}

struct Control<C> {
    connector: Arc<C>,
    config: MultiplexerConfig,
    backoff: Backoff,
    registry: SubscriptionRegistry,
    slots: HashMap<String, Slot>,
    workers: JoinSet<()>,
    link: Option<Link>,
    state: watch::Sender<ConnectionState>,
    attempt: Option<PendingAttempt>,
    next_attempt: u64,
    connects: u64,
    connect_waiters: Vec<oneshot::Sender<Result<(), StreamError>>>,
    events_tx: mpsc::Sender<Event>,
}

async fn recv_link(link: &mut Option<Link>) -> Option<InboundFrame> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

impl<C: Connector> Control<C> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<Event>,
    ) {
        loop {
            let step = tokio::select! {
                cmd = commands.recv() => cmd.map_or(Step::HandlesGone, Step::Command),
                Some(event) = events.recv() => Step::Event(event),
                frame = recv_link(&mut self.link) => Step::Inbound(frame),
                Some(done) = self.workers.join_next() => Step::WorkerDone(done),
            };
            match step {
                Step::Command(Command::Dispose { reply }) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                Step::Command(cmd) => self.on_command(cmd).await,
                Step::HandlesGone => {
                    self.shutdown().await;
                    break;
                }
                Step::Event(event) => self.on_event(event).await,
                Step::Inbound(Some(frame)) => self.route(frame).await,
                Step::Inbound(None) => self.on_link_lost(),
                Step::WorkerDone(Err(err)) if err.is_panic() => {
                    warn!(%err, "dispatch worker panicked");
                }
                Step::WorkerDone(_) => {}
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "connection state");
            *current = next;
            true
        });
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => {
                if self.current_state() == ConnectionState::Connected {
                    let _ = reply.send(Ok(()));
                } else {
                    self.connect_waiters.push(reply);
                    self.ensure_connecting();
                }
            }
            Command::Subscribe {
                name,
                params,
                reply,
            } => {
                let handle = self.subscribe(&name, params).await;
                let _ = reply.send(handle);
            }
            Command::Unsubscribe { name, reply } => {
                let status = self.unsubscribe(&name).await;
                let _ = reply.send(status);
            }
            Command::Restart {
                name,
                params,
                reply,
            } => {
                let mode = self.restart(&name, params).await;
                let _ = reply.send(mode);
            }
            Command::Status { name, reply } => {
                let _ = reply.send(self.registry.get(&name));
            }
            Command::List { reply } => {
                let _ = reply.send(self.registry.list());
            }
            Command::Workers { reply } => {
                let _ = reply.send(self.workers.len());
            }
            Command::Watch { name, reply } => {
                let rx = self.slots.get(&name).map(|slot| slot.publisher.subscribe());
                let _ = reply.send(rx);
            }
            Command::Dispose { .. } => {}
        }
    }

    async fn subscribe(&mut self, name: &str, params: StreamParams) -> SubscriptionHandle {
        let previous = self.registry.get(name);
        let handle = self.registry.register(name, params.clone());
        if handle.created {
            self.slots
                .insert(name.to_owned(), Slot::new(handle.generation));
            info!(stream = %name, kind = %params.kind, "subscribed");
            self.send_intent(ClientIntent::Subscribe {
                stream: name.to_owned(),
                params,
            })
            .await;
        } else if previous.as_ref().map(|status| &status.params) != Some(&params) {
            // Same name, new parameters: behave like a restart.
            let _ = self.restart(name, params).await;
        } else if previous.is_some_and(|status| status.state == SubscriptionState::Errored) {
            self.retry_rejected(name, params).await;
        }
        self.ensure_connecting();
        handle
    }

    /// Ask again for a stream the remote refused. The view starts over so a
    /// replayed backlog cannot land on top of stale rows.
    async fn retry_rejected(&mut self, name: &str, params: StreamParams) {
        self.registry.mark_pending(name);
        if let Some(slot) = self.slots.get(name) {
            if let Some(worker) = &slot.worker {
                worker
                    .dispatch(Dispatch::Reset {
                        generation: slot.generation,
                    })
                    .await;
            }
        }
        info!(stream = %name, "retrying rejected stream");
        self.send_intent(ClientIntent::Subscribe {
            stream: name.to_owned(),
            params,
        })
        .await;
    }

    async fn unsubscribe(&mut self, name: &str) -> Option<SubscriptionStatus> {
        let status = self.registry.unregister(name)?;
        if let Some(mut slot) = self.slots.remove(name) {
            slot.close_worker();
        }
        if self.connector.supports_teardown() {
            self.send_intent(ClientIntent::Unsubscribe {
                stream: name.to_owned(),
            })
            .await;
        }
        info!(stream = %name, "unsubscribed");
        Some(status)
    }

    async fn restart(&mut self, name: &str, params: StreamParams) -> Result<RestartMode, StreamError> {
        if !self.registry.update(name, params.clone()) {
            return Err(StreamError::NotFound(name.to_owned()));
        }
        self.registry.mark_pending(name);

        if params.kind.supports_restart() {
            if let Some(slot) = self.slots.get(name) {
                if let Some(worker) = &slot.worker {
                    worker
                        .dispatch(Dispatch::Reset {
                            generation: slot.generation,
                        })
                        .await;
                }
            }
            self.send_intent(ClientIntent::Restart {
                stream: name.to_owned(),
                params,
            })
            .await;
            info!(stream = %name, "restarted in place");
            return Ok(RestartMode::InPlace);
        }

        if let (Some(generation), Some(slot)) = (self.registry.renew(name), self.slots.get_mut(name)) {
            slot.close_worker();
            slot.generation = generation;
            slot.publisher
                .send_replace(Arc::new(ViewSnapshot::default()));
        }
        if self.connector.supports_teardown() {
            self.send_intent(ClientIntent::Unsubscribe {
                stream: name.to_owned(),
            })
            .await;
        }
        self.send_intent(ClientIntent::Subscribe {
            stream: name.to_owned(),
            params,
        })
        .await;
        info!(stream = %name, "restarted by resubscribing");
        Ok(RestartMode::Resubscribed)
    }

    /// Send on the live link. Without a link the intent is dropped; the
    /// registry replay on connect covers it.
    async fn send_intent(&mut self, intent: ClientIntent) {
        let Some(link) = &self.link else {
            return;
        };
        if link.outbound.send(intent).await.is_err() {
            debug!("outbound closed; waiting for the link loss to surface");
        }
    }

    fn ensure_connecting(&mut self) {
        if self.current_state() == ConnectionState::Disconnected && self.attempt.is_none() {
            self.backoff.reset();
            self.schedule_attempt(Duration::ZERO);
        }
    }

    fn schedule_attempt(&mut self, delay: Duration) {
        self.next_attempt += 1;
        let id = self.next_attempt;
        let connector = Arc::clone(&self.connector);
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let event = match connector.connect().await {
                Ok(link) => Event::Connected { attempt: id, link },
                Err(error) => Event::ConnectFailed { attempt: id, error },
            };
            let _ = events.send(event).await;
        });
        if let Some(old) = self.attempt.replace(PendingAttempt { id, task }) {
            old.task.abort();
        }
        self.set_state(ConnectionState::Connecting);
    }

    fn is_current_attempt(&self, id: u64) -> bool {
        self.attempt.as_ref().is_some_and(|a| a.id == id)
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Connected { attempt, link } => {
                if !self.is_current_attempt(attempt) {
                    debug!(attempt, "discarding link from a superseded attempt");
                    return;
                }
                self.attempt = None;
                self.on_connected(link).await;
            }
            Event::ConnectFailed { attempt, error } => {
                if !self.is_current_attempt(attempt) {
                    return;
                }
                self.attempt = None;
                warn!(%error, attempt = self.backoff.attempt() + 1, "connect failed");
                self.retry_or_give_up();
            }
        }
    }

    async fn on_connected(&mut self, link: Link) {
        self.backoff.reset();
        self.connects += 1;
        self.link = Some(link);

        if self.connects > 1 {
            // Clear and rebuild: the remote replays each backlog from scratch.
            for slot in self.slots.values() {
                if let Some(worker) = &slot.worker {
                    worker
                        .dispatch(Dispatch::Reset {
                            generation: slot.generation,
                        })
                        .await;
                }
            }
        }

        let replay: Vec<ClientIntent> = self
            .registry
            .entries()
            .map(|(name, params)| ClientIntent::Subscribe {
                stream: name.to_owned(),
                params: params.clone(),
            })
            .collect();
        let count = replay.len();
        for intent in replay {
            self.send_intent(intent).await;
        }

        self.set_state(ConnectionState::Connected);
        info!(subscriptions = count, reconnect = self.connects > 1, "link up");
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn on_link_lost(&mut self) {
        self.link = None;
        self.registry.mark_all_pending();
        warn!("link lost; reconnecting");
        self.retry_or_give_up();
    }

    fn retry_or_give_up(&mut self) {
        match self.backoff.next_backoff() {
            Some(delay) => self.schedule_attempt(delay),
            None => {
                let attempts = self.backoff.attempt();
                self.set_state(ConnectionState::Disconnected);
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(StreamError::Unavailable { attempts }));
                }
            }
        }
    }

    async fn route(&mut self, mut frame: InboundFrame) {
        let Some(slot) = self.slots.get_mut(&frame.stream) else {
            debug!(stream = %frame.stream, "dropping frame for unknown stream");
            return;
        };
        if let Some(remote) = frame.error.take() {
            let error = SubscriptionError::from_remote(frame.stream.clone(), remote);
            warn!(%error, "stream rejected");
            self.registry.mark_errored(&frame.stream, error);
            return;
        }
        self.registry.mark_active(&frame.stream);

        let generation = slot.generation;
        let stream = frame.stream.clone();
        let depth = self.config.dispatch_queue_depth;
        let workers = &mut self.workers;
        let publisher = &slot.publisher;
        let worker = slot.worker.get_or_insert_with(|| {
            WorkerHandle::spawn(workers, &stream, generation, Arc::clone(publisher), depth)
        });
        if !worker.dispatch(Dispatch::Frame { frame, generation }).await {
            warn!(stream = %stream, "dispatch worker gone; will respawn on next frame");
            slot.worker = None;
        }
    }

    async fn shutdown(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.task.abort();
        }
        self.link = None;
        for (_, mut slot) in self.slots.drain() {
            slot.close_worker();
        }
        self.registry.clear();
        while self.workers.join_next().await.is_some() {}
        self.state.send_replace(ConnectionState::Disposed);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(StreamError::Disposed));
        }
        info!("multiplexer disposed");
    }
}

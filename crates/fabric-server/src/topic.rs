//! Topic endpoints: one publish or subscribe socket behind the endpoint
//! lifecycle.
//!
//! The socket sits in a slot on the endpoint and is driven by its own task.
//! Sends and live filter changes reach the task over a command channel. While
//! receiving, the pending receive owns the socket and stays in the slot, so
//! `close` can always take it out and drop it.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use fabric_protocol::{Frames, frames_to_value, value_to_frames};
use fabric_transport::{SocketMode, SocketRole, TopicSocket, TransportError};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::endpoint::{Endpoint, EndpointCore};
use crate::error::FabricError;
use crate::plugins::{Plugin, PluginChain, PluginKind};
use crate::server::Server;

/// Receives each message that made it through the receive chain.
pub type MessageCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// A receive in flight. It hands the socket back when it completes, with
/// `None` if it was interrupted before a message arrived.
type PendingRecv = Pin<
    Box<dyn Future<Output = (TopicSocket, Option<Result<Frames, TransportError>>)> + Send>,
>;

enum SocketSlot {
    Empty,
    Idle(TopicSocket),
    Receiving(PendingRecv),
}

enum SocketCommand {
    Send(Frames, oneshot::Sender<Result<(), TransportError>>),
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Clone)]
pub struct TopicEndpoint {
    inner: Arc<TopicInner>,
}

struct TopicInner {
    core: EndpointCore,
    role: SocketRole,
    address: String,
    mode: SocketMode,
    plugins: PluginChain,
    filters: Mutex<Vec<String>>,
    callback: RwLock<MessageCallback>,
    socket: Mutex<SocketSlot>,
    /// Ends a pending receive so a command can use the socket.
    interrupt: Arc<Notify>,
    commands: Mutex<Option<mpsc::UnboundedSender<SocketCommand>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

pub struct TopicEndpointBuilder {
    role: SocketRole,
    address: String,
    mode: SocketMode,
    plugins: PluginChain,
    filters: Vec<String>,
}

impl TopicEndpointBuilder {
    /// Own the address.
    pub fn bind(mut self) -> Self {
        self.mode = SocketMode::Bind;
        self
    }

    /// Attach to a peer that owns the address.
    pub fn connect(mut self) -> Self {
        self.mode = SocketMode::Connect;
        self
    }

    pub fn plugin<P: Plugin>(mut self, plugin: P) -> Self {
        self.plugins.add(plugin);
        self
    }

    pub fn shared_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.add_shared(plugin);
        self
    }

    /// Queue a topic filter. Only subscribers keep filters.
    pub fn filter(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        if self.role == SocketRole::Subscribe && !self.filters.contains(&topic) {
            self.filters.push(topic);
        }
        self
    }

    pub fn build(self) -> TopicEndpoint {
        let core = EndpointCore::new();
        let id = core.id();
        let default_callback: MessageCallback = Arc::new(move |message: Value| {
            trace!("Unhandled message on topic endpoint {id}: {message}");
        });
        TopicEndpoint {
            inner: Arc::new(TopicInner {
                core,
                role: self.role,
                address: self.address,
                mode: self.mode,
                plugins: self.plugins,
                filters: Mutex::new(self.filters),
                callback: RwLock::new(default_callback),
                socket: Mutex::new(SocketSlot::Empty),
                interrupt: Arc::new(Notify::new()),
                commands: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TopicEndpoint
// ─────────────────────────────────────────────────────────────────────────────

impl TopicEndpoint {
    /// A publisher. Binds unless told otherwise.
    pub fn publisher(address: impl Into<String>) -> TopicEndpointBuilder {
        TopicEndpointBuilder {
            role: SocketRole::Publish,
            address: address.into(),
            mode: SocketMode::Bind,
            plugins: PluginChain::new(),
            filters: Vec::new(),
        }
    }

    /// A subscriber. Connects unless told otherwise.
    pub fn subscriber(address: impl Into<String>) -> TopicEndpointBuilder {
        TopicEndpointBuilder {
            role: SocketRole::Subscribe,
            address: address.into(),
            mode: SocketMode::Connect,
            plugins: PluginChain::new(),
            filters: Vec::new(),
        }
    }

    pub fn role(&self) -> SocketRole {
        self.inner.role
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn mode(&self) -> SocketMode {
        self.inner.mode
    }

    pub fn plugins(&self) -> &PluginChain {
        &self.inner.plugins
    }

    /// Current topic filters, in the order they were added.
    pub fn filters(&self) -> Vec<String> {
        self.inner.filters.lock().clone()
    }

    /// Replace the message callback.
    pub fn onmessage(&self, callback: impl Fn(Value) + Send + Sync + 'static) {
        *self.inner.callback.write() = Arc::new(callback);
    }

    /// Run `message` through the send chain and write it to the socket.
    /// A message dropped by the chain is not an error.
    pub async fn send(&self, message: Value) -> Result<(), FabricError> {
        let id = self.inner.core.id();
        if self.inner.role != SocketRole::Publish {
            return Err(FabricError::InvalidOperation(format!(
                "send on subscribe endpoint {id}"
            )));
        }
        if !self.inner.core.is_active() {
            return Err(FabricError::NotActive(id));
        }

        let Some(message) = self.inner.plugins.run(PluginKind::Send, message) else {
            return Ok(());
        };
        let frames = value_to_frames(message);
        if frames.is_empty() {
            debug!("Send chain produced no frames on {id}");
            return Ok(());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .inner
            .commands
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(SocketCommand::Send(frames, reply_tx)).is_ok());
        if !sent {
            return Err(FabricError::NotActive(id));
        }
        match reply_rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(FabricError::NotActive(id)),
        }
    }

    /// Add a topic filter. Adding one that exists already changes nothing.
    pub fn add_filter(&self, topic: impl Into<String>) -> Result<(), FabricError> {
        self.require_subscriber("add_filter")?;
        let topic = topic.into();
        let mut filters = self.inner.filters.lock();
        if filters.contains(&topic) {
            return Ok(());
        }
        filters.push(topic.clone());
        if let Some(tx) = self.inner.commands.lock().as_ref() {
            let _ = tx.send(SocketCommand::Subscribe(topic));
        }
        Ok(())
    }

    /// Remove a topic filter. Removing one that is absent changes nothing.
    pub fn remove_filter(&self, topic: &str) -> Result<(), FabricError> {
        self.require_subscriber("remove_filter")?;
        let mut filters = self.inner.filters.lock();
        let Some(pos) = filters.iter().position(|f| f == topic) else {
            return Ok(());
        };
        filters.remove(pos);
        if let Some(tx) = self.inner.commands.lock().as_ref() {
            let _ = tx.send(SocketCommand::Unsubscribe(topic.to_string()));
        }
        Ok(())
    }

    fn require_subscriber(&self, op: &str) -> Result<(), FabricError> {
        if self.inner.role == SocketRole::Subscribe {
            Ok(())
        } else {
            Err(FabricError::InvalidOperation(format!(
                "{op} on {} endpoint {}",
                self.inner.role.as_str(),
                self.inner.core.id()
            )))
        }
    }

    async fn open(&self) -> Result<(), FabricError> {
        let inner = &self.inner;
        let mut socket = TopicSocket::open(inner.role, &inner.address, inner.mode).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let filters = {
            let filters = inner.filters.lock();
            *inner.commands.lock() = Some(tx);
            filters.clone()
        };
        if inner.role == SocketRole::Subscribe {
            for filter in &filters {
                socket.subscribe(filter).await?;
            }
        }

        inner.plugins.setup(inner.core.id());
        *inner.socket.lock() = SocketSlot::Idle(socket);
        let task = tokio::spawn(run_socket(inner.role, rx, Arc::downgrade(inner)));
        *inner.task.lock() = Some(task);
        Ok(())
    }
}

impl Endpoint for TopicEndpoint {
    fn core(&self) -> &EndpointCore {
        &self.inner.core
    }

    fn kind(&self) -> &'static str {
        "topic"
    }

    async fn activate(&self, server: &Server) -> Result<(), FabricError> {
        self.inner.core.activate(server)?;
        if let Err(e) = self.open().await {
            *self.inner.commands.lock() = None;
            self.inner.core.reset();
            return Err(e);
        }
        info!(
            "Topic endpoint {} {} on {}",
            self.inner.core.id(),
            self.inner.role.as_str(),
            self.inner.address
        );
        Ok(())
    }

    fn close(&self) {
        if !self.inner.core.close() {
            return;
        }
        self.inner.commands.lock().take();
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        // Dropping the socket frees its address before we return.
        let slot = std::mem::replace(&mut *self.inner.socket.lock(), SocketSlot::Empty);
        drop(slot);
        debug!("Topic endpoint {} released {}", self.inner.core.id(), self.inner.address);
    }

    fn as_topic(&self) -> Option<&TopicEndpoint> {
        Some(self)
    }
}

impl TopicInner {
    fn deliver(&self, frames: Frames) {
        let Some(message) = self.plugins.run(PluginKind::Receive, frames_to_value(&frames)) else {
            return;
        };
        let callback = self.callback.read().clone();
        callback(message);
    }

    /// Poll for the next message. The first poll moves the socket into a
    /// pending receive that is kept in the slot until it completes.
    fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Result<Frames, TransportError>> {
        let mut slot = self.socket.lock();
        if matches!(*slot, SocketSlot::Idle(_)) {
            if let SocketSlot::Idle(socket) = std::mem::replace(&mut *slot, SocketSlot::Empty) {
                *slot = SocketSlot::Receiving(receive(socket, self.interrupt.clone()));
            }
        }
        let SocketSlot::Receiving(pending) = &mut *slot else {
            return Poll::Ready(Err(TransportError::Closed));
        };
        let polled = pending.as_mut().poll(cx);
        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready((socket, frames)) => {
                *slot = SocketSlot::Idle(socket);
                match frames {
                    Some(frames) => Poll::Ready(frames),
                    // Stale interrupt; start over.
                    None => {
                        cx.waker().wake_by_ref();
                        Poll::Pending
                    }
                }
            }
        }
    }

    /// Take the socket out of the slot, ending a pending receive first. A
    /// message that arrived meanwhile comes back with it.
    async fn checkout(&self) -> Option<(TopicSocket, Option<Result<Frames, TransportError>>)> {
        let slot = std::mem::replace(&mut *self.socket.lock(), SocketSlot::Empty);
        match slot {
            SocketSlot::Empty => None,
            SocketSlot::Idle(socket) => Some((socket, None)),
            SocketSlot::Receiving(pending) => {
                self.interrupt.notify_one();
                Some(pending.await)
            }
        }
    }

    /// Run one command with the socket checked out of the slot. It goes back
    /// only while the endpoint is still active.
    async fn run_command(&self, command: SocketCommand) {
        let Some((mut socket, received)) = self.checkout().await else {
            if let SocketCommand::Send(_, reply) = command {
                let _ = reply.send(Err(TransportError::Closed));
            }
            return;
        };
        match received {
            Some(Ok(frames)) => self.deliver(frames),
            Some(Err(e)) => warn!("Topic socket receive error: {e}"),
            None => {}
        }

        match command {
            SocketCommand::Send(frames, reply) => {
                let _ = reply.send(socket.send(frames).await);
            }
            SocketCommand::Subscribe(filter) => {
                if let Err(e) = socket.subscribe(&filter).await {
                    warn!("Failed to subscribe to '{filter}': {e}");
                }
            }
            SocketCommand::Unsubscribe(filter) => {
                if let Err(e) = socket.unsubscribe(&filter).await {
                    warn!("Failed to unsubscribe from '{filter}': {e}");
                }
            }
        }

        let mut slot = self.socket.lock();
        if self.core.is_active() {
            *slot = SocketSlot::Idle(socket);
        }
    }
}

fn receive(mut socket: TopicSocket, interrupt: Arc<Notify>) -> PendingRecv {
    Box::pin(async move {
        let frames = tokio::select! {
            biased;
            frames = socket.recv() => Some(frames),
            () = interrupt.notified() => None,
        };
        (socket, frames)
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Socket task
// ─────────────────────────────────────────────────────────────────────────────

enum Step {
    Command(Option<SocketCommand>),
    Received(Result<Frames, TransportError>),
}

async fn run_socket(
    role: SocketRole,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    endpoint: Weak<TopicInner>,
) {
    let receives = role == SocketRole::Subscribe;

    loop {
        // Commands first so filter changes apply before queued messages.
        let step = tokio::select! {
            biased;
            command = commands.recv() => Step::Command(command),
            frames = next_message(&endpoint), if receives => Step::Received(frames),
        };

        let Some(inner) = endpoint.upgrade() else {
            break;
        };
        match step {
            Step::Command(None) => break,
            Step::Command(Some(command)) => inner.run_command(command).await,
            Step::Received(Ok(frames)) => inner.deliver(frames),
            Step::Received(Err(TransportError::Closed)) => break,
            Step::Received(Err(e)) => warn!("Topic socket receive error: {e}"),
        }
    }

    debug!("Topic socket task finished");
}

fn next_message(
    endpoint: &Weak<TopicInner>,
) -> impl Future<Output = Result<Frames, TransportError>> + '_ {
    std::future::poll_fn(move |cx| match endpoint.upgrade() {
        Some(inner) => inner.poll_recv(cx),
        None => Poll::Ready(Err(TransportError::Closed)),
    })
}

impl std::fmt::Debug for TopicEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicEndpoint")
            .field("id", &self.inner.core.id())
            .field("role", &self.inner.role)
            .field("address", &self.inner.address)
            .field("active", &self.inner.core.is_active())
            .finish()
    }
}


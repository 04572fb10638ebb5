//! The peer client: one implementation for every peer role.
//!
//! A `PeerClient` owns the local view of the mesh: the cached directory,
//! the endpoint cache keyed by peer, the listener and handler tables, and
//! the map of outstanding calls. The same implementation serves windows,
//! workers, and the coordinator itself; the only difference is how an
//! instance reaches the coordinator (a registration handshake over its
//! link, or immediate membership for the coordinator's own client).
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │ PeerClient (cheap clonable handle)                    │
//! │                                                       │
//! │  directory cache      ── replaced wholesale on every  │
//! │                          MAP_UPDATE                   │
//! │  connections          ── PeerKey → Brokering | Ready  │
//! │  listeners/handlers   ── name-keyed dispatch tables   │
//! │  pending              ── request id → PendingCall     │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! All state is `Rc<RefCell>`-owned and mutated only on the owning
//! process's event loop; background readers and timers run as
//! `spawn_local` tasks, so clients must be constructed inside a local task
//! context (a `LocalSet` or local runtime).

use crate::client::connection::{PeerConnection, QueuedSend};
use crate::client::events::{ClientEvent, EventFan};
use crate::client::invoke::{PendingCall, RequestIdFactory};
use crate::client::throttle::ThrottledSender;
use crate::client::{ClientOptions, RegistrationState};
use crate::coordinator::PeerSeat;
use crate::error::MeshError;
use crate::protocol::{
    ControlFrame, Envelope, Frame, InvokeFault, PeerIdentity, PeerKey, PeerRole, Target,
};
use crate::transport::{Endpoint, EndpointReceiver, EndpointSender, Packet};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Token returned by [`PeerClient::on`], consumed by [`PeerClient::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type ListenerFn = Rc<dyn Fn(&PeerIdentity, &[Value]) -> Result<(), MeshError>>;

struct Listener {
    id: u64,
    callback: ListenerFn,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, MeshError>>>>;
type HandlerFn = Rc<dyn Fn(PeerIdentity, Vec<Value>) -> HandlerFuture>;

/// Where a response to an inbound envelope should be posted.
enum ReplyVia {
    /// Back over the brokered endpoint the request arrived on.
    Connection(PeerKey),
    /// Back over the coordinator link (coordinator-relayed traffic).
    Link,
    /// Back over an explicit write handle (traffic the coordinator relayed
    /// into its own client from a peer's link).
    Raw(EndpointSender),
    /// Back into this client's own dispatch (self-targeted traffic).
    Local,
}

/// A peer's messaging client.
///
/// Cheap to clone; all clones share the same state. See the module docs
/// for the concurrency model.
#[derive(Clone)]
pub struct PeerClient {
    inner: Rc<ClientInner>,
}

pub(crate) struct ClientInner {
    identity: PeerIdentity,
    options: ClientOptions,
    link: Endpoint,
    state: Cell<RegistrationState>,
    registration_waiters: RefCell<Vec<oneshot::Sender<Result<(), MeshError>>>>,
    directory: RefCell<Vec<PeerIdentity>>,
    connections: RefCell<HashMap<PeerKey, PeerConnection>>,
    listeners: RefCell<HashMap<String, Vec<Listener>>>,
    next_listener_id: Cell<u64>,
    handlers: RefCell<HashMap<String, HandlerFn>>,
    pending: RefCell<HashMap<u64, PendingCall>>,
    request_ids: RequestIdFactory,
    events: EventFan,
    error_tx: mpsc::UnboundedSender<MeshError>,
    error_rx: RefCell<Option<mpsc::UnboundedReceiver<MeshError>>>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
    shut: Cell<bool>,
}

impl PeerClient {
    /// Construct a client for a spawned peer process and begin the
    /// registration handshake.
    ///
    /// Sends `REGISTER` over the seat's coordinator link immediately and
    /// enters `Subscribing`; the client becomes usable for `send`/`invoke`
    /// once a directory snapshot naming it arrives (see
    /// [`wait_registered`](PeerClient::wait_registered)).
    pub fn connect(seat: PeerSeat, options: ClientOptions) -> Result<Self, MeshError> {
        let PeerSeat {
            handle,
            role,
            tag,
            link,
        } = seat;
        let mut identity = PeerIdentity::new(role, handle);
        identity.identifier = options.identifier.clone();
        identity.tag = tag;

        let client = Self::build(identity, link, options)?;
        client.inner.begin_registration();
        Ok(client)
    }

    /// Construct the coordinator's own client over a direct link.
    ///
    /// No handshake: the caller guarantees the identity is already in the
    /// directory, so the client starts `Registered`.
    pub(crate) fn attached(
        link: Endpoint,
        identity: PeerIdentity,
        options: ClientOptions,
    ) -> Result<Self, MeshError> {
        let client = Self::build(identity, link, options)?;
        client.inner.state.set(RegistrationState::Registered);
        Ok(client)
    }

    fn build(
        identity: PeerIdentity,
        link: Endpoint,
        options: ClientOptions,
    ) -> Result<Self, MeshError> {
        let link_rx = link.take_receiver()?;
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        let inner = Rc::new(ClientInner {
            identity,
            options,
            link,
            state: Cell::new(RegistrationState::Unregistered),
            registration_waiters: RefCell::new(Vec::new()),
            directory: RefCell::new(Vec::new()),
            connections: RefCell::new(HashMap::new()),
            listeners: RefCell::new(HashMap::new()),
            next_listener_id: Cell::new(1),
            handlers: RefCell::new(HashMap::new()),
            pending: RefCell::new(HashMap::new()),
            request_ids: RequestIdFactory::new(),
            events: EventFan::new(),
            error_tx,
            error_rx: RefCell::new(Some(error_rx)),
            tasks: RefCell::new(Vec::new()),
            shut: Cell::new(false),
        });
        inner.spawn_link_reader(link_rx);
        Ok(Self { inner })
    }

    /// This client's own identity.
    pub fn identity(&self) -> &PeerIdentity {
        &self.inner.identity
    }

    /// Current registration state.
    pub fn registration_state(&self) -> RegistrationState {
        self.inner.state.get()
    }

    /// Clone of the cached directory snapshot.
    pub fn directory(&self) -> Vec<PeerIdentity> {
        self.inner.directory.borrow().clone()
    }

    /// Subscribe to client notifications.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Take the error channel carrying reported (non-propagated) failures,
    /// such as listener errors. Only the first caller gets it.
    pub fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<MeshError>> {
        self.inner.error_rx.borrow_mut().take()
    }

    /// Resolve once this client is `Registered`.
    ///
    /// Fails with `RegistrationTimeout` if the registration window elapsed,
    /// or `Shutdown` if the client was shut down while waiting.
    pub async fn wait_registered(&self) -> Result<(), MeshError> {
        match self.inner.state.get() {
            RegistrationState::Registered => Ok(()),
            RegistrationState::Failed => Err(MeshError::RegistrationTimeout),
            _ => {
                let (tx, rx) = oneshot::channel();
                self.inner.registration_waiters.borrow_mut().push(tx);
                rx.await.map_err(|_| MeshError::Shutdown)?
            }
        }
    }

    /// Send a named fire-and-forget message to every peer the target
    /// resolves to.
    ///
    /// Resolution runs against the cached directory. A peer with no cached
    /// endpoint triggers exactly one brokering request; the returned future
    /// resolves once the envelope has been posted to every resolved peer
    /// (not once it is delivered). A non-broadcast target resolving to
    /// nothing fails with `UnknownTarget`; an empty broadcast is a no-op.
    pub async fn send(
        &self,
        target: &Target,
        name: &str,
        args: Vec<Value>,
    ) -> Result<(), MeshError> {
        self.inner.ensure_registered()?;

        let resolved = target.resolve(&self.inner.directory.borrow());
        if resolved.is_empty() {
            if target.is_broadcast() {
                tracing::debug!(%target, "broadcast matched no peers");
                return Ok(());
            }
            return Err(MeshError::UnknownTarget(target.to_string()));
        }

        let mut flushes = Vec::new();
        for peer in resolved {
            if peer.key() == self.inner.identity.key() {
                self.inner.dispatch_envelope(
                    self.inner.identity.clone(),
                    Envelope::message(name, args.clone()),
                    ReplyVia::Local,
                );
                continue;
            }
            if let Some(flush) = self
                .inner
                .post_or_queue(&peer, Envelope::message(name, args.clone()))?
            {
                flushes.push(flush);
            }
        }
        for flush in flushes {
            flush.await.map_err(|_| MeshError::Shutdown)??;
        }
        Ok(())
    }

    /// Call a handler on exactly one peer and await its response.
    ///
    /// Broadcast targets are rejected with `InvalidTarget`, as are targets
    /// resolving to more than one peer. The call rejects with
    /// `InvokeTimeout` when no response arrives within the deadline
    /// (`timeout`, or the client's default); a response arriving after
    /// that is dropped.
    pub async fn invoke(
        &self,
        target: &Target,
        channel: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, MeshError> {
        let inner = &self.inner;
        inner.ensure_registered()?;

        if target.is_broadcast() {
            return Err(MeshError::InvalidTarget(format!(
                "invoke cannot broadcast: {target}"
            )));
        }
        let mut resolved = target.resolve(&inner.directory.borrow());
        let peer = match resolved.len() {
            0 => return Err(MeshError::UnknownTarget(target.to_string())),
            1 => resolved.remove(0),
            count => {
                return Err(MeshError::InvalidTarget(format!(
                    "{target} resolves to {count} peers"
                )))
            }
        };

        let request_id = inner.request_ids.next();
        let (tx, rx) = oneshot::channel();
        inner
            .pending
            .borrow_mut()
            .insert(request_id, PendingCall::new(channel, tx));

        let envelope = Envelope::invoke(channel, request_id, args);
        let deadline = timeout.unwrap_or(inner.options.invoke_timeout);

        // The brokering wait (if any) counts against the call's deadline.
        let exchange = async {
            if peer.key() == inner.identity.key() {
                inner.dispatch_envelope(inner.identity.clone(), envelope, ReplyVia::Local);
            } else {
                match inner.post_or_queue(&peer, envelope)? {
                    None => {}
                    Some(flush) => flush.await.map_err(|_| MeshError::Shutdown)??,
                }
            }
            rx.await.map_err(|_| MeshError::Shutdown)?
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                inner.pending.borrow_mut().remove(&request_id);
                Err(error)
            }
            Err(_elapsed) => {
                if let Some(call) = inner.pending.borrow_mut().remove(&request_id) {
                    tracing::warn!(
                        channel = call.channel(),
                        request_id,
                        elapsed_ms = call.elapsed().as_millis() as u64,
                        "invoke timed out"
                    );
                }
                Err(MeshError::InvokeTimeout)
            }
        }
    }

    /// Register a listener for a named message.
    ///
    /// Listeners run synchronously in registration order when an envelope
    /// with that name arrives on any endpoint; a failing listener is
    /// reported on the error channel and does not stop the rest.
    pub fn on<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&PeerIdentity, &[Value]) -> Result<(), MeshError> + 'static,
    {
        let id = self.inner.next_listener_id.get();
        self.inner.next_listener_id.set(id + 1);
        self.inner
            .listeners
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .push(Listener {
                id,
                callback: Rc::new(listener),
            });
        ListenerId(id)
    }

    /// Remove a listener. Returns `true` if it was registered.
    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.borrow_mut();
        let Some(registered) = listeners.get_mut(name) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|listener| listener.id != id.0);
        let removed = registered.len() != before;
        if registered.is_empty() {
            listeners.remove(name);
        }
        removed
    }

    /// Register the handler for an invoke channel.
    ///
    /// Exactly one handler exists per channel; registering again replaces
    /// the previous one.
    pub fn handle<F, Fut>(&self, channel: &str, handler: F)
    where
        F: Fn(PeerIdentity, Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = Result<Value, MeshError>> + 'static,
    {
        let callback: HandlerFn = Rc::new(move |sender, args| -> HandlerFuture {
            Box::pin(handler(sender, args))
        });
        if self
            .inner
            .handlers
            .borrow_mut()
            .insert(channel.to_string(), callback)
            .is_some()
        {
            tracing::debug!(channel, "invoke handler replaced");
        }
    }

    /// Remove the handler for an invoke channel. Returns `true` if one was
    /// registered.
    pub fn unhandle(&self, channel: &str) -> bool {
        self.inner.handlers.borrow_mut().remove(channel).is_some()
    }

    /// Wrap `send` to the given target in a rate limiter. See
    /// [`ThrottledSender`].
    pub fn throttled(
        &self,
        target: Target,
        name: impl Into<String>,
        interval: Duration,
    ) -> ThrottledSender {
        ThrottledSender::new(self.clone(), target, name.into(), interval)
    }

    pub(crate) fn report_error(&self, error: MeshError) {
        self.inner.report(error);
    }

    /// Dispatch an envelope the coordinator relayed from a peer's link,
    /// with the reply routed back over that link.
    pub(crate) fn dispatch_relayed(
        &self,
        sender: PeerIdentity,
        envelope: Envelope,
        reply: EndpointSender,
    ) {
        self.inner
            .dispatch_envelope(sender, envelope, ReplyVia::Raw(reply));
    }

    /// Shut the client down: abort background tasks, drop every cached
    /// endpoint, and reject all pending calls and waiters with `Shutdown`.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut.replace(true) {
            return;
        }
        tracing::info!(identity = %inner.identity, "client shutting down");

        for task in inner.tasks.borrow_mut().drain(..) {
            task.abort();
        }
        let connections: Vec<_> = inner.connections.borrow_mut().drain().collect();
        for (_, connection) in connections {
            connection.tear_down(|| MeshError::Shutdown);
        }
        let pending: Vec<_> = inner.pending.borrow_mut().drain().collect();
        for (_, call) in pending {
            call.reject(MeshError::Shutdown);
        }
        for waiter in inner.registration_waiters.borrow_mut().drain(..) {
            let _ = waiter.send(Err(MeshError::Shutdown));
        }
    }
}

impl ClientInner {
    fn ensure_registered(&self) -> Result<(), MeshError> {
        if self.shut.get() {
            return Err(MeshError::Shutdown);
        }
        match self.state.get() {
            RegistrationState::Registered => Ok(()),
            _ => Err(MeshError::NotRegistered),
        }
    }

    pub(crate) fn report(&self, error: MeshError) {
        tracing::warn!(%error, identity = %self.identity, "failure reported to error channel");
        let _ = self.error_tx.send(error);
    }

    fn begin_registration(self: &Rc<Self>) {
        self.state.set(RegistrationState::Subscribing);
        let register = ControlFrame::Register {
            identifier: self.options.identifier.clone(),
        };
        if self.link.post(Frame::Control(register)).is_err() {
            tracing::warn!(identity = %self.identity, "coordinator link closed before registration");
            self.fail_registration();
            return;
        }
        tracing::debug!(identity = %self.identity, "registration request sent");

        let weak = Rc::downgrade(self);
        let window = self.options.registration_timeout;
        let timer = tokio::task::spawn_local(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = weak.upgrade() {
                if inner.state.get() == RegistrationState::Subscribing {
                    inner.fail_registration();
                }
            }
        });
        self.tasks.borrow_mut().push(timer);
    }

    fn complete_registration(&self) {
        self.state.set(RegistrationState::Registered);
        tracing::info!(identity = %self.identity, "registration complete");
        for waiter in self.registration_waiters.borrow_mut().drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.events.emit(ClientEvent::RegistrationComplete);
    }

    fn fail_registration(&self) {
        if self.state.get().is_terminal() {
            return;
        }
        self.state.set(RegistrationState::Failed);
        tracing::warn!(identity = %self.identity, "registration failed");
        for waiter in self.registration_waiters.borrow_mut().drain(..) {
            let _ = waiter.send(Err(MeshError::RegistrationTimeout));
        }
        self.events.emit(ClientEvent::RegistrationFailed);
    }

    fn spawn_link_reader(self: &Rc<Self>, mut rx: EndpointReceiver) {
        let weak = Rc::downgrade(self);
        let task = tokio::task::spawn_local(async move {
            while let Some(packet) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                inner.handle_link_packet(packet);
            }
            if let Some(inner) = weak.upgrade() {
                tracing::warn!(identity = %inner.identity, "coordinator link closed");
                if inner.state.get() == RegistrationState::Subscribing {
                    inner.fail_registration();
                }
            }
        });
        self.tasks.borrow_mut().push(task);
    }

    fn handle_link_packet(self: &Rc<Self>, packet: Packet) {
        if self.shut.get() {
            return;
        }
        let Packet { frame, port } = packet;
        match frame {
            Frame::Control(ControlFrame::MapUpdate { map }) => self.apply_map(map),
            Frame::Control(ControlFrame::PortMessage { sender }) => match port {
                Some(port) => self.attach_port(sender, port),
                None => {
                    tracing::warn!(peer = %sender, "PORT_MESSAGE without a transferred endpoint")
                }
            },
            Frame::Control(ControlFrame::PortFailure { target, error }) => {
                self.fail_brokering(&target, &error);
            }
            Frame::Control(frame) => {
                tracing::warn!(?frame, "unexpected control frame on peer link");
            }
            Frame::Envelope(envelope) => {
                // Coordinator-relayed traffic: attribute to the coordinator.
                let sender = self
                    .directory
                    .borrow()
                    .iter()
                    .find(|peer| peer.role == PeerRole::Coordinator)
                    .cloned()
                    .unwrap_or_else(|| PeerIdentity::new(PeerRole::Coordinator, 0));
                self.dispatch_envelope(sender, envelope, ReplyVia::Link);
            }
        }
    }

    /// Apply a full directory snapshot: replace the cache wholesale, settle
    /// registration, and drop routes to peers that vanished.
    fn apply_map(self: &Rc<Self>, map: Vec<PeerIdentity>) {
        *self.directory.borrow_mut() = map.clone();

        if self.state.get() == RegistrationState::Subscribing
            && map.iter().any(|peer| peer.key() == self.identity.key())
        {
            self.complete_registration();
        }

        let stale: Vec<PeerKey> = self
            .connections
            .borrow()
            .keys()
            .filter(|key| !map.iter().any(|peer| &peer.key() == *key))
            .cloned()
            .collect();
        for key in stale {
            self.drop_connection(&key, "peer removed from directory");
        }

        self.events.emit(ClientEvent::DirectoryChanged);
    }

    /// Cache a brokered endpoint, start its reader, and flush any sends
    /// that were parked behind the brokering request.
    fn attach_port(self: &Rc<Self>, sender: PeerIdentity, port: Endpoint) {
        let key = sender.key();
        let previous = self.connections.borrow_mut().remove(&key);
        let queue = match previous {
            Some(ready @ PeerConnection::Ready { .. }) => {
                // Duplicate brokering: both sides drop the same new pair
                // and keep the one already live.
                self.connections.borrow_mut().insert(key, ready);
                tracing::debug!(peer = %sender, "duplicate brokered endpoint dropped");
                return;
            }
            Some(PeerConnection::Brokering { queue }) => queue,
            None => Vec::new(),
        };

        let rx = match port.take_receiver() {
            Ok(rx) => rx,
            Err(error) => {
                tracing::warn!(peer = %sender, %error, "brokered endpoint unusable");
                for queued in queue {
                    let _ = queued.done.send(Err(MeshError::Transport(error.clone())));
                }
                return;
            }
        };
        let reader = self.spawn_port_reader(sender.clone(), key.clone(), rx);

        for queued in queue {
            let result = port
                .post(Frame::Envelope(queued.envelope))
                .map_err(MeshError::from);
            let _ = queued.done.send(result);
        }

        self.connections.borrow_mut().insert(
            key,
            PeerConnection::Ready {
                endpoint: port,
                reader,
            },
        );
        self.events.emit(ClientEvent::EndpointAdded(sender));
    }

    fn spawn_port_reader(
        self: &Rc<Self>,
        sender: PeerIdentity,
        key: PeerKey,
        mut rx: EndpointReceiver,
    ) -> JoinHandle<()> {
        let weak = Rc::downgrade(self);
        tokio::task::spawn_local(async move {
            while let Some(packet) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                inner.handle_port_packet(&sender, &key, packet);
            }
            if let Some(inner) = weak.upgrade() {
                inner.drop_connection(&key, "endpoint closed");
            }
        })
    }

    fn handle_port_packet(self: &Rc<Self>, sender: &PeerIdentity, key: &PeerKey, packet: Packet) {
        if self.shut.get() {
            return;
        }
        if packet.port.is_some() {
            tracing::warn!(peer = %sender, "endpoint transfer over a brokered endpoint ignored");
        }
        match packet.frame {
            Frame::Envelope(envelope) => {
                self.dispatch_envelope(sender.clone(), envelope, ReplyVia::Connection(key.clone()));
            }
            Frame::Control(frame) => {
                tracing::warn!(peer = %sender, ?frame, "control frame over a brokered endpoint ignored");
            }
        }
    }

    fn drop_connection(&self, key: &PeerKey, reason: &str) {
        if let Some(connection) = self.connections.borrow_mut().remove(key) {
            tracing::debug!(peer = %key, reason, "dropping connection");
            let key = key.clone();
            let reason = reason.to_string();
            connection.tear_down(move || MeshError::PeerNotFound(format!("{key}: {reason}")));
        }
    }

    fn fail_brokering(&self, target: &PeerKey, error: &str) {
        tracing::warn!(peer = %target, error, "brokering failed");
        let is_brokering = matches!(
            self.connections.borrow().get(target),
            Some(PeerConnection::Brokering { .. })
        );
        if !is_brokering {
            return;
        }
        if let Some(PeerConnection::Brokering { queue }) =
            self.connections.borrow_mut().remove(target)
        {
            for queued in queue {
                let _ = queued
                    .done
                    .send(Err(MeshError::PeerNotFound(format!("{target}: {error}"))));
            }
        }
    }

    /// Post an envelope towards a peer, entering `Brokering` (with exactly
    /// one `PORT_REQUEST`) if no live endpoint is cached.
    ///
    /// Returns a flush receiver when the envelope was parked behind an
    /// in-flight brokering request.
    fn post_or_queue(
        self: &Rc<Self>,
        peer: &PeerIdentity,
        envelope: Envelope,
    ) -> Result<Option<oneshot::Receiver<Result<(), MeshError>>>, MeshError> {
        let key = peer.key();

        enum Route {
            Posted,
            Queued(oneshot::Receiver<Result<(), MeshError>>),
            NeedsBroker,
        }

        let route = {
            let mut connections = self.connections.borrow_mut();
            match connections.get_mut(&key) {
                Some(PeerConnection::Ready { endpoint, .. }) => {
                    if endpoint.post(Frame::Envelope(envelope.clone())).is_ok() {
                        Route::Posted
                    } else {
                        // The endpoint died before the directory said so;
                        // fall through and broker a fresh one.
                        Route::NeedsBroker
                    }
                }
                Some(PeerConnection::Brokering { queue }) => {
                    let (tx, rx) = oneshot::channel();
                    queue.push(QueuedSend {
                        envelope: envelope.clone(),
                        done: tx,
                    });
                    Route::Queued(rx)
                }
                None => Route::NeedsBroker,
            }
        };

        match route {
            Route::Posted => Ok(None),
            Route::Queued(rx) => Ok(Some(rx)),
            Route::NeedsBroker => {
                self.drop_connection(&key, "endpoint closed");
                let (tx, rx) = oneshot::channel();
                self.connections.borrow_mut().insert(
                    key.clone(),
                    PeerConnection::Brokering {
                        queue: vec![QueuedSend { envelope, done: tx }],
                    },
                );
                if let Err(error) = self.link.post(Frame::Control(ControlFrame::PortRequest {
                    target: key.clone(),
                })) {
                    self.fail_brokering(&key, "coordinator link closed");
                    return Err(error.into());
                }
                tracing::debug!(peer = %key, "requested endpoint brokering");
                Ok(Some(rx))
            }
        }
    }

    fn dispatch_envelope(self: &Rc<Self>, sender: PeerIdentity, envelope: Envelope, reply: ReplyVia) {
        if self.shut.get() {
            return;
        }
        match envelope {
            Envelope::Message { message, args } => {
                let callbacks: Vec<ListenerFn> = self
                    .listeners
                    .borrow()
                    .get(&message)
                    .map(|listeners| {
                        listeners
                            .iter()
                            .map(|listener| listener.callback.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                if callbacks.is_empty() {
                    tracing::debug!(message = %message, sender = %sender, "no listeners for message");
                }
                for callback in callbacks {
                    if let Err(error) = callback(&sender, &args) {
                        self.report(MeshError::Listener {
                            message: message.clone(),
                            detail: error.to_string(),
                        });
                    }
                }
            }
            Envelope::Invoke {
                channel,
                request_id,
                args,
            } => {
                let handler = self.handlers.borrow().get(&channel).cloned();
                match handler {
                    Some(handler) => {
                        let weak = Rc::downgrade(self);
                        let _ = tokio::task::spawn_local(async move {
                            let outcome = handler(sender, args).await;
                            let Some(inner) = weak.upgrade() else { return };
                            let response = match outcome {
                                Ok(data) => Envelope::invoke_ok(request_id, data),
                                Err(error) => Envelope::invoke_err(
                                    request_id,
                                    InvokeFault::Handler(error.to_string()),
                                ),
                            };
                            inner.post_reply(reply, response);
                        });
                    }
                    None => {
                        tracing::debug!(channel = %channel, "invoke with no registered handler");
                        self.post_reply(
                            reply,
                            Envelope::invoke_err(request_id, InvokeFault::NoHandler(channel)),
                        );
                    }
                }
            }
            Envelope::InvokeResponse {
                request_id,
                success,
                data,
                error,
            } => {
                let call = self.pending.borrow_mut().remove(&request_id);
                match call {
                    Some(call) => {
                        let outcome = if success {
                            Ok(data.unwrap_or(Value::Null))
                        } else {
                            Err(error.map(InvokeFault::into_error).unwrap_or_else(|| {
                                MeshError::Handler("unspecified failure".to_string())
                            }))
                        };
                        call.complete(outcome);
                    }
                    // Already timed out, or a duplicate: drop silently.
                    None => tracing::debug!(request_id, "response with no pending call, dropped"),
                }
            }
        }
    }

    fn post_reply(self: &Rc<Self>, reply: ReplyVia, envelope: Envelope) {
        match reply {
            ReplyVia::Connection(key) => {
                let posted = match self.connections.borrow().get(&key) {
                    Some(PeerConnection::Ready { endpoint, .. }) => {
                        endpoint.post(Frame::Envelope(envelope)).is_ok()
                    }
                    _ => false,
                };
                if !posted {
                    tracing::warn!(peer = %key, "invoke response dropped, endpoint gone");
                }
            }
            ReplyVia::Link => {
                if self.link.post(Frame::Envelope(envelope)).is_err() {
                    tracing::warn!("invoke response dropped, coordinator link closed");
                }
            }
            ReplyVia::Raw(sender) => {
                if sender.post(Frame::Envelope(envelope)).is_err() {
                    tracing::warn!("invoke response dropped, peer link closed");
                }
            }
            ReplyVia::Local => {
                let identity = self.identity.clone();
                self.dispatch_envelope(identity, envelope, ReplyVia::Local);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::LocalSet;

    fn run_local<F: std::future::Future>(future: F) -> F::Output {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("failed to build runtime");
        runtime.block_on(LocalSet::new().run_until(future))
    }

    fn manual_client() -> (PeerClient, Endpoint) {
        let (coordinator_half, peer_half) = Endpoint::pair();
        let seat = PeerSeat {
            handle: 1,
            role: PeerRole::Window,
            tag: None,
            link: peer_half,
        };
        let client =
            PeerClient::connect(seat, ClientOptions::default().with_identifier("w")).unwrap();
        (client, coordinator_half)
    }

    #[test]
    fn test_connect_enters_subscribing() {
        run_local(async {
            let (client, _link) = manual_client();
            assert_eq!(client.registration_state(), RegistrationState::Subscribing);
            assert_eq!(client.identity().identifier.as_deref(), Some("w"));
        });
    }

    #[test]
    fn test_operations_fail_before_registration() {
        run_local(async {
            let (client, _link) = manual_client();
            assert!(matches!(
                client.send(&Target::Handle(2), "ping", vec![]).await,
                Err(MeshError::NotRegistered)
            ));
            assert!(matches!(
                client.invoke(&Target::Handle(2), "ping", vec![], None).await,
                Err(MeshError::NotRegistered)
            ));
        });
    }

    #[test]
    fn test_off_removes_only_the_named_listener() {
        run_local(async {
            let (client, _link) = manual_client();
            let first = client.on("tick", |_sender, _args| Ok(()));
            let _second = client.on("tick", |_sender, _args| Ok(()));

            assert!(client.off("tick", first));
            assert!(!client.off("tick", first));
            assert_eq!(
                client
                    .inner
                    .listeners
                    .borrow()
                    .get("tick")
                    .map(|l| l.len()),
                Some(1)
            );
        });
    }

    #[test]
    fn test_shutdown_is_idempotent_and_rejects_waiters() {
        run_local(async {
            let (client, _link) = manual_client();
            let waiting = client.clone();
            let waiter = tokio::task::spawn_local(async move { waiting.wait_registered().await });
            tokio::task::yield_now().await;

            client.shutdown();
            client.shutdown();

            let result = waiter.await.expect("waiter task panicked");
            assert!(matches!(result, Err(MeshError::Shutdown)));
        });
    }
}


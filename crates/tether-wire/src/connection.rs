//! One established link between two endpoints.
//!
//! A [`Connection`] owns the pending table of requests it sent, the set of
//! inbound calls it is running, the subscriptions peers hold on local
//! objects through it, and the proxies it created. Two tasks pump bytes:
//! the writer drains an ordered queue of encoded frames, the reader decodes
//! frames in arrival order and dispatches them.
//!
//! Frames are encoded and queued under one lock, so per-connection FIFO
//! order holds and a meta object is always sent before any descriptor
//! that omits it.

use crate::codec::{
    self, decode_descriptor, encode_descriptor, malformed, ObjectDescriptor, ReferenceExporter,
    ReferenceResolver,
};
use crate::control;
use crate::endpoint::Endpoint;
use crate::event::EndpointEventKind;
use crate::frame::{CorrelationId, Frame};
use crate::message::{
    decode_length, decode_message, encode_message, HandshakeMessage, Identity, PROTOCOL_VERSION,
};
use crate::proxy::RemoteLink;
use crate::registry::ServiceRegistry;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};
use tether_runtime::{AnyObject, DynamicObject, Future, Promise, SubscriptionId, WeakObject};
use tether_types::{
    DynamicValue, EndpointId, Error, MetaObject, ObjectRef, Result, Signature,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Identifier of a connection within its endpoint.
pub type ConnectionId = u64;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Handshake in progress.
    Connecting,
    Connected,
    Closing,
}

/// Which side of the handshake we play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Connector,
    Acceptor,
}

/// The peer, as learned during the handshake.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub endpoint_id: EndpointId,
    pub name: String,
    pub protocol_version: u32,
    pub connected_at: DateTime<Utc>,
}

enum Pending {
    Call {
        promise: Promise<DynamicValue>,
        returns: Signature,
        sent_at: Instant,
    },
    Lookup(Promise<AnyObject>),
    Services(Promise<Vec<String>>),
}

impl Pending {
    fn reject(self, error: Error) {
        let _ = match self {
            Self::Call { promise, .. } => promise.set_error(error),
            Self::Lookup(promise) => promise.set_error(error),
            Self::Services(promise) => promise.set_error(error),
        };
    }
}

#[derive(Default)]
struct PendingTable {
    /// Set once on shutdown; later requests fail immediately.
    closed: bool,
    entries: HashMap<CorrelationId, Pending>,
}

#[derive(Default)]
struct WriterSide {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    /// Routes whose meta object the peer has already received.
    sent_routes: HashSet<u64>,
}

fn lock<S>(m: &Mutex<S>) -> MutexGuard<'_, S> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// An established (or establishing) link to one peer.
pub struct Connection {
    id: ConnectionId,
    endpoint: Weak<Endpoint>,
    local_id: EndpointId,
    peer: OnceLock<PeerInfo>,
    state: Mutex<ConnectionState>,
    max_frame_size: u32,
    call_timeout: Option<Duration>,
    next_corr: AtomicU64,
    next_link: AtomicU64,
    writer: Mutex<WriterSide>,
    pending: Mutex<PendingTable>,
    /// Inbound calls still running, for cancel requests.
    running: Mutex<HashMap<CorrelationId, Future<DynamicValue>>>,
    /// Subscriptions the peer holds on our objects, by link id.
    remote_links: Mutex<HashMap<u64, (AnyObject, SubscriptionId)>>,
    /// Meta objects received from the peer, by route.
    known_meta: Mutex<HashMap<u64, Arc<MetaObject>>>,
    /// Proxies created for the peer's routes; events are routed to them.
    proxies: Mutex<HashMap<u64, WeakObject>>,
    reader_task: Mutex<Option<AbortHandle>>,
}

impl Connection {
    pub(crate) fn new(endpoint: &Arc<Endpoint>, id: ConnectionId) -> Arc<Self> {
        let config = endpoint.config();
        Arc::new(Self {
            id,
            endpoint: Arc::downgrade(endpoint),
            local_id: config.endpoint_id,
            peer: OnceLock::new(),
            state: Mutex::new(ConnectionState::Connecting),
            max_frame_size: config.max_frame_size,
            call_timeout: config.call_timeout(),
            next_corr: AtomicU64::new(1),
            next_link: AtomicU64::new(1),
            writer: Mutex::default(),
            pending: Mutex::default(),
            running: Mutex::default(),
            remote_links: Mutex::default(),
            known_meta: Mutex::default(),
            proxies: Mutex::default(),
            reader_task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The peer; `None` until the handshake completed.
    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.get()
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Requests still waiting for an answer.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).entries.len()
    }

    fn endpoint(&self) -> Result<Arc<Endpoint>> {
        self.endpoint.upgrade().ok_or(Error::ConnectionClosed)
    }

    // ---- handshake and pump ----

    /// Exchange identities on a fresh stream.
    pub(crate) async fn handshake<S>(
        &self,
        stream: &mut S,
        role: Role,
        name: &str,
        secret: Option<&str>,
        timeout: Duration,
    ) -> Result<PeerInfo>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let exchange = async {
            let ours = Identity::local(self.local_id, name, secret);
            let theirs = match role {
                Role::Connector => {
                    write_handshake(stream, &HandshakeMessage::Hello(ours)).await?;
                    match read_handshake(stream, self.max_frame_size).await? {
                        HandshakeMessage::Welcome(theirs) => {
                            check_identity(&theirs, secret)?;
                            theirs
                        }
                        HandshakeMessage::Refused { code, message } => {
                            return Err(Error::HandshakeFailed(format!(
                                "refused by peer ({code}): {message}"
                            )))
                        }
                        HandshakeMessage::Hello(_) => {
                            return Err(Error::HandshakeFailed(
                                "unexpected hello from accepting side".into(),
                            ))
                        }
                    }
                }
                Role::Acceptor => {
                    let theirs = match read_handshake(stream, self.max_frame_size).await? {
                        HandshakeMessage::Hello(theirs) => theirs,
                        _ => {
                            refuse(stream, 401, "handshake required").await;
                            return Err(Error::HandshakeFailed(
                                "first message was not a hello".into(),
                            ));
                        }
                    };
                    if let Err(e) = check_identity(&theirs, secret) {
                        let code = match e {
                            Error::VersionMismatch { .. } => 426,
                            _ => 403,
                        };
                        refuse(stream, code, &e.to_string()).await;
                        return Err(e);
                    }
                    write_handshake(stream, &HandshakeMessage::Welcome(ours)).await?;
                    theirs
                }
            };
            Ok::<_, Error>(PeerInfo {
                endpoint_id: theirs.endpoint_id,
                name: theirs.name,
                protocol_version: theirs.protocol_version,
                connected_at: Utc::now(),
            })
        };
        let peer = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(peer)) => peer,
            Ok(Err(e)) => {
                *lock(&self.state) = ConnectionState::Disconnected;
                return Err(e);
            }
            Err(_) => {
                *lock(&self.state) = ConnectionState::Disconnected;
                return Err(Error::HandshakeFailed("timed out".into()));
            }
        };
        let _ = self.peer.set(peer.clone());
        Ok(peer)
    }

    /// Split `stream` and spawn the reader and writer tasks.
    pub(crate) fn start<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        lock(&self.writer).tx = Some(tx);
        *lock(&self.state) = ConnectionState::Connected;

        let weak = Arc::downgrade(self);
        let conn_id = self.id;
        tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                let header = (body.len() as u32).to_be_bytes();
                let written = async {
                    writer.write_all(&header).await?;
                    writer.write_all(&body).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    debug!(conn = conn_id, error = %e, "Write failed");
                    if let Some(conn) = weak.upgrade() {
                        conn.shutdown(Error::from(e));
                    }
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let conn = Arc::clone(self);
        let max = self.max_frame_size;
        let task = tokio::spawn(async move {
            let reason = loop {
                let body = match read_body(&mut reader, max).await {
                    Ok(body) => body,
                    Err(e) => break e,
                };
                if let Err(e) = conn.handle_body(body) {
                    warn!(conn = conn.id, error = %e, "Malformed frame, closing connection");
                    break e;
                }
            };
            conn.shutdown(reason);
        });
        *lock(&self.reader_task) = Some(task.abort_handle());
    }

    /// Close the connection; every pending request fails with
    /// `ConnectionClosed`.
    pub fn close(&self) {
        self.shutdown(Error::ConnectionClosed);
    }

    fn shutdown(&self, reason: Error) {
        {
            let mut state = lock(&self.state);
            if matches!(
                *state,
                ConnectionState::Closing | ConnectionState::Disconnected
            ) {
                return;
            }
            *state = ConnectionState::Closing;
        }

        // Reject before anything else is released.
        let pending = {
            let mut table = lock(&self.pending);
            table.closed = true;
            std::mem::take(&mut table.entries)
        };
        let rejected = pending.len();
        for (_, entry) in pending {
            entry.reject(Error::ConnectionClosed);
        }

        lock(&self.writer).tx = None;
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }

        let running: Vec<_> = lock(&self.running).drain().map(|(_, f)| f).collect();
        for call in running {
            call.cancel_request();
        }
        let links: Vec<_> = lock(&self.remote_links).drain().map(|(_, l)| l).collect();
        for (object, subscription) in links {
            object.unsubscribe(subscription);
        }
        let proxies: Vec<_> = lock(&self.proxies).drain().map(|(_, p)| p).collect();

        if let Ok(endpoint) = self.endpoint() {
            for proxy in proxies.iter().filter_map(WeakObject::upgrade) {
                endpoint.forget_proxy(&proxy);
            }
            endpoint.connection_closed(self.id, &reason);
        }

        *lock(&self.state) = ConnectionState::Disconnected;
        info!(conn = self.id, reason = %reason, rejected, "Connection closed");
    }

    // ---- sending ----

    /// Build a frame under the writer lock and queue it.
    fn send(&self, build: impl FnOnce(&mut Exporter<'_>) -> Result<Frame>) -> Result<()> {
        let endpoint = self.endpoint()?;
        let mut writer = lock(&self.writer);
        let WriterSide { tx, sent_routes } = &mut *writer;
        let tx = tx.as_ref().ok_or(Error::ConnectionClosed)?;
        let mut exporter = Exporter {
            conn: self.id,
            local_id: self.local_id,
            registry: endpoint.registry(),
            sent_routes,
            fresh: Vec::new(),
        };
        let built = build(&mut exporter);
        let fresh = std::mem::take(&mut exporter.fresh);
        let body = built.and_then(|frame| {
            let body = frame.encode();
            if body.len() > self.max_frame_size as usize {
                return Err(Error::MessageTooLarge {
                    size: body.len() as u32,
                    max: self.max_frame_size,
                });
            }
            Ok(body)
        });
        match body {
            Ok(body) => tx.send(body).map_err(|_| Error::ConnectionClosed),
            Err(e) => {
                // The frame never left; the peer has not seen these metas.
                for route in fresh {
                    sent_routes.remove(&route);
                }
                Err(e)
            }
        }
    }

    fn send_error(&self, corr: CorrelationId, error: &Error) {
        let frame = Frame::Error {
            corr,
            code: error.code(),
            message: error.wire_message(),
        };
        if let Err(e) = self.send(|_| Ok(frame)) {
            debug!(conn = self.id, corr, error = %e, "Could not send error frame");
        }
    }

    fn send_outcome(&self, corr: CorrelationId, outcome: &Result<DynamicValue>) {
        match outcome {
            Ok(value) => {
                let sent = self.send(|exporter| {
                    let mut buf = BytesMut::new();
                    codec::encode_value(&mut buf, value, exporter)?;
                    Ok(Frame::Reply {
                        corr,
                        payload: buf.freeze(),
                    })
                });
                match sent {
                    Ok(()) | Err(Error::ConnectionClosed) => {}
                    Err(e) => self.send_error(corr, &e),
                }
            }
            Err(Error::Canceled) => {
                let _ = self.send(|_| Ok(Frame::Canceled { corr }));
            }
            Err(e) => self.send_error(corr, e),
        }
    }

    fn send_event(&self, route: u64, member: u32, payload: &[DynamicValue]) {
        let sent = self.send(|exporter| {
            let mut buf = BytesMut::new();
            codec::encode_values(&mut buf, payload, exporter)?;
            Ok(Frame::Event {
                object: route,
                signal: member,
                argc: payload.len() as u32,
                payload: buf.freeze(),
            })
        });
        if let Err(e) = sent {
            debug!(conn = self.id, route, member, error = %e, "Event not sent");
        }
    }

    fn take_pending(&self, corr: CorrelationId) -> Option<Pending> {
        lock(&self.pending).entries.remove(&corr)
    }

    /// Register `pending`, then send the frame built for its correlation id.
    fn request(
        self: &Arc<Self>,
        pending: Pending,
        build: impl FnOnce(CorrelationId, &mut Exporter<'_>) -> Result<Frame>,
    ) -> Option<CorrelationId> {
        let corr = self.next_corr.fetch_add(1, Ordering::Relaxed);
        {
            let mut table = lock(&self.pending);
            if table.closed {
                drop(table);
                pending.reject(Error::ConnectionClosed);
                return None;
            }
            table.entries.insert(corr, pending);
        }
        if let Err(e) = self.send(|exporter| build(corr, exporter)) {
            if let Some(entry) = self.take_pending(corr) {
                entry.reject(e);
            }
            return None;
        }
        self.arm_timeout(corr);
        Some(corr)
    }

    fn arm_timeout(self: &Arc<Self>, corr: CorrelationId) {
        let Some(timeout) = self.call_timeout else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(self);
        handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(conn) = weak.upgrade() {
                if let Some(entry) = conn.take_pending(corr) {
                    debug!(conn = conn.id, corr, "Request timed out");
                    entry.reject(Error::TimedOut);
                }
            }
        });
    }

    /// Call `action` on the peer's object at `route`.
    ///
    /// Never blocks: the returned future settles when the reply, an error,
    /// a timeout or the connection's closure arrives.
    pub fn call(
        self: &Arc<Self>,
        route: u64,
        action: u32,
        args: Vec<DynamicValue>,
        returns: Signature,
    ) -> Future<DynamicValue> {
        let promise = Promise::new();
        let future = promise.future();
        let argc = args.len() as u32;
        let sent = self.request(
            Pending::Call {
                promise: promise.clone(),
                returns,
                sent_at: Instant::now(),
            },
            |corr, exporter| {
                let mut buf = BytesMut::new();
                codec::encode_values(&mut buf, &args, exporter)?;
                Ok(Frame::Call {
                    corr,
                    object: route,
                    action,
                    argc,
                    args: buf.freeze(),
                })
            },
        );
        if let Some(corr) = sent {
            debug!(conn = self.id, corr, object = route, action, "Call sent");
            if let Ok(endpoint) = self.endpoint() {
                endpoint.publish(EndpointEventKind::CallSent {
                    conn: self.id,
                    corr,
                    object: route,
                    action,
                });
            }
            let weak = Arc::downgrade(self);
            promise.on_cancel(move || {
                if let Some(conn) = weak.upgrade() {
                    let _ = conn.send(|_| Ok(Frame::Cancel { corr }));
                }
            });
        }
        future
    }

    /// Look up a service the peer registered under `name`.
    pub fn get_object(self: &Arc<Self>, name: &str) -> Future<AnyObject> {
        let promise = Promise::new();
        let future = promise.future();
        let name = name.to_string();
        self.request(Pending::Lookup(promise), |corr, _| {
            Ok(Frame::Lookup { corr, name })
        });
        future
    }

    /// Names the peer has registered.
    pub fn services(self: &Arc<Self>) -> Future<Vec<String>> {
        let promise = Promise::new();
        let future = promise.future();
        self.request(Pending::Services(promise), |corr, _| {
            Ok(Frame::ListServices { corr })
        });
        future
    }

    // ---- receiving ----

    fn handle_body(self: &Arc<Self>, body: Bytes) -> Result<()> {
        match Frame::decode(body)? {
            Frame::Call {
                corr,
                object,
                action,
                argc,
                args,
            } => self.on_call(corr, object, action, argc, args),
            Frame::Reply { corr, payload } => self.on_reply(corr, payload),
            Frame::Error {
                corr,
                code,
                message,
            } => {
                match self.take_pending(corr) {
                    Some(entry) => {
                        self.completed(corr, false);
                        entry.reject(Error::from_wire(code, message));
                    }
                    None => self.unmatched(corr),
                }
                Ok(())
            }
            Frame::Canceled { corr } => {
                match self.take_pending(corr) {
                    Some(entry) => {
                        self.completed(corr, false);
                        entry.reject(Error::Canceled);
                    }
                    None => self.unmatched(corr),
                }
                Ok(())
            }
            Frame::Event {
                object,
                signal,
                argc,
                payload,
            } => self.on_event(object, signal, argc, payload),
            Frame::Lookup { corr, name } => {
                self.on_lookup(corr, &name);
                Ok(())
            }
            Frame::LookupReply { corr, descriptor } => self.on_lookup_reply(corr, descriptor),
            Frame::Cancel { corr } => {
                let call = lock(&self.running).get(&corr).cloned();
                match call {
                    Some(call) => {
                        debug!(conn = self.id, corr, "Cancel requested by peer");
                        call.cancel_request();
                    }
                    None => debug!(conn = self.id, corr, "Cancel for a call no longer running"),
                }
                Ok(())
            }
            Frame::ListServices { corr } => {
                let names = self.endpoint()?.registered_names();
                let _ = self.send(|_| Ok(Frame::ServiceList { corr, names }));
                Ok(())
            }
            Frame::ServiceList { corr, names } => {
                match self.take_pending(corr) {
                    Some(Pending::Services(promise)) => {
                        let _ = promise.set_value(names);
                    }
                    Some(other) => {
                        other.reject(malformed("service list for another request"));
                        return Err(malformed("service list for another request"));
                    }
                    None => self.unmatched(corr),
                }
                Ok(())
            }
        }
    }

    fn unmatched(&self, corr: CorrelationId) {
        warn!(conn = self.id, corr, "Dropping answer with no pending request");
    }

    fn completed(&self, corr: CorrelationId, ok: bool) {
        if let Ok(endpoint) = self.endpoint() {
            endpoint.publish(EndpointEventKind::CallCompleted {
                conn: self.id,
                corr,
                ok,
            });
        }
    }

    fn resolver(self: &Arc<Self>) -> Result<Resolver<'_>> {
        Ok(Resolver {
            conn: self,
            endpoint: self.endpoint()?,
        })
    }

    fn on_reply(self: &Arc<Self>, corr: CorrelationId, mut payload: Bytes) -> Result<()> {
        let Some(entry) = self.take_pending(corr) else {
            self.unmatched(corr);
            return Ok(());
        };
        let Pending::Call {
            promise,
            returns,
            sent_at,
        } = entry
        else {
            entry.reject(malformed("reply to a non-call request"));
            return Err(malformed("reply to a non-call request"));
        };
        let decoded = self.resolver().and_then(|mut resolver| {
            let value = codec::decode_value(&mut payload, &returns, &mut resolver)?;
            codec::expect_end(&payload)?;
            Ok(value)
        });
        match decoded {
            Ok(value) => {
                debug!(
                    conn = self.id,
                    corr,
                    elapsed_us = sent_at.elapsed().as_micros() as u64,
                    "Call completed"
                );
                self.completed(corr, true);
                let _ = promise.set_value(value);
                Ok(())
            }
            Err(e) => {
                let _ = promise.set_error(e.clone());
                Err(e)
            }
        }
    }

    fn on_lookup(self: &Arc<Self>, corr: CorrelationId, name: &str) {
        let found = self.endpoint().ok().and_then(|e| e.registry().lookup(name));
        let Some((_, object)) = found else {
            self.send_error(corr, &Error::NoSuchName(name.to_string()));
            return;
        };
        let sent = self.send(|exporter| {
            let descriptor = exporter.export(&object.to_ref())?;
            let mut buf = BytesMut::new();
            encode_descriptor(&mut buf, &descriptor)?;
            Ok(Frame::LookupReply {
                corr,
                descriptor: buf.freeze(),
            })
        });
        if let Err(e) = sent {
            self.send_error(corr, &e);
        }
    }

    fn on_lookup_reply(self: &Arc<Self>, corr: CorrelationId, mut body: Bytes) -> Result<()> {
        let promise = match self.take_pending(corr) {
            Some(Pending::Lookup(promise)) => promise,
            Some(other) => {
                other.reject(malformed("lookup reply for another request"));
                return Err(malformed("lookup reply for another request"));
            }
            None => {
                self.unmatched(corr);
                return Ok(());
            }
        };
        let resolved = self.resolver().and_then(|mut resolver| {
            let descriptor = decode_descriptor(&mut body)?;
            codec::expect_end(&body)?;
            resolver.resolve(descriptor)
        });
        match resolved.and_then(AnyObject::try_from) {
            Ok(object) => {
                let _ = promise.set_value(object);
                Ok(())
            }
            Err(e) => {
                let _ = promise.set_error(e.clone());
                Err(e)
            }
        }
    }

    fn on_call(
        self: &Arc<Self>,
        corr: CorrelationId,
        route: u64,
        action: u32,
        argc: u32,
        mut args: Bytes,
    ) -> Result<()> {
        let endpoint = self.endpoint()?;
        let Some(target) = endpoint.registry().by_route(route) else {
            self.send_error(corr, &Error::NoSuchName(format!("no object at route {route}")));
            return Ok(());
        };
        let (params, control) = match control::signatures(action) {
            Some((params, _)) => (params, true),
            None => match target.meta().action(action) {
                Some(meta) => (meta.parameters.clone(), false),
                None => {
                    self.send_error(corr, &Error::NoSuchAction(format!("{action} on {route}")));
                    return Ok(());
                }
            },
        };
        if argc as usize != params.children().len() {
            self.send_error(
                corr,
                &Error::SignatureMismatch(format!(
                    "action {action} expects {params}, got {argc} arguments"
                )),
            );
            return Ok(());
        }
        // The frame is already delimited, so bad arguments only fail this call.
        let decoded = {
            let mut resolver = self.resolver()?;
            codec::decode_values(&mut args, &params, &mut resolver)
                .and_then(|values| codec::expect_end(&args).map(|()| values))
        };
        let values = match decoded {
            Ok(values) => values,
            Err(e) => {
                debug!(conn = self.id, corr, action, error = %e, "Arguments do not decode");
                self.send_error(
                    corr,
                    &Error::SignatureMismatch(format!("action {action} expects {params}: {e}")),
                );
                return Ok(());
            }
        };

        let call = if control {
            self.run_control(&target, route, action, values)
        } else {
            target.call(action, values)
        };
        lock(&self.running).insert(corr, call.clone());
        let weak = Arc::downgrade(self);
        call.on_settled(move |outcome| {
            if let Some(conn) = weak.upgrade() {
                lock(&conn.running).remove(&corr);
                conn.send_outcome(corr, outcome);
            }
        });
        Ok(())
    }

    fn run_control(
        self: &Arc<Self>,
        target: &AnyObject,
        route: u64,
        action: u32,
        values: Vec<DynamicValue>,
    ) -> Future<DynamicValue> {
        let mut values = values.into_iter();
        let mut arg = move || values.next().unwrap_or(DynamicValue::Void);
        match action {
            control::SUBSCRIBE => {
                let member = match arg().into_native::<u32>() {
                    Ok(m) => m,
                    Err(e) => return Future::failed(e),
                };
                let link = self.next_link.fetch_add(1, Ordering::Relaxed);
                let forward = Arc::downgrade(self);
                let subscribed = target.subscribe(member, move |payload| {
                    if let Some(conn) = forward.upgrade() {
                        conn.send_event(route, member, payload);
                    }
                });
                let weak = Arc::downgrade(self);
                let target = target.clone();
                subscribed.then(move |outcome| {
                    let subscription = outcome?;
                    match weak.upgrade() {
                        Some(conn) if conn.is_connected() => {
                            lock(&conn.remote_links).insert(link, (target, subscription));
                            Ok(DynamicValue::UInt64(link))
                        }
                        _ => {
                            target.unsubscribe(subscription);
                            Err(Error::ConnectionClosed)
                        }
                    }
                })
            }
            control::UNSUBSCRIBE => {
                let link = match arg().into_native::<u64>() {
                    Ok(l) => l,
                    Err(e) => return Future::failed(e),
                };
                if let Some((object, subscription)) = lock(&self.remote_links).remove(&link) {
                    object.unsubscribe(subscription);
                }
                Future::ready(DynamicValue::Void)
            }
            control::GET_PROPERTY => match arg().into_native::<u32>() {
                Ok(id) => target
                    .get_property(id)
                    .then(|outcome| Ok(DynamicValue::dynamic(outcome?))),
                Err(e) => Future::failed(e),
            },
            control::SET_PROPERTY => match arg().into_native::<u32>() {
                Ok(id) => target
                    .set_property(id, arg())
                    .then(|outcome| outcome.map(|()| DynamicValue::Void)),
                Err(e) => Future::failed(e),
            },
            control::EMIT => {
                let signal = match arg().into_native::<u32>() {
                    Ok(s) => s,
                    Err(e) => return Future::failed(e),
                };
                let payload = match arg().into_native::<Vec<DynamicValue>>() {
                    Ok(p) => p,
                    Err(e) => return Future::failed(e),
                };
                match target.emit(signal, payload) {
                    Ok(()) => Future::ready(DynamicValue::Void),
                    Err(e) => Future::failed(e),
                }
            }
            other => Future::failed(Error::NoSuchAction(format!("control action {other}"))),
        }
    }

    fn on_event(
        self: &Arc<Self>,
        route: u64,
        member: u32,
        argc: u32,
        mut payload: Bytes,
    ) -> Result<()> {
        let proxy = lock(&self.proxies).get(&route).and_then(WeakObject::upgrade);
        let Some(proxy) = proxy else {
            debug!(conn = self.id, route, member, "Event for a proxy that is gone");
            return Ok(());
        };
        let Some(signature) = proxy.meta().subscription_payload(member) else {
            return Err(malformed(format!("event for unknown member {member}")));
        };
        if argc as usize != signature.children().len() {
            return Err(malformed(format!(
                "event {member} carries {argc} values, {signature} declared"
            )));
        }
        let values = {
            let mut resolver = self.resolver()?;
            let values = codec::decode_values(&mut payload, &signature, &mut resolver)?;
            codec::expect_end(&payload)?;
            values
        };
        proxy.deliver(member, &values);
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("peer", &self.peer.get().map(|p| p.endpoint_id))
            .finish()
    }
}

/// Exports local objects while a frame is being encoded.
pub(crate) struct Exporter<'a> {
    conn: ConnectionId,
    local_id: EndpointId,
    registry: &'a ServiceRegistry,
    sent_routes: &'a mut HashSet<u64>,
    /// Routes first sent in this frame.
    fresh: Vec<u64>,
}

impl ReferenceExporter for Exporter<'_> {
    fn export(&mut self, object: &ObjectRef) -> Result<ObjectDescriptor> {
        let object = AnyObject::try_from(object.clone())?;
        let route = self.registry.export(&object, self.conn);
        let meta = if self.sent_routes.insert(route) {
            self.fresh.push(route);
            Some(Arc::clone(object.meta()))
        } else {
            None
        };
        Ok(ObjectDescriptor {
            endpoint: self.local_id,
            route,
            uid: object.uid(),
            meta,
        })
    }
}

/// Materializes object references received on a connection.
struct Resolver<'a> {
    conn: &'a Arc<Connection>,
    endpoint: Arc<Endpoint>,
}

impl ReferenceResolver for Resolver<'_> {
    fn resolve(&mut self, descriptor: ObjectDescriptor) -> Result<ObjectRef> {
        let meta = {
            let mut known = lock(&self.conn.known_meta);
            match descriptor.meta {
                Some(meta) => {
                    known.insert(descriptor.route, Arc::clone(&meta));
                    meta
                }
                None => known.get(&descriptor.route).cloned().ok_or_else(|| {
                    malformed(format!(
                        "reference to route {} without a meta object",
                        descriptor.route
                    ))
                })?,
            }
        };

        // Our own object coming back is the original, not a proxy.
        if let Some(local) = self.endpoint.registry().by_uid(descriptor.uid) {
            return Ok(local.to_ref());
        }
        if let Some(proxy) = self.endpoint.cached_proxy(descriptor.uid) {
            return Ok(proxy.to_ref());
        }

        let link = RemoteLink::new(Arc::clone(self.conn), descriptor.route, Arc::clone(&meta));
        let proxy = DynamicObject::proxy(descriptor.uid, meta, Arc::new(link));
        lock(&self.conn.proxies).insert(descriptor.route, proxy.downgrade());
        self.endpoint.cache_proxy(&proxy);
        debug!(
            conn = self.conn.id,
            route = descriptor.route,
            uid = %descriptor.uid,
            origin = %descriptor.endpoint,
            "Created proxy"
        );
        Ok(proxy.to_ref())
    }
}

fn check_identity(peer: &Identity, secret: Option<&str>) -> Result<()> {
    if peer.protocol_version != PROTOCOL_VERSION {
        return Err(Error::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: peer.protocol_version,
        });
    }
    if let Some(secret) = secret {
        if !peer.verify(secret) {
            return Err(Error::HandshakeFailed(format!(
                "identity proof from {} rejected",
                peer.endpoint_id
            )));
        }
    }
    Ok(())
}

async fn refuse<S: AsyncWrite + Unpin>(stream: &mut S, code: u16, message: &str) {
    let refused = HandshakeMessage::Refused {
        code,
        message: message.to_string(),
    };
    if let Err(e) = write_handshake(stream, &refused).await {
        debug!(error = %e, "Could not send handshake refusal");
    }
}

async fn write_handshake<S: AsyncWrite + Unpin>(
    stream: &mut S,
    msg: &HandshakeMessage,
) -> Result<()> {
    let bytes = encode_message(msg)
        .map_err(|e| Error::HandshakeFailed(format!("cannot encode handshake: {e}")))?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_handshake<S: AsyncRead + Unpin>(
    stream: &mut S,
    max: u32,
) -> Result<HandshakeMessage> {
    let body = read_body(stream, max).await?;
    decode_message(&body).map_err(|e| Error::HandshakeFailed(format!("bad handshake: {e}")))
}

/// Read one length-prefixed body.
async fn read_body<R: AsyncRead + Unpin>(reader: &mut R, max: u32) -> Result<Bytes> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::ConnectionClosed);
        }
        Err(e) => return Err(Error::from(e)),
    }
    let len = decode_length(&header);
    if len > max {
        return Err(Error::MessageTooLarge { size: len, max });
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

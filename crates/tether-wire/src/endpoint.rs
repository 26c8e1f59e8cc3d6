//! Endpoint: owns connections, the service registry and the proxy cache.
//!
//! An [`Endpoint`] listens for peers, connects to peers, and makes local
//! objects addressable by name. Several endpoints can live in one process;
//! nothing here is global.

use crate::connection::{Connection, ConnectionId, Role};
use crate::event::{EndpointEvent, EndpointEventKind, EventBus};
use crate::registry::{ProxyCache, ServiceId, ServiceRegistry};
use crate::url::Url;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tether_runtime::{AnyObject, Future};
use tether_types::{EndpointConfig, EndpointId, Error, ObjectUid, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// A node of the object bus.
pub struct Endpoint {
    config: EndpointConfig,
    registry: ServiceRegistry,
    proxies: ProxyCache,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_conn: AtomicU64,
    events: EventBus,
    listeners: Mutex<Vec<AbortHandle>>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> Arc<Self> {
        info!(
            endpoint_id = %config.endpoint_id,
            name = %config.name,
            "Endpoint created"
        );
        Arc::new(Self {
            config,
            registry: ServiceRegistry::new(),
            proxies: ProxyCache::new(),
            connections: DashMap::new(),
            next_conn: AtomicU64::new(1),
            events: EventBus::new(),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> EndpointId {
        self.config.endpoint_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    // ---- services ----

    /// Make `object` reachable by peers under `name`.
    pub fn register_object(&self, name: &str, object: &AnyObject) -> Result<ServiceId> {
        let route = self.registry.register(name, object)?;
        info!(service = %name, route, uid = %object.uid(), "Service registered");
        self.publish(EndpointEventKind::ServiceRegistered {
            name: name.to_string(),
            route,
        });
        Ok(route)
    }

    pub fn unregister_object(&self, name: &str) -> Result<()> {
        let route = self.registry.unregister(name)?;
        info!(service = %name, route, "Service unregistered");
        self.publish(EndpointEventKind::ServiceUnregistered {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Names registered on this endpoint, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Names registered on the peer of `conn`.
    pub fn services(&self, conn: &Arc<Connection>) -> Future<Vec<String>> {
        conn.services()
    }

    /// Look up `name` on the peer of `conn` and build a proxy for it.
    pub fn get_object(&self, conn: &Arc<Connection>, name: &str) -> Future<AnyObject> {
        conn.get_object(name)
    }

    // ---- connections ----

    /// Start accepting peers on `url`; returns the bound address.
    pub async fn listen(self: &Arc<Self>, url: &str) -> Result<SocketAddr> {
        let url = Url::parse(url)?;
        let listener = TcpListener::bind(url.socket_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Tether: listening on {} (endpoint_id={})",
            local_addr,
            self.id()
        );
        let task = tokio::spawn(accept_loop(listener, Arc::downgrade(self)));
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task.abort_handle());
        Ok(local_addr)
    }

    /// Connect to the endpoint at `url`; completes once the handshake has.
    pub async fn connect(self: &Arc<Self>, url: &str) -> Result<Arc<Connection>> {
        let url = Url::parse(url)?;
        info!("Tether: connecting to {}", url);
        let stream = TcpStream::connect(url.socket_addr()).await?;
        stream.set_nodelay(true)?;
        self.connect_stream(stream).await
    }

    /// Run the connecting side of the protocol over an established stream.
    pub async fn connect_stream<S>(self: &Arc<Self>, stream: S) -> Result<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.establish(stream, Role::Connector).await
    }

    /// Run the accepting side of the protocol over an established stream.
    pub async fn accept_stream<S>(self: &Arc<Self>, stream: S) -> Result<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.establish(stream, Role::Acceptor).await
    }

    async fn establish<S>(self: &Arc<Self>, mut stream: S, role: Role) -> Result<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(self, id);
        let handshake = conn
            .handshake(
                &mut stream,
                role,
                &self.config.name,
                self.config.shared_secret.as_deref(),
                self.config.handshake_timeout(),
            )
            .await;
        let peer = match handshake {
            Ok(peer) => peer,
            Err(e) => {
                warn!(conn = id, role = ?role, error = %e, "Handshake failed");
                return Err(e);
            }
        };
        self.connections.insert(id, Arc::clone(&conn));
        conn.start(stream);
        info!(
            conn = id,
            peer = %peer.endpoint_id,
            peer_name = %peer.name,
            "Connection established"
        );
        self.publish(EndpointEventKind::ConnectionOpened {
            conn: id,
            peer: peer.endpoint_id,
            peer_name: peer.name,
        });
        Ok(conn)
    }

    /// Live connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Stop listening and close every connection.
    pub fn close(&self) {
        for task in self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        for conn in self.connections() {
            conn.close();
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EndpointEvent> {
        self.events.subscribe()
    }

    // ---- used by connections ----

    pub(crate) fn publish(&self, kind: EndpointEventKind) {
        self.events.publish(kind);
    }

    pub(crate) fn connection_closed(&self, id: ConnectionId, reason: &Error) {
        self.connections.remove(&id);
        let released = self.registry.release_connection(id);
        debug!(conn = id, released, "Released exports of closed connection");
        self.publish(EndpointEventKind::ConnectionClosed {
            conn: id,
            reason: reason.to_string(),
        });
    }

    /// A cached proxy for `uid` whose connection is still up.
    pub(crate) fn cached_proxy(&self, uid: ObjectUid) -> Option<AnyObject> {
        self.proxies.get(uid).filter(|proxy| {
            proxy
                .remote_backend()
                .is_some_and(|backend| backend.is_connected())
        })
    }

    pub(crate) fn cache_proxy(&self, proxy: &AnyObject) {
        self.proxies.insert(proxy);
    }

    /// Drop `proxy` from the cache unless another proxy replaced it.
    pub(crate) fn forget_proxy(&self, proxy: &AnyObject) {
        if self
            .proxies
            .get(proxy.uid())
            .is_some_and(|cached| cached.ptr_eq(proxy))
        {
            self.proxies.remove(proxy.uid());
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.config.endpoint_id)
            .field("name", &self.config.name)
            .field("connections", &self.connections.len())
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, endpoint: Weak<Endpoint>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Tether: accepted connection from {}", addr);
                let Some(endpoint) = endpoint.upgrade() else {
                    break;
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %addr, error = %e, "Could not disable Nagle");
                }
                tokio::spawn(async move {
                    if let Err(e) = endpoint.accept_stream(stream).await {
                        debug!(peer = %addr, error = %e, "Inbound connection rejected");
                    }
                });
            }
            Err(e) => {
                error!("Tether: accept error: {}", e);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

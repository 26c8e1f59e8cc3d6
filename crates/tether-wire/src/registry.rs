//! Export table and proxy cache of one endpoint.
//!
//! The [`ServiceRegistry`] records every object this endpoint makes
//! addressable: named services registered explicitly, and anonymous
//! exports created when an object reference is sent over a connection.
//! Each export has a route, the id peers put in their call frames.
//!
//! The [`ProxyCache`] maps an object's uid to the proxy already built for
//! it, so the same remote object always materializes as the same proxy.

use crate::connection::ConnectionId;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tether_runtime::{AnyObject, WeakObject};
use tether_types::{Error, ObjectUid, Result};

/// Route of an export; also returned by `register_object`.
pub type ServiceId = u64;

#[derive(Debug)]
struct Export {
    object: AnyObject,
    names: BTreeSet<String>,
    /// Connections the reference was sent over.
    connections: HashSet<ConnectionId>,
}

impl Export {
    fn is_unused(&self) -> bool {
        self.names.is_empty() && self.connections.is_empty()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_route: ServiceId,
    names: HashMap<String, ServiceId>,
    exports: HashMap<ServiceId, Export>,
    by_uid: HashMap<ObjectUid, ServiceId>,
}

impl RegistryInner {
    fn route_for(&mut self, object: &AnyObject) -> ServiceId {
        if let Some(route) = self.by_uid.get(&object.uid()) {
            return *route;
        }
        self.next_route += 1;
        let route = self.next_route;
        self.exports.insert(
            route,
            Export {
                object: object.clone(),
                names: BTreeSet::new(),
                connections: HashSet::new(),
            },
        );
        self.by_uid.insert(object.uid(), route);
        route
    }

    fn drop_if_unused(&mut self, route: ServiceId) {
        if self.exports.get(&route).is_some_and(Export::is_unused) {
            if let Some(export) = self.exports.remove(&route) {
                self.by_uid.remove(&export.object.uid());
            }
        }
    }
}

/// Thread-safe export table.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `object` reachable under `name`.
    pub fn register(&self, name: &str, object: &AnyObject) -> Result<ServiceId> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.names.contains_key(name) {
            return Err(Error::NameAlreadyRegistered(name.to_string()));
        }
        let route = inner.route_for(object);
        inner.names.insert(name.to_string(), route);
        if let Some(export) = inner.exports.get_mut(&route) {
            export.names.insert(name.to_string());
        }
        Ok(route)
    }

    /// Remove a name. The export survives while peers still hold it.
    pub fn unregister(&self, name: &str) -> Result<ServiceId> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let route = inner
            .names
            .remove(name)
            .ok_or_else(|| Error::NoSuchName(name.to_string()))?;
        if let Some(export) = inner.exports.get_mut(&route) {
            export.names.remove(name);
        }
        inner.drop_if_unused(route);
        Ok(route)
    }

    /// Export `object` for a peer on `conn`, reusing an existing route.
    pub fn export(&self, object: &AnyObject, conn: ConnectionId) -> ServiceId {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let route = inner.route_for(object);
        if let Some(export) = inner.exports.get_mut(&route) {
            export.connections.insert(conn);
        }
        route
    }

    /// Forget every reference sent over `conn`; drops anonymous exports
    /// nobody else holds.
    pub fn release_connection(&self, conn: ConnectionId) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let touched: Vec<ServiceId> = inner
            .exports
            .iter_mut()
            .filter_map(|(route, export)| export.connections.remove(&conn).then_some(*route))
            .collect();
        let before = inner.exports.len();
        for route in touched {
            inner.drop_if_unused(route);
        }
        before - inner.exports.len()
    }

    pub fn lookup(&self, name: &str) -> Option<(ServiceId, AnyObject)> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let route = *inner.names.get(name)?;
        inner
            .exports
            .get(&route)
            .map(|export| (route, export.object.clone()))
    }

    pub fn by_route(&self, route: ServiceId) -> Option<AnyObject> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.exports.get(&route).map(|e| e.object.clone())
    }

    pub fn by_uid(&self, uid: ObjectUid) -> Option<AnyObject> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let route = inner.by_uid.get(&uid)?;
        inner.exports.get(route).map(|e| e.object.clone())
    }

    /// Registered service names, sorted.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = inner.names.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of exports, named and anonymous.
    pub fn export_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.exports.len()
    }
}

/// Weak uid → proxy map.
#[derive(Debug, Clone, Default)]
pub struct ProxyCache {
    proxies: Arc<RwLock<HashMap<ObjectUid, WeakObject>>>,
}

impl ProxyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live proxy for `uid`, if any.
    pub fn get(&self, uid: ObjectUid) -> Option<AnyObject> {
        let proxies = self.proxies.read().unwrap_or_else(|e| e.into_inner());
        proxies.get(&uid).and_then(WeakObject::upgrade)
    }

    pub fn insert(&self, proxy: &AnyObject) {
        let mut proxies = self.proxies.write().unwrap_or_else(|e| e.into_inner());
        proxies.retain(|_, weak| weak.upgrade().is_some());
        proxies.insert(proxy.uid(), proxy.downgrade());
    }

    pub fn remove(&self, uid: ObjectUid) {
        let mut proxies = self.proxies.write().unwrap_or_else(|e| e.into_inner());
        proxies.remove(&uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_runtime::ObjectBuilder;

    fn object() -> AnyObject {
        let mut b = ObjectBuilder::new();
        b.action0("ping", || Ok(())).unwrap();
        b.build()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ServiceRegistry::new();
        let obj = object();
        let route = registry.register("svc", &obj).unwrap();
        let (found_route, found) = registry.lookup("svc").unwrap();
        assert_eq!(found_route, route);
        assert!(found.ptr_eq(&obj));
        assert!(registry.by_uid(obj.uid()).is_some());
        assert_eq!(registry.names(), vec!["svc".to_string()]);
    }

    #[test]
    fn test_name_taken_until_unregistered() {
        let registry = ServiceRegistry::new();
        registry.register("svc", &object()).unwrap();
        assert!(matches!(
            registry.register("svc", &object()),
            Err(Error::NameAlreadyRegistered(_))
        ));
        registry.unregister("svc").unwrap();
        assert!(matches!(
            registry.unregister("svc"),
            Err(Error::NoSuchName(_))
        ));
        registry.register("svc", &object()).unwrap();
    }

    #[test]
    fn test_anonymous_export_released_with_connection() {
        let registry = ServiceRegistry::new();
        let named = object();
        let anon = object();
        let named_route = registry.register("svc", &named).unwrap();
        assert_eq!(registry.export(&named, 1), named_route);
        let anon_route = registry.export(&anon, 1);
        assert_eq!(registry.export(&anon, 2), anon_route);
        assert_eq!(registry.export_count(), 2);

        assert_eq!(registry.release_connection(1), 0);
        assert!(registry.by_route(anon_route).is_some());
        assert_eq!(registry.release_connection(2), 1);
        assert!(registry.by_route(anon_route).is_none());
        assert!(registry.by_route(named_route).is_some());
    }

    #[test]
    fn test_proxy_cache_is_weak() {
        let cache = ProxyCache::new();
        let obj = object();
        cache.insert(&obj);
        assert!(cache.get(obj.uid()).is_some());
        let uid = obj.uid();
        drop(obj);
        assert!(cache.get(uid).is_none());
    }
}

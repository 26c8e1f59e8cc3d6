//! Backend of proxies: forwards object operations over a connection.

use crate::connection::Connection;
use crate::control;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tether_runtime::{Future, RemoteBackend};
use tether_types::{ActionId, DynamicValue, Error, MetaObject, PropertyId, Result, Signature, SignalId};
use tracing::debug;

/// Remote side of one subscribed member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// SUBSCRIBE sent, no answer yet. `wanted` turns false when the last
    /// local subscriber leaves before the answer.
    Pending { wanted: bool },
    /// The peer's link id.
    Linked(u64),
}

type Links = Arc<Mutex<HashMap<u32, LinkState>>>;

/// Stands for the peer's object at `route` on `conn`.
pub struct RemoteLink {
    conn: Arc<Connection>,
    route: u64,
    meta: Arc<MetaObject>,
    links: Links,
}

fn lock_links(links: &Links) -> std::sync::MutexGuard<'_, HashMap<u32, LinkState>> {
    links.lock().unwrap_or_else(|e| e.into_inner())
}

fn release(conn: &Arc<Connection>, route: u64, link: u64) {
    let args = vec![DynamicValue::UInt64(link)];
    // Nobody waits for the answer.
    let _ = conn.call(route, control::UNSUBSCRIBE, args, Signature::Void);
}

impl RemoteLink {
    pub(crate) fn new(conn: Arc<Connection>, route: u64, meta: Arc<MetaObject>) -> Self {
        Self {
            conn,
            route,
            meta,
            links: Arc::default(),
        }
    }

    pub fn route(&self) -> u64 {
        self.route
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    fn control(&self, action: ActionId, args: Vec<DynamicValue>) -> Future<DynamicValue> {
        let returns = control::signatures(action)
            .map(|(_, returns)| returns)
            .unwrap_or(Signature::Void);
        self.conn.call(self.route, action, args, returns)
    }
}

impl RemoteBackend for RemoteLink {
    fn call(&self, action: ActionId, args: Vec<DynamicValue>) -> Future<DynamicValue> {
        let Some(meta) = self.meta.action(action) else {
            return Future::failed(Error::NoSuchAction(action.to_string()));
        };
        self.conn
            .call(self.route, action, args, meta.returns.clone())
    }

    fn get_property(&self, property: PropertyId) -> Future<DynamicValue> {
        self.control(control::GET_PROPERTY, vec![DynamicValue::UInt32(property)])
            .then(|outcome| match outcome? {
                DynamicValue::Dynamic(inner) => Ok(*inner),
                other => Ok(other),
            })
    }

    fn set_property(&self, property: PropertyId, value: DynamicValue) -> Future<()> {
        self.control(
            control::SET_PROPERTY,
            vec![DynamicValue::UInt32(property), DynamicValue::dynamic(value)],
        )
        .then(|outcome| outcome.map(|_| ()))
    }

    fn subscribe_remote(&self, member: u32) -> Future<()> {
        {
            let mut links = lock_links(&self.links);
            if let Some(LinkState::Linked(_)) = links.get(&member).copied() {
                return Future::ready(());
            }
            links.insert(member, LinkState::Pending { wanted: true });
        }
        let links = Arc::clone(&self.links);
        let conn = Arc::clone(&self.conn);
        let route = self.route;
        self.control(control::SUBSCRIBE, vec![DynamicValue::UInt32(member)])
            .then(move |outcome| {
                let link = match outcome.and_then(|v| v.into_native::<u64>()) {
                    Ok(link) => link,
                    Err(e) => {
                        let mut links = lock_links(&links);
                        if matches!(links.get(&member), Some(LinkState::Pending { .. })) {
                            links.remove(&member);
                        }
                        return Err(e);
                    }
                };
                let keep = {
                    let mut links = lock_links(&links);
                    match links.get(&member).copied() {
                        Some(LinkState::Pending { wanted: true }) => {
                            links.insert(member, LinkState::Linked(link));
                            true
                        }
                        Some(LinkState::Pending { wanted: false }) => {
                            links.remove(&member);
                            false
                        }
                        // Unsubscribed already, or an earlier link is in place.
                        _ => false,
                    }
                };
                if !keep {
                    debug!(route, member, link, "Subscription answered after it was dropped");
                    release(&conn, route, link);
                }
                Ok(())
            })
    }

    fn unsubscribe_remote(&self, member: u32) {
        let mut links = lock_links(&self.links);
        match links.get(&member).copied() {
            Some(LinkState::Linked(link)) => {
                links.remove(&member);
                drop(links);
                release(&self.conn, self.route, link);
            }
            Some(LinkState::Pending { .. }) => {
                links.insert(member, LinkState::Pending { wanted: false });
            }
            None => debug!(route = self.route, member, "No remote link to drop"),
        }
    }

    fn emit(&self, signal: SignalId, payload: Vec<DynamicValue>) -> Result<()> {
        let payload = payload.into_iter().map(DynamicValue::dynamic).collect();
        let payload = DynamicValue::list(Signature::Dynamic, payload)?;
        let _ = self.control(control::EMIT, vec![DynamicValue::UInt32(signal), payload]);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("route {} on connection {}", self.route, self.conn.id())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }
}

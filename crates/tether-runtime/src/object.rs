//! Dynamic objects: a meta object bound to something that can execute it.
//!
//! A [`DynamicObject`] is either local, holding a dispatch table of native
//! handlers and property storage, or a proxy, forwarding everything through
//! a [`RemoteBackend`]. Both kinds keep their own subscriber table, so
//! signal delivery looks the same to local code either way.

use crate::future::{Future, Promise};
use crate::strand::Strand;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use tether_types::{
    ActionId, DynamicValue, Error, FromValue, IntoValue, MetaAction, MetaObject, ObjectHandle,
    ObjectRef, ObjectUid, PropertyId, Reflect, Result, Signature, SignalId,
};
use tracing::{debug, warn};

/// Identifier of one subscription on one object.
pub type SubscriptionId = u64;

/// Receives the payload of a fired signal or a changed property.
pub type SignalHandler = Arc<dyn Fn(&[DynamicValue]) + Send + Sync>;

type SyncFn = dyn Fn(Vec<DynamicValue>) -> Result<DynamicValue> + Send + Sync;
type AsyncFn = dyn Fn(Vec<DynamicValue>) -> BoxFuture<'static, Result<DynamicValue>> + Send + Sync;

/// A native implementation bound to one action id.
#[derive(Clone)]
pub enum ActionHandler {
    /// Runs to completion on the dispatching thread.
    Sync(Arc<SyncFn>),
    /// Returns a future driven by the tokio runtime; can be aborted on cancel.
    Async(Arc<AsyncFn>),
}

/// Where a proxy sends the work it cannot do itself.
///
/// Arguments handed to a backend have already been checked against the
/// meta object.
pub trait RemoteBackend: Send + Sync + 'static {
    fn call(&self, action: ActionId, args: Vec<DynamicValue>) -> Future<DynamicValue>;

    fn get_property(&self, property: PropertyId) -> Future<DynamicValue>;

    fn set_property(&self, property: PropertyId, value: DynamicValue) -> Future<()>;

    /// Ask the remote object to start forwarding `member` events.
    fn subscribe_remote(&self, member: u32) -> Future<()>;

    /// Stop forwarding `member` events. Best effort.
    fn unsubscribe_remote(&self, member: u32);

    /// Fire a signal on the remote object.
    fn emit(&self, signal: SignalId, payload: Vec<DynamicValue>) -> Result<()>;

    /// Short description for logs.
    fn describe(&self) -> String;

    /// False once the link to the remote object is gone for good.
    fn is_connected(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct Subscribers {
    next_id: SubscriptionId,
    by_id: BTreeMap<SubscriptionId, (u32, SignalHandler)>,
}

impl Subscribers {
    fn count_for(&self, member: u32) -> usize {
        self.by_id.values().filter(|(m, _)| *m == member).count()
    }
}

pub(crate) struct LocalBackend {
    pub(crate) actions: HashMap<ActionId, ActionHandler>,
    pub(crate) properties: Mutex<HashMap<PropertyId, DynamicValue>>,
    pub(crate) strand: Option<Strand>,
}

enum Backend {
    Local(LocalBackend),
    Remote(Arc<dyn RemoteBackend>),
}

fn lock<S>(m: &Mutex<S>) -> MutexGuard<'_, S> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// An object invoked by action id rather than by compiled type.
pub struct DynamicObject {
    uid: ObjectUid,
    meta: Arc<MetaObject>,
    subscribers: Arc<Mutex<Subscribers>>,
    backend: Backend,
}

impl DynamicObject {
    pub(crate) fn local(meta: MetaObject, backend: LocalBackend) -> AnyObject {
        AnyObject(Arc::new(Self {
            uid: ObjectUid::new(),
            meta: Arc::new(meta),
            subscribers: Arc::default(),
            backend: Backend::Local(backend),
        }))
    }

    /// Build a proxy standing for the object identified by `uid`.
    pub fn proxy(
        uid: ObjectUid,
        meta: Arc<MetaObject>,
        backend: Arc<dyn RemoteBackend>,
    ) -> AnyObject {
        AnyObject(Arc::new(Self {
            uid,
            meta,
            subscribers: Arc::default(),
            backend: Backend::Remote(backend),
        }))
    }

    pub fn uid(&self) -> ObjectUid {
        self.uid
    }

    pub fn meta(&self) -> &Arc<MetaObject> {
        &self.meta
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.backend, Backend::Remote(_))
    }

    /// The backend of a proxy; `None` for a local object.
    pub fn remote_backend(&self) -> Option<&Arc<dyn RemoteBackend>> {
        match &self.backend {
            Backend::Remote(b) => Some(b),
            Backend::Local(_) => None,
        }
    }

    /// Invoke `action` with `args`.
    ///
    /// Arguments are checked against the declared parameters before
    /// anything runs. The returned future settles when the handler (or the
    /// remote peer) completes.
    pub fn call(&self, action: ActionId, args: Vec<DynamicValue>) -> Future<DynamicValue> {
        let Some(meta_action) = self.meta.action(action) else {
            return Future::failed(Error::NoSuchAction(format!("{} on {}", action, self.uid)));
        };
        let args = match check_args(meta_action, args) {
            Ok(args) => args,
            Err(e) => return Future::failed(e),
        };
        match &self.backend {
            Backend::Remote(remote) => remote.call(action, args),
            Backend::Local(local) => self.dispatch_local(local, meta_action, args),
        }
    }

    /// Invoke an action by name, choosing the overload from the arguments.
    ///
    /// An exact signature match wins. Otherwise the single overload with
    /// the same arity that accepts the arguments is used; none is
    /// `NoSuchAction` and several is `AmbiguousAction`.
    pub fn call_named(&self, name: &str, args: Vec<DynamicValue>) -> Future<DynamicValue> {
        match self.resolve_overload(name, &args) {
            Ok(id) => self.call(id, args),
            Err(e) => Future::failed(e),
        }
    }

    /// [`DynamicObject::call_named`] with the reply converted to `R`.
    pub fn call_typed<R>(&self, name: &str, args: Vec<DynamicValue>) -> Future<R>
    where
        R: FromValue + Clone + Send + 'static,
    {
        self.call_named(name, args)
            .then(|outcome| outcome?.into_native::<R>())
    }

    fn resolve_overload(&self, name: &str, args: &[DynamicValue]) -> Result<ActionId> {
        let exact = Signature::tuple(args.iter().map(DynamicValue::signature));
        if let Ok(id) = self.meta.find_action(name, &exact) {
            return Ok(id);
        }
        let candidates: Vec<&MetaAction> = self
            .meta
            .actions()
            .iter()
            .filter(|a| a.name == name)
            .filter(|a| check_args(a, args.to_vec()).is_ok())
            .collect();
        match candidates.as_slice() {
            [only] => Ok(only.id),
            [] => Err(Error::NoSuchAction(format!("{name}::{exact}"))),
            _ => Err(Error::AmbiguousAction(format!("{name}::{exact}"))),
        }
    }

    fn dispatch_local(
        &self,
        local: &LocalBackend,
        action: &MetaAction,
        args: Vec<DynamicValue>,
    ) -> Future<DynamicValue> {
        let Some(handler) = local.actions.get(&action.id).cloned() else {
            return Future::failed(Error::NoSuchAction(action.to_string()));
        };
        debug!(object = %self.uid, action = %action.name, "Dispatching local call");
        let returns = action.returns.clone();
        let promise = Promise::new();
        let future = promise.future();

        if let Some(strand) = &local.strand {
            let job_promise = promise.clone();
            let posted = strand.post(Box::pin(async move {
                if job_promise.is_cancel_requested() {
                    let _ = job_promise.set_canceled();
                    return;
                }
                let outcome = match handler {
                    ActionHandler::Sync(f) => f(args),
                    ActionHandler::Async(f) => f(args).await,
                };
                let _ = job_promise.settle(check_return(outcome, &returns));
            }));
            if let Err(e) = posted {
                let _ = promise.set_error(e);
            }
            return future;
        }

        match handler {
            ActionHandler::Sync(f) => {
                let _ = promise.settle(check_return(f(args), &returns));
            }
            ActionHandler::Async(f) => {
                let work = f(args);
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let task_promise = promise.clone();
                        let task = handle.spawn(async move {
                            let outcome = work.await;
                            let _ = task_promise.settle(check_return(outcome, &returns));
                        });
                        let abort = task.abort_handle();
                        let cancel_promise = promise.clone();
                        promise.on_cancel(move || {
                            abort.abort();
                            let _ = cancel_promise.set_canceled();
                        });
                    }
                    Err(_) => {
                        let outcome = futures::executor::block_on(work);
                        let _ = promise.settle(check_return(outcome, &returns));
                    }
                }
            }
        }
        future
    }

    /// Current value of a property.
    pub fn get_property(&self, property: PropertyId) -> Future<DynamicValue> {
        if self.meta.property(property).is_none() {
            return Future::failed(Error::NoSuchProperty(property.to_string()));
        }
        match &self.backend {
            Backend::Remote(remote) => remote.get_property(property),
            Backend::Local(local) => match lock(&local.properties).get(&property) {
                Some(value) => Future::ready(value.clone()),
                None => Future::failed(Error::NoSuchProperty(property.to_string())),
            },
        }
    }

    /// Replace a property's value and notify its subscribers.
    pub fn set_property(&self, property: PropertyId, value: DynamicValue) -> Future<()> {
        let Some(meta) = self.meta.property(property) else {
            return Future::failed(Error::NoSuchProperty(property.to_string()));
        };
        let value = match value.coerce(&meta.signature) {
            Ok(v) => v,
            Err(e) => {
                return Future::failed(Error::SignatureMismatch(format!(
                    "property {}: {e}",
                    meta.name
                )))
            }
        };
        match &self.backend {
            Backend::Remote(remote) => remote.set_property(property, value),
            Backend::Local(local) => {
                lock(&local.properties).insert(property, value.clone());
                self.deliver(property, &[value]);
                Future::ready(())
            }
        }
    }

    pub fn property_named(&self, name: &str) -> Future<DynamicValue> {
        match self.meta.find_property(name) {
            Ok(id) => self.get_property(id),
            Err(e) => Future::failed(e),
        }
    }

    pub fn set_property_named(&self, name: &str, value: DynamicValue) -> Future<()> {
        match self.meta.find_property(name) {
            Ok(id) => self.set_property(id, value),
            Err(e) => Future::failed(e),
        }
    }

    /// Fire `signal` with `payload`.
    ///
    /// On a proxy the signal is fired on the remote object, and comes back
    /// to local subscribers through the event stream.
    pub fn emit(&self, signal: SignalId, payload: Vec<DynamicValue>) -> Result<()> {
        let meta = self
            .meta
            .signal(signal)
            .ok_or_else(|| Error::NoSuchSignal(signal.to_string()))?;
        let payload = check_values(&meta.payload, payload)
            .map_err(|e| Error::SignatureMismatch(format!("signal {}: {e}", meta.name)))?;
        match &self.backend {
            Backend::Remote(remote) => remote.emit(signal, payload),
            Backend::Local(_) => {
                self.deliver(signal, &payload);
                Ok(())
            }
        }
    }

    pub fn emit_named(&self, name: &str, payload: Vec<DynamicValue>) -> Result<()> {
        let id = self.meta.find_signal(name)?;
        self.emit(id, payload)
    }

    /// Register `handler` for a signal or a property change.
    ///
    /// On a proxy, the first local subscriber of a member also subscribes
    /// on the remote object; the returned future settles once that is done.
    pub fn subscribe(
        &self,
        member: u32,
        handler: impl Fn(&[DynamicValue]) + Send + Sync + 'static,
    ) -> Future<SubscriptionId> {
        if self.meta.subscription_payload(member).is_none() {
            return Future::failed(Error::NoSuchSignal(member.to_string()));
        }
        let (id, first) = {
            let mut subs = lock(&self.subscribers);
            let first = subs.count_for(member) == 0;
            subs.next_id += 1;
            let id = subs.next_id;
            subs.by_id.insert(id, (member, Arc::new(handler)));
            (id, first)
        };
        match &self.backend {
            Backend::Remote(remote) if first => {
                let subscribers = Arc::clone(&self.subscribers);
                remote.subscribe_remote(member).then(move |outcome| {
                    if let Err(e) = outcome {
                        lock(&subscribers).by_id.remove(&id);
                        return Err(e);
                    }
                    Ok(id)
                })
            }
            _ => Future::ready(id),
        }
    }

    pub fn subscribe_named(
        &self,
        name: &str,
        handler: impl Fn(&[DynamicValue]) + Send + Sync + 'static,
    ) -> Future<SubscriptionId> {
        let member = self
            .meta
            .find_signal(name)
            .or_else(|_| self.meta.find_property(name));
        match member {
            Ok(member) => self.subscribe(member, handler),
            Err(_) => Future::failed(Error::NoSuchSignal(name.to_string())),
        }
    }

    /// Drop a subscription. Unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        let last_member = {
            let mut subs = lock(&self.subscribers);
            match subs.by_id.remove(&subscription) {
                Some((member, _)) if subs.count_for(member) == 0 => Some(member),
                _ => None,
            }
        };
        if let (Some(member), Backend::Remote(remote)) = (last_member, &self.backend) {
            remote.unsubscribe_remote(member);
        }
    }

    /// Number of live subscriptions on `member`.
    pub fn subscriber_count(&self, member: u32) -> usize {
        lock(&self.subscribers).count_for(member)
    }

    /// Hand `payload` to every handler subscribed to `member` right now.
    ///
    /// Handlers added while delivering are not called for this delivery.
    pub fn deliver(&self, member: u32, payload: &[DynamicValue]) {
        let snapshot: Vec<SignalHandler> = lock(&self.subscribers)
            .by_id
            .values()
            .filter(|(m, _)| *m == member)
            .map(|(_, h)| Arc::clone(h))
            .collect();
        if snapshot.is_empty() {
            return;
        }
        debug!(object = %self.uid, member, subscribers = snapshot.len(), "Delivering event");
        for handler in snapshot {
            handler(payload);
        }
    }
}

fn check_values(expected: &Signature, values: Vec<DynamicValue>) -> Result<Vec<DynamicValue>> {
    let params = expected.children();
    if params.len() != values.len() {
        return Err(Error::SignatureMismatch(format!(
            "expected {} values {expected}, got {}",
            params.len(),
            values.len()
        )));
    }
    values
        .into_iter()
        .zip(params.iter())
        .map(|(v, p)| v.coerce(p))
        .collect()
}

fn check_args(action: &MetaAction, args: Vec<DynamicValue>) -> Result<Vec<DynamicValue>> {
    let got = Signature::tuple(args.iter().map(DynamicValue::signature));
    check_values(&action.parameters, args).map_err(|_| {
        Error::SignatureMismatch(format!(
            "{} expects {}, got {got}",
            action.name, action.parameters
        ))
    })
}

fn check_return(outcome: Result<DynamicValue>, returns: &Signature) -> Result<DynamicValue> {
    outcome?.coerce(returns).map_err(|e| {
        warn!(error = %e, "Handler returned a value of the wrong type");
        Error::SignatureMismatch(format!("return value: {e}"))
    })
}

impl ObjectHandle for DynamicObject {
    fn uid(&self) -> ObjectUid {
        self.uid
    }

    fn meta_object(&self) -> &Arc<MetaObject> {
        &self.meta
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for DynamicObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.backend {
            Backend::Local(_) => "local".to_string(),
            Backend::Remote(r) => r.describe(),
        };
        f.debug_struct("DynamicObject")
            .field("uid", &self.uid)
            .field("backend", &kind)
            .finish()
    }
}

/// Shared handle to a local object or a proxy.
///
/// This is what travels inside a [`DynamicValue`] as an object reference.
#[derive(Clone, Debug)]
pub struct AnyObject(Arc<DynamicObject>);

impl AnyObject {
    pub fn as_arc(&self) -> &Arc<DynamicObject> {
        &self.0
    }

    /// True when both handles point at the same in-process object.
    pub fn ptr_eq(&self, other: &AnyObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakObject {
        WeakObject(Arc::downgrade(&self.0))
    }

    pub fn to_ref(&self) -> ObjectRef {
        ObjectRef::new(Arc::clone(&self.0) as Arc<dyn ObjectHandle>)
    }
}

impl Deref for AnyObject {
    type Target = DynamicObject;

    fn deref(&self) -> &DynamicObject {
        &self.0
    }
}

impl PartialEq for AnyObject {
    fn eq(&self, other: &Self) -> bool {
        self.0.uid == other.0.uid
    }
}

/// Non-owning handle, used by caches that must not keep objects alive.
#[derive(Clone, Debug)]
pub struct WeakObject(std::sync::Weak<DynamicObject>);

impl WeakObject {
    pub fn upgrade(&self) -> Option<AnyObject> {
        self.0.upgrade().map(AnyObject)
    }
}

impl TryFrom<ObjectRef> for AnyObject {
    type Error = Error;

    fn try_from(r: ObjectRef) -> Result<Self> {
        r.downcast::<DynamicObject>()
            .map(AnyObject)
            .ok_or_else(|| Error::type_mismatch(Signature::Object, "foreign object handle"))
    }
}

impl From<AnyObject> for DynamicValue {
    fn from(o: AnyObject) -> Self {
        DynamicValue::Object(o.to_ref())
    }
}

impl Reflect for AnyObject {
    fn signature() -> Signature {
        Signature::Object
    }
}

impl IntoValue for AnyObject {
    fn into_value(self) -> DynamicValue {
        self.into()
    }
}

impl FromValue for AnyObject {
    fn from_value(value: DynamicValue) -> Result<Self> {
        ObjectRef::from_value(value).and_then(AnyObject::try_from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ObjectBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_object() -> AnyObject {
        let mut b = ObjectBuilder::new();
        b.action1("double", |x: i32| Ok(x * 2)).unwrap();
        b.action1("echo", |x: String| Ok(x)).unwrap();
        b.action1("echo", |x: i32| Ok(x)).unwrap();
        b.action("describe", "(m)", "s", |args| {
            Ok(DynamicValue::from(args[0].content().signature().to_string()))
        })
        .unwrap();
        b.action("broken", "()", "i", |_| Ok(DynamicValue::from("not an int")))
            .unwrap();
        b.signal("ticked", "(i)").unwrap();
        b.property("level", "i", DynamicValue::Int32(1)).unwrap();
        b.build()
    }

    #[test]
    fn test_call_validates_arguments() {
        let obj = counter_object();
        let double = obj.meta().find_action_by_name("double").unwrap();
        assert_eq!(
            obj.call(double, vec![21i32.into()]).typed::<i32>().peek().unwrap().unwrap(),
            42
        );
        assert!(matches!(
            obj.call(double, vec!["x".into()]).peek(),
            Some(Err(Error::SignatureMismatch(_)))
        ));
        assert!(matches!(
            obj.call(double, vec![]).peek(),
            Some(Err(Error::SignatureMismatch(_)))
        ));
        assert!(matches!(
            obj.call(9999, vec![]).peek(),
            Some(Err(Error::NoSuchAction(_)))
        ));
    }

    #[test]
    fn test_call_named_resolves_overloads() {
        let obj = counter_object();
        let s = obj.call_typed::<String>("echo", vec!["hi".into()]);
        assert_eq!(s.peek().unwrap().unwrap(), "hi");
        let i = obj.call_typed::<i32>("echo", vec![5i32.into()]);
        assert_eq!(i.peek().unwrap().unwrap(), 5);
        assert!(matches!(
            obj.call_named("echo", vec![1.5f64.into()]).peek(),
            Some(Err(Error::NoSuchAction(_)))
        ));
        let described = obj.call_typed::<String>("describe", vec![vec![1u8].into_value()]);
        assert_eq!(described.peek().unwrap().unwrap(), "[C]");
    }

    #[test]
    fn test_return_value_checked() {
        let obj = counter_object();
        assert!(matches!(
            obj.call_named("broken", vec![]).peek(),
            Some(Err(Error::SignatureMismatch(_)))
        ));
    }

    #[test]
    fn test_properties_validate_and_notify() {
        let obj = counter_object();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        obj.subscribe_named("level", move |payload| {
            sink.lock().unwrap().push(payload[0].clone());
        })
        .peek()
        .unwrap()
        .unwrap();
        obj.set_property_named("level", DynamicValue::Int32(3))
            .peek()
            .unwrap()
            .unwrap();
        assert_eq!(
            obj.property_named("level").peek().unwrap().unwrap(),
            DynamicValue::Int32(3)
        );
        assert!(matches!(
            obj.set_property_named("level", "high".into()).peek(),
            Some(Err(Error::SignatureMismatch(_)))
        ));
        assert_eq!(*seen.lock().unwrap(), vec![DynamicValue::Int32(3)]);
        assert!(matches!(
            obj.property_named("nope").peek(),
            Some(Err(Error::NoSuchProperty(_)))
        ));
    }

    #[test]
    fn test_emit_snapshots_subscribers() {
        let obj = counter_object();
        let hits = Arc::new(AtomicUsize::new(0));
        let late_hits = Arc::new(AtomicUsize::new(0));
        let inner = obj.clone();
        let (h, lh) = (Arc::clone(&hits), Arc::clone(&late_hits));
        obj.subscribe_named("ticked", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            let lh = Arc::clone(&lh);
            // Subscribing during delivery must not see this firing.
            let _ = inner.subscribe_named("ticked", move |_| {
                lh.fetch_add(1, Ordering::SeqCst);
            });
        });
        obj.emit_named("ticked", vec![1i32.into()]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);
        assert!(matches!(
            obj.emit_named("ticked", vec!["x".into()]),
            Err(Error::SignatureMismatch(_))
        ));
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let obj = counter_object();
        let ticked = obj.meta().find_signal("ticked").unwrap();
        let id = obj.subscribe(ticked, |_| {}).peek().unwrap().unwrap();
        assert_eq!(obj.subscriber_count(ticked), 1);
        obj.unsubscribe(id);
        obj.unsubscribe(id);
        obj.unsubscribe(12345);
        assert_eq!(obj.subscriber_count(ticked), 0);
    }

    #[test]
    fn test_object_value_roundtrip() {
        let obj = counter_object();
        let value = DynamicValue::from(obj.clone());
        assert_eq!(value.signature(), Signature::Object);
        let back: AnyObject = value.extract().unwrap();
        assert!(back.ptr_eq(&obj));
        assert_eq!(value.clone(), value);
    }

    #[tokio::test]
    async fn test_async_handler_cancel_aborts() {
        let mut b = ObjectBuilder::new();
        b.async_action("sleep", "()", "v", |_| {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Ok(DynamicValue::Void)
            })
        })
        .unwrap();
        let obj = b.build();
        let fut = obj.call_named("sleep", vec![]);
        fut.cancel_request();
        assert!(matches!(fut.await, Err(Error::Canceled)));
    }
}

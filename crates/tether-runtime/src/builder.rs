//! Registration surface for local objects.
//!
//! ```ignore
//! let mut b = ObjectBuilder::new();
//! b.action1("echo", |s: String| Ok(s))?;
//! b.signal("changed", "(s)")?;
//! b.property("level", "i", DynamicValue::Int32(0))?;
//! let object = b.build();
//! ```

use crate::object::{ActionHandler, AnyObject, DynamicObject, LocalBackend};
use crate::strand::Strand;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tether_types::{
    ActionId, DynamicValue, Error, FromValue, IntoValue, MetaObjectBuilder, PropertyId, Result,
    Signature, SignalId,
};

/// Collects actions, signals and properties, then produces a local object.
pub struct ObjectBuilder {
    meta: MetaObjectBuilder,
    actions: HashMap<ActionId, ActionHandler>,
    properties: HashMap<PropertyId, DynamicValue>,
    strand: bool,
}

fn next_arg<T: FromValue>(args: &mut impl Iterator<Item = DynamicValue>) -> Result<T> {
    T::from_value(args.next().unwrap_or(DynamicValue::Void))
}

impl ObjectBuilder {
    pub fn new() -> Self {
        Self {
            meta: MetaObjectBuilder::new(),
            actions: HashMap::new(),
            properties: HashMap::new(),
            strand: false,
        }
    }

    /// Run every call on one sequential strand instead of the caller's
    /// thread.
    pub fn strand(&mut self) -> &mut Self {
        self.strand = true;
        self
    }

    /// Bind a handler working on raw dynamic values.
    pub fn action<F>(
        &mut self,
        name: &str,
        parameters: &str,
        returns: &str,
        handler: F,
    ) -> Result<ActionId>
    where
        F: Fn(Vec<DynamicValue>) -> Result<DynamicValue> + Send + Sync + 'static,
    {
        let id = self.meta.add_action(
            name,
            Signature::parse(parameters)?,
            Signature::parse(returns)?,
        )?;
        self.actions.insert(id, ActionHandler::Sync(Arc::new(handler)));
        Ok(id)
    }

    /// Bind a handler that completes asynchronously.
    pub fn async_action<F>(
        &mut self,
        name: &str,
        parameters: &str,
        returns: &str,
        handler: F,
    ) -> Result<ActionId>
    where
        F: Fn(Vec<DynamicValue>) -> BoxFuture<'static, Result<DynamicValue>>
            + Send
            + Sync
            + 'static,
    {
        let id = self.meta.add_action(
            name,
            Signature::parse(parameters)?,
            Signature::parse(returns)?,
        )?;
        self.actions
            .insert(id, ActionHandler::Async(Arc::new(handler)));
        Ok(id)
    }

    fn typed<F>(&mut self, name: &str, parameters: Signature, returns: Signature, f: F) -> Result<ActionId>
    where
        F: Fn(Vec<DynamicValue>) -> Result<DynamicValue> + Send + Sync + 'static,
    {
        let id = self.meta.add_action(name, parameters, returns)?;
        self.actions.insert(id, ActionHandler::Sync(Arc::new(f)));
        Ok(id)
    }

    /// Bind a native function of no arguments.
    pub fn action0<R, F>(&mut self, name: &str, f: F) -> Result<ActionId>
    where
        R: IntoValue,
        F: Fn() -> Result<R> + Send + Sync + 'static,
    {
        self.typed(name, Signature::Tuple(Vec::new()), R::signature(), move |_| {
            f().map(IntoValue::into_value)
        })
    }

    /// Bind a native function of one argument.
    pub fn action1<A, R, F>(&mut self, name: &str, f: F) -> Result<ActionId>
    where
        A: FromValue,
        R: IntoValue,
        F: Fn(A) -> Result<R> + Send + Sync + 'static,
    {
        self.typed(
            name,
            Signature::tuple([A::signature()]),
            R::signature(),
            move |args| {
                let mut args = args.into_iter();
                f(next_arg(&mut args)?).map(IntoValue::into_value)
            },
        )
    }

    /// Bind a native function of two arguments.
    pub fn action2<A, B, R, F>(&mut self, name: &str, f: F) -> Result<ActionId>
    where
        A: FromValue,
        B: FromValue,
        R: IntoValue,
        F: Fn(A, B) -> Result<R> + Send + Sync + 'static,
    {
        self.typed(
            name,
            Signature::tuple([A::signature(), B::signature()]),
            R::signature(),
            move |args| {
                let mut args = args.into_iter();
                let a = next_arg(&mut args)?;
                let b = next_arg(&mut args)?;
                f(a, b).map(IntoValue::into_value)
            },
        )
    }

    /// Declare a signal with a tuple payload signature.
    pub fn signal(&mut self, name: &str, payload: &str) -> Result<SignalId> {
        self.meta.add_signal(name, Signature::parse(payload)?)
    }

    /// Declare a property and its initial value.
    pub fn property(
        &mut self,
        name: &str,
        signature: &str,
        initial: DynamicValue,
    ) -> Result<PropertyId> {
        let signature = Signature::parse(signature)?;
        let initial = initial.coerce(&signature).map_err(|e| {
            Error::SignatureMismatch(format!("initial value of {name}: {e}"))
        })?;
        let id = self.meta.add_property(name, signature)?;
        self.properties.insert(id, initial);
        Ok(id)
    }

    pub fn build(self) -> AnyObject {
        DynamicObject::local(
            self.meta.build(),
            LocalBackend {
                actions: self.actions,
                properties: Mutex::new(self.properties),
                strand: self.strand.then(Strand::new),
            },
        )
    }
}

impl Default for ObjectBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_meta_matches_registration() {
        let mut b = ObjectBuilder::new();
        let give = b.action1("give", |_o: AnyObject| Ok(())).unwrap();
        let add = b.action2("add", |a: i64, b: i64| Ok(a + b)).unwrap();
        let sig = b.signal("fired", "(s)").unwrap();
        let obj = b.build();
        let meta = obj.meta();
        assert_eq!(meta.action(give).unwrap().parameters.to_string(), "(o)");
        assert_eq!(meta.action(give).unwrap().returns.to_string(), "v");
        assert_eq!(meta.action(add).unwrap().parameters.to_string(), "(ll)");
        assert_eq!(meta.action(add).unwrap().returns.to_string(), "l");
        assert_eq!(meta.signal(sig).unwrap().payload.to_string(), "(s)");
        assert_ne!(obj.uid(), ObjectBuilder::new().build().uid());
    }

    #[test]
    fn test_bad_declarations() {
        let mut b = ObjectBuilder::new();
        assert!(matches!(
            b.action("x", "(q)", "v", |_| Ok(DynamicValue::Void)),
            Err(Error::InvalidSignature(_))
        ));
        assert!(matches!(
            b.property("p", "i", "one".into()),
            Err(Error::SignatureMismatch(_))
        ));
        b.action0("ping", || Ok("pong".to_string())).unwrap();
        assert!(matches!(
            b.action0("ping", || Ok("again".to_string())),
            Err(Error::AmbiguousAction(_))
        ));
    }

    #[tokio::test]
    async fn test_strand_serializes_calls() {
        let running = Arc::new(AtomicU32::new(0));
        let overlap = Arc::new(AtomicU32::new(0));
        let mut b = ObjectBuilder::new();
        let (r, o) = (Arc::clone(&running), Arc::clone(&overlap));
        b.async_action("work", "()", "v", move |_| {
            let (r, o) = (Arc::clone(&r), Arc::clone(&o));
            Box::pin(async move {
                if r.fetch_add(1, Ordering::SeqCst) > 0 {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(DynamicValue::Void)
            })
        })
        .unwrap();
        b.strand();
        let obj = b.build();
        let calls: Vec<_> = (0..4).map(|_| obj.call_named("work", vec![])).collect();
        for call in calls {
            call.await.unwrap();
        }
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }
}

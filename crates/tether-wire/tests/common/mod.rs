//! Shared fixtures for the endpoint integration tests.

#![allow(dead_code)]

use futures::FutureExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_runtime::{AnyObject, ObjectBuilder};
use tether_types::{DynamicValue, EndpointConfig, Error};
use tether_wire::{Connection, Endpoint};

pub fn config(name: &str) -> EndpointConfig {
    EndpointConfig {
        name: name.to_string(),
        ..EndpointConfig::default()
    }
}

/// An endpoint listening on an ephemeral loopback port, and its url.
pub async fn serving(config: EndpointConfig) -> (Arc<Endpoint>, String) {
    let endpoint = Endpoint::new(config);
    let addr = endpoint.listen("tcp://127.0.0.1:0").await.unwrap();
    (endpoint, format!("tcp://{addr}"))
}

/// A client endpoint connected to `url`.
pub async fn client(name: &str, url: &str) -> (Arc<Endpoint>, Arc<Connection>) {
    let endpoint = Endpoint::new(config(name));
    let conn = endpoint.connect(url).await.unwrap();
    (endpoint, conn)
}

/// Holds one object: `give(o)` stores it, `take()` hands it back.
pub fn ping_pong() -> AnyObject {
    let held: Arc<Mutex<Option<AnyObject>>> = Arc::default();
    let mut b = ObjectBuilder::new();
    let slot = Arc::clone(&held);
    b.action1("give", move |o: AnyObject| {
        *slot.lock().unwrap() = Some(o);
        Ok(())
    })
    .unwrap();
    b.action0("take", move || {
        held.lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Remote("nothing to take".into()))
    })
    .unwrap();
    b.build()
}

/// Arithmetic, a signal, a property and a slow async action.
pub fn counter() -> AnyObject {
    let mut b = ObjectBuilder::new();
    b.action2("add", |a: i32, b: i32| Ok(a + b)).unwrap();
    b.action1("greet", |name: String| Ok(format!("hello {name}")))
        .unwrap();
    b.action1("fail", |why: String| -> Result<(), Error> { Err(Error::Remote(why)) })
        .unwrap();
    b.async_action("sleep", "(i)", "i", |args| {
        async move {
            let ms = args[0].extract::<i32>()?;
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            Ok(DynamicValue::Int32(ms))
        }
        .boxed()
    })
    .unwrap();
    b.signal("ticked", "(i)").unwrap();
    b.property("level", "i", DynamicValue::Int32(1)).unwrap();
    b.build()
}

/// Poll `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

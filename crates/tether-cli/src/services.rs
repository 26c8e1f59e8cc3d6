//! Services hosted by `tether serve`.

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tether_runtime::{AnyObject, ObjectBuilder};
use tether_types::{DynamicValue, Error, Result};
use tracing::{info, warn};

/// Name `PingPongService` is registered under.
pub const PING_PONG: &str = "PingPongService";
/// Name `RemotePerformanceService` is registered under.
pub const REMOTE_PERFORMANCE: &str = "RemotePerformanceService";

/// How long one measured operation may take.
const MEASURE_TIMEOUT: Duration = Duration::from_secs(20);

fn lock<S>(m: &Mutex<S>) -> MutexGuard<'_, S> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keeps the last object it was given.
pub fn ping_pong() -> Result<AnyObject> {
    let held: Arc<Mutex<Option<AnyObject>>> = Arc::default();
    let mut b = ObjectBuilder::new();
    let slot = Arc::clone(&held);
    b.action1("give", move |object: AnyObject| {
        info!(uid = %object.uid(), proxy = object.is_proxy(), "PingPong: given an object");
        *lock(&slot) = Some(object);
        Ok(())
    })?;
    b.action0("take", move || {
        lock(&held)
            .clone()
            .ok_or_else(|| Error::Remote("no object was given yet".into()))
    })?;
    Ok(b.build())
}

struct PerformanceState {
    objects: Vec<AnyObject>,
    measure_count: i32,
    total_calls: u64,
}

impl PerformanceState {
    fn random_object(&self) -> Option<AnyObject> {
        if self.objects.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..self.objects.len());
        Some(self.objects[idx].clone())
    }
}

type Operation = Arc<dyn Fn(AnyObject) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Measures calls, property reads and property writes on stored objects.
///
/// Every `measure*` action runs the operation `measure_count` times on a
/// randomly chosen stored object and returns one duration in nanoseconds
/// per run. A failing operation is logged and still measured.
pub fn remote_performance() -> Result<AnyObject> {
    let state = Arc::new(Mutex::new(PerformanceState {
        objects: Vec::new(),
        measure_count: 4,
        total_calls: 0,
    }));
    let mut b = ObjectBuilder::new();

    let s = Arc::clone(&state);
    b.action1("setObject", move |object: AnyObject| {
        lock(&s).objects.push(object);
        Ok(())
    })?;
    let s = Arc::clone(&state);
    b.action1("setObjectList", move |objects: Vec<AnyObject>| {
        lock(&s).objects = objects;
        Ok(())
    })?;
    let s = Arc::clone(&state);
    b.action0("clear", move || {
        lock(&s).objects.clear();
        Ok(())
    })?;
    let s = Arc::clone(&state);
    b.action1("setMeasureCount", move |count: i32| {
        lock(&s).measure_count = count;
        Ok(())
    })?;

    let s = Arc::clone(&state);
    b.async_action("measureCallDuration", "(s)", "[l]", move |args| {
        let state = Arc::clone(&s);
        async move {
            let function = args[0].extract::<String>()?;
            let op: Operation = Arc::new(move |object: AnyObject| {
                let function = function.clone();
                async move { object.call_named(&function, vec![]).await.map(|_| ()) }.boxed()
            });
            measure(&state, "measureCallDuration", op).await
        }
        .boxed()
    })?;

    let s = Arc::clone(&state);
    b.async_action("measureCallDurationArgument", "(sm)", "[l]", move |args| {
        let state = Arc::clone(&s);
        async move {
            let function = args[0].extract::<String>()?;
            let argument = args[1].clone();
            let op: Operation = Arc::new(move |object: AnyObject| {
                let function = function.clone();
                let argument = argument.clone();
                async move {
                    object
                        .call_named(&function, vec![argument])
                        .await
                        .map(|_| ())
                }
                .boxed()
            });
            measure(&state, "measureCallDurationArgument", op).await
        }
        .boxed()
    })?;

    let s = Arc::clone(&state);
    b.async_action("measureGetPropertyDuration", "(s)", "[l]", move |args| {
        let state = Arc::clone(&s);
        async move {
            let property = args[0].extract::<String>()?;
            let op: Operation = Arc::new(move |object: AnyObject| {
                let property = property.clone();
                async move { object.property_named(&property).await.map(|_| ()) }.boxed()
            });
            measure(&state, "measureGetPropertyDuration", op).await
        }
        .boxed()
    })?;

    let s = Arc::clone(&state);
    b.async_action("measureSetPropertyDuration", "(s)", "[l]", move |args| {
        let state = Arc::clone(&s);
        async move {
            let property = args[0].extract::<String>()?;
            let op: Operation = Arc::new(move |object: AnyObject| {
                let property = property.clone();
                async move {
                    let watched = property.clone();
                    let subscription = object
                        .subscribe_named(&property, move |payload| {
                            info!(property = %watched, value = ?payload, "RemotePerformance: property set");
                        })
                        .await?;
                    let set = object
                        .set_property_named(&property, DynamicValue::Int32(99))
                        .await;
                    object.unsubscribe(subscription);
                    set
                }
                .boxed()
            });
            measure(&state, "measureSetPropertyDuration", op).await
        }
        .boxed()
    })?;

    Ok(b.build())
}

async fn measure(
    state: &Arc<Mutex<PerformanceState>>,
    source: &str,
    operation: Operation,
) -> Result<DynamicValue> {
    let count = lock(state).measure_count;
    let mut results = Vec::with_capacity(count.max(0) as usize);
    for i in 0..count {
        let (object, call) = {
            let mut state = lock(state);
            let object = state
                .random_object()
                .ok_or_else(|| Error::Remote("No stored object to call".into()))?;
            state.total_calls += 1;
            (object, state.total_calls)
        };
        info!(call, measure = i, uid = %object.uid(), "{source}: operation start");

        let start = Instant::now();
        match tokio::time::timeout(MEASURE_TIMEOUT, operation(object.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(Error::Canceled)) => warn!("{source}: measured call was canceled"),
            Ok(Err(e)) => warn!(error = %e, "{source}: measured call returned an error"),
            Err(_) => {
                let message = format!(
                    "{source}: measured call did not finish after {} ms",
                    MEASURE_TIMEOUT.as_millis()
                );
                warn!("{message}");
                return Err(Error::Remote(message));
            }
        }
        let nanos = start.elapsed().as_nanos() as i64;
        info!(
            call,
            measure = i,
            uid = %object.uid(),
            elapsed_ms = nanos / 1_000_000,
            "{source}: operation stop"
        );
        results.push(nanos);
    }
    Ok(DynamicValue::from_native(results))
}

//! # Delivery Engine
//!
//! Every handler invocation runs in its own failure domain: a panic is
//! caught here, logged and counted, and never reaches the publisher or
//! sibling handlers.
//!
//! Spawned invocations are tracked by [`InFlight`] so `close` can wait for
//! them instead of leaving work running past the broker's lifetime.

use crate::contract::{EventHandler, HandlerId};
use crate::payload::Payload;
use crate::stats::BrokerStats;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::error;

/// Count of spawned invocations that have not finished yet.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    /// Count one unit of work until the guard is dropped.
    ///
    /// Callers that check a closed flag must enter before checking it, so a
    /// concurrent `close` either sees the work or the work sees the flag.
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }

    /// Units of work currently counted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves once no invocation is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.len() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps an [`InFlight`] count raised while alive.
pub(crate) struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Run `handler` inline, catching panics. Returns `true` if it completed.
pub(crate) fn invoke(
    handler: &EventHandler,
    payload: Payload,
    stats: &BrokerStats,
    topic: &str,
    handler_id: HandlerId,
) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
        Ok(()) => {
            stats.record_delivery();
            true
        }
        Err(panic) => {
            stats.record_failure();
            error!(
                topic = topic,
                handler_id = handler_id,
                panic = panic_message(&*panic),
                "Event handler panicked"
            );
            false
        }
    }
}

/// Run each handler as its own task, tracked by `in_flight`. Does not wait for them.
pub(crate) fn dispatch(
    handlers: Vec<(HandlerId, EventHandler)>,
    payload: &Payload,
    stats: &Arc<BrokerStats>,
    in_flight: &Arc<InFlight>,
    topic: &str,
) -> usize {
    let count = handlers.len();
    for (handler_id, handler) in handlers {
        let payload = payload.clone();
        let stats = Arc::clone(stats);
        let topic = topic.to_string();
        let guard = in_flight.enter();
        tokio::spawn(async move {
            let _guard = guard;
            invoke(&handler, payload, &stats, &topic, handler_id);
        });
    }
    count
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

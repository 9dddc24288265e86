//! # Consumption Tasks
//!
//! Backends that open one native subscription per `subscribe` call (AMQP,
//! Redis, NATS) run one background task per subscription. The task owns
//! the native stream and invokes the handler inline, so once the task has
//! been joined no invocation for that subscription can still be running.
//!
//! A task reports the result of its native unsubscribe over a oneshot;
//! [`StopUnsubscribe`] stops the task, joins it and returns that result.

use crate::context::Context;
use crate::contract::{HandlerId, Unsubscribe};
use crate::error::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// How a consumption task is asked to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopMode {
    Running,
    /// Stop immediately; buffered messages are discarded.
    Stop,
    /// Stop receiving, deliver what is already buffered, then stop.
    Drain,
}

/// Receiving side of a task's stop request.
pub(crate) struct StopSignal {
    receiver: watch::Receiver<StopMode>,
}

impl StopSignal {
    /// Resolves with the requested mode. A dropped task handle means `Stop`.
    pub async fn requested(&mut self) -> StopMode {
        match self
            .receiver
            .wait_for(|mode| *mode != StopMode::Running)
            .await
        {
            Ok(mode) => *mode,
            Err(_) => StopMode::Stop,
        }
    }
}

/// Why [`pump`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpExit {
    Stopped(StopMode),
    Cancelled,
    Ended,
}

/// Feed every stream item to `deliver` until stopped, cancelled or ended.
pub(crate) async fn pump<S, F>(
    stream: &mut S,
    stop: &mut StopSignal,
    ctx: &Context,
    mut deliver: F,
) -> PumpExit
where
    S: Stream + Unpin,
    F: FnMut(S::Item),
{
    let requested = stop.requested();
    let done = ctx.done();
    tokio::pin!(requested, done);

    loop {
        tokio::select! {
            biased;
            mode = &mut requested => return PumpExit::Stopped(mode),
            _ = &mut done => return PumpExit::Cancelled,
            item = stream.next() => match item {
                Some(item) => deliver(item),
                None => return PumpExit::Ended,
            },
        }
    }
}

/// Deliver what is left in `stream` until it ends.
///
/// Used after the native subscription stopped receiving. Returns `false`
/// if `limit` elapsed first; the rest is dropped.
pub(crate) async fn drain_buffered<S, F>(
    stream: &mut S,
    mut deliver: F,
    limit: Duration,
) -> bool
where
    S: Stream + Unpin,
    F: FnMut(S::Item),
{
    let drained = tokio::time::timeout(limit, async {
        while let Some(item) = stream.next().await {
            deliver(item);
        }
    })
    .await;
    drained.is_ok()
}

/// One running consumption task.
pub(crate) struct ConsumerTask {
    stop: watch::Sender<StopMode>,
    handle: JoinHandle<()>,
}

impl ConsumerTask {
    pub fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, receiver) = watch::channel(StopMode::Running);
        let handle = tokio::spawn(run(StopSignal { receiver }));
        Self { stop, handle }
    }

    /// Request an immediate stop and wait for the task.
    pub async fn stop(self) {
        self.finish(StopMode::Stop).await;
    }

    /// Request a drain and wait for the task.
    pub async fn drain(self) {
        self.finish(StopMode::Drain).await;
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    async fn finish(self, mode: StopMode) {
        self.stop.send_replace(mode);
        if let Err(err) = self.handle.await {
            if err.is_panic() {
                error!(error = %err, "Consumption task panicked");
            }
        }
    }
}

/// Live consumption tasks of one broker, keyed by handler id.
#[derive(Default)]
pub(crate) struct ConsumerSet {
    tasks: Mutex<HashMap<HandlerId, ConsumerTask>>,
    next_id: AtomicU64,
}

impl ConsumerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> HandlerId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert(&self, id: HandlerId, task: ConsumerTask) {
        self.tasks.lock().insert(id, task);
    }

    pub fn take(&self, id: HandlerId) -> Option<ConsumerTask> {
        self.tasks.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Stop and join every task.
    pub async fn stop_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain().map(|(_, t)| t).collect();
        debug!(count = tasks.len(), "Stopping consumption tasks");
        futures::future::join_all(tasks.into_iter().map(ConsumerTask::stop)).await;
    }

    /// Drain and join every task.
    pub async fn drain_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain().map(|(_, t)| t).collect();
        debug!(count = tasks.len(), "Draining consumption tasks");
        futures::future::join_all(tasks.into_iter().map(ConsumerTask::drain)).await;
    }
}

/// Removes one task-backed subscription.
pub(crate) struct StopUnsubscribe {
    consumers: Arc<ConsumerSet>,
    id: HandlerId,
    outcome: Mutex<Option<oneshot::Receiver<Result<()>>>>,
}

impl StopUnsubscribe {
    pub fn new(
        consumers: Arc<ConsumerSet>,
        id: HandlerId,
        outcome: oneshot::Receiver<Result<()>>,
    ) -> Self {
        Self {
            consumers,
            id,
            outcome: Mutex::new(Some(outcome)),
        }
    }
}

#[async_trait]
impl Unsubscribe for StopUnsubscribe {
    async fn unsubscribe(&self) -> Result<()> {
        if let Some(task) = self.consumers.take(self.id) {
            task.stop().await;
        }
        let outcome = self.outcome.lock().take();
        // a task that exited without reporting had nothing left to release
        let result = match outcome {
            Some(rx) => rx.await.unwrap_or(Ok(())),
            None => Ok(()),
        };
        if let Err(err) = &result {
            warn!(handler_id = self.id, error = %err, "Native unsubscribe failed");
        }
        debug!(handler_id = self.id, "Unsubscribed");
        result
    }
}

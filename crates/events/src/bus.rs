//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern** - a pub/sub mechanism for distributing
//! work lifecycle events to multiple consumers (the failure rescheduler, event-driven
//! workers, audit sinks, etc.).
//!
//! ## Design Philosophy
//!
//! - **Transport-agnostic**: the in-process implementation is channel based; nothing in
//!   the trait prevents a networked implementation
//! - **At-least-once delivery**: events may be delivered multiple times; consumers must be idempotent
//! - **No ordering guarantees across topics**: `added` and `finished` for unrelated items
//!   may be observed in any order
//! - **No persistence**: the bus is for distribution, the work store is the source of truth
//!
//! ## Local completeness
//!
//! An in-process bus only sees events published by the same process. Consumers that
//! react to events (such as the event-driven worker) therefore miss work added by other
//! processes and must be paired with a polling strategy in multi-process deployments.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

/// A subscription to an event stream.
///
/// Each subscription gets a copy of all events published to the bus after it was
/// created (broadcast semantics). Dropping the subscription unsubscribes.
///
/// ## Usage Pattern
///
/// ```ignore
/// let mut subscription = bus.subscribe();
///
/// while let Some(event) = subscription.recv().await {
///     process(event).await?;
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait until the next message is available. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait for up to `timeout`. `Ok(None)` on timeout, `Err` once the bus is gone.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<M>, TryRecvError> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(TryRecvError::Disconnected),
            Err(_) => Ok(None),
        }
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// ## Architecture Role
///
/// ```text
/// Director (persist change) → Event Bus (publish) → Consumers
///                                                     ├─ Failure rescheduler
///                                                     ├─ Event-driven workers
///                                                     └─ External sinks (audit, alerting)
/// ```
///
/// Changes are **persisted first**, then **published**. A failed publication never
/// undoes a persisted change.
///
/// ## Thread Safety
///
/// The trait requires `Send + Sync`; publishing is synchronous and may happen from any
/// task or thread.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

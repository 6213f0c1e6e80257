//! Typed publish/subscribe buses
//!
//! A [`Bus`] fans one event type out to an ordered set of registered
//! [`Handler`]s. Publishing never blocks and never fails: a handler that
//! returns an error or panics is logged and the remaining handlers still
//! see the event.
//!
//! Two delivery modes exist:
//! - **Inline**: handlers run on the publishing task, before `publish`
//!   returns.
//! - **Queued**: events are pushed onto an unbounded queue drained by a
//!   dedicated worker task, so a slow handler never stalls the publisher.
//!
//! Handlers are invoked on a snapshot of the subscriber list, so a handler
//! may unregister itself (or others) while being called.

use parking_lot::RwLock;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::Result;

/// Identifier of a registered handler, unique within one context
pub type SubscriberId = u64;

/// Receives events of type `E`
pub trait Handler<E>: Send + Sync {
    fn handle(&self, event: &E) -> Result<()>;
}

impl<E, F> Handler<E> for F
where
    F: Fn(&E) -> Result<()> + Send + Sync,
{
    fn handle(&self, event: &E) -> Result<()> {
        self(event)
    }
}

/// How a bus delivers events to its handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Inline,
    Queued,
}

struct Subscriber<E> {
    id: SubscriberId,
    handler: Arc<dyn Handler<E>>,
}

type Subscribers<E> = Arc<RwLock<Vec<Subscriber<E>>>>;

enum Queued<E> {
    Event(E),
    Flush(oneshot::Sender<()>),
}

/// A typed event bus
pub struct Bus<E> {
    name: &'static str,
    subscribers: Subscribers<E>,
    queue: Option<mpsc::UnboundedSender<Queued<E>>>,
    ids: Arc<AtomicU64>,
}

impl<E: Send + Sync + 'static> Bus<E> {
    /// Create a bus that delivers on the publishing task
    pub fn inline(name: &'static str, ids: Arc<AtomicU64>) -> Self {
        Self {
            name,
            subscribers: Arc::new(RwLock::new(Vec::new())),
            queue: None,
            ids,
        }
    }

    /// Create a bus drained by its own worker task
    ///
    /// Must be called inside a Tokio runtime.
    pub fn queued(name: &'static str, ids: Arc<AtomicU64>) -> Self {
        let subscribers: Subscribers<E> = Arc::new(RwLock::new(Vec::new()));
        let (tx, mut rx) = mpsc::unbounded_channel::<Queued<E>>();

        let worker_subscribers = subscribers.clone();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Queued::Event(event) => dispatch(name, &worker_subscribers, &event),
                    Queued::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("{} bus worker stopped", name);
        });

        Self {
            name,
            subscribers,
            queue: Some(tx),
            ids,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn mode(&self) -> DeliveryMode {
        if self.queue.is_some() {
            DeliveryMode::Queued
        } else {
            DeliveryMode::Inline
        }
    }

    /// Allocate a fresh subscriber id from the shared counter
    pub fn next_id(&self) -> SubscriberId {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a handler under a fresh id
    pub fn subscribe(&self, handler: Arc<dyn Handler<E>>) -> SubscriberId {
        let id = self.next_id();
        self.register(id, handler);
        id
    }

    /// Register a handler under `id`
    ///
    /// Returns false, leaving the existing handler in place, when `id` is
    /// already registered.
    pub fn register(&self, id: SubscriberId, handler: Arc<dyn Handler<E>>) -> bool {
        let mut subscribers = self.subscribers.write();
        if subscribers.iter().any(|s| s.id == id) {
            return false;
        }
        subscribers.push(Subscriber { id, handler });
        true
    }

    /// Remove the handler registered under `id`; unknown ids are ignored
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn is_registered(&self, id: SubscriberId) -> bool {
        self.subscribers.read().iter().any(|s| s.id == id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Publish an event to every registered handler
    pub fn publish(&self, event: E) {
        match &self.queue {
            Some(queue) => {
                if queue.send(Queued::Event(event)).is_err() {
                    debug!("{} bus worker gone, event dropped", self.name);
                }
            }
            None => dispatch(self.name, &self.subscribers, &event),
        }
    }

    /// Wait until every event published before this call has been handled
    pub async fn flush(&self) {
        if let Some(queue) = &self.queue {
            let (tx, rx) = oneshot::channel();
            if queue.send(Queued::Flush(tx)).is_ok() {
                let _ = rx.await;
            }
        }
    }
}

fn dispatch<E>(name: &str, subscribers: &RwLock<Vec<Subscriber<E>>>, event: &E) {
    let snapshot: Vec<(SubscriberId, Arc<dyn Handler<E>>)> = subscribers
        .read()
        .iter()
        .map(|s| (s.id, s.handler.clone()))
        .collect();

    for (id, handler) in snapshot {
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} bus subscriber {} failed: {}", name, id, e),
            Err(panic) => warn!(
                "{} bus subscriber {} panicked: {}",
                name,
                id,
                panic_message(panic.as_ref())
            ),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use parking_lot::Mutex;

    fn ids() -> Arc<AtomicU64> {
        Arc::new(AtomicU64::new(0))
    }

    fn recorder(log: Arc<Mutex<Vec<u32>>>, tag: u32) -> Arc<dyn Handler<u32>> {
        Arc::new(move |event: &u32| -> Result<()> {
            log.lock().push(tag * 100 + *event);
            Ok(())
        })
    }

    #[test]
    fn test_inline_delivery_order() {
        let bus = Bus::<u32>::inline("test", ids());
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(recorder(log.clone(), 1));
        bus.subscribe(recorder(log.clone(), 2));

        bus.publish(7);
        assert_eq!(*log.lock(), vec![107, 207]);
    }

    #[test]
    fn test_register_is_idempotent() {
        let bus = Bus::<u32>::inline("test", ids());
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(bus.register(5, recorder(log.clone(), 1)));
        assert!(!bus.register(5, recorder(log.clone(), 2)));
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(1);
        assert_eq!(*log.lock(), vec![101]);
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let bus = Bus::<u32>::inline("test", ids());
        assert!(!bus.unregister(99));

        let id = bus.subscribe(Arc::new(|_: &u32| -> Result<()> { Ok(()) }));
        assert!(bus.unregister(id));
        assert!(!bus.unregister(id));
        assert!(!bus.is_registered(id));
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let bus = Bus::<u32>::inline("test", ids());
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(Arc::new(|_: &u32| -> Result<()> {
            Err(EngineError::Handler("boom".into()))
        }));
        bus.subscribe(Arc::new(|_: &u32| -> Result<()> { panic!("handler panic") }));
        bus.subscribe(recorder(log.clone(), 3));

        bus.publish(1);
        bus.publish(2);
        assert_eq!(*log.lock(), vec![301, 302]);
    }

    #[test]
    fn test_handler_may_unregister_itself() {
        let bus = Arc::new(Bus::<u32>::inline("test", ids()));
        let id = bus.next_id();
        let weak = Arc::downgrade(&bus);
        bus.register(
            id,
            Arc::new(move |_: &u32| -> Result<()> {
                if let Some(bus) = weak.upgrade() {
                    bus.unregister(id);
                }
                Ok(())
            }),
        );

        bus.publish(1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_queued_delivery_and_flush() {
        let bus = Bus::<u32>::queued("test", ids());
        assert_eq!(bus.mode(), DeliveryMode::Queued);

        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(recorder(log.clone(), 1));

        for i in 0..10 {
            bus.publish(i);
        }
        bus.flush().await;

        let expected: Vec<u32> = (0..10).map(|i| 100 + i).collect();
        assert_eq!(*log.lock(), expected);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");
    }
}

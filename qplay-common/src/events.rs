//! Event bus shared by qplay components
//!
//! `EventBus` decouples side effects (notifications, persistence triggers,
//! auto-advance policies) from the core transitions that cause them.
//!
//! Two delivery paths exist for every emitted event:
//! - **Handlers** registered with [`EventBus::on`] / [`EventBus::once`] run
//!   synchronously inside `emit`, in registration order.
//! - **Subscribers** obtained from [`EventBus::subscribe`] receive a clone via
//!   `tokio::broadcast`, for async consumers that must never block the emitter.
//!
//! A failing handler (returned `Err` or panicked) is logged and skipped; it
//! never prevents the remaining handlers from running and never propagates
//! into the caller of `emit`.

use std::any::Any;
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{error, warn};

/// An event that can travel over an [`EventBus`]
///
/// Handlers are keyed by the event's kind, so a handler registered for
/// `Kind::Play` only sees play events.
pub trait BusEvent: Clone + Send + Sync + 'static {
    /// Discriminant used for handler registration
    type Kind: Copy + Eq + Debug + Send + Sync + 'static;

    /// Kind of this event
    fn kind(&self) -> Self::Kind;
}

/// Synchronous event handler
pub type Handler<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

/// Registration token returned by [`EventBus::on`], used with [`EventBus::off`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration<E: BusEvent> {
    id: HandlerId,
    kind: E::Kind,
    once: bool,
    handler: Handler<E>,
}

/// Generic pub/sub bus
///
/// # Examples
///
/// ```
/// use qplay_common::events::{BusEvent, EventBus};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// #[derive(Debug, Clone)]
/// struct Ping;
///
/// impl BusEvent for Ping {
///     type Kind = ();
///     fn kind(&self) {}
/// }
///
/// let bus: EventBus<Ping> = EventBus::new(16);
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&seen);
/// bus.on((), move |_: &Ping| {
///     counter.fetch_add(1, Ordering::SeqCst);
///     Ok(())
/// });
///
/// bus.emit(Ping);
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
/// ```
pub struct EventBus<E: BusEvent> {
    handlers: Mutex<Vec<Registration<E>>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<E>,
    capacity: usize,
}

impl<E: BusEvent> EventBus<E> {
    /// Creates a new EventBus
    ///
    /// `capacity` bounds the broadcast buffer for async subscribers; a
    /// subscriber that falls further behind observes `RecvError::Lagged`.
    /// Synchronous handlers are unaffected by it.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            tx,
            capacity,
        }
    }

    /// Register a handler for every future event of `kind`
    pub fn on<F>(&self, kind: E::Kind, handler: F) -> HandlerId
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(kind, false, Arc::new(handler))
    }

    /// Register a handler for the next event of `kind` only
    ///
    /// The registration is consumed by the first matching `emit`, even if
    /// the handler fails.
    pub fn once<F>(&self, kind: E::Kind, handler: F) -> HandlerId
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(kind, true, Arc::new(handler))
    }

    /// Remove a handler
    ///
    /// Returns false if the handler was already removed (or was a `once`
    /// handler that has fired).
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|r| r.id != id);
        handlers.len() != before
    }

    /// Emit an event
    ///
    /// Runs matching handlers in registration order, then forwards the event
    /// to broadcast subscribers. Returns the number of handlers invoked.
    ///
    /// The handler list is snapshotted before any handler runs, so handlers
    /// may freely call `on`/`off`/`emit` on this bus.
    pub fn emit(&self, event: E) -> usize {
        let kind = event.kind();

        let due: Vec<(HandlerId, Handler<E>)> = {
            let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            let due = handlers
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| (r.id, Arc::clone(&r.handler)))
                .collect();
            handlers.retain(|r| !(r.once && r.kind == kind));
            due
        };

        for (id, handler) in &due {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Event handler {:?} for {:?} failed: {:#}", id, kind, e);
                }
                Err(payload) => {
                    error!(
                        "Event handler {:?} for {:?} panicked: {}",
                        id,
                        kind,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }

        // No receivers is fine
        let _ = self.tx.send(event);

        due.len()
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Number of registered synchronous handlers
    pub fn handler_count(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of active broadcast subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured broadcast capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn register(&self, kind: E::Kind, once: bool, handler: Handler<E>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                kind,
                once,
                handler,
            });
        id
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum TestEvent {
        Started(u32),
        Stopped,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestKind {
        Started,
        Stopped,
    }

    impl BusEvent for TestEvent {
        type Kind = TestKind;

        fn kind(&self) -> TestKind {
            match self {
                TestEvent::Started(_) => TestKind::Started,
                TestEvent::Stopped => TestKind::Stopped,
            }
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (log, move |s: &str| sink.lock().unwrap().push(s.to_string()))
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus: EventBus<TestEvent> = EventBus::new(10);
        let (log, record) = recorder();

        for name in ["a", "b", "c"] {
            let record = record.clone();
            bus.on(TestKind::Started, move |_| {
                record(name);
                Ok(())
            });
        }

        assert_eq!(bus.emit(TestEvent::Started(1)), 3);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_handlers_filtered_by_kind() {
        let bus: EventBus<TestEvent> = EventBus::new(10);
        let (log, record) = recorder();

        bus.on(TestKind::Stopped, move |_| {
            record("stopped");
            Ok(())
        });

        assert_eq!(bus.emit(TestEvent::Started(1)), 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bus.emit(TestEvent::Stopped), 1);
        assert_eq!(*log.lock().unwrap(), vec!["stopped"]);
    }

    #[test]
    fn test_failing_handlers_do_not_block_others() {
        let bus: EventBus<TestEvent> = EventBus::new(10);
        let (log, record) = recorder();

        bus.on(TestKind::Started, |_| Err(anyhow::anyhow!("boom")));
        bus.on(TestKind::Started, |_| panic!("handler panic"));
        bus.on(TestKind::Started, move |_| {
            record("survivor");
            Ok(())
        });

        assert_eq!(bus.emit(TestEvent::Started(7)), 3);
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let bus: EventBus<TestEvent> = EventBus::new(10);
        let (log, record) = recorder();

        bus.once(TestKind::Started, move |event| {
            if let TestEvent::Started(n) = event {
                record(&n.to_string());
            }
            Ok(())
        });

        bus.emit(TestEvent::Started(1));
        bus.emit(TestEvent::Started(2));
        assert_eq!(*log.lock().unwrap(), vec!["1"]);
        assert_eq!(bus.handler_count(), 0);
    }

    #[test]
    fn test_once_survives_other_kinds() {
        let bus: EventBus<TestEvent> = EventBus::new(10);
        bus.once(TestKind::Started, |_| Ok(()));

        bus.emit(TestEvent::Stopped);
        assert_eq!(bus.handler_count(), 1);
    }

    #[test]
    fn test_off_removes_handler() {
        let bus: EventBus<TestEvent> = EventBus::new(10);
        let (log, record) = recorder();

        let id = bus.on(TestKind::Stopped, move |_| {
            record("x");
            Ok(())
        });

        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(TestEvent::Stopped);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_handler_may_reenter_bus() {
        let bus = Arc::new(EventBus::<TestEvent>::new(10));
        let (log, record) = recorder();

        let inner_bus = Arc::clone(&bus);
        bus.once(TestKind::Started, move |_| {
            inner_bus.emit(TestEvent::Stopped);
            Ok(())
        });
        bus.on(TestKind::Stopped, move |_| {
            record("nested");
            Ok(())
        });

        bus.emit(TestEvent::Started(0));
        assert_eq!(*log.lock().unwrap(), vec!["nested"]);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus: EventBus<TestEvent> = EventBus::new(10);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(TestEvent::Started(3));
        bus.emit(TestEvent::Stopped);

        assert_eq!(rx.recv().await.unwrap(), TestEvent::Started(3));
        assert_eq!(rx.recv().await.unwrap(), TestEvent::Stopped);
    }

    #[test]
    fn test_emit_without_subscribers_is_ok() {
        let bus: EventBus<TestEvent> = EventBus::new(4);
        assert_eq!(bus.capacity(), 4);
        assert_eq!(bus.emit(TestEvent::Stopped), 0);
    }
}

//! Change notifications keyed by typed topics.
//!
//! Every store mutation publishes a [`SyncEvent`]. Consumers either register
//! a handler for one [`Topic`] or take a broadcast receiver and filter it
//! themselves; [`ChangeNotifier::wait_for`] covers the common "fetch this
//! entity and tell me when it landed" case.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot};
use tracing::trace;

use crate::entity::{EntityKey, EntityKind};

/// Capacity of the broadcast stream before slow receivers start lagging.
const STREAM_CAPACITY: usize = 1024;

/// What a subscriber listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// One entity finished resolving (stored, refreshed or removed).
    Entity(EntityKey),
    /// A full-collection load for a kind completed.
    Collection(EntityKind),
    /// The fetch queue ran dry.
    ReloadFinished,
    /// A user-facing notice was raised.
    Notice,
}

/// A published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The entity's latest fetch completed, or it was removed.
    EntityDone(EntityKey),
    /// A collection load completed.
    CollectionDone(EntityKind),
    /// The fetch queue emptied.
    ReloadFinished,
    /// Transient message for the user.
    Notice(String),
}

impl SyncEvent {
    /// Topic this event is delivered under.
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Self::EntityDone(key) => Topic::Entity(*key),
            Self::CollectionDone(kind) => Topic::Collection(*kind),
            Self::ReloadFinished => Topic::ReloadFinished,
            Self::Notice(_) => Topic::Notice,
        }
    }
}

/// Handle returned by [`ChangeNotifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;
type HandlerMap = RwLock<HashMap<Topic, Vec<(SubscriptionId, Handler)>>>;

fn remove_handler(handlers: &HandlerMap, id: SubscriptionId) -> bool {
    let mut handlers = handlers.write();
    let mut removed = false;
    handlers.retain(|_, list| {
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        removed |= list.len() != before;
        !list.is_empty()
    });
    removed
}

/// Drops a subscription when the owning waiter finishes or is dropped.
struct SubscriptionGuard {
    handlers: Weak<HandlerMap>,
    id: SubscriptionId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            remove_handler(&handlers, self.id);
        }
    }
}

/// Topic-keyed publish/subscribe hub.
pub struct ChangeNotifier {
    handlers: Arc<HandlerMap>,
    next_id: AtomicU64,
    stream: broadcast::Sender<SyncEvent>,
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("topics", &self.handlers.read().len())
            .field("receivers", &self.stream.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    /// Create a notifier with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            stream,
        }
    }

    /// Register a handler for one topic.
    ///
    /// Handlers run synchronously inside [`publish`](Self::publish), so they
    /// must not block.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        remove_handler(&self.handlers, id)
    }

    /// Deliver an event to its topic's handlers and to every stream receiver.
    ///
    /// Returns the number of handlers invoked.
    pub fn publish(&self, event: SyncEvent) -> usize {
        let topic = event.topic();
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&topic)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        trace!(?topic, handlers = handlers.len(), "publishing");
        for handler in &handlers {
            handler(&event);
        }

        // No receivers is fine.
        let _ = self.stream.send(event);
        handlers.len()
    }

    /// Receive every event published from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.stream.subscribe()
    }

    /// Resolve with the next event on `topic`.
    ///
    /// A one-shot handler is registered when this is called, not when the
    /// future is first polled, so an event published in between is not
    /// missed, however many other events follow it. The handler is removed
    /// once the future completes or is dropped. Yields `None` if the notifier
    /// is dropped first.
    pub fn wait_for(
        &self,
        topic: Topic,
    ) -> impl Future<Output = Option<SyncEvent>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let id = self.subscribe(topic, move |event| {
            if let Some(tx) = tx.lock().take() {
                // The waiter may already be gone.
                let _ = tx.send(event.clone());
            }
        });
        let guard = SubscriptionGuard {
            handlers: Arc::downgrade(&self.handlers),
            id,
        };

        async move {
            let _guard = guard;
            rx.await.ok()
        }
    }

    /// Number of handlers registered for a topic.
    #[must_use]
    pub fn handler_count(&self, topic: Topic) -> usize {
        self.handlers.read().get(&topic).map_or(0, Vec::len)
    }
}

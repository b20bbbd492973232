use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

type Subscriber =
    Arc<dyn Fn(Arc<dyn Any + Send + Sync>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// In-process event bus with typed pub/sub.
///
/// Events are dispatched by `TypeId`: subscribers register for a concrete
/// event type and receive an `Arc<E>` for every emission of that type.
/// Handlers run as spawned tasks; [`emit_and_wait`](EventBus::emit_and_wait)
/// joins them, [`emit`](EventBus::emit) does not. A handler panic is
/// contained by its task and never reaches the emitter.
///
/// `EventBus` is cheap to clone and shares state across clones.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<TypeId, Vec<Subscriber>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of type `E`.
    pub fn subscribe<E, F, Fut>(&self, handler: F)
    where
        E: Send + Sync + 'static,
        F: Fn(Arc<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let subscriber: Subscriber = Arc::new(move |any| {
            match any.downcast::<E>() {
                Ok(event) => Box::pin(handler(event)),
                // dispatch is keyed by TypeId, so this arm is unreachable
                Err(_) => Box::pin(async {}),
            }
        });
        if let Ok(mut subs) = self.subscribers.write() {
            subs.entry(TypeId::of::<E>()).or_default().push(subscriber);
        }
    }

    fn handlers_for(&self, type_id: TypeId) -> Vec<Subscriber> {
        self.subscribers
            .read()
            .map(|subs| subs.get(&type_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Emit an event, spawning all subscribers. Returns once they are
    /// spawned, not once they complete.
    pub fn emit<E: Send + Sync + 'static>(&self, event: E) {
        let event: Arc<dyn Any + Send + Sync> = Arc::new(event);
        for handler in self.handlers_for(TypeId::of::<E>()) {
            let event = event.clone();
            tokio::spawn(async move {
                handler(event).await;
            });
        }
    }

    /// Emit an event and wait for every subscriber to finish.
    pub async fn emit_and_wait<E: Send + Sync + 'static>(&self, event: E) {
        let event: Arc<dyn Any + Send + Sync> = Arc::new(event);
        let mut tasks = Vec::new();
        for handler in self.handlers_for(TypeId::of::<E>()) {
            let event = event.clone();
            tasks.push(tokio::spawn(async move {
                handler(event).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

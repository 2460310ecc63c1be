use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Lifecycle notifications emitted around flow start and stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEvent {
    NodesStarting,
    NodesStarted,
    NodesStopping,
    NodesStopped,
}

impl RuntimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeEvent::NodesStarting => "nodes-starting",
            RuntimeEvent::NodesStarted => "nodes-started",
            RuntimeEvent::NodesStopping => "nodes-stopping",
            RuntimeEvent::NodesStopped => "nodes-stopped",
        }
    }
}

/// Callback list owned by whichever component emits `E`.
///
/// Delivery is synchronous on the emitting thread, in registration order.
/// Handlers may subscribe further listeners while being called.
pub struct Listeners<E> {
    handlers: RwLock<Vec<Listener<E>>>,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self { handlers: RwLock::new(Vec::new()) }
    }

    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) {
        self.handlers.write().push(Arc::new(handler));
    }

    pub fn emit(&self, event: &E) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listeners({})", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn listeners_fire_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listeners = Listeners::<RuntimeEvent>::new();
        for tag in ["first", "second"] {
            let seen = seen.clone();
            listeners.subscribe(move |e: &RuntimeEvent| seen.lock().push(format!("{tag}:{}", e.name())));
        }
        listeners.emit(&RuntimeEvent::NodesStarted);
        assert_eq!(*seen.lock(), vec!["first:nodes-started", "second:nodes-started"]);
    }

    #[test]
    fn handler_may_subscribe_during_emit() {
        let listeners = Arc::new(Listeners::<String>::new());
        let inner = listeners.clone();
        listeners.subscribe(move |_| inner.subscribe(|_| {}));
        listeners.emit(&"mqtt in".to_string());
        assert_eq!(listeners.len(), 2);
    }
}

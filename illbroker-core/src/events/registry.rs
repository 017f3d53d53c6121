use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use illbroker_model::{Event, EventName, Signal};

use crate::error::Result;

pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handlers keyed by lifecycle signal and event name. Built once at startup
/// and frozen before the listener starts.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(Signal, EventName), Vec<EventHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .handlers
            .iter()
            .map(|((signal, name), handlers)| format!("{signal}/{name}x{}", handlers.len()))
            .collect();
        keys.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &keys)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_created<F, Fut>(&mut self, name: EventName, handler: F) -> &mut Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(Signal::Created, name, handler)
    }

    pub fn on_task_started<F, Fut>(&mut self, name: EventName, handler: F) -> &mut Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(Signal::TaskBegin, name, handler)
    }

    pub fn on_task_completed<F, Fut>(&mut self, name: EventName, handler: F) -> &mut Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(Signal::TaskComplete, name, handler)
    }

    fn register<F, Fut>(&mut self, signal: Signal, name: EventName, handler: F) -> &mut Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers
            .entry((signal, name))
            .or_default()
            .push(handler);
        self
    }

    pub fn handlers(&self, signal: Signal, name: EventName) -> &[EventHandler] {
        self.handlers
            .get(&(signal, name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn freeze(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handlers_accumulate_per_signal_and_name() {
        let mut registry = HandlerRegistry::new();
        registry
            .on_created(EventName::RequestReceived, |_| async { Ok(()) })
            .on_created(EventName::RequestReceived, |_| async { Ok(()) })
            .on_task_completed(EventName::LocateSuppliers, |_| async { Ok(()) });

        assert_eq!(
            registry
                .handlers(Signal::Created, EventName::RequestReceived)
                .len(),
            2
        );
        assert_eq!(
            registry
                .handlers(Signal::TaskComplete, EventName::LocateSuppliers)
                .len(),
            1
        );
        assert!(
            registry
                .handlers(Signal::TaskBegin, EventName::LocateSuppliers)
                .is_empty()
        );
    }
}

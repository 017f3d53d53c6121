use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use illbroker_model::SignalEnvelope;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::{BrokerError, Result};
use crate::events::registry::HandlerRegistry;
use crate::events::store::{EventStore, SignalSource, decode_signal};

pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Attempt `n` waits `n` times this unit before resubscribing.
    pub reconnect_backoff: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Owns the signal subscription and fans each signal out to the handlers
/// registered for it.
#[derive(Clone)]
pub struct EventListener {
    store: Arc<dyn EventStore>,
    source: Arc<dyn SignalSource>,
    registry: Arc<HandlerRegistry>,
    config: ListenerConfig,
}

impl fmt::Debug for EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListener")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl EventListener {
    pub fn new(
        store: Arc<dyn EventStore>,
        source: Arc<dyn SignalSource>,
        registry: Arc<HandlerRegistry>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            store,
            source,
            registry,
            config,
        }
    }

    /// Runs until `cancel` fires (`Ok`) or the reconnect budget is spent
    /// (`ListenerExhausted`).
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.source.subscribe().await {
                Ok(mut subscription) => {
                    attempts = 0;
                    info!(target: "bus::listener", "event listener subscribed");
                    loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => {
                                info!(target: "bus::listener", "event listener shutting down");
                                return Ok(());
                            }
                            next = subscription.next_payload() => next,
                        };
                        match next {
                            Ok(Some(payload)) => self.dispatch(&payload).await,
                            Ok(None) => {
                                warn!(target: "bus::listener", "signal connection closed");
                                break;
                            }
                            Err(err) => {
                                warn!(target: "bus::listener", error = %err, "signal connection lost");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(target: "bus::listener", error = %err, attempt = attempts + 1, "subscribe failed");
                }
            }

            attempts += 1;
            if attempts > self.config.max_reconnect_attempts {
                error!(
                    target: "bus::listener",
                    attempts = self.config.max_reconnect_attempts,
                    "event listener exhausted reconnect attempts"
                );
                return Err(BrokerError::ListenerExhausted {
                    attempts: self.config.max_reconnect_attempts,
                });
            }

            let delay = self.config.reconnect_backoff * attempts;
            debug!(target: "bus::listener", attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Deliver one raw payload. Returns after every matching handler
    /// finished.
    pub async fn dispatch(&self, payload: &str) {
        let SignalEnvelope { event: event_id, signal } = match decode_signal(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(target: "bus::listener", error = %err, payload, "ignoring malformed signal");
                return;
            }
        };

        let event = match self.store.get_event(event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                warn!(target: "bus::listener", event_id = %event_id, signal = %signal, "signal for unknown event");
                return;
            }
            Err(err) => {
                error!(target: "bus::listener", event_id = %event_id, error = %err, "failed to load signalled event");
                return;
            }
        };

        let handlers = self.registry.handlers(signal, event.event_name);
        if handlers.is_empty() {
            return;
        }

        let span = info_span!(
            "event",
            transaction_id = %event.ill_transaction_id,
            event_id = %event.id,
            event_name = %event.event_name,
            signal = %signal,
        );

        let mut set = JoinSet::new();
        for handler in handlers {
            let handler = Arc::clone(handler);
            let event = event.clone();
            set.spawn(
                async move {
                    if let Err(err) = handler(event).await {
                        error!(error = %err, "event handler failed");
                    }
                }
                .instrument(span.clone()),
            );
        }

        while let Some(joined) = set.join_next().await {
            if let Err(err) = joined {
                span.in_scope(|| {
                    if err.is_panic() {
                        error!(error = %err, "event handler panicked");
                    } else {
                        warn!(error = %err, "event handler aborted");
                    }
                });
            }
        }
    }
}

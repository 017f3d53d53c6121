use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::archive::Archiver;
use crate::database::DatabaseContext;
use crate::error::Result;
use crate::events::{EventBus, EventListener, HandlerRegistry, ListenerConfig};
use crate::intake::ProtocolIntake;
use crate::locator::{FairnessRota, RotaFilter, SupplierLocator};
use crate::lookup::{
    DirectoryLookup, HoldingsLookup, PatternHoldingsLookup, PeerResolver, StaticDirectoryLookup,
};
use crate::messaging::{MessageSender, OutboundMessaging};
use crate::workflow::{NotificationHub, RequesterNotified, WorkflowManager, log_notifications};

pub const DEFAULT_BROKER_SYMBOL: &str = "ISIL:BROKER";

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub broker_symbol: String,
    /// Let the requester supply itself when it holds the item.
    pub supply_local: bool,
    pub listener: ListenerConfig,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            broker_symbol: DEFAULT_BROKER_SYMBOL.to_string(),
            supply_local: false,
            listener: ListenerConfig::default(),
        }
    }
}

/// External systems the broker talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub holdings: Arc<dyn HoldingsLookup>,
    pub directory: Arc<dyn DirectoryLookup>,
    pub rota: Arc<dyn RotaFilter>,
    pub sender: Arc<dyn MessageSender>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("holdings_ptr", &Arc::as_ptr(&self.holdings))
            .field("directory_ptr", &Arc::as_ptr(&self.directory))
            .field("sender_ptr", &Arc::as_ptr(&self.sender))
            .finish()
    }
}

impl Collaborators {
    /// Pattern holdings, an empty static directory and the fairness rota.
    pub fn offline(sender: Arc<dyn MessageSender>) -> Self {
        Self {
            holdings: Arc::new(PatternHoldingsLookup),
            directory: Arc::new(StaticDirectoryLookup::default()),
            rota: Arc::new(FairnessRota),
            sender,
        }
    }
}

/// A fully wired broker: components registered on one frozen handler
/// registry, ready to start listening.
pub struct Broker {
    context: DatabaseContext,
    bus: EventBus,
    intake: ProtocolIntake,
    archiver: Archiver,
    notifications: NotificationHub,
    listener: EventListener,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("intake", &self.intake)
            .field("listener", &self.listener)
            .finish()
    }
}

impl Broker {
    pub fn assemble(
        context: DatabaseContext,
        collaborators: Collaborators,
        settings: BrokerSettings,
    ) -> Self {
        let bus = EventBus::new(Arc::clone(&context.events));
        let resolver = PeerResolver::new(
            Arc::clone(&context.peers),
            Arc::clone(&collaborators.directory),
        );
        let notifications = NotificationHub::default();

        let locator = SupplierLocator::new(
            bus.clone(),
            Arc::clone(&context.transactions),
            Arc::clone(&context.located_suppliers),
            Arc::clone(&collaborators.holdings),
            resolver.clone(),
            Arc::clone(&collaborators.rota),
            settings.supply_local,
        );
        let workflow = WorkflowManager::new(
            bus.clone(),
            Arc::clone(&context.transactions),
            Arc::clone(&context.located_suppliers),
            notifications.clone(),
            settings.broker_symbol.clone(),
        );
        let messaging = OutboundMessaging::new(
            bus.clone(),
            Arc::clone(&context.transactions),
            Arc::clone(&context.located_suppliers),
            Arc::clone(&context.peers),
            Arc::clone(&collaborators.sender),
            settings.broker_symbol.clone(),
        );

        let mut registry = HandlerRegistry::new();
        workflow.register(&mut registry);
        locator.register(&mut registry);
        messaging.register(&mut registry);
        let registry = registry.freeze();

        let listener = EventListener::new(
            Arc::clone(&context.events),
            Arc::clone(&context.signals),
            registry,
            settings.listener.clone(),
        );
        let intake = ProtocolIntake::new(
            bus.clone(),
            Arc::clone(&context.transactions),
            Arc::clone(&context.located_suppliers),
            resolver,
            settings.broker_symbol.clone(),
        );
        let archiver = Archiver::new(
            Arc::clone(&context.transactions),
            Arc::clone(&context.located_suppliers),
            Arc::clone(&context.events),
        );

        info!(broker_symbol = %settings.broker_symbol, supply_local = settings.supply_local, "broker assembled");

        Self {
            context,
            bus,
            intake,
            archiver,
            notifications,
            listener,
        }
    }

    pub fn context(&self) -> &DatabaseContext {
        &self.context
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn intake(&self) -> &ProtocolIntake {
        &self.intake
    }

    pub fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    pub fn listener(&self) -> EventListener {
        self.listener.clone()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<RequesterNotified> {
        self.notifications.subscribe()
    }

    /// Log every requester notification on its own task until `cancel`
    /// fires. Subscribes before returning, so nothing published afterwards
    /// is missed.
    pub fn spawn_notification_log(&self, cancel: CancellationToken) -> JoinHandle<u64> {
        tokio::spawn(log_notifications(self.notifications.subscribe(), cancel))
    }

    /// Run the listener on its own task until `cancel` fires.
    pub fn spawn_listener(&self, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        let listener = self.listener();
        tokio::spawn(async move { listener.run(cancel).await })
    }
}

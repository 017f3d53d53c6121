//! Outbound side: turns `message-supplier` and `message-requester` tasks
//! into protocol messages and hands them to a [`MessageSender`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use illbroker_model::{
    BrokerMode, Event, EventData, EventName, EventStatus, IllMessage, IllTransaction,
    LocatedSupplier, MessageHeader, MessageInfo, Peer, ReasonForMessage, Request, RequesterAction,
    RequestingAgencyMessage, StatusInfo, SupplierStatus, SupplyingAgencyMessage,
};
use tracing::{debug, info, warn};

use crate::database::ports::{LocatedSupplierRepository, PeerRepository, TransactionRepository};
use crate::error::{BrokerError, Result};
use crate::events::{EventBus, HandlerRegistry};
use crate::locator::TaskOutcome;
use crate::workflow::keys;

/// Delivers one protocol message to a peer.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, peer: &Peer, message: &IllMessage) -> Result<()>;
}

/// Posts messages as JSON to the peer's `url`.
#[derive(Clone)]
pub struct HttpMessageSender {
    client: reqwest::Client,
}

impl fmt::Debug for HttpMessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMessageSender").finish_non_exhaustive()
    }
}

impl HttpMessageSender {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MessageSender for HttpMessageSender {
    async fn send(&self, peer: &Peer, message: &IllMessage) -> Result<()> {
        if peer.url.is_empty() {
            return Err(BrokerError::Delivery(format!(
                "peer {} has no endpoint",
                peer.name
            )));
        }

        self.client
            .post(&peer.url)
            .json(message)
            .send()
            .await
            .map_err(|e| BrokerError::Delivery(format!("POST {} failed: {e}", peer.url)))?
            .error_for_status()
            .map_err(|e| BrokerError::Delivery(format!("{} rejected message: {e}", peer.url)))?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct OutboundMessaging {
    bus: EventBus,
    transactions: Arc<dyn TransactionRepository>,
    located: Arc<dyn LocatedSupplierRepository>,
    peers: Arc<dyn PeerRepository>,
    sender: Arc<dyn MessageSender>,
    broker_symbol: String,
}

impl fmt::Debug for OutboundMessaging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundMessaging")
            .field("broker_symbol", &self.broker_symbol)
            .field("sender_ptr", &Arc::as_ptr(&self.sender))
            .finish()
    }
}

impl OutboundMessaging {
    pub fn new(
        bus: EventBus,
        transactions: Arc<dyn TransactionRepository>,
        located: Arc<dyn LocatedSupplierRepository>,
        peers: Arc<dyn PeerRepository>,
        sender: Arc<dyn MessageSender>,
        broker_symbol: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            transactions,
            located,
            peers,
            sender,
            broker_symbol: broker_symbol.into(),
        }
    }

    pub fn register(&self, registry: &mut HandlerRegistry) {
        let messaging = self.clone();
        registry.on_created(EventName::MessageSupplier, move |event| {
            let messaging = messaging.clone();
            async move {
                messaging
                    .bus
                    .run_task(&event, |task| messaging.message_supplier(task))
                    .await
            }
        });

        let messaging = self.clone();
        registry.on_created(EventName::MessageRequester, move |event| {
            let messaging = messaging.clone();
            async move {
                messaging
                    .bus
                    .run_task(&event, |task| messaging.message_requester(task))
                    .await
            }
        });
    }

    pub async fn message_supplier(&self, task: Event) -> TaskOutcome {
        outcome(self.try_message_supplier(&task).await, &task)
    }

    pub async fn message_requester(&self, task: Event) -> TaskOutcome {
        outcome(self.try_message_requester(&task).await, &task)
    }

    async fn try_message_supplier(&self, task: &Event) -> Result<IllMessage> {
        let transaction = self.load_transaction(task).await?;
        let target = task
            .event_data
            .custom_str(keys::SUPPLIER_SYMBOL)
            .map(str::to_string)
            .or_else(|| transaction.supplier_symbol.clone())
            .ok_or_else(|| {
                BrokerError::NotFound(format!(
                    "no supplier selected for transaction {}",
                    transaction.id
                ))
            })?;

        let row = self
            .located
            .find_by_symbol(transaction.id, &target)
            .await?;
        let supplier = self.supplier_peer(row.as_ref(), &target).await?;
        let requester_mode = self.requester_mode(&transaction).await?;
        let header = MessageHeader {
            requesting_agency_id: match requester_mode {
                BrokerMode::Opaque => self.broker_symbol.clone(),
                BrokerMode::Transparent => transaction.requester_symbol.clone(),
            },
            supplying_agency_id: target.clone(),
            requesting_agency_request_id: transaction.requester_request_id.clone(),
            supplying_agency_request_id: None,
            timestamp: Utc::now(),
        };

        let forwarded = task
            .event_data
            .message()
            .and_then(|message| message.as_requesting_agency_message());
        let custom_action = task
            .event_data
            .custom_str(keys::ACTION)
            .map(str::parse::<RequesterAction>)
            .transpose()?;

        let message = match (forwarded, custom_action) {
            (Some(incoming), _) => IllMessage::RequestingAgencyMessage(RequestingAgencyMessage {
                header: MessageHeader {
                    supplying_agency_request_id: incoming.header.supplying_agency_request_id.clone(),
                    ..header
                },
                action: incoming.action,
                note: incoming.note.clone(),
            }),
            (None, Some(action)) => IllMessage::RequestingAgencyMessage(RequestingAgencyMessage {
                header,
                action,
                note: task.event_data.custom_str(keys::NOTE).map(str::to_string),
            }),
            (None, None) => {
                let data = &transaction.ill_transaction_data;
                let mut bibliographic_info = data.bibliographic_info.clone();
                if let Some(local_id) = row.as_ref().and_then(|row| row.local_id.clone()) {
                    bibliographic_info.supplier_unique_record_id = Some(local_id);
                }
                IllMessage::Request(Request {
                    header,
                    bibliographic_info,
                    service_info: data.service_info.clone(),
                    billing_info: data.billing_info.clone(),
                })
            }
        };

        self.sender.send(&supplier, &message).await?;
        info!(
            transaction_id = %transaction.id,
            supplier = %target,
            kind = message.kind(),
            "message sent to supplier"
        );

        if let (Some(mut row), Some(action)) = (row, message.requester_action()) {
            row.last_action = Some(action);
            self.located.update_status(&row).await?;
        }
        Ok(message)
    }

    async fn try_message_requester(&self, task: &Event) -> Result<IllMessage> {
        let transaction = self.load_transaction(task).await?;
        let requester = match transaction.requester_id {
            Some(id) => self.peers.get(id).await?,
            None => None,
        };
        let requester = match requester {
            Some(peer) => peer,
            None => self
                .peers
                .find_by_symbol(&transaction.requester_symbol)
                .await?
                .ok_or_else(|| {
                    BrokerError::NotFound(format!(
                        "requester peer {}",
                        transaction.requester_symbol
                    ))
                })?,
        };

        let relayed = task
            .event_data
            .message()
            .and_then(|message| message.as_supplying_agency_message());
        let supplier_symbol = relayed
            .map(|message| message.header.supplying_agency_id.clone())
            .or_else(|| transaction.supplier_symbol.clone())
            .unwrap_or_else(|| self.broker_symbol.clone());
        let header = MessageHeader {
            requesting_agency_id: transaction.requester_symbol.clone(),
            supplying_agency_id: match requester.broker_mode {
                BrokerMode::Opaque => self.broker_symbol.clone(),
                BrokerMode::Transparent => supplier_symbol,
            },
            requesting_agency_request_id: transaction.requester_request_id.clone(),
            supplying_agency_request_id: relayed
                .and_then(|message| message.header.supplying_agency_request_id.clone()),
            timestamp: Utc::now(),
        };

        let message = match relayed {
            Some(incoming) => SupplyingAgencyMessage {
                header,
                message_info: incoming.message_info.clone(),
                status_info: incoming.status_info.clone(),
            },
            None => {
                let status = match task.event_data.custom_str(keys::STATUS) {
                    Some(raw) => raw.parse()?,
                    None => SupplierStatus::Unfilled,
                };
                SupplyingAgencyMessage {
                    header,
                    message_info: MessageInfo {
                        reason_for_message: ReasonForMessage::StatusChange,
                        answer_yes_no: None,
                        note: task.event_data.custom_str(keys::NOTE).map(str::to_string),
                    },
                    status_info: StatusInfo {
                        status,
                        last_change: Some(Utc::now()),
                    },
                }
            }
        };
        let message = IllMessage::SupplyingAgencyMessage(message);

        self.sender.send(&requester, &message).await?;
        info!(
            transaction_id = %transaction.id,
            requester = %transaction.requester_symbol,
            status = ?message.supplier_status(),
            "message sent to requester"
        );
        Ok(message)
    }

    async fn supplier_peer(&self, row: Option<&LocatedSupplier>, symbol: &str) -> Result<Peer> {
        if let Some(row) = row
            && let Some(peer) = self.peers.get(row.supplier_id).await?
        {
            return Ok(peer);
        }
        debug!(symbol, "supplier not in rota, resolving by symbol");
        self.peers
            .find_by_symbol(symbol)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("supplier peer {symbol}")))
    }

    async fn requester_mode(&self, transaction: &IllTransaction) -> Result<BrokerMode> {
        let peer = match transaction.requester_id {
            Some(id) => self.peers.get(id).await?,
            None => None,
        };
        Ok(peer.map(|peer| peer.broker_mode).unwrap_or_default())
    }

    async fn load_transaction(&self, task: &Event) -> Result<IllTransaction> {
        self.transactions
            .get(task.ill_transaction_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("transaction {}", task.ill_transaction_id)))
    }
}

fn outcome(result: Result<IllMessage>, task: &Event) -> TaskOutcome {
    match result {
        Ok(message) => (EventStatus::Success, EventData::outgoing(message)),
        Err(err) => {
            warn!(
                transaction_id = %task.ill_transaction_id,
                event_name = %task.event_name,
                error = %err,
                "outbound message failed"
            );
            let kind = match err {
                BrokerError::Delivery(_) => "send",
                BrokerError::NotFound(_) => "not-found",
                _ => "internal",
            };
            (EventStatus::Error, EventData::error(kind, err.to_string()))
        }
    }
}

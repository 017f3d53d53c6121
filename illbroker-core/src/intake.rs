//! Transport-independent handling of inbound protocol messages.

use std::fmt;
use std::sync::Arc;

use illbroker_model::{
    Event, EventData, EventName, EventStatus, IllMessage, IllTransaction, Request,
    RequestingAgencyMessage, SupplierStatus, SupplyingAgencyMessage,
};
use tracing::{debug, info, warn};

use crate::database::ports::{LocatedSupplierRepository, PeerRepository, TransactionRepository};
use crate::error::{BrokerError, Result};
use crate::events::EventBus;
use crate::lookup::PeerResolver;
use crate::workflow::keys;

#[derive(Clone)]
pub struct ProtocolIntake {
    bus: EventBus,
    transactions: Arc<dyn TransactionRepository>,
    located: Arc<dyn LocatedSupplierRepository>,
    peers: Arc<dyn PeerRepository>,
    resolver: PeerResolver,
    broker_symbol: String,
}

impl fmt::Debug for ProtocolIntake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolIntake")
            .field("broker_symbol", &self.broker_symbol)
            .finish()
    }
}

impl ProtocolIntake {
    pub fn new(
        bus: EventBus,
        transactions: Arc<dyn TransactionRepository>,
        located: Arc<dyn LocatedSupplierRepository>,
        resolver: PeerResolver,
        broker_symbol: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            transactions,
            located,
            peers: resolver.repository(),
            resolver,
            broker_symbol: broker_symbol.into(),
        }
    }

    /// Open a transaction for a new request. A request id seen before is
    /// rejected with `Conflict`.
    pub async fn request_received(&self, request: Request) -> Result<IllTransaction> {
        let request_id = &request.header.requesting_agency_request_id;
        if self
            .transactions
            .find_by_requester_request_id(request_id)
            .await?
            .is_some()
        {
            return Err(BrokerError::Conflict(format!(
                "request {request_id} already has a transaction"
            )));
        }

        let requester_symbol = request.header.requesting_agency_id.clone();
        let requester = match self.resolver.resolve_one(&requester_symbol).await {
            Ok(peer) => peer,
            Err(err) => {
                warn!(requester = %requester_symbol, error = %err, "requester lookup failed");
                None
            }
        };

        let transaction = IllTransaction::from_request(&request, requester.as_ref().map(|p| p.id));
        self.transactions.create(&transaction).await?;
        if let Some(requester) = &requester {
            self.peers.increment_borrows(requester.id).await?;
        }

        self.bus
            .create_notice(
                transaction.id,
                EventName::RequestReceived,
                EventData::incoming(IllMessage::Request(request)),
                EventStatus::Success,
            )
            .await?;

        info!(
            transaction_id = %transaction.id,
            requester = %requester_symbol,
            request_id = %transaction.requester_request_id,
            "request received"
        );
        Ok(transaction)
    }

    pub async fn supplying_agency_message_received(
        &self,
        message: SupplyingAgencyMessage,
    ) -> Result<Event> {
        let mut transaction = self
            .transaction_for(&message.header.requesting_agency_request_id)
            .await?;
        let status = message.status_info.status;
        transaction.record_supplier_status(status);
        self.transactions.update(&transaction).await?;

        let supplier_symbol = &message.header.supplying_agency_id;
        match self
            .located
            .find_by_symbol(transaction.id, supplier_symbol)
            .await?
        {
            Some(mut supplier) => {
                supplier.record_status(status);
                self.located.update_status(&supplier).await?;
                if status == SupplierStatus::Loaned {
                    self.peers.increment_loans(supplier.supplier_id).await?;
                }
            }
            None => debug!(
                transaction_id = %transaction.id,
                supplier = %supplier_symbol,
                "status from a supplier outside the rota"
            ),
        }

        let notice = self
            .bus
            .create_notice(
                transaction.id,
                EventName::SupplierMsgReceived,
                EventData::incoming(IllMessage::SupplyingAgencyMessage(message)),
                EventStatus::Success,
            )
            .await?;
        info!(transaction_id = %transaction.id, status = %status, "supplier message received");
        Ok(notice)
    }

    pub async fn requesting_agency_message_received(
        &self,
        message: RequestingAgencyMessage,
    ) -> Result<Event> {
        let mut transaction = self
            .transaction_for(&message.header.requesting_agency_request_id)
            .await?;
        let action = message.action;
        transaction.record_requester_action(action);
        self.transactions.update(&transaction).await?;

        if let Some(mut selected) = self.located.get_selected(transaction.id).await? {
            selected.last_action = Some(action);
            self.located.update_status(&selected).await?;
        }

        let addressed = &message.header.supplying_agency_id;
        let addressed_as = if addressed.is_empty() || *addressed == self.broker_symbol {
            keys::ADDRESSED_AS_BROKER.to_string()
        } else {
            addressed.clone()
        };

        let notice = self
            .bus
            .create_notice(
                transaction.id,
                EventName::RequesterMsgReceived,
                EventData::incoming(IllMessage::RequestingAgencyMessage(message))
                    .with_custom(keys::ADDRESSED_AS, addressed_as),
                EventStatus::Success,
            )
            .await?;
        info!(transaction_id = %transaction.id, action = %action, "requester message received");
        Ok(notice)
    }

    async fn transaction_for(&self, requester_request_id: &str) -> Result<IllTransaction> {
        self.transactions
            .find_by_requester_request_id(requester_request_id)
            .await?
            .ok_or_else(|| {
                BrokerError::NotFound(format!("transaction for request {requester_request_id}"))
            })
    }
}

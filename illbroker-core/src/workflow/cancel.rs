use illbroker_model::{Event, EventData, EventName, IllTransactionId, RequesterAction};
use tracing::{debug, info, warn};

use super::{WorkflowManager, keys};
use crate::error::Result;

impl WorkflowManager {
    /// Fan a confirmed cancel out to every other supplier still working on
    /// the request. Only applies when the requester addressed a real
    /// supplier; a cancel sent to the broker symbol was already routed.
    pub(super) async fn reconcile_cancel(&self, relayed: &Event) {
        match self.try_reconcile_cancel(relayed).await {
            Ok(0) => {}
            Ok(created) => info!(
                transaction_id = %relayed.ill_transaction_id,
                created,
                "cancel forwarded to remaining suppliers"
            ),
            Err(err) => warn!(
                transaction_id = %relayed.ill_transaction_id,
                error = %err,
                "cancel reconciliation skipped"
            ),
        }
    }

    async fn try_reconcile_cancel(&self, relayed: &Event) -> Result<usize> {
        let transaction_id = relayed.ill_transaction_id;
        let Some(confirming) = relayed
            .event_data
            .message()
            .map(|message| message.header().supplying_agency_id.clone())
        else {
            debug!(transaction_id = %transaction_id, "relayed cancel carries no message");
            return Ok(0);
        };

        let Some(addressed_as) = self.cancel_addressee(transaction_id).await? else {
            debug!(transaction_id = %transaction_id, "no requester cancel on record");
            return Ok(0);
        };

        if addressed_as == keys::ADDRESSED_AS_BROKER || addressed_as == self.broker_symbol {
            debug!(transaction_id = %transaction_id, "cancel was addressed to the broker");
            return Ok(0);
        }

        if self
            .located
            .find_by_symbol(transaction_id, &addressed_as)
            .await?
            .is_none()
        {
            debug!(
                transaction_id = %transaction_id,
                addressed_as = %addressed_as,
                "cancel addressee is not part of the rota"
            );
            return Ok(0);
        }

        let remaining: Vec<String> = self
            .located
            .list(transaction_id)
            .await?
            .into_iter()
            .filter(|supplier| supplier.still_in_play() && supplier.supplier_symbol != confirming)
            .map(|supplier| supplier.supplier_symbol)
            .collect();

        for symbol in &remaining {
            self.bus
                .create_task(
                    transaction_id,
                    EventName::MessageSupplier,
                    EventData::empty()
                        .with_custom(keys::ACTION, RequesterAction::Cancel.as_str())
                        .with_custom(keys::SUPPLIER_SYMBOL, symbol.clone()),
                )
                .await?;
        }
        Ok(remaining.len())
    }

    /// Identity the latest requester cancel was addressed to.
    async fn cancel_addressee(&self, transaction_id: IllTransactionId) -> Result<Option<String>> {
        let events = self.bus.events_for_transaction(transaction_id).await?;
        let Some(notice) = events.iter().rev().find(|event| {
            event.event_name == EventName::RequesterMsgReceived
                && event
                    .event_data
                    .message()
                    .and_then(|message| message.requester_action())
                    == Some(RequesterAction::Cancel)
        }) else {
            return Ok(None);
        };

        Ok(notice
            .event_data
            .custom_str(keys::ADDRESSED_AS)
            .map(str::to_string)
            .or_else(|| {
                notice
                    .event_data
                    .message()
                    .map(|message| message.header().supplying_agency_id.clone())
            }))
    }
}

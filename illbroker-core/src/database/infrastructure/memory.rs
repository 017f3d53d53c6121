use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use illbroker_model::{
    Event, EventData, EventId, EventStatus, IllTransaction, IllTransactionId, LocatedSupplier,
    LocatedSupplierId, Peer, PeerId, Signal, SupplierSelection, SupplierStatus,
};
use tokio::sync::{Mutex, broadcast};
use tracing::warn;

use crate::database::ports::{
    LocatedSupplierRepository, PeerRepository, TransactionRepository,
};
use crate::error::{BrokerError, Result};
use crate::events::store::{
    EventStore, SignalSource, SignalSubscription, check_transition, encode_signal,
};

const SIGNAL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct MemoryState {
    transactions: HashMap<IllTransactionId, IllTransaction>,
    peers: HashMap<PeerId, Peer>,
    rotas: HashMap<IllTransactionId, Vec<LocatedSupplier>>,
    events: Vec<Event>,
    signals: broadcast::Sender<String>,
}

impl MemoryState {
    fn publish(&self, fail: bool, payload: String) -> Result<()> {
        if fail {
            return Err(BrokerError::Internal("signal publish failed".into()));
        }
        // No subscribers is not an error.
        let _ = self.signals.send(payload);
        Ok(())
    }
}

/// Process-local adapter implementing every repository port, the event
/// store and the signal source. Each operation holds one lock for its whole
/// duration, which gives the same all-or-nothing behaviour as a relational
/// transaction.
pub struct MemoryDatabase {
    state: Mutex<MemoryState>,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
}

impl fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("fail_publish", &self.fail_publish.load(Ordering::Relaxed))
            .field("fail_subscribe", &self.fail_subscribe.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            state: Mutex::new(MemoryState {
                transactions: HashMap::new(),
                peers: HashMap::new(),
                rotas: HashMap::new(),
                events: Vec::new(),
                signals,
            }),
            fail_publish: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
        }
    }

    /// Make every following publish fail, rolling back the write it belongs to.
    pub fn set_publish_failure(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_subscribe_failure(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Close every open subscription, as a dropped database connection would.
    pub async fn disconnect_subscribers(&self) {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        self.state.lock().await.signals = signals;
    }

    /// Number of live subscriptions.
    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.signals.receiver_count()
    }

    fn publish_failing(&self) -> bool {
        self.fail_publish.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionRepository for MemoryDatabase {
    async fn create(&self, transaction: &IllTransaction) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .transactions
            .values()
            .any(|existing| existing.requester_request_id == transaction.requester_request_id)
        {
            return Err(BrokerError::Conflict(format!(
                "transaction for requester request id {} already exists",
                transaction.requester_request_id
            )));
        }
        state
            .transactions
            .insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn get(&self, id: IllTransactionId) -> Result<Option<IllTransaction>> {
        Ok(self.state.lock().await.transactions.get(&id).cloned())
    }

    async fn find_by_requester_request_id(
        &self,
        requester_request_id: &str,
    ) -> Result<Option<IllTransaction>> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .values()
            .find(|transaction| transaction.requester_request_id == requester_request_id)
            .cloned())
    }

    async fn update(&self, transaction: &IllTransaction) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .transactions
            .get_mut(&transaction.id)
            .ok_or_else(|| BrokerError::NotFound(format!("transaction {}", transaction.id)))?;
        stored.supplier_symbol = transaction.supplier_symbol.clone();
        stored.last_requester_action = transaction.last_requester_action;
        stored.prev_requester_action = transaction.prev_requester_action;
        stored.last_supplier_status = transaction.last_supplier_status;
        stored.prev_supplier_status = transaction.prev_supplier_status;
        Ok(())
    }

    async fn set_supplier_symbol(
        &self,
        id: IllTransactionId,
        supplier_symbol: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .transactions
            .get_mut(&id)
            .ok_or_else(|| BrokerError::NotFound(format!("transaction {id}")))?;
        stored.supplier_symbol = supplier_symbol.map(str::to_string);
        Ok(())
    }

    async fn list_archivable(
        &self,
        before: DateTime<Utc>,
        statuses: &[SupplierStatus],
    ) -> Result<Vec<IllTransactionId>> {
        let state = self.state.lock().await;
        let mut ids: Vec<(DateTime<Utc>, IllTransactionId)> = state
            .transactions
            .values()
            .filter(|transaction| transaction.timestamp < before)
            .filter(|transaction| {
                transaction
                    .last_supplier_status
                    .is_some_and(|status| statuses.contains(&status))
            })
            .map(|transaction| (transaction.timestamp, transaction.id))
            .collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn delete(&self, id: IllTransactionId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let removed = state.transactions.remove(&id).is_some();
        if removed {
            state.rotas.remove(&id);
            state.events.retain(|event| event.ill_transaction_id != id);
        }
        Ok(removed)
    }
}

#[async_trait]
impl PeerRepository for MemoryDatabase {
    async fn get(&self, id: PeerId) -> Result<Option<Peer>> {
        Ok(self.state.lock().await.peers.get(&id).cloned())
    }

    async fn find_by_symbol(&self, symbol: &str) -> Result<Option<Peer>> {
        Ok(self
            .state
            .lock()
            .await
            .peers
            .values()
            .find(|peer| peer.answers_to(symbol))
            .cloned())
    }

    async fn save(&self, peer: &Peer) -> Result<()> {
        let mut state = self.state.lock().await;
        for other in state.peers.values_mut().filter(|other| other.id != peer.id) {
            other.symbols.retain(|symbol| !peer.answers_to(symbol));
            other.branch_symbols.retain(|symbol| !peer.answers_to(symbol));
        }

        let mut stored = peer.clone();
        if let Some(existing) = state.peers.get(&peer.id) {
            stored.loans_count = existing.loans_count;
            stored.borrows_count = existing.borrows_count;
        }
        state.peers.insert(peer.id, stored);
        Ok(())
    }

    async fn increment_loans(&self, id: PeerId) -> Result<()> {
        let mut state = self.state.lock().await;
        let peer = state
            .peers
            .get_mut(&id)
            .ok_or_else(|| BrokerError::NotFound(format!("peer {id}")))?;
        peer.loans_count += 1;
        Ok(())
    }

    async fn increment_borrows(&self, id: PeerId) -> Result<()> {
        let mut state = self.state.lock().await;
        let peer = state
            .peers
            .get_mut(&id)
            .ok_or_else(|| BrokerError::NotFound(format!("peer {id}")))?;
        peer.borrows_count += 1;
        Ok(())
    }
}

#[async_trait]
impl LocatedSupplierRepository for MemoryDatabase {
    async fn replace_rota(
        &self,
        transaction_id: IllTransactionId,
        rota: &[LocatedSupplier],
    ) -> Result<()> {
        let mut rows = rota.to_vec();
        rows.sort_by_key(|row| row.ordinal);
        self.state.lock().await.rotas.insert(transaction_id, rows);
        Ok(())
    }

    async fn list(&self, transaction_id: IllTransactionId) -> Result<Vec<LocatedSupplier>> {
        Ok(self
            .state
            .lock()
            .await
            .rotas
            .get(&transaction_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_by_selection(
        &self,
        transaction_id: IllTransactionId,
        selection: SupplierSelection,
    ) -> Result<Vec<LocatedSupplier>> {
        let mut rows = self.list(transaction_id).await?;
        rows.retain(|row| row.supplier_status == selection);
        Ok(rows)
    }

    async fn get_selected(
        &self,
        transaction_id: IllTransactionId,
    ) -> Result<Option<LocatedSupplier>> {
        Ok(self
            .list_by_selection(transaction_id, SupplierSelection::Selected)
            .await?
            .into_iter()
            .next())
    }

    async fn find_by_symbol(
        &self,
        transaction_id: IllTransactionId,
        symbol: &str,
    ) -> Result<Option<LocatedSupplier>> {
        Ok(self
            .list(transaction_id)
            .await?
            .into_iter()
            .find(|row| row.supplier_symbol == symbol))
    }

    async fn rotate_selection(
        &self,
        transaction_id: IllTransactionId,
        promote: Option<LocatedSupplierId>,
    ) -> Result<Option<LocatedSupplier>> {
        let mut state = self.state.lock().await;
        let rows = state.rotas.entry(transaction_id).or_default();

        if let Some(target) = promote {
            match rows.iter().find(|row| row.id == target) {
                Some(row) if row.supplier_status == SupplierSelection::New => {}
                Some(row) => {
                    return Err(BrokerError::Conflict(format!(
                        "located supplier {target} is {}, expected new",
                        row.supplier_status
                    )));
                }
                None => {
                    return Err(BrokerError::NotFound(format!("located supplier {target}")));
                }
            }
        }

        for row in rows
            .iter_mut()
            .filter(|row| row.supplier_status == SupplierSelection::Selected)
        {
            row.supplier_status = SupplierSelection::Skipped;
        }

        let promoted = promote.and_then(|target| {
            rows.iter_mut().find(|row| row.id == target).map(|row| {
                row.supplier_status = SupplierSelection::Selected;
                row.clone()
            })
        });
        Ok(promoted)
    }

    async fn update_status(&self, supplier: &LocatedSupplier) -> Result<()> {
        let mut state = self.state.lock().await;
        let row = state
            .rotas
            .get_mut(&supplier.ill_transaction_id)
            .and_then(|rows| rows.iter_mut().find(|row| row.id == supplier.id))
            .ok_or_else(|| BrokerError::NotFound(format!("located supplier {}", supplier.id)))?;
        row.last_status = supplier.last_status;
        row.prev_status = supplier.prev_status;
        row.last_action = supplier.last_action;
        Ok(())
    }

    async fn delete_for_transaction(&self, transaction_id: IllTransactionId) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .await
            .rotas
            .remove(&transaction_id)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }
}

#[async_trait]
impl EventStore for MemoryDatabase {
    async fn insert_and_publish(&self, event: &Event) -> Result<()> {
        let payload = encode_signal(event.id, Signal::Created)?;
        let mut state = self.state.lock().await;
        if state.events.iter().any(|existing| existing.id == event.id) {
            return Err(BrokerError::Conflict(format!("event {} already exists", event.id)));
        }
        state.publish(self.publish_failing(), payload)?;
        state.events.push(event.clone());
        Ok(())
    }

    async fn transition_task(
        &self,
        id: EventId,
        from: EventStatus,
        to: EventStatus,
        result: Option<&EventData>,
        signal: Signal,
    ) -> Result<Event> {
        let payload = encode_signal(id, signal)?;
        let mut state = self.state.lock().await;
        let index = state
            .events
            .iter()
            .position(|event| event.id == id)
            .ok_or_else(|| BrokerError::NotFound(format!("event {id}")))?;
        check_transition(&state.events[index], from)?;

        let mut updated = state.events[index].clone();
        updated.event_status = to;
        if let Some(result) = result {
            updated.result_data = Some(result.clone());
        }

        state.publish(self.publish_failing(), payload)?;
        state.events[index] = updated.clone();
        Ok(updated)
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        Ok(self
            .state
            .lock()
            .await
            .events
            .iter()
            .find(|event| event.id == id)
            .cloned())
    }

    async fn events_for_transaction(
        &self,
        transaction_id: IllTransactionId,
    ) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self
            .state
            .lock()
            .await
            .events
            .iter()
            .filter(|event| event.ill_transaction_id == transaction_id)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.timestamp);
        Ok(events)
    }

    async fn delete_events_for_transaction(
        &self,
        transaction_id: IllTransactionId,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.events.len();
        state
            .events
            .retain(|event| event.ill_transaction_id != transaction_id);
        Ok((before - state.events.len()) as u64)
    }
}

struct MemorySubscription {
    receiver: broadcast::Receiver<String>,
}

#[async_trait]
impl SignalSubscription for MemorySubscription {
    async fn next_payload(&mut self) -> Result<Option<String>> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Ok(Some(payload)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "signal subscriber lagged; signals dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl SignalSource for MemoryDatabase {
    async fn subscribe(&self) -> Result<Box<dyn SignalSubscription>> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BrokerError::Internal("signal source unavailable".into()));
        }
        let receiver = self.state.lock().await.signals.subscribe();
        Ok(Box::new(MemorySubscription { receiver }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use illbroker_model::EventName;

    fn located(transaction_id: IllTransactionId, ordinal: i32) -> LocatedSupplier {
        LocatedSupplier {
            id: LocatedSupplierId::new(),
            ill_transaction_id: transaction_id,
            supplier_id: PeerId::new(),
            supplier_symbol: format!("ISIL:S{ordinal}"),
            ordinal,
            supplier_status: SupplierSelection::New,
            local_id: None,
            local: false,
            last_status: None,
            prev_status: None,
            last_action: None,
        }
    }

    #[tokio::test]
    async fn failed_publish_rolls_back_insert() {
        let db = MemoryDatabase::new();
        let event = Event::new_task(
            IllTransactionId::new(),
            EventName::LocateSuppliers,
            EventData::empty(),
        );

        db.set_publish_failure(true);
        assert!(db.insert_and_publish(&event).await.is_err());
        assert!(db.get_event(event.id).await.unwrap().is_none());

        db.set_publish_failure(false);
        db.insert_and_publish(&event).await.unwrap();
        assert!(db.get_event(event.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_publish_leaves_status_untouched() {
        let db = MemoryDatabase::new();
        let event = Event::new_task(
            IllTransactionId::new(),
            EventName::SelectSupplier,
            EventData::empty(),
        );
        db.insert_and_publish(&event).await.unwrap();

        db.set_publish_failure(true);
        let err = db
            .transition_task(
                event.id,
                EventStatus::New,
                EventStatus::Processing,
                None,
                Signal::TaskBegin,
            )
            .await;
        assert!(err.is_err());
        let stored = db.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.event_status, EventStatus::New);
    }

    #[tokio::test]
    async fn rotation_keeps_a_single_selected_row() {
        let db = MemoryDatabase::new();
        let tx = IllTransactionId::new();
        let rota = vec![located(tx, 0), located(tx, 1)];
        db.replace_rota(tx, &rota).await.unwrap();

        let first = db.rotate_selection(tx, Some(rota[0].id)).await.unwrap();
        assert_eq!(first.map(|row| row.ordinal), Some(0));
        db.rotate_selection(tx, Some(rota[1].id)).await.unwrap();

        let rows = db.list(tx).await.unwrap();
        assert_eq!(rows[0].supplier_status, SupplierSelection::Skipped);
        assert_eq!(rows[1].supplier_status, SupplierSelection::Selected);

        let err = db.rotate_selection(tx, Some(rota[0].id)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Conflict(_)));
        assert_eq!(
            db.get_selected(tx).await.unwrap().map(|row| row.id),
            Some(rota[1].id)
        );
    }

    #[tokio::test]
    async fn disconnect_closes_open_subscriptions() {
        let db = MemoryDatabase::new();
        let mut subscription = db.subscribe().await.unwrap();
        db.disconnect_subscribers().await;
        assert!(subscription.next_payload().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saving_a_peer_takes_over_its_symbols() {
        let db = MemoryDatabase::new();
        let old = Peer::new("Old", vec!["ISIL:A".into(), "ISIL:B".into()]);
        db.save(&old).await.unwrap();
        let new = Peer::new("New", vec!["ISIL:B".into()]);
        db.save(&new).await.unwrap();

        let owner = PeerRepository::find_by_symbol(&db, "ISIL:B")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(owner.id, new.id);
        let old = PeerRepository::get(&db, old.id).await.unwrap().unwrap();
        assert_eq!(old.symbols, vec!["ISIL:A".to_string()]);
    }
}

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use illbroker_core::database::ports::PeerRepository;
use illbroker_core::events::ListenerConfig;
use illbroker_core::{
    Broker, BrokerSettings, Collaborators, DatabaseContext, EventBus, MemoryDatabase,
    MessageSender,
};
use illbroker_model::{
    BibliographicInfo, BrokerMode, Event, IllMessage, IllTransactionId, MessageHeader,
    MessageInfo, Peer, ReasonForMessage, RefreshPolicy, Request, RequesterAction,
    RequestingAgencyMessage, StatusInfo, SupplierStatus, SupplyingAgencyMessage,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const BROKER: &str = "ISIL:BROKER";
pub const REQUESTER: &str = "ISIL:REQ";

/// Records every outbound message instead of delivering it. Messages to
/// an unreachable symbol fail and are not recorded.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(String, IllMessage)>>,
    unreachable: Vec<String>,
}

impl RecordingSender {
    pub fn unreachable(symbols: &[&str]) -> Self {
        Self {
            sent: Mutex::default(),
            unreachable: symbols.iter().map(|symbol| symbol.to_string()).collect(),
        }
    }

    pub async fn sent(&self) -> Vec<(String, IllMessage)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, peer: &Peer, message: &IllMessage) -> illbroker_core::Result<()> {
        let symbol = peer.symbols.first().cloned().unwrap_or_default();
        if self.unreachable.contains(&symbol) {
            return Err(illbroker_core::BrokerError::Delivery(format!(
                "{symbol} refused the connection"
            )));
        }
        self.sent.lock().await.push((symbol, message.clone()));
        Ok(())
    }
}

pub struct Harness {
    pub db: Arc<MemoryDatabase>,
    pub broker: Broker,
    pub sender: Arc<RecordingSender>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub async fn start(requester_mode: BrokerMode, suppliers: &[(&str, i64, i64)]) -> Self {
        Self::start_with_sender(requester_mode, suppliers, RecordingSender::default()).await
    }

    pub async fn start_with_sender(
        requester_mode: BrokerMode,
        suppliers: &[(&str, i64, i64)],
        sender: RecordingSender,
    ) -> Self {
        let db = Arc::new(MemoryDatabase::new());
        let mut requester = peer(REQUESTER, 0, 0);
        requester.broker_mode = requester_mode;
        db.save(&requester).await.unwrap();
        for (symbol, loans, borrows) in suppliers {
            db.save(&peer(symbol, *loans, *borrows)).await.unwrap();
        }

        let sender = Arc::new(sender);
        let settings = BrokerSettings {
            broker_symbol: BROKER.to_string(),
            supply_local: false,
            listener: ListenerConfig {
                reconnect_backoff: Duration::from_millis(10),
                max_reconnect_attempts: 3,
            },
        };
        let broker = Broker::assemble(
            DatabaseContext::from_memory(db.clone()),
            Collaborators::offline(sender.clone()),
            settings,
        );

        let cancel = CancellationToken::new();
        broker.spawn_listener(cancel.clone());
        wait_for_subscriber(&db).await;

        Self {
            db,
            broker,
            sender,
            cancel,
        }
    }

    pub fn bus(&self) -> &EventBus {
        self.broker.bus()
    }

    pub async fn events(&self, transaction_id: IllTransactionId) -> Vec<Event> {
        self.bus()
            .events_for_transaction(transaction_id)
            .await
            .unwrap()
    }

    /// Poll the event history until `done` holds.
    pub async fn wait_until<F>(&self, transaction_id: IllTransactionId, done: F) -> Result<Vec<Event>>
    where
        F: Fn(&[Event]) -> bool,
    {
        for _ in 0..500 {
            let events = self.events(transaction_id).await;
            if done(&events) {
                return Ok(events);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let events = self.events(transaction_id).await;
        bail!("condition not reached, history: {:?}", history(&events))
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn wait_for_subscriber(db: &MemoryDatabase) {
    for _ in 0..500 {
        if db.subscriber_count().await > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("listener never subscribed");
}

/// A peer that is never refreshed from the directory.
pub fn peer(symbol: &str, loans: i64, borrows: i64) -> Peer {
    let mut peer = Peer::new(symbol, vec![symbol.to_string()]);
    peer.refresh_policy = RefreshPolicy::Never;
    peer.loans_count = loans;
    peer.borrows_count = borrows;
    peer
}

pub fn header(request_id: &str, supplier: &str) -> MessageHeader {
    MessageHeader {
        requesting_agency_id: REQUESTER.into(),
        supplying_agency_id: supplier.into(),
        requesting_agency_request_id: request_id.into(),
        ..MessageHeader::default()
    }
}

pub fn request(request_id: &str, record_id: &str) -> Request {
    Request {
        header: header(request_id, BROKER),
        bibliographic_info: BibliographicInfo {
            supplier_unique_record_id: Some(record_id.into()),
            title: Some("The Left Hand of Darkness".into()),
            ..BibliographicInfo::default()
        },
        ..Request::default()
    }
}

pub fn supplier_says(
    request_id: &str,
    supplier: &str,
    status: SupplierStatus,
    reason: ReasonForMessage,
) -> SupplyingAgencyMessage {
    SupplyingAgencyMessage {
        header: header(request_id, supplier),
        message_info: MessageInfo {
            reason_for_message: reason,
            answer_yes_no: None,
            note: None,
        },
        status_info: StatusInfo {
            status,
            last_change: None,
        },
    }
}

pub fn requester_says(
    request_id: &str,
    addressed_to: &str,
    action: RequesterAction,
) -> RequestingAgencyMessage {
    RequestingAgencyMessage {
        header: header(request_id, addressed_to),
        action,
        note: None,
    }
}

pub fn history(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .map(|event| format!("{} {}", event.event_name, event.event_status))
        .collect()
}

pub fn count(events: &[Event], name: &str, status: &str) -> usize {
    let wanted = format!("{name} {status}");
    history(events).iter().filter(|entry| **entry == wanted).count()
}

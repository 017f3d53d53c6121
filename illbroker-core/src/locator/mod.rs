//! Builds and walks the supplier rota of a transaction.

pub mod closures;
pub mod rota;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use illbroker_model::{
    Event, EventData, EventName, EventStatus, IllTransaction, IllTransactionId, LocatedSupplier,
    LocatedSupplierId, ProblemKind, SupplierSelection,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

pub use closures::is_closed;
pub use rota::{Candidate, FairnessRota, RotaFilter, RotaInfo};

use crate::database::ports::{LocatedSupplierRepository, TransactionRepository};
use crate::error::{BrokerError, Result};
use crate::events::{EventBus, HandlerRegistry};
use crate::lookup::{Holding, HoldingsLookup, PeerResolver};

/// Outcome of a locator task: the status it completes with and its result.
pub type TaskOutcome = (EventStatus, EventData);

#[derive(Clone)]
pub struct SupplierLocator {
    bus: EventBus,
    transactions: Arc<dyn TransactionRepository>,
    located: Arc<dyn LocatedSupplierRepository>,
    holdings: Arc<dyn HoldingsLookup>,
    resolver: PeerResolver,
    rota: Arc<dyn RotaFilter>,
    supply_local: bool,
}

impl fmt::Debug for SupplierLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupplierLocator")
            .field("resolver", &self.resolver)
            .field("supply_local", &self.supply_local)
            .finish()
    }
}

impl SupplierLocator {
    pub fn new(
        bus: EventBus,
        transactions: Arc<dyn TransactionRepository>,
        located: Arc<dyn LocatedSupplierRepository>,
        holdings: Arc<dyn HoldingsLookup>,
        resolver: PeerResolver,
        rota: Arc<dyn RotaFilter>,
        supply_local: bool,
    ) -> Self {
        Self {
            bus,
            transactions,
            located,
            holdings,
            resolver,
            rota,
            supply_local,
        }
    }

    pub fn register(&self, registry: &mut HandlerRegistry) {
        let locator = self.clone();
        registry.on_created(EventName::LocateSuppliers, move |event| {
            let locator = locator.clone();
            async move { locator.handle_locate(event).await }
        });

        let locator = self.clone();
        registry.on_created(EventName::SelectSupplier, move |event| {
            let locator = locator.clone();
            async move { locator.handle_select(event).await }
        });
    }

    async fn handle_locate(&self, event: Event) -> Result<()> {
        self.bus
            .run_task(&event, |task| self.locate_suppliers(task.ill_transaction_id))
            .await
    }

    async fn handle_select(&self, event: Event) -> Result<()> {
        self.bus
            .run_task(&event, |task| self.select_supplier(task.ill_transaction_id))
            .await
    }

    /// Look up holdings, resolve the holding peers and persist the ordered
    /// rota.
    pub async fn locate_suppliers(&self, transaction_id: IllTransactionId) -> TaskOutcome {
        match self.try_locate(transaction_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(transaction_id = %transaction_id, error = %err, "locate suppliers failed");
                (
                    EventStatus::Error,
                    EventData::error(error_kind(&err), err.to_string()),
                )
            }
        }
    }

    async fn try_locate(&self, transaction_id: IllTransactionId) -> Result<TaskOutcome> {
        let transaction = self.load_transaction(transaction_id).await?;

        let Some(identifier) = transaction
            .ill_transaction_data
            .supplier_unique_record_id()
            .filter(|id| !id.trim().is_empty())
        else {
            return Ok(problem(ProblemKind::MissingRequestId));
        };

        let holdings = self.holdings.lookup(identifier).await?;
        if holdings.holdings.is_empty() {
            return Ok((
                EventStatus::Problem,
                EventData::problem(ProblemKind::NoHoldings)
                    .with_custom("holdings_query", holdings.query),
            ));
        }

        let mut symbols: Vec<String> = Vec::new();
        for holding in &holdings.holdings {
            if !symbols.contains(&holding.symbol) {
                symbols.push(holding.symbol.clone());
            }
        }
        let resolved = self.resolver.resolve(&symbols).await?;

        let candidates = self.build_candidates(&transaction, &holdings.holdings, &resolved.peers);
        if candidates.is_empty() {
            return Ok((
                EventStatus::Problem,
                EventData::problem(ProblemKind::NoSuppliers)
                    .with_custom("holdings", serde_json::to_value(&holdings.holdings)?)
                    .with_custom("holdings_query", holdings.query)
                    .with_custom("directory_query", resolved.directory_query),
            ));
        }

        let requester_custom = self.requester_custom_data(&transaction).await?;
        let data = &transaction.ill_transaction_data;
        let (ordered, rota_info) = self.rota.filter_and_sort(
            candidates.clone(),
            &requester_custom,
            data.service_info.as_ref(),
            data.billing_info.as_ref(),
        )?;
        if ordered.is_empty() {
            return Ok((
                EventStatus::Problem,
                EventData::problem(ProblemKind::NoSuppliersAfterFilter)
                    .with_custom("candidates", serde_json::to_value(&candidates)?)
                    .with_custom("rota_info", serde_json::to_value(&rota_info)?),
            ));
        }

        let rows: Vec<LocatedSupplier> = ordered
            .iter()
            .enumerate()
            .map(|(ordinal, candidate)| LocatedSupplier {
                id: LocatedSupplierId::new(),
                ill_transaction_id: transaction_id,
                supplier_id: candidate.supplier_id,
                supplier_symbol: candidate.symbol.clone(),
                ordinal: ordinal as i32,
                supplier_status: SupplierSelection::New,
                local_id: Some(candidate.local_id.clone()),
                local: candidate.local,
                last_status: None,
                prev_status: None,
                last_action: None,
            })
            .collect();
        self.located.replace_rota(transaction_id, &rows).await?;

        info!(
            transaction_id = %transaction_id,
            suppliers = rows.len(),
            rota = %rota_info.name,
            "rota located"
        );

        Ok((
            EventStatus::Success,
            EventData::empty()
                .with_custom("holdings", serde_json::to_value(&holdings.holdings)?)
                .with_custom("holdings_query", holdings.query)
                .with_custom("directory_query", resolved.directory_query)
                .with_custom("candidates", serde_json::to_value(&ordered)?)
                .with_custom("rota_info", serde_json::to_value(&rota_info)?),
        ))
    }

    fn build_candidates(
        &self,
        transaction: &IllTransaction,
        holdings: &[Holding],
        peers: &[illbroker_model::Peer],
    ) -> Vec<Candidate> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut candidates = Vec::new();
        for holding in holdings {
            let Some(peer) = peers.iter().find(|peer| peer.answers_to(&holding.symbol)) else {
                debug!(symbol = %holding.symbol, "holding has no known peer");
                continue;
            };
            if !seen.insert(holding.symbol.as_str()) {
                continue;
            }
            candidates.push(Candidate {
                supplier_id: peer.id,
                symbol: holding.symbol.clone(),
                local_id: holding.local_identifier.clone(),
                ratio: peer.fairness_ratio(),
                local: self.supply_local && holding.symbol == transaction.requester_symbol,
            });
        }
        candidates
    }

    async fn requester_custom_data(
        &self,
        transaction: &IllTransaction,
    ) -> Result<Map<String, Value>> {
        let Some(requester_id) = transaction.requester_id else {
            return Ok(Map::new());
        };
        Ok(self
            .resolver
            .repository()
            .get(requester_id)
            .await?
            .map(|peer| peer.custom_data)
            .unwrap_or_default())
    }

    /// Promote the next open `new` candidate, demoting the current one.
    pub async fn select_supplier(&self, transaction_id: IllTransactionId) -> TaskOutcome {
        match self.try_select(transaction_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(transaction_id = %transaction_id, error = %err, "select supplier failed");
                (
                    EventStatus::Error,
                    EventData::error(error_kind(&err), err.to_string()),
                )
            }
        }
    }

    async fn try_select(&self, transaction_id: IllTransactionId) -> Result<TaskOutcome> {
        let candidates = self
            .located
            .list_by_selection(transaction_id, SupplierSelection::New)
            .await?;

        let now = Utc::now();
        let peers = self.resolver.repository();
        let mut skipped: Vec<String> = Vec::new();
        let mut chosen = None;
        for candidate in candidates {
            let closed = match peers.get(candidate.supplier_id).await? {
                Some(peer) => is_closed(&peer.custom_data, now),
                None => false,
            };
            if closed {
                debug!(symbol = %candidate.supplier_symbol, "skipping closed supplier");
                skipped.push(candidate.supplier_symbol);
                continue;
            }
            chosen = Some(candidate);
            break;
        }

        let selected = self
            .located
            .rotate_selection(transaction_id, chosen.as_ref().map(|c| c.id))
            .await?;

        let Some(selected) = selected else {
            self.transactions
                .set_supplier_symbol(transaction_id, None)
                .await?;
            return Ok((
                EventStatus::Problem,
                EventData::problem(ProblemKind::NoNewSuppliers).with_custom("skipped", skipped),
            ));
        };

        self.transactions
            .set_supplier_symbol(transaction_id, Some(&selected.supplier_symbol))
            .await?;

        info!(
            transaction_id = %transaction_id,
            supplier = %selected.supplier_symbol,
            ordinal = selected.ordinal,
            "supplier selected"
        );

        Ok((
            EventStatus::Success,
            EventData::empty()
                .with_custom("supplier_symbol", selected.supplier_symbol.clone())
                .with_custom("supplier_id", selected.supplier_id.to_string())
                .with_custom("local_id", selected.local_id.clone())
                .with_custom("ordinal", selected.ordinal)
                .with_custom("skipped", skipped),
        ))
    }

    async fn load_transaction(&self, id: IllTransactionId) -> Result<IllTransaction> {
        self.transactions
            .get(id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("transaction {id}")))
    }
}

fn problem(kind: ProblemKind) -> TaskOutcome {
    (EventStatus::Problem, EventData::problem(kind))
}

fn error_kind(err: &BrokerError) -> &'static str {
    match err {
        BrokerError::Lookup(_) => "lookup",
        BrokerError::NotFound(_) => "not-found",
        BrokerError::Conflict(_) => "conflict",
        _ => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryDatabase;
    use crate::database::ports::PeerRepository;
    use crate::lookup::directory::{DirectoryResult, MockDirectoryLookup};
    use crate::lookup::holdings::{HoldingsResult, MockHoldingsLookup};
    use illbroker_model::{BibliographicInfo, MessageHeader, Peer, RefreshPolicy, Request};
    use serde_json::json;

    fn request(record_id: Option<&str>) -> Request {
        Request {
            header: MessageHeader {
                requesting_agency_id: "ISIL:REQ".into(),
                requesting_agency_request_id: format!("req-{}", uuid::Uuid::now_v7()),
                ..MessageHeader::default()
            },
            bibliographic_info: BibliographicInfo {
                supplier_unique_record_id: record_id.map(str::to_string),
                ..BibliographicInfo::default()
            },
            ..Request::default()
        }
    }

    async fn pinned_peer(db: &MemoryDatabase, symbol: &str, loans: i64, borrows: i64) -> Peer {
        let mut peer = Peer::new(symbol, vec![symbol.to_string()]);
        peer.refresh_policy = RefreshPolicy::Never;
        peer.loans_count = loans;
        peer.borrows_count = borrows;
        PeerRepository::save(db, &peer).await.unwrap();
        peer
    }

    fn holdings(symbols: &'static [&'static str]) -> MockHoldingsLookup {
        let mut mock = MockHoldingsLookup::new();
        mock.expect_lookup().returning(move |identifier| {
            Ok(HoldingsResult {
                holdings: symbols
                    .iter()
                    .map(|symbol| Holding {
                        symbol: symbol.to_string(),
                        local_identifier: format!("{identifier}-{symbol}"),
                    })
                    .collect(),
                query: format!("identifier={identifier}"),
            })
        });
        mock
    }

    fn empty_directory() -> MockDirectoryLookup {
        let mut mock = MockDirectoryLookup::new();
        mock.expect_lookup().returning(|symbols| {
            Ok(DirectoryResult {
                entries: Vec::new(),
                query: format!("symbols={}", symbols.join(",")),
            })
        });
        mock
    }

    fn locator(
        db: &Arc<MemoryDatabase>,
        holdings: MockHoldingsLookup,
        supply_local: bool,
    ) -> SupplierLocator {
        SupplierLocator::new(
            EventBus::new(db.clone()),
            db.clone(),
            db.clone(),
            Arc::new(holdings),
            PeerResolver::new(db.clone(), Arc::new(empty_directory())),
            Arc::new(FairnessRota),
            supply_local,
        )
    }

    async fn transaction(db: &MemoryDatabase, record_id: Option<&str>) -> IllTransactionId {
        let tx = IllTransaction::from_request(&request(record_id), None);
        TransactionRepository::create(db, &tx).await.unwrap();
        tx.id
    }

    #[tokio::test]
    async fn missing_record_id_is_a_problem() {
        let db = Arc::new(MemoryDatabase::new());
        let mut holdings = MockHoldingsLookup::new();
        holdings.expect_lookup().never();
        let locator = locator(&db, holdings, false);
        let tx = transaction(&db, Some("  ")).await;

        let (status, data) = locator.locate_suppliers(tx).await;
        assert_eq!(status, EventStatus::Problem);
        assert_eq!(
            data.problem_record().unwrap().kind,
            ProblemKind::MissingRequestId
        );
    }

    #[tokio::test]
    async fn lookup_failure_is_an_error() {
        let db = Arc::new(MemoryDatabase::new());
        let mut holdings = MockHoldingsLookup::new();
        holdings
            .expect_lookup()
            .returning(|_| Err(BrokerError::Lookup("holdings down".into())));
        let locator = locator(&db, holdings, false);
        let tx = transaction(&db, Some("rec-1")).await;

        let (status, data) = locator.locate_suppliers(tx).await;
        assert_eq!(status, EventStatus::Error);
        assert_eq!(data.error_record().unwrap().kind, "lookup");
    }

    #[tokio::test]
    async fn no_holdings_and_no_suppliers() {
        let db = Arc::new(MemoryDatabase::new());
        let tx = transaction(&db, Some("rec-1")).await;

        let (status, data) = locator(&db, holdings(&[]), false)
            .locate_suppliers(tx)
            .await;
        assert_eq!(status, EventStatus::Problem);
        assert_eq!(data.problem_record().unwrap().kind, ProblemKind::NoHoldings);

        let (status, data) = locator(&db, holdings(&["ISIL:UNKNOWN"]), false)
            .locate_suppliers(tx)
            .await;
        assert_eq!(status, EventStatus::Problem);
        assert_eq!(data.problem_record().unwrap().kind, ProblemKind::NoSuppliers);
    }

    #[tokio::test]
    async fn rota_is_ordered_by_locality_then_ratio() {
        let db = Arc::new(MemoryDatabase::new());
        pinned_peer(&db, "ISIL:BUSY", 9, 3).await;
        pinned_peer(&db, "ISIL:QUIET", 1, 4).await;
        pinned_peer(&db, "ISIL:REQ", 5, 1).await;
        let tx = transaction(&db, Some("rec-1")).await;

        let locator = locator(&db, holdings(&["ISIL:BUSY", "ISIL:QUIET", "ISIL:REQ"]), true);
        let (status, data) = locator.locate_suppliers(tx).await;
        assert_eq!(status, EventStatus::Success);
        assert!(data.custom.contains_key("candidates"));
        assert_eq!(data.custom["rota_info"]["name"], json!("fairness"));

        let rota = LocatedSupplierRepository::list(db.as_ref(), tx).await.unwrap();
        let order: Vec<_> = rota.iter().map(|s| s.supplier_symbol.as_str()).collect();
        assert_eq!(order, ["ISIL:REQ", "ISIL:QUIET", "ISIL:BUSY"]);
        assert!(rota[0].local);
        assert!(rota.iter().all(|s| s.supplier_status == SupplierSelection::New));
        assert_eq!(
            rota.iter().map(|s| s.ordinal).collect::<Vec<_>>(),
            [0, 1, 2]
        );
    }

    #[tokio::test]
    async fn select_skips_closed_peers_then_exhausts() {
        let db = Arc::new(MemoryDatabase::new());
        let mut closed = pinned_peer(&db, "ISIL:CLOSED", 0, 1).await;
        let today = Utc::now().format("%Y-%m-%d").to_string();
        closed.custom_data.insert("timeZone".into(), json!("UTC"));
        closed.custom_data.insert(
            "closures".into(),
            json!([{"startDate": today, "endDate": today}]),
        );
        PeerRepository::save(db.as_ref(), &closed).await.unwrap();
        pinned_peer(&db, "ISIL:OPEN", 1, 1).await;
        let tx = transaction(&db, Some("rec-1")).await;

        let locator = locator(&db, holdings(&["ISIL:CLOSED", "ISIL:OPEN"]), false);
        let (status, _) = locator.locate_suppliers(tx).await;
        assert_eq!(status, EventStatus::Success);

        let (status, data) = locator.select_supplier(tx).await;
        assert_eq!(status, EventStatus::Success);
        assert_eq!(data.custom_str("supplier_symbol"), Some("ISIL:OPEN"));
        assert_eq!(data.custom["skipped"], json!(["ISIL:CLOSED"]));
        let stored = TransactionRepository::get(db.as_ref(), tx).await.unwrap().unwrap();
        assert_eq!(stored.supplier_symbol.as_deref(), Some("ISIL:OPEN"));

        let (status, data) = locator.select_supplier(tx).await;
        assert_eq!(status, EventStatus::Problem);
        assert_eq!(
            data.problem_record().unwrap().kind,
            ProblemKind::NoNewSuppliers
        );
        let rota = LocatedSupplierRepository::list(db.as_ref(), tx).await.unwrap();
        assert!(rota
            .iter()
            .all(|s| s.supplier_status != SupplierSelection::Selected));
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use illbroker_model::{BrokerMode, Peer, PeerId, RefreshPolicy};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::database::ports::PeerRepository;
use crate::error::{BrokerError, Result};

#[derive(Debug, Clone)]
pub struct PostgresPeerRepository {
    pool: PgPool,
}

impl PostgresPeerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_by_id(&self, id: PeerId) -> Result<Option<Peer>> {
        let row = sqlx::query_as::<_, PeerRow>(
            r#"
            SELECT id, name, url, vendor, broker_mode, refresh_policy, refresh_time,
                   loans_count, borrows_count, custom_data
            FROM peers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to load peer: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut peer = row.into_peer()?;
        self.attach_symbols(std::slice::from_mut(&mut peer)).await?;
        Ok(Some(peer))
    }

    async fn attach_symbols(&self, peers: &mut [Peer]) -> Result<()> {
        if peers.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = peers.iter().map(|peer| peer.id.to_uuid()).collect();

        let symbols = sqlx::query_as::<_, (PeerId, String)>(
            "SELECT peer_id, symbol_value FROM symbols WHERE peer_id = ANY($1) ORDER BY symbol_value",
        )
        .bind(&ids)
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to load peer symbols: {e}")))?;

        let branches = sqlx::query_as::<_, (PeerId, String)>(
            "SELECT peer_id, symbol_value FROM branch_symbols WHERE peer_id = ANY($1) ORDER BY symbol_value",
        )
        .bind(&ids)
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to load branch symbols: {e}")))?;

        let mut by_peer: HashMap<PeerId, &mut Peer> =
            peers.iter_mut().map(|peer| (peer.id, peer)).collect();
        for (peer_id, symbol) in symbols {
            if let Some(peer) = by_peer.get_mut(&peer_id) {
                peer.symbols.push(symbol);
            }
        }
        for (peer_id, symbol) in branches {
            if let Some(peer) = by_peer.get_mut(&peer_id) {
                peer.branch_symbols.push(symbol);
            }
        }
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct PeerRow {
    id: PeerId,
    name: String,
    url: String,
    vendor: String,
    broker_mode: String,
    refresh_policy: String,
    refresh_time: DateTime<Utc>,
    loans_count: i64,
    borrows_count: i64,
    custom_data: Json<Map<String, Value>>,
}

impl PeerRow {
    fn into_peer(self) -> Result<Peer> {
        Ok(Peer {
            id: self.id,
            name: self.name,
            url: self.url,
            vendor: self.vendor,
            broker_mode: self.broker_mode.parse::<BrokerMode>()?,
            refresh_policy: self.refresh_policy.parse::<RefreshPolicy>()?,
            refresh_time: self.refresh_time,
            loans_count: self.loans_count,
            borrows_count: self.borrows_count,
            custom_data: self.custom_data.0,
            symbols: Vec::new(),
            branch_symbols: Vec::new(),
        })
    }
}

async fn replace_symbols(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    peer_id: PeerId,
    symbols: &[String],
) -> Result<()> {
    sqlx::query(&format!("DELETE FROM {table} WHERE peer_id = $1 OR symbol_value = ANY($2)"))
        .bind(peer_id)
        .bind(symbols)
        .execute(&mut **tx)
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to clear {table}: {e}")))?;

    if symbols.is_empty() {
        return Ok(());
    }

    sqlx::query(&format!(
        "INSERT INTO {table} (symbol_value, peer_id) SELECT UNNEST($1::text[]), $2::uuid"
    ))
    .bind(symbols)
    .bind(peer_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| BrokerError::Internal(format!("failed to write {table}: {e}")))?;
    Ok(())
}

#[async_trait]
impl PeerRepository for PostgresPeerRepository {
    async fn get(&self, id: PeerId) -> Result<Option<Peer>> {
        self.load_by_id(id).await
    }

    async fn find_by_symbol(&self, symbol: &str) -> Result<Option<Peer>> {
        let peer_id = sqlx::query_scalar::<_, PeerId>(
            r#"
            SELECT peer_id FROM symbols WHERE symbol_value = $1
            UNION ALL
            SELECT peer_id FROM branch_symbols WHERE symbol_value = $1
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to resolve symbol {symbol}: {e}")))?;

        match peer_id {
            Some(id) => self.load_by_id(id).await,
            None => Ok(None),
        }
    }

    async fn save(&self, peer: &Peer) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to begin transaction: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO peers (
                id, name, url, vendor, broker_mode, refresh_policy, refresh_time,
                loans_count, borrows_count, custom_data
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                url = EXCLUDED.url,
                vendor = EXCLUDED.vendor,
                broker_mode = EXCLUDED.broker_mode,
                refresh_policy = EXCLUDED.refresh_policy,
                refresh_time = EXCLUDED.refresh_time,
                custom_data = EXCLUDED.custom_data
            "#,
        )
        .bind(peer.id)
        .bind(&peer.name)
        .bind(&peer.url)
        .bind(&peer.vendor)
        .bind(peer.broker_mode.as_str())
        .bind(peer.refresh_policy.as_str())
        .bind(peer.refresh_time)
        .bind(peer.loans_count)
        .bind(peer.borrows_count)
        .bind(Json(&peer.custom_data))
        .execute(&mut *tx)
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to save peer: {e}")))?;

        replace_symbols(&mut tx, "symbols", peer.id, &peer.symbols).await?;
        replace_symbols(&mut tx, "branch_symbols", peer.id, &peer.branch_symbols).await?;

        tx.commit()
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to commit peer: {e}")))
    }

    async fn increment_loans(&self, id: PeerId) -> Result<()> {
        let result = sqlx::query("UPDATE peers SET loans_count = loans_count + 1 WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to bump loans: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound(format!("peer {id}")));
        }
        Ok(())
    }

    async fn increment_borrows(&self, id: PeerId) -> Result<()> {
        let result =
            sqlx::query("UPDATE peers SET borrows_count = borrows_count + 1 WHERE id = $1")
                .bind(id)
                .execute(self.pool())
                .await
                .map_err(|e| BrokerError::Internal(format!("failed to bump borrows: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound(format!("peer {id}")));
        }
        Ok(())
    }
}

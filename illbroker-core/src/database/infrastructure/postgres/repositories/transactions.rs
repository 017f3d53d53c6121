use async_trait::async_trait;
use chrono::{DateTime, Utc};
use illbroker_model::{
    IllTransaction, IllTransactionData, IllTransactionId, PeerId, RequesterAction,
    SupplierStatus,
};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::database::ports::TransactionRepository;
use crate::error::{BrokerError, Result};

#[derive(Debug, Clone)]
pub struct PostgresTransactionRepository {
    pool: PgPool,
}

impl PostgresTransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: IllTransactionId,
    timestamp: DateTime<Utc>,
    requester_symbol: String,
    requester_id: Option<PeerId>,
    requester_request_id: String,
    supplier_symbol: Option<String>,
    last_requester_action: Option<String>,
    prev_requester_action: Option<String>,
    last_supplier_status: Option<String>,
    prev_supplier_status: Option<String>,
    ill_transaction_data: Json<IllTransactionData>,
}

impl TransactionRow {
    fn into_transaction(self) -> Result<IllTransaction> {
        Ok(IllTransaction {
            id: self.id,
            timestamp: self.timestamp,
            requester_symbol: self.requester_symbol,
            requester_id: self.requester_id,
            requester_request_id: self.requester_request_id,
            supplier_symbol: self.supplier_symbol,
            last_requester_action: parse_opt::<RequesterAction>(self.last_requester_action)?,
            prev_requester_action: parse_opt::<RequesterAction>(self.prev_requester_action)?,
            last_supplier_status: parse_opt::<SupplierStatus>(self.last_supplier_status)?,
            prev_supplier_status: parse_opt::<SupplierStatus>(self.prev_supplier_status)?,
            ill_transaction_data: self.ill_transaction_data.0,
        })
    }
}

pub(super) fn parse_opt<T>(raw: Option<String>) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = illbroker_model::ModelError>,
{
    raw.map(|value| value.parse::<T>()).transpose().map_err(BrokerError::from)
}

const SELECT_COLUMNS: &str = r#"
    SELECT
        id,
        timestamp,
        requester_symbol,
        requester_id,
        requester_request_id,
        supplier_symbol,
        last_requester_action,
        prev_requester_action,
        last_supplier_status,
        prev_supplier_status,
        ill_transaction_data
    FROM ill_transactions
"#;

#[async_trait]
impl TransactionRepository for PostgresTransactionRepository {
    async fn create(&self, transaction: &IllTransaction) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO ill_transactions (
                id,
                timestamp,
                requester_symbol,
                requester_id,
                requester_request_id,
                supplier_symbol,
                last_requester_action,
                prev_requester_action,
                last_supplier_status,
                prev_supplier_status,
                ill_transaction_data
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (requester_request_id) DO NOTHING
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.timestamp)
        .bind(&transaction.requester_symbol)
        .bind(transaction.requester_id)
        .bind(&transaction.requester_request_id)
        .bind(&transaction.supplier_symbol)
        .bind(transaction.last_requester_action.map(|a| a.as_str()))
        .bind(transaction.prev_requester_action.map(|a| a.as_str()))
        .bind(transaction.last_supplier_status.map(|s| s.as_str()))
        .bind(transaction.prev_supplier_status.map(|s| s.as_str()))
        .bind(Json(&transaction.ill_transaction_data))
        .execute(self.pool())
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to create transaction: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::Conflict(format!(
                "transaction for requester request id {} already exists",
                transaction.requester_request_id
            )));
        }
        Ok(())
    }

    async fn get(&self, id: IllTransactionId) -> Result<Option<IllTransaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to load transaction: {e}")))?;

        row.map(TransactionRow::into_transaction).transpose()
    }

    async fn find_by_requester_request_id(
        &self,
        requester_request_id: &str,
    ) -> Result<Option<IllTransaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "{SELECT_COLUMNS} WHERE requester_request_id = $1"
        ))
        .bind(requester_request_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| {
            BrokerError::Internal(format!(
                "failed to load transaction by requester request id: {e}"
            ))
        })?;

        row.map(TransactionRow::into_transaction).transpose()
    }

    async fn update(&self, transaction: &IllTransaction) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ill_transactions
            SET supplier_symbol = $2,
                last_requester_action = $3,
                prev_requester_action = $4,
                last_supplier_status = $5,
                prev_supplier_status = $6
            WHERE id = $1
            "#,
        )
        .bind(transaction.id)
        .bind(&transaction.supplier_symbol)
        .bind(transaction.last_requester_action.map(|a| a.as_str()))
        .bind(transaction.prev_requester_action.map(|a| a.as_str()))
        .bind(transaction.last_supplier_status.map(|s| s.as_str()))
        .bind(transaction.prev_supplier_status.map(|s| s.as_str()))
        .execute(self.pool())
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to update transaction: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound(format!("transaction {}", transaction.id)));
        }
        Ok(())
    }

    async fn set_supplier_symbol(
        &self,
        id: IllTransactionId,
        supplier_symbol: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE ill_transactions SET supplier_symbol = $2 WHERE id = $1")
            .bind(id)
            .bind(supplier_symbol)
            .execute(self.pool())
            .await
            .map_err(|e| {
                BrokerError::Internal(format!("failed to set transaction supplier: {e}"))
            })?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound(format!("transaction {id}")));
        }
        Ok(())
    }

    async fn list_archivable(
        &self,
        before: DateTime<Utc>,
        statuses: &[SupplierStatus],
    ) -> Result<Vec<IllTransactionId>> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        sqlx::query_scalar::<_, IllTransactionId>(
            r#"
            SELECT id
            FROM ill_transactions
            WHERE timestamp < $1
              AND last_supplier_status = ANY($2)
            ORDER BY timestamp ASC
            "#,
        )
        .bind(before)
        .bind(&statuses)
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to list archivable transactions: {e}")))
    }

    async fn delete(&self, id: IllTransactionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM ill_transactions WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to delete transaction: {e}")))?;
        Ok(result.rows_affected() > 0)
    }
}

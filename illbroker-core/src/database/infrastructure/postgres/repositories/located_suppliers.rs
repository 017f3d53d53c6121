use async_trait::async_trait;
use illbroker_model::{
    IllTransactionId, LocatedSupplier, LocatedSupplierId, PeerId, RequesterAction,
    SupplierSelection, SupplierStatus,
};
use sqlx::{FromRow, PgPool};

use super::transactions::parse_opt;
use crate::database::ports::LocatedSupplierRepository;
use crate::error::{BrokerError, Result};

#[derive(Debug, Clone)]
pub struct PostgresLocatedSupplierRepository {
    pool: PgPool,
}

impl PostgresLocatedSupplierRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct LocatedSupplierRow {
    id: LocatedSupplierId,
    ill_transaction_id: IllTransactionId,
    supplier_id: PeerId,
    supplier_symbol: String,
    ordinal: i32,
    supplier_status: String,
    local_id: Option<String>,
    local: bool,
    last_status: Option<String>,
    prev_status: Option<String>,
    last_action: Option<String>,
}

impl LocatedSupplierRow {
    fn into_located(self) -> Result<LocatedSupplier> {
        Ok(LocatedSupplier {
            id: self.id,
            ill_transaction_id: self.ill_transaction_id,
            supplier_id: self.supplier_id,
            supplier_symbol: self.supplier_symbol,
            ordinal: self.ordinal,
            supplier_status: self.supplier_status.parse::<SupplierSelection>()?,
            local_id: self.local_id,
            local: self.local,
            last_status: parse_opt::<SupplierStatus>(self.last_status)?,
            prev_status: parse_opt::<SupplierStatus>(self.prev_status)?,
            last_action: parse_opt::<RequesterAction>(self.last_action)?,
        })
    }
}

const COLUMNS: &str = r#"
    id,
    ill_transaction_id,
    supplier_id,
    supplier_symbol,
    ordinal,
    supplier_status,
    local_id,
    local,
    last_status,
    prev_status,
    last_action
"#;

fn into_rows(rows: Vec<LocatedSupplierRow>) -> Result<Vec<LocatedSupplier>> {
    rows.into_iter().map(LocatedSupplierRow::into_located).collect()
}

#[async_trait]
impl LocatedSupplierRepository for PostgresLocatedSupplierRepository {
    async fn replace_rota(
        &self,
        transaction_id: IllTransactionId,
        rota: &[LocatedSupplier],
    ) -> Result<()> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to begin transaction: {e}")))?;

        sqlx::query("DELETE FROM located_suppliers WHERE ill_transaction_id = $1")
            .bind(transaction_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to clear rota: {e}")))?;

        for row in rota {
            sqlx::query(
                r#"
                INSERT INTO located_suppliers (
                    id,
                    ill_transaction_id,
                    supplier_id,
                    supplier_symbol,
                    ordinal,
                    supplier_status,
                    local_id,
                    local,
                    last_status,
                    prev_status,
                    last_action
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(row.id)
            .bind(transaction_id)
            .bind(row.supplier_id)
            .bind(&row.supplier_symbol)
            .bind(row.ordinal)
            .bind(row.supplier_status.as_str())
            .bind(&row.local_id)
            .bind(row.local)
            .bind(row.last_status.map(|s| s.as_str()))
            .bind(row.prev_status.map(|s| s.as_str()))
            .bind(row.last_action.map(|a| a.as_str()))
            .execute(&mut *tx)
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to insert rota row: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to commit rota: {e}")))
    }

    async fn list(&self, transaction_id: IllTransactionId) -> Result<Vec<LocatedSupplier>> {
        let rows = sqlx::query_as::<_, LocatedSupplierRow>(&format!(
            "SELECT {COLUMNS} FROM located_suppliers WHERE ill_transaction_id = $1 ORDER BY ordinal"
        ))
        .bind(transaction_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to load rota: {e}")))?;
        into_rows(rows)
    }

    async fn list_by_selection(
        &self,
        transaction_id: IllTransactionId,
        selection: SupplierSelection,
    ) -> Result<Vec<LocatedSupplier>> {
        let rows = sqlx::query_as::<_, LocatedSupplierRow>(&format!(
            r#"
            SELECT {COLUMNS} FROM located_suppliers
            WHERE ill_transaction_id = $1 AND supplier_status = $2
            ORDER BY ordinal
            "#
        ))
        .bind(transaction_id)
        .bind(selection.as_str())
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to load rota by status: {e}")))?;
        into_rows(rows)
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
        let row = sqlx::query_as::<_, LocatedSupplierRow>(&format!(
            r#"
            SELECT {COLUMNS} FROM located_suppliers
            WHERE ill_transaction_id = $1 AND supplier_symbol = $2
            ORDER BY ordinal
            LIMIT 1
            "#
        ))
        .bind(transaction_id)
        .bind(symbol)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to load located supplier: {e}")))?;
        row.map(LocatedSupplierRow::into_located).transpose()
    }

    async fn rotate_selection(
        &self,
        transaction_id: IllTransactionId,
        promote: Option<LocatedSupplierId>,
    ) -> Result<Option<LocatedSupplier>> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to begin transaction: {e}")))?;

        sqlx::query("SELECT id FROM located_suppliers WHERE ill_transaction_id = $1 FOR UPDATE")
            .bind(transaction_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to lock rota: {e}")))?;

        sqlx::query(
            r#"
            UPDATE located_suppliers
            SET supplier_status = 'skipped'
            WHERE ill_transaction_id = $1 AND supplier_status = 'selected'
            "#,
        )
        .bind(transaction_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to demote selected supplier: {e}")))?;

        let Some(target) = promote else {
            tx.commit()
                .await
                .map_err(|e| BrokerError::Internal(format!("failed to commit rotation: {e}")))?;
            return Ok(None);
        };

        let row = sqlx::query_as::<_, LocatedSupplierRow>(&format!(
            r#"
            UPDATE located_suppliers
            SET supplier_status = 'selected'
            WHERE id = $1 AND ill_transaction_id = $2 AND supplier_status = 'new'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(target)
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to promote supplier: {e}")))?;

        let Some(row) = row else {
            // Dropping the transaction rolls back the demotion.
            return Err(BrokerError::Conflict(format!(
                "located supplier {target} is not a new candidate"
            )));
        };

        tx.commit()
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to commit rotation: {e}")))?;
        row.into_located().map(Some)
    }

    async fn update_status(&self, supplier: &LocatedSupplier) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE located_suppliers
            SET last_status = $2, prev_status = $3, last_action = $4
            WHERE id = $1
            "#,
        )
        .bind(supplier.id)
        .bind(supplier.last_status.map(|s| s.as_str()))
        .bind(supplier.prev_status.map(|s| s.as_str()))
        .bind(supplier.last_action.map(|a| a.as_str()))
        .execute(self.pool())
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to update located supplier: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound(format!("located supplier {}", supplier.id)));
        }
        Ok(())
    }

    async fn delete_for_transaction(&self, transaction_id: IllTransactionId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM located_suppliers WHERE ill_transaction_id = $1")
            .bind(transaction_id)
            .execute(self.pool())
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to delete rota: {e}")))?;
        Ok(result.rows_affected())
    }
}

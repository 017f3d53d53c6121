use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use illbroker_model::{
    Event, EventData, EventId, EventName, EventStatus, EventType, IllTransactionId, Signal,
};
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};

use crate::error::{BrokerError, Result};
use crate::events::store::{
    EventStore, SignalSource, SignalSubscription, check_transition, encode_signal,
};

/// Event log in the `events` table with notifications over `pg_notify`.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    channel: String,
}

impl fmt::Debug for PostgresEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresEventStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("channel", &self.channel)
            .finish()
    }
}

impl PostgresEventStore {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn notify(&self, conn: &mut PgConnection, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(conn)
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to publish signal: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: EventId,
    ill_transaction_id: IllTransactionId,
    timestamp: DateTime<Utc>,
    event_type: String,
    event_name: String,
    event_status: String,
    event_data: Json<EventData>,
    result_data: Option<Json<EventData>>,
}

impl EventRow {
    fn into_event(self) -> Result<Event> {
        Ok(Event {
            id: self.id,
            ill_transaction_id: self.ill_transaction_id,
            timestamp: self.timestamp,
            event_type: self.event_type.parse::<EventType>()?,
            event_name: self.event_name.parse::<EventName>()?,
            event_status: self.event_status.parse::<EventStatus>()?,
            event_data: self.event_data.0,
            result_data: self.result_data.map(|data| data.0),
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT
        id,
        ill_transaction_id,
        timestamp,
        event_type,
        event_name,
        event_status,
        event_data,
        result_data
    FROM events
"#;

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn insert_and_publish(&self, event: &Event) -> Result<()> {
        let payload = encode_signal(event.id, Signal::Created)?;
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to begin transaction: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO events (
                id,
                ill_transaction_id,
                timestamp,
                event_type,
                event_name,
                event_status,
                event_data,
                result_data
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(event.ill_transaction_id)
        .bind(event.timestamp)
        .bind(event.event_type.as_str())
        .bind(event.event_name.as_str())
        .bind(event.event_status.as_str())
        .bind(Json(&event.event_data))
        .bind(event.result_data.as_ref().map(Json))
        .execute(&mut *tx)
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to insert event: {e}")))?;

        self.notify(&mut *tx, &payload).await?;

        tx.commit()
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to commit event: {e}")))
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
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to begin transaction: {e}")))?;

        let row = sqlx::query_as::<_, EventRow>(&format!("{SELECT_COLUMNS} WHERE id = $1 FOR UPDATE"))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to lock event: {e}")))?;
        let Some(row) = row else {
            return Err(BrokerError::NotFound(format!("event {id}")));
        };

        let mut event = row.into_event()?;
        check_transition(&event, from)?;

        event.event_status = to;
        if let Some(result) = result {
            event.result_data = Some(result.clone());
        }

        sqlx::query(
            r#"
            UPDATE events
            SET event_status = $2,
                result_data = COALESCE($3, result_data)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(result.map(Json))
        .execute(&mut *tx)
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to update event: {e}")))?;

        self.notify(&mut *tx, &payload).await?;

        tx.commit()
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to commit transition: {e}")))?;
        Ok(event)
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        let row = sqlx::query_as::<_, EventRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to load event: {e}")))?;
        row.map(EventRow::into_event).transpose()
    }

    async fn events_for_transaction(
        &self,
        transaction_id: IllTransactionId,
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "{SELECT_COLUMNS} WHERE ill_transaction_id = $1 ORDER BY timestamp ASC, id ASC"
        ))
        .bind(transaction_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to load transaction events: {e}")))?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn delete_events_for_transaction(
        &self,
        transaction_id: IllTransactionId,
    ) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE ill_transaction_id = $1")
            .bind(transaction_id)
            .execute(self.pool())
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to delete events: {e}")))?;
        Ok(result.rows_affected())
    }
}

/// `LISTEN` on the notification channel with a dedicated connection per
/// subscription.
#[derive(Clone)]
pub struct PostgresSignalSource {
    pool: PgPool,
    channel: String,
}

impl fmt::Debug for PostgresSignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresSignalSource")
            .field("channel", &self.channel)
            .finish()
    }
}

impl PostgresSignalSource {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

struct PostgresSubscription {
    listener: PgListener,
}

#[async_trait]
impl SignalSubscription for PostgresSubscription {
    async fn next_payload(&mut self) -> Result<Option<String>> {
        // try_recv yields None when the connection dropped instead of
        // silently reconnecting, so the listener can apply its backoff.
        match self.listener.try_recv().await {
            Ok(Some(notification)) => Ok(Some(notification.payload().to_string())),
            Ok(None) => Ok(None),
            Err(e) => Err(BrokerError::Internal(format!("notification stream failed: {e}"))),
        }
    }
}

#[async_trait]
impl SignalSource for PostgresSignalSource {
    async fn subscribe(&self) -> Result<Box<dyn SignalSubscription>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to open listener: {e}")))?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|e| BrokerError::Internal(format!("failed to listen on {}: {e}", self.channel)))?;
        Ok(Box::new(PostgresSubscription { listener }))
    }
}

use std::time::Duration;

use ordercore_types::{Delivery, DeliveryId, QueueError, QueueName, WorkQueue};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{query, Pool, Postgres, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// At-least-once queue in the `ordercore_queue_messages` table.
///
/// `receive` claims the oldest visible row with `FOR UPDATE SKIP LOCKED`,
/// stamps a fresh receipt and hides the row for the visibility timeout. A
/// consumer that dies without acking gets its message redelivered once the
/// timeout passes. Stale receipts are rejected as unknown deliveries.
#[derive(Debug, Clone)]
pub struct PostgresWorkQueue {
    pool: Pool<Postgres>,
    visibility_timeout: Duration,
}

impl PostgresWorkQueue {
    /// Wrap an existing pool. Received messages stay hidden for
    /// `visibility_timeout` unless acknowledged.
    pub const fn from_pool(pool: Pool<Postgres>, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }
}

impl WorkQueue for PostgresWorkQueue {
    #[instrument(name = "postgres.publish", skip(self, payload), fields(queue = %queue))]
    async fn publish(&self, queue: &QueueName, payload: &Value) -> Result<(), QueueError> {
        query(
            "INSERT INTO ordercore_queue_messages (message_id, queue_name, payload)
             VALUES ($1, $2, $3)",
        )
        .bind(Uuid::now_v7())
        .bind(queue.as_ref())
        .bind(Json(payload))
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, queue))?;

        debug!("[postgres.publish] message enqueued");
        Ok(())
    }

    #[instrument(name = "postgres.receive", skip(self), fields(queue = %queue))]
    async fn receive(&self, queue: &QueueName) -> Result<Option<Delivery>, QueueError> {
        let receipt = Uuid::now_v7();

        let row = query(
            "UPDATE ordercore_queue_messages
             SET attempt = attempt + 1,
                 receipt = $2,
                 visible_at = now() + make_interval(secs => $3)
             WHERE message_id = (
                 SELECT message_id FROM ordercore_queue_messages
                 WHERE queue_name = $1 AND visible_at <= now()
                 ORDER BY enqueued_at, message_id
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             RETURNING payload, attempt",
        )
        .bind(queue.as_ref())
        .bind(receipt)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, queue))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let Json(payload): Json<Value> = row
            .try_get("payload")
            .map_err(|error| map_sqlx_error(error, queue))?;
        let attempt: i32 = row
            .try_get("attempt")
            .map_err(|error| map_sqlx_error(error, queue))?;

        Ok(Some(Delivery {
            id: DeliveryId::new(receipt),
            queue: queue.clone(),
            payload,
            attempt: u32::try_from(attempt).unwrap_or(u32::MAX),
        }))
    }

    #[instrument(name = "postgres.ack", skip(self, delivery), fields(delivery = %delivery.id))]
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let result = query("DELETE FROM ordercore_queue_messages WHERE receipt = $1")
            .bind(Uuid::from(delivery.id))
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, &delivery.queue))?;

        settled(delivery, result.rows_affected())
    }

    #[instrument(name = "postgres.release", skip(self, delivery), fields(delivery = %delivery.id))]
    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let result = query(
            "UPDATE ordercore_queue_messages
             SET receipt = NULL, visible_at = now()
             WHERE receipt = $1",
        )
        .bind(Uuid::from(delivery.id))
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, &delivery.queue))?;

        settled(delivery, result.rows_affected())
    }
}

fn settled(delivery: &Delivery, rows_affected: u64) -> Result<(), QueueError> {
    if rows_affected == 0 {
        warn!("[postgres.unknown_delivery] receipt is not in flight");
        return Err(QueueError::UnknownDelivery(delivery.id));
    }
    Ok(())
}

fn map_sqlx_error(error: sqlx::Error, queue: &QueueName) -> QueueError {
    error!(
        error = %error,
        queue = %queue,
        "[postgres.database_error] queue operation failed"
    );
    QueueError::unavailable(queue, error)
}

use ordercore_types::{Order, OrderId, OrderStore, StoreError, StoreOperation};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{query, Pool, Postgres, Row};
use tracing::{debug, error, info, instrument};

/// Order documents in the `ordercore_orders` table.
#[derive(Debug, Clone)]
pub struct PostgresOrderStore {
    pool: Pool<Postgres>,
}

impl PostgresOrderStore {
    /// Wrap an existing pool. The schema must already be migrated.
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn encode(order: &Order) -> Result<Value, StoreError> {
        serde_json::to_value(order).map_err(|error| StoreError::SerializationFailed {
            order_id: order.order_id().clone(),
            detail: error.to_string(),
        })
    }
}

impl OrderStore for PostgresOrderStore {
    #[instrument(
        name = "postgres.create_if_absent",
        skip(self, order),
        fields(order_id = %order.order_id())
    )]
    async fn create_if_absent(&self, order: &Order) -> Result<bool, StoreError> {
        let document = Self::encode(order)?;

        let result = query(
            "INSERT INTO ordercore_orders (order_id, order_status, document, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (order_id) DO NOTHING",
        )
        .bind(order.order_id().as_ref())
        .bind(order.status().to_string())
        .bind(Json(document))
        .bind(order.created_at())
        .bind(order.updated_at())
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, StoreOperation::CreateIfAbsent))?;

        let created = result.rows_affected() == 1;
        info!(created, "[postgres.create_if_absent] order insert finished");
        Ok(created)
    }

    #[instrument(name = "postgres.get_order", skip(self))]
    async fn get(&self, order_id: &OrderId) -> Result<Option<Order>, StoreError> {
        let row = query("SELECT document FROM ordercore_orders WHERE order_id = $1")
            .bind(order_id.as_ref())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, StoreOperation::Get))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let Json(document): Json<Value> = row
            .try_get("document")
            .map_err(|error| map_sqlx_error(error, StoreOperation::Get))?;
        let order = serde_json::from_value(document).map_err(|error| {
            StoreError::DeserializationFailed {
                order_id: order_id.clone(),
                detail: error.to_string(),
            }
        })?;

        Ok(Some(order))
    }

    #[instrument(
        name = "postgres.upsert_order",
        skip(self, order),
        fields(order_id = %order.order_id(), status = %order.status())
    )]
    async fn upsert(&self, order: &Order) -> Result<Order, StoreError> {
        let document = Self::encode(order)?;

        query(
            "INSERT INTO ordercore_orders (order_id, order_status, document, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (order_id) DO UPDATE
             SET order_status = EXCLUDED.order_status,
                 document = EXCLUDED.document,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(order.order_id().as_ref())
        .bind(order.status().to_string())
        .bind(Json(document))
        .bind(order.created_at())
        .bind(order.updated_at())
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, StoreOperation::Upsert))?;

        Ok(order.clone())
    }

    #[instrument(
        name = "postgres.replace_if_unchanged",
        skip(self, current, next),
        fields(order_id = %next.order_id(), status = %next.status())
    )]
    async fn replace_if_unchanged(&self, current: &Order, next: &Order) -> Result<bool, StoreError> {
        let expected = Self::encode(current)?;
        let document = Self::encode(next)?;

        let result = query(
            "UPDATE ordercore_orders
             SET order_status = $2, document = $3, updated_at = $4
             WHERE order_id = $1 AND order_status = $5 AND document = $6",
        )
        .bind(next.order_id().as_ref())
        .bind(next.status().to_string())
        .bind(Json(document))
        .bind(next.updated_at())
        .bind(current.status().to_string())
        .bind(Json(expected))
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, StoreOperation::ReplaceIfUnchanged))?;

        let replaced = result.rows_affected() == 1;
        if !replaced {
            debug!("[postgres.replace_if_unchanged] stored document changed; nothing written");
        }
        Ok(replaced)
    }
}

fn map_sqlx_error(error: sqlx::Error, operation: StoreOperation) -> StoreError {
    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] order store operation failed"
    );
    StoreError::unavailable(operation, error)
}

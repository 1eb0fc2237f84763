use ordercore_types::{
    HistoryError, HistoryEvent, HistoryStore, HistoryVersion, InstanceHistory, OrderId,
};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{query, query_scalar, Pool, Postgres, Row};
use tracing::{error, info, instrument, warn};

use crate::is_unique_violation;

/// Orchestration histories in the `ordercore_history` table.
///
/// Each event is one row keyed by `(instance_id, sequence)`. Appends run in a
/// transaction holding a per-instance advisory lock, so the version check and
/// the inserts cannot interleave with another writer.
#[derive(Debug, Clone)]
pub struct PostgresHistoryStore {
    pool: Pool<Postgres>,
}

impl PostgresHistoryStore {
    /// Wrap an existing pool. The schema must already be migrated.
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn stored_version(&self, instance_id: &OrderId) -> Result<HistoryVersion, HistoryError> {
        let count: i64 =
            query_scalar("SELECT COUNT(*) FROM ordercore_history WHERE instance_id = $1")
                .bind(instance_id.as_ref())
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        to_version(count)
    }
}

impl HistoryStore for PostgresHistoryStore {
    #[instrument(name = "postgres.read_history", skip(self))]
    async fn read_history(&self, instance_id: &OrderId) -> Result<InstanceHistory, HistoryError> {
        let rows = query(
            "SELECT event FROM ordercore_history WHERE instance_id = $1 ORDER BY sequence ASC",
        )
        .bind(instance_id.as_ref())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(payload): Json<Value> = row.try_get("event").map_err(map_sqlx_error)?;
            let event = serde_json::from_value(payload).map_err(|error| HistoryError::Corrupted {
                instance_id: instance_id.clone(),
                detail: error.to_string(),
            })?;
            events.push(event);
        }

        Ok(InstanceHistory::new(events))
    }

    #[instrument(
        name = "postgres.append_history",
        skip(self, events),
        fields(expected = %expected, event_count = events.len())
    )]
    async fn append_history(
        &self,
        instance_id: &OrderId,
        expected: HistoryVersion,
        events: Vec<HistoryEvent>,
    ) -> Result<HistoryVersion, HistoryError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(instance_id.as_ref())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let count: i64 =
            query_scalar("SELECT COUNT(*) FROM ordercore_history WHERE instance_id = $1")
                .bind(instance_id.as_ref())
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        let actual = to_version(count)?;

        if actual != expected {
            warn!(
                actual = %actual,
                "[postgres.version_conflict] history moved on before append"
            );
            return Err(HistoryError::VersionConflict {
                instance_id: instance_id.clone(),
                expected,
                actual,
            });
        }

        let appended = events.len();
        let start = count;
        for (offset, event) in events.into_iter().enumerate() {
            let recorded_at = event.recorded_at();
            let payload = serde_json::to_value(&event).map_err(|error| HistoryError::Corrupted {
                instance_id: instance_id.clone(),
                detail: error.to_string(),
            })?;
            let sequence = start + to_sequence(offset)?;

            let inserted = query(
                "INSERT INTO ordercore_history (instance_id, sequence, event, recorded_at)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(instance_id.as_ref())
            .bind(sequence)
            .bind(Json(payload))
            .bind(recorded_at)
            .execute(&mut *tx)
            .await;

            if let Err(error) = inserted {
                if is_unique_violation(&error) {
                    drop(tx);
                    let actual = self.stored_version(instance_id).await?;
                    warn!(
                        actual = %actual,
                        "[postgres.version_conflict] concurrent append won the sequence"
                    );
                    return Err(HistoryError::VersionConflict {
                        instance_id: instance_id.clone(),
                        expected,
                        actual,
                    });
                }
                return Err(map_sqlx_error(error));
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;

        let version = expected.advance(appended);
        info!(
            version = %version,
            "[postgres.append_history] history events appended"
        );
        Ok(version)
    }
}

fn to_version(count: i64) -> Result<HistoryVersion, HistoryError> {
    usize::try_from(count)
        .map(HistoryVersion::new)
        .map_err(HistoryError::unavailable)
}

fn to_sequence(offset: usize) -> Result<i64, HistoryError> {
    i64::try_from(offset).map_err(HistoryError::unavailable)
}

fn map_sqlx_error(error: sqlx::Error) -> HistoryError {
    error!(
        error = %error,
        "[postgres.database_error] history store operation failed"
    );
    HistoryError::unavailable(error)
}

//! Postgres-backed saga repository.
//!
//! Each instance is one row in `saga_instances`, keyed by `(saga_type,
//! correlation_id)`. The whole [`SagaInstance`] is stored as a JSON document;
//! `current_state` and `version` are duplicated into columns so the
//! conditional statements can check them.
//!
//! ## Queries
//!
//! A [`SagaQuery`] is an in-process predicate, so queries decode candidate
//! rows and filter them here. Request responses carry
//! [`QueryHint::PendingRequest`]; those are answered from the GIN-indexed
//! `pending_requests` column and decode at most the rows holding that request
//! id. Queries without a hint scan every row of the saga type.
//!
//! ## Conditional writes
//!
//! | Operation | Statement | Zero rows affected |
//! |-----------|-----------|--------------------|
//! | insert | `INSERT ... ON CONFLICT DO NOTHING` | `InsertOutcome::AlreadyExists` |
//! | update | `UPDATE ... WHERE version < $new` | `ConcurrencyConflict` |
//! | delete | `DELETE ... WHERE version <= $current` | `ConcurrencyConflict` |
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RepositoryError |
//! |------------|----------------------|-----------------|
//! | Database | Any | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! This backend is optimistic only; `acquire` hands out guards that hold nothing.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::types::Uuid;
use sqlx::{PgPool, Row};
use tracing::{Span, field, instrument};

use sagaflow_core::{CorrelationId, QueryHint, SagaData, SagaInstance, SagaQuery};

use super::r#trait::{InsertOutcome, InstanceLock, RepositoryError, SagaRepository};

/// Table definition expected by [`PostgresSagaRepository`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS saga_instances (
    saga_type       TEXT        NOT NULL,
    correlation_id  UUID        NOT NULL,
    current_state   TEXT        NOT NULL,
    version         BIGINT      NOT NULL CHECK (version > 0),
    document        JSONB       NOT NULL,
    pending_requests UUID[]     NOT NULL DEFAULT '{}',
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (saga_type, correlation_id)
)
"#;

/// Index backing [`QueryHint::PendingRequest`] lookups.
pub const PENDING_REQUESTS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS saga_instances_pending_requests
    ON saga_instances USING GIN (pending_requests)
"#;

/// Postgres saga repository for one saga type.
///
/// Several machines can share the table; `saga_type` keeps their rows apart.
#[derive(Debug)]
pub struct PostgresSagaRepository<D> {
    pool: Arc<PgPool>,
    saga_type: String,
    _data: PhantomData<fn() -> D>,
}

impl<D> Clone for PostgresSagaRepository<D> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            saga_type: self.saga_type.clone(),
            _data: PhantomData,
        }
    }
}

impl<D> PostgresSagaRepository<D>
where
    D: SagaData + Serialize + DeserializeOwned,
{
    pub fn new(pool: PgPool, saga_type: impl Into<String>) -> Self {
        Self {
            pool: Arc::new(pool),
            saga_type: saga_type.into(),
            _data: PhantomData,
        }
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    /// Create `saga_instances` and its index if they do not exist.
    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        for statement in [SCHEMA, PENDING_REQUESTS_INDEX] {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    #[instrument(
        skip(self),
        fields(saga_type = %self.saga_type, correlation_id = %correlation_id, found = field::Empty),
        err
    )]
    pub async fn load_instance(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaInstance<D>>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT document
            FROM saga_instances
            WHERE saga_type = $1 AND correlation_id = $2
            "#,
        )
        .bind(&self.saga_type)
        .bind(correlation_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        let span = Span::current();
        span.record("found", row.is_some());
        let Some(row) = row else {
            return Ok(None);
        };
        let document: serde_json::Value = row
            .try_get("document")
            .map_err(|e| RepositoryError::Storage(format!("failed to read document: {e}")))?;
        decode(document).map(Some)
    }

    /// Insert at version 1. A row that already exists is reported, not overwritten.
    #[instrument(
        skip(self, instance),
        fields(saga_type = %self.saga_type, correlation_id = %instance.correlation_id()),
        err
    )]
    pub async fn insert_instance(&self, instance: &SagaInstance<D>) -> Result<InsertOutcome, RepositoryError> {
        let (version, document) = encode_next(instance)?;

        let result = sqlx::query(
            r#"
            INSERT INTO saga_instances (saga_type, correlation_id, current_state, version, document, pending_requests)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (saga_type, correlation_id) DO NOTHING
            "#,
        )
        .bind(&self.saga_type)
        .bind(instance.correlation_id().as_uuid())
        .bind(instance.current_state().name())
        .bind(version)
        .bind(&document)
        .bind(pending_request_column(instance))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::AlreadyExists
        } else {
            InsertOutcome::Inserted
        })
    }

    #[instrument(
        skip(self, instance),
        fields(
            saga_type = %self.saga_type,
            correlation_id = %instance.correlation_id(),
            version = instance.version()
        ),
        err
    )]
    pub async fn update_instance(&self, instance: &SagaInstance<D>) -> Result<(), RepositoryError> {
        let (version, document) = encode_next(instance)?;

        let result = sqlx::query(
            r#"
            UPDATE saga_instances
            SET current_state = $3, version = $4, document = $5, pending_requests = $6, updated_at = NOW()
            WHERE saga_type = $1 AND correlation_id = $2 AND version < $4
            "#,
        )
        .bind(&self.saga_type)
        .bind(instance.correlation_id().as_uuid())
        .bind(instance.current_state().name())
        .bind(version)
        .bind(&document)
        .bind(pending_request_column(instance))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::conflict(
                instance.correlation_id(),
                format!("no row below version {version}"),
            ));
        }
        Ok(())
    }

    #[instrument(
        skip(self, instance),
        fields(
            saga_type = %self.saga_type,
            correlation_id = %instance.correlation_id(),
            version = instance.version()
        ),
        err
    )]
    pub async fn delete_instance(&self, instance: &SagaInstance<D>) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            DELETE FROM saga_instances
            WHERE saga_type = $1 AND correlation_id = $2 AND version <= $3
            "#,
        )
        .bind(&self.saga_type)
        .bind(instance.correlation_id().as_uuid())
        .bind(to_column(instance.version())?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::conflict(
                instance.correlation_id(),
                format!("no row at or below version {}", instance.version()),
            ));
        }
        Ok(())
    }

    /// Narrows by the query's hint when it has one, then applies the predicate in process.
    #[instrument(
        skip(self, query),
        fields(
            saga_type = %self.saga_type,
            query = %query.description(),
            hinted = query.hint().is_some(),
            matches = field::Empty
        ),
        err
    )]
    pub async fn query_instances(&self, query: &SagaQuery<D>) -> Result<Vec<CorrelationId>, RepositoryError> {
        let rows = match query.hint() {
            Some(QueryHint::PendingRequest(request_id)) => {
                sqlx::query(
                    r#"
                    SELECT document
                    FROM saga_instances
                    WHERE saga_type = $1 AND pending_requests @> ARRAY[$2::uuid]
                    ORDER BY correlation_id ASC
                    "#,
                )
                .bind(&self.saga_type)
                .bind(request_id.as_uuid())
                .fetch_all(&*self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT document
                    FROM saga_instances
                    WHERE saga_type = $1
                    ORDER BY correlation_id ASC
                    "#,
                )
                .bind(&self.saga_type)
                .fetch_all(&*self.pool)
                .await
            }
        }
        .map_err(|e| map_sqlx_error("query", e))?;

        let mut matches = Vec::new();
        for row in rows {
            let document: serde_json::Value = row
                .try_get("document")
                .map_err(|e| RepositoryError::Storage(format!("failed to read document: {e}")))?;
            let instance = decode::<D>(document)?;
            if query.matches(&instance) {
                matches.push(instance.correlation_id());
            }
        }

        Span::current().record("matches", matches.len());
        Ok(matches)
    }

    fn runtime(&self) -> Result<tokio::runtime::Handle, RepositoryError> {
        tokio::runtime::Handle::try_current().map_err(|_| {
            RepositoryError::Storage(
                "PostgresSagaRepository requires async runtime (tokio). Ensure you're calling from within a tokio runtime context."
                    .to_string(),
            )
        })
    }
}

/// Serialized form of `instance` as it will be stored: one version ahead.
fn encode_next<D: SagaData + Serialize>(instance: &SagaInstance<D>) -> Result<(i64, serde_json::Value), RepositoryError> {
    let mut next = instance.clone();
    let version = to_column(next.increment_version())?;
    let document = serde_json::to_value(&next).map_err(|e| RepositoryError::Serialization(e.to_string()))?;
    Ok((version, document))
}

/// Value of the `pending_requests` column for `instance`.
fn pending_request_column<D>(instance: &SagaInstance<D>) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = instance.pending_requests().map(|(_, id)| *id.as_uuid()).collect();
    ids.sort();
    ids
}

fn decode<D: DeserializeOwned>(document: serde_json::Value) -> Result<SagaInstance<D>, RepositoryError> {
    serde_json::from_value(document).map_err(|e| RepositoryError::Serialization(e.to_string()))
}

fn to_column(version: u64) -> Result<i64, RepositoryError> {
    i64::try_from(version).map_err(|_| RepositoryError::Storage(format!("version {version} out of range")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            RepositoryError::Storage(format!("database error in {} ({}): {}", operation, code, db_err.message()))
        }
        sqlx::Error::PoolClosed => RepositoryError::Storage(format!("connection pool closed in {}", operation)),
        _ => RepositoryError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

impl<D> SagaRepository<D> for PostgresSagaRepository<D>
where
    D: SagaData + Serialize + DeserializeOwned,
{
    fn acquire(&self, correlation_id: CorrelationId) -> Result<InstanceLock, RepositoryError> {
        Ok(InstanceLock::unlocked(correlation_id))
    }

    fn load(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance<D>>, RepositoryError> {
        self.runtime()?.block_on(self.load_instance(correlation_id))
    }

    fn insert(&self, instance: &mut SagaInstance<D>) -> Result<InsertOutcome, RepositoryError> {
        let outcome = self.runtime()?.block_on(self.insert_instance(instance))?;
        if outcome == InsertOutcome::Inserted {
            instance.increment_version();
        }
        Ok(outcome)
    }

    fn update(&self, instance: &mut SagaInstance<D>) -> Result<(), RepositoryError> {
        self.runtime()?.block_on(self.update_instance(instance))?;
        instance.increment_version();
        Ok(())
    }

    fn delete(&self, instance: &SagaInstance<D>) -> Result<(), RepositoryError> {
        self.runtime()?.block_on(self.delete_instance(instance))
    }

    fn query(&self, query: &SagaQuery<D>) -> Result<Vec<CorrelationId>, RepositoryError> {
        self.runtime()?.block_on(self.query_instances(query))
    }
}

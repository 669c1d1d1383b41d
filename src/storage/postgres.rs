//! PostgreSQL event-stream repository.
//!
//! Three relational tables share one column layout
//! `(id, correlationid, sourceid, version, eventtype, created, event)`:
//! `events` (per-aggregate streams, unique on `(sourceid, version)` for
//! optimistic concurrency), `events_integration` (global log), and
//! `events_correlation` (correlation index). Snapshots live in
//! `events_snapshots`, keyed by source id.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::{EventStreamRepository, Result, Snapshot, StoreError};
use crate::message::{EventEnvelope, VersionedEvent};
use crate::registry::TypeRegistry;
use crate::ConnectionStringResolver;

const EVENTS_TABLE: &str = "events";
const EVENTS_INTEGRATION_TABLE: &str = "events_integration";
const EVENTS_CORRELATION_TABLE: &str = "events_correlation";
const SNAPSHOTS_TABLE: &str = "events_snapshots";

/// Postgres error code for unique-constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

/// Event-stream repository backed by PostgreSQL.
pub struct PostgresEventStreamRepository {
    pool: PgPool,
    registry: Arc<TypeRegistry>,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl PostgresEventStreamRepository {
    /// Connects using the resolved connection string.
    pub async fn connect(
        resolver: ConnectionStringResolver,
        registry: Arc<TypeRegistry>,
    ) -> Result<Self> {
        let uri = resolver()
            .map_err(|err| StoreError::Backend(format!("resolving connection string: {err}")))?;
        let pool = PgPool::connect(&uri).await?;
        Ok(Self::new(pool, registry))
    }

    /// Wraps an existing pool.
    pub fn new(pool: PgPool, registry: Arc<TypeRegistry>) -> Self {
        Self { pool, registry }
    }

    /// Creates tables and the uniqueness constraint if they do not exist.
    pub async fn init(&self) -> Result<()> {
        for table in [EVENTS_TABLE, EVENTS_INTEGRATION_TABLE, EVENTS_CORRELATION_TABLE] {
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT NOT NULL,
                    correlationid TEXT NOT NULL,
                    sourceid TEXT NOT NULL,
                    version BIGINT NOT NULL,
                    eventtype TEXT NOT NULL,
                    created TIMESTAMPTZ NOT NULL,
                    event JSONB NOT NULL
                )"
            );
            sqlx::query(&ddl).execute(&self.pool).await?;
        }
        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {EVENTS_TABLE}_sourceid_version
             ON {EVENTS_TABLE} (sourceid, version)"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {SNAPSHOTS_TABLE} (
                sourceid TEXT PRIMARY KEY,
                aggregatetype TEXT NOT NULL,
                version BIGINT NOT NULL,
                created TIMESTAMPTZ NOT NULL,
                body JSONB NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_event(&self, row: &PgRow) -> Result<VersionedEvent> {
        let envelope = EventEnvelope {
            id: row.try_get("id")?,
            correlation_id: row.try_get("correlationid")?,
            source_id: row.try_get("sourceid")?,
            version: row.try_get("version")?,
            event_type: row.try_get("eventtype")?,
            created: row.try_get("created")?,
            event: row.try_get::<sqlx::types::Json<serde_json::Value>, _>("event")?.0,
        };
        Ok(self.registry.decode_event(envelope)?)
    }

    async fn insert<'a, E>(
        &self,
        executor: E,
        table: &str,
        source_id: &str,
        envelope: &EventEnvelope,
    ) -> std::result::Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'a, Database = sqlx::Postgres>,
    {
        let sql = format!(
            "INSERT INTO {table} (id, correlationid, sourceid, version, eventtype, created, event)
             VALUES ($1, $2, $3, $4, $5, $6, $7)"
        );
        sqlx::query(&sql)
            .bind(&envelope.id)
            .bind(&envelope.correlation_id)
            .bind(source_id)
            .bind(envelope.version)
            .bind(&envelope.event_type)
            .bind(envelope.created)
            .bind(sqlx::types::Json(&envelope.event))
            .execute(executor)
            .await
            .map(|_| ())
    }

    async fn fetch_events(&self, sql: &str, bind: Option<&str>) -> Result<Vec<VersionedEvent>> {
        let query = match bind {
            Some(value) => sqlx::query(sql).bind(value),
            None => sqlx::query(sql),
        };
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(|row| self.row_to_event(row)).collect()
    }
}

#[async_trait]
impl EventStreamRepository for PostgresEventStreamRepository {
    async fn save(&self, source_id: &str, events: &[VersionedEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for event in events {
            let envelope = self.registry.encode_event(event)?;
            if let Err(err) = self.insert(&mut *tx, EVENTS_TABLE, source_id, &envelope).await {
                if let sqlx::Error::Database(db_err) = &err {
                    if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
                        return Err(StoreError::Conflict {
                            source_id: source_id.to_string(),
                            version: event.version,
                        });
                    }
                }
                return Err(err.into());
            }
            self.insert(&mut *tx, EVENTS_INTEGRATION_TABLE, source_id, &envelope)
                .await?;
            self.insert(&mut *tx, EVENTS_CORRELATION_TABLE, source_id, &envelope)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, source_id: &str, from_version: i64) -> Result<Vec<VersionedEvent>> {
        let sql = format!(
            "SELECT id, correlationid, sourceid, version, eventtype, created, event
             FROM {EVENTS_TABLE}
             WHERE sourceid = $1 AND version >= $2
             ORDER BY version ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(source_id)
            .bind(from_version)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| self.row_to_event(row)).collect()
    }

    async fn save_integration_event(&self, event: &VersionedEvent) -> Result<()> {
        let envelope = self.registry.encode_event(event)?;
        let mut tx = self.pool.begin().await?;
        self.insert(&mut *tx, EVENTS_INTEGRATION_TABLE, &event.source_id, &envelope)
            .await?;
        self.insert(&mut *tx, EVENTS_CORRELATION_TABLE, &event.source_id, &envelope)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn integration_events_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<VersionedEvent>> {
        let sql = format!(
            "SELECT id, correlationid, sourceid, version, eventtype, created, event
             FROM {EVENTS_CORRELATION_TABLE}
             WHERE correlationid = $1
             ORDER BY created ASC"
        );
        self.fetch_events(&sql, Some(correlation_id)).await
    }

    async fn all_integration_events(&self) -> Result<Vec<VersionedEvent>> {
        let sql = format!(
            "SELECT id, correlationid, sourceid, version, eventtype, created, event
             FROM {EVENTS_INTEGRATION_TABLE}
             ORDER BY created ASC"
        );
        self.fetch_events(&sql, None).await
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let sql = format!(
            "INSERT INTO {SNAPSHOTS_TABLE} (sourceid, aggregatetype, version, created, body)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (sourceid) DO UPDATE SET
                 aggregatetype = EXCLUDED.aggregatetype,
                 version = EXCLUDED.version,
                 created = EXCLUDED.created,
                 body = EXCLUDED.body"
        );
        sqlx::query(&sql)
            .bind(&snapshot.source_id)
            .bind(&snapshot.aggregate_type)
            .bind(snapshot.version)
            .bind(snapshot.created)
            .bind(sqlx::types::Json(&snapshot.body))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_snapshot(&self, source_id: &str) -> Result<Option<Snapshot>> {
        let sql = format!(
            "SELECT sourceid, aggregatetype, version, created, body
             FROM {SNAPSHOTS_TABLE}
             WHERE sourceid = $1"
        );
        let row = sqlx::query(&sql)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Snapshot {
                source_id: row.try_get("sourceid")?,
                aggregate_type: row.try_get("aggregatetype")?,
                version: row.try_get("version")?,
                created: row.try_get("created")?,
                body: row.try_get::<sqlx::types::Json<serde_json::Value>, _>("body")?.0,
            })),
            None => Ok(None),
        }
    }
}

//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from `cadenza-core` using sqlx with the split
//! read/write pool. Free-form mappings (input, output, context, metadata,
//! event data) are stored as JSON text; timestamps as RFC 3339 text; status
//! columns carry the engine's wire vocabulary verbatim.

use std::collections::HashMap;
use std::future::Future;

use cadenza_core::store::{WorkflowFilter, WorkflowStore};
use cadenza_types::error::StoreError;
use cadenza_types::workflow::{
    StepInstance, StepStatus, WorkflowEvent, WorkflowInstance, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use super::pool::StorePool;

/// SQLite-backed implementation of `WorkflowStore`.
pub struct SqliteWorkflowStore {
    pool: StorePool,
}

impl SqliteWorkflowStore {
    /// Create a new store backed by the given pool.
    pub fn new(pool: StorePool) -> Self {
        Self { pool }
    }

    async fn load_steps(&self, workflow_inst_id: Uuid) -> Result<Vec<StepInstance>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM step_instances WHERE workflow_inst_id = ? ORDER BY execution_order ASC",
        )
        .bind(workflow_inst_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            steps.push(StepRow::from_row(row).map_err(query_err)?.into_step()?);
        }
        Ok(steps)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    id: String,
    workflow_id: String,
    status: String,
    input: String,
    output: String,
    context: String,
    current_step_id: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    error: Option<String>,
    retry_count: i64,
    last_retry_at: Option<String>,
    metadata: String,
    trace_id: String,
    correlation_id: String,
    business_id: String,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            context: row.try_get("context")?,
            current_step_id: row.try_get("current_step_id")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
            retry_count: row.try_get("retry_count")?,
            last_retry_at: row.try_get("last_retry_at")?,
            metadata: row.try_get("metadata")?,
            trace_id: row.try_get("trace_id")?,
            correlation_id: row.try_get("correlation_id")?,
            business_id: row.try_get("business_id")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, StoreError> {
        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            status: parse_workflow_status(&self.status)?,
            input: parse_map(&self.input)?,
            output: parse_map(&self.output)?,
            context: parse_map(&self.context)?,
            current_step_id: self.current_step_id,
            steps: Vec::new(),
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            error: self.error,
            retry_count: self.retry_count as u32,
            last_retry_at: self.last_retry_at.as_deref().map(parse_datetime).transpose()?,
            metadata: parse_map(&self.metadata)?,
            trace_id: self.trace_id,
            correlation_id: self.correlation_id,
            business_id: self.business_id,
        })
    }
}

struct StepRow {
    id: String,
    step_id: String,
    workflow_inst_id: String,
    status: String,
    input: String,
    output: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    retry_count: i64,
    last_retry_at: Option<String>,
    duration_ms: i64,
    execution_order: i64,
    priority: i64,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            step_id: row.try_get("step_id")?,
            workflow_inst_id: row.try_get("workflow_inst_id")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
            retry_count: row.try_get("retry_count")?,
            last_retry_at: row.try_get("last_retry_at")?,
            duration_ms: row.try_get("duration_ms")?,
            execution_order: row.try_get("execution_order")?,
            priority: row.try_get("priority")?,
        })
    }

    fn into_step(self) -> Result<StepInstance, StoreError> {
        Ok(StepInstance {
            id: parse_uuid(&self.id)?,
            step_id: self.step_id,
            workflow_inst_id: parse_uuid(&self.workflow_inst_id)?,
            status: parse_step_status(&self.status)?,
            input: parse_map(&self.input)?,
            output: parse_map(&self.output)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            error: self.error,
            retry_count: self.retry_count as u32,
            last_retry_at: self.last_retry_at.as_deref().map(parse_datetime).transpose()?,
            duration_ms: self.duration_ms,
            execution_order: self.execution_order as usize,
            priority: self.priority as i32,
        })
    }
}

struct EventRow {
    id: String,
    workflow_inst_id: String,
    step_inst_id: Option<String>,
    event_type: String,
    event_data: String,
    timestamp: String,
}

impl EventRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_inst_id: row.try_get("workflow_inst_id")?,
            step_inst_id: row.try_get("step_inst_id")?,
            event_type: row.try_get("event_type")?,
            event_data: row.try_get("event_data")?,
            timestamp: row.try_get("timestamp")?,
        })
    }

    fn into_event(self) -> Result<WorkflowEvent, StoreError> {
        Ok(WorkflowEvent {
            id: parse_uuid(&self.id)?,
            workflow_inst_id: parse_uuid(&self.workflow_inst_id)?,
            step_inst_id: self
                .step_inst_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            event_type: self.event_type,
            event_data: parse_map(&self.event_data)?,
            timestamp: parse_datetime(&self.timestamp)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    s.parse::<Uuid>()
        .map_err(|e| StoreError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_workflow_status(s: &str) -> Result<WorkflowStatus, StoreError> {
    s.parse().map_err(StoreError::Query)
}

fn parse_step_status(s: &str) -> Result<StepStatus, StoreError> {
    s.parse().map_err(StoreError::Query)
}

fn parse_map(s: &str) -> Result<HashMap<String, Value>, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn to_json(map: &HashMap<String, Value>) -> Result<String, StoreError> {
    serde_json::to_string(map).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn push_filters<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filter: &'a WorkflowFilter) {
    builder.push(" WHERE 1=1");
    if let Some(workflow_id) = &filter.workflow_id {
        builder.push(" AND workflow_id = ").push_bind(workflow_id);
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(trace_id) = &filter.trace_id {
        builder.push(" AND trace_id = ").push_bind(trace_id);
    }
    if let Some(correlation_id) = &filter.correlation_id {
        builder.push(" AND correlation_id = ").push_bind(correlation_id);
    }
    if let Some(business_id) = &filter.business_id {
        builder.push(" AND business_id = ").push_bind(business_id);
    }
}

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn save_workflow(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, workflow_id, status, input, output, context, current_step_id,
                started_at, completed_at, error, retry_count, last_retry_at,
                metadata, trace_id, correlation_id, business_id, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 input = excluded.input,
                 output = excluded.output,
                 context = excluded.context,
                 current_step_id = excluded.current_step_id,
                 completed_at = excluded.completed_at,
                 error = excluded.error,
                 retry_count = excluded.retry_count,
                 last_retry_at = excluded.last_retry_at,
                 metadata = excluded.metadata,
                 updated_at = excluded.updated_at"#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.workflow_id)
        .bind(instance.status.as_str())
        .bind(to_json(&instance.input)?)
        .bind(to_json(&instance.output)?)
        .bind(to_json(&instance.context)?)
        .bind(&instance.current_step_id)
        .bind(format_datetime(&instance.started_at))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .bind(&instance.error)
        .bind(instance.retry_count as i64)
        .bind(instance.last_retry_at.as_ref().map(format_datetime))
        .bind(to_json(&instance.metadata)?)
        .bind(&instance.trace_id)
        .bind(&instance.correlation_id)
        .bind(&instance.business_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?
            .ok_or(StoreError::NotFound)?;

        let mut instance = WorkflowRow::from_row(&row).map_err(query_err)?.into_instance()?;
        instance.steps = self.load_steps(id).await?;
        Ok(instance)
    }

    async fn update_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        let completed_at = status.is_terminal().then(|| format_datetime(&Utc::now()));

        let result = sqlx::query(
            "UPDATE workflow_instances SET status = ?, completed_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(&completed_at)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_workflow_output(
        &self,
        id: Uuid,
        output: &HashMap<String, Value>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE workflow_instances SET output = ?, updated_at = ? WHERE id = ?",
        )
        .bind(to_json(output)?)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_workflow_error(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let now = format_datetime(&Utc::now());
        let result = sqlx::query(
            "UPDATE workflow_instances SET status = 'failed', error = ?, completed_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<WorkflowInstance>, u64), StoreError> {
        let mut count_query = QueryBuilder::new("SELECT COUNT(*) FROM workflow_instances");
        push_filters(&mut count_query, filter);
        let total: i64 = count_query
            .build_query_scalar()
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut page_query = QueryBuilder::new("SELECT * FROM workflow_instances");
        push_filters(&mut page_query, filter);
        page_query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = page_query
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            instances.push(WorkflowRow::from_row(row).map_err(query_err)?.into_instance()?);
        }
        Ok((instances, total as u64))
    }

    async fn save_step(&self, step: &StepInstance) -> Result<(), StoreError> {
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO step_instances
               (id, step_id, workflow_inst_id, status, input, output, started_at,
                completed_at, error, retry_count, last_retry_at, duration_ms,
                execution_order, priority, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 input = excluded.input,
                 output = excluded.output,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at,
                 error = excluded.error,
                 retry_count = excluded.retry_count,
                 last_retry_at = excluded.last_retry_at,
                 duration_ms = excluded.duration_ms,
                 updated_at = excluded.updated_at"#,
        )
        .bind(step.id.to_string())
        .bind(&step.step_id)
        .bind(step.workflow_inst_id.to_string())
        .bind(step.status.as_str())
        .bind(to_json(&step.input)?)
        .bind(to_json(&step.output)?)
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.completed_at.as_ref().map(format_datetime))
        .bind(&step.error)
        .bind(step.retry_count as i64)
        .bind(step.last_retry_at.as_ref().map(format_datetime))
        .bind(step.duration_ms)
        .bind(step.execution_order as i64)
        .bind(step.priority as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<StepInstance, StoreError> {
        let row = sqlx::query("SELECT * FROM step_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?
            .ok_or(StoreError::NotFound)?;

        StepRow::from_row(&row).map_err(query_err)?.into_step()
    }

    async fn get_workflow_steps(
        &self,
        workflow_inst_id: Uuid,
    ) -> Result<Vec<StepInstance>, StoreError> {
        self.load_steps(workflow_inst_id).await
    }

    async fn update_step_status(&self, id: Uuid, status: StepStatus) -> Result<(), StoreError> {
        let now = Utc::now();
        let started_at = (status == StepStatus::Running).then(|| format_datetime(&now));
        let completed_at = status.is_terminal().then(|| format_datetime(&now));

        let result = sqlx::query(
            "UPDATE step_instances SET status = ?, started_at = COALESCE(?, started_at), completed_at = COALESCE(?, completed_at), updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(&started_at)
        .bind(&completed_at)
        .bind(format_datetime(&now))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_step_output(
        &self,
        id: Uuid,
        output: &HashMap<String, Value>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE step_instances SET output = ?, updated_at = ? WHERE id = ?",
        )
        .bind(to_json(output)?)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_step_error(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let now = format_datetime(&Utc::now());
        let result = sqlx::query(
            "UPDATE step_instances SET status = 'failed', error = ?, completed_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn save_event(&self, event: &WorkflowEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO workflow_events
               (id, workflow_inst_id, step_inst_id, event_type, event_data, timestamp, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(event.id.to_string())
        .bind(event.workflow_inst_id.to_string())
        .bind(event.step_inst_id.map(|id| id.to_string()))
        .bind(&event.event_type)
        .bind(to_json(&event.event_data)?)
        .bind(format_datetime(&event.timestamp))
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_workflow_events(
        &self,
        workflow_inst_id: Uuid,
    ) -> Result<Vec<WorkflowEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_events WHERE workflow_inst_id = ? ORDER BY timestamp ASC, id ASC",
        )
        .bind(workflow_inst_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            events.push(EventRow::from_row(row).map_err(query_err)?.into_event()?);
        }
        Ok(events)
    }

    async fn with_transaction<F, Fut, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        // The single-connection writer pool already serializes mutations and
        // each statement commits atomically under WAL.
        f().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

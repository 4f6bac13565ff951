use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reel_core::models::{Flow, FlowTask, TaskKind};
use reel_storage::FlowStore;
use sqlx::{PgConnection, PgPool, Postgres};
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
struct FlowRow {
    id: Uuid,
    deposit_id: String,
    is_last: bool,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    flow_id: Uuid,
    kind: String,
    status: String,
    payload: serde_json::Value,
    message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn to_task(self) -> Result<FlowTask> {
        Ok(FlowTask {
            id: self.id,
            flow_id: self.flow_id,
            kind: self.kind.parse()?,
            status: self.status.parse()?,
            payload: self.payload,
            message: self.message,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const TASK_COLUMNS: &str = "id, flow_id, kind, status, payload, message, created_at, updated_at";

/// Workflow engine tables (`flows`, `flow_tasks`).
#[derive(Clone)]
pub struct FlowRepository {
    pool: PgPool,
}

impl FlowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn tasks_of(&self, flow_id: Uuid) -> Result<Vec<FlowTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as::<Postgres, TaskRow>(&format!(
            "SELECT {} FROM flow_tasks WHERE flow_id = $1 ORDER BY created_at, id",
            TASK_COLUMNS
        ))
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch flow tasks")?;
        rows.into_iter().map(TaskRow::to_task).collect()
    }
}

/// Wake workers listening for task changes. Workers also poll, so failure only
/// delays pickup.
async fn notify_workers(conn: &mut PgConnection, task_id: Uuid) {
    if let Err(e) = sqlx::query("SELECT pg_notify('reel_task_queue', $1)")
        .bind(task_id.to_string())
        .execute(conn)
        .await
    {
        tracing::warn!(
            error = %e,
            task_id = %task_id,
            "Failed to send pg_notify, workers will discover the task via polling"
        );
    }
}

#[async_trait]
impl FlowStore for FlowRepository {
    #[tracing::instrument(skip(self), fields(db.table = "flows"))]
    async fn latest_flow_for_deposit(&self, deposit_id: &str) -> Result<Option<Flow>> {
        let row: Option<FlowRow> = sqlx::query_as::<Postgres, FlowRow>(
            r#"
            SELECT id, deposit_id, is_last, created_at
            FROM flows
            WHERE deposit_id = $1 AND is_last
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(deposit_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest flow")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let tasks = self.tasks_of(row.id).await?;
        Ok(Some(Flow {
            id: row.id,
            deposit_id: row.deposit_id,
            is_last: row.is_last,
            created_at: row.created_at,
            tasks,
        }))
    }

    #[tracing::instrument(skip(self), fields(db.table = "flow_tasks", task_id = %task_id))]
    async fn restart_task(&self, task_id: Uuid) -> Result<FlowTask> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for task restart")?;

        let row: Option<TaskRow> = sqlx::query_as::<Postgres, TaskRow>(&format!(
            r#"
            UPDATE flow_tasks
            SET status = 'pending', message = NULL, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to reset task")?;
        let task = row
            .ok_or_else(|| anyhow::anyhow!("Task {} not found", task_id))?
            .to_task()?;

        notify_workers(&mut tx, task_id).await;
        tx.commit()
            .await
            .context("Failed to commit task restart")?;

        tracing::info!(task_id = %task_id, kind = %task.kind, "Task restarted");
        Ok(task)
    }

    #[tracing::instrument(skip(self, payload), fields(db.table = "flow_tasks", flow_id = %flow_id, kind = %kind))]
    async fn enqueue_task(
        &self,
        flow_id: Uuid,
        kind: TaskKind,
        payload: serde_json::Value,
    ) -> Result<FlowTask> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction for task creation")?;

        let task = FlowTask::new(flow_id, kind, payload);
        sqlx::query(
            r#"
            INSERT INTO flow_tasks (id, flow_id, kind, status, payload, message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NULL, $6, $7)
            "#,
        )
        .bind(task.id)
        .bind(task.flow_id)
        .bind(task.kind.to_string())
        .bind(task.status.to_string())
        .bind(&task.payload)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to enqueue {} task into flow {}", kind, flow_id))?;

        notify_workers(&mut tx, task.id).await;
        tx.commit()
            .await
            .context("Failed to commit task creation")?;

        tracing::info!(task_id = %task.id, flow_id = %flow_id, kind = %kind, "Task enqueued");
        Ok(task)
    }
}

//! Restarting workflow tasks of a deposit.

use std::sync::Arc;

use reel_core::models::{EntityId, FlowTask, TaskKind};
use reel_core::{AppError, AppResult};
use reel_storage::{FlowStore, Store};

use crate::resolver::EntityResolver;

pub struct TaskRestartService {
    store: Arc<dyn Store>,
    flows: Arc<dyn FlowStore>,
    resolver: EntityResolver,
}

impl TaskRestartService {
    pub fn new(store: Arc<dyn Store>, flows: Arc<dyn FlowStore>, resolver: EntityResolver) -> Self {
        Self {
            store,
            flows,
            resolver,
        }
    }

    /// Restart every task of `kind` in the latest flow of the entity's deposit.
    #[tracing::instrument(skip(self), fields(entity = %id, kind = %kind))]
    pub async fn restart_tasks(&self, id: &EntityId, kind: TaskKind) -> AppResult<Vec<FlowTask>> {
        let mut tx = self.store.begin().await?;
        let deposit_pid = self.resolver.deposit_pid(tx.as_mut(), id).await;
        tx.rollback().await?;
        let deposit_pid = deposit_pid?;

        let flow = self
            .flows
            .latest_flow_for_deposit(&deposit_pid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No flow for deposit {}", deposit_pid)))?;

        let mut restarted = Vec::new();
        for task in flow.tasks_of_kind(kind) {
            restarted.push(self.flows.restart_task(task.id).await?);
        }

        tracing::info!(
            deposit_id = %deposit_pid,
            flow_id = %flow.id,
            restarted = restarted.len(),
            "Tasks restarted"
        );
        Ok(restarted)
    }
}

//! Resolution of operator-supplied identifiers to stored records and deposits.

use reel_core::models::{EntityId, EntityKind, EntityMetadata, PidType};
use reel_core::{AppError, AppResult};
use reel_storage::StoreTx;

/// A published record together with the draft it was published from.
#[derive(Debug, Clone)]
pub struct ResolvedPair {
    pub record: EntityMetadata,
    pub deposit: EntityMetadata,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EntityResolver;

impl EntityResolver {
    pub fn new() -> Self {
        Self
    }

    /// Look up the entity registered under `pid_type:value`.
    #[tracing::instrument(skip(self, tx))]
    pub async fn resolve(
        &self,
        tx: &mut dyn StoreTx,
        pid_type: PidType,
        value: &str,
    ) -> AppResult<EntityMetadata> {
        let entity_id = tx
            .resolve_pid(pid_type, value)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{}:{} does not resolve", pid_type, value)))?;
        tx.get_entity(entity_id).await?.ok_or_else(|| {
            AppError::NotFound(format!(
                "{}:{} points at missing entity {}",
                pid_type, value, entity_id
            ))
        })
    }

    /// Resolve the record/deposit pair behind either identifier.
    ///
    /// A `recid` is followed to its draft through `_deposit.id`; a `depid` is followed
    /// to the published record through `_deposit.pid.value`.
    #[tracing::instrument(skip(self, tx), fields(entity = %id))]
    pub async fn resolve_pair(&self, tx: &mut dyn StoreTx, id: &EntityId) -> AppResult<ResolvedPair> {
        let (record, deposit) = match id.pid_type {
            PidType::Recid => {
                let record = self.resolve(tx, PidType::Recid, &id.value).await?;
                let depid = record.deposit_pid().map(str::to_owned).ok_or_else(|| {
                    AppError::NotFound(format!("Record {} has no draft", id.value))
                })?;
                let deposit = self.resolve(tx, PidType::Depid, &depid).await?;
                (record, deposit)
            }
            PidType::Depid => {
                let deposit = self.resolve(tx, PidType::Depid, &id.value).await?;
                let recid = deposit.published_pid().map(str::to_owned).ok_or_else(|| {
                    AppError::NotFound(format!("Deposit {} has never been published", id.value))
                })?;
                let record = self.resolve(tx, PidType::Recid, &recid).await?;
                (record, deposit)
            }
        };

        expect_kind(&record, EntityKind::Record)?;
        expect_kind(&deposit, EntityKind::Deposit)?;
        Ok(ResolvedPair { record, deposit })
    }

    /// The draft identifier behind either identifier, without loading the draft.
    pub async fn deposit_pid(&self, tx: &mut dyn StoreTx, id: &EntityId) -> AppResult<String> {
        match id.pid_type {
            PidType::Recid => {
                let record = self.resolve(tx, PidType::Recid, &id.value).await?;
                record.deposit_pid().map(str::to_owned).ok_or_else(|| {
                    AppError::NotFound(format!("Record {} has no draft", id.value))
                })
            }
            PidType::Depid => Ok(id.value.clone()),
        }
    }

    /// The draft behind either identifier.
    pub async fn resolve_deposit(
        &self,
        tx: &mut dyn StoreTx,
        id: &EntityId,
    ) -> AppResult<EntityMetadata> {
        let depid = self.deposit_pid(tx, id).await?;
        let deposit = self.resolve(tx, PidType::Depid, &depid).await?;
        expect_kind(&deposit, EntityKind::Deposit)?;
        Ok(deposit)
    }
}

fn expect_kind(entity: &EntityMetadata, kind: EntityKind) -> AppResult<()> {
    if entity.kind != kind {
        return Err(AppError::InvalidInput(format!(
            "Entity {} is a {}, expected a {}",
            entity.id, entity.kind, kind
        )));
    }
    Ok(())
}

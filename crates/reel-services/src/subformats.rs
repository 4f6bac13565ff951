//! Requesting derived renditions (subformats) of a deposit's master video.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use reel_core::constants::{HEIGHT_TAG, PRESET_QUALITY_TAG};
use reel_core::models::{
    subformat_key, BucketRole, EntityId, Quality, SubformatDescriptor, TaggedVersion, TaskKind,
};
use reel_core::{AppError, AppResult};
use reel_storage::{FlowStore, Store, StoreTx};
use serde::Serialize;
use uuid::Uuid;

use crate::reconcile::{tagged_heads, AssociationRepository};
use crate::resolver::EntityResolver;

/// What a transcoder needs to produce one subformat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscodeRequest {
    pub deposit_pid: String,
    pub master_version_id: Uuid,
    pub master_key: String,
    pub quality: Quality,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Schedule a transcode and return the id of the task that will run it.
    async fn transcode(&self, request: &TranscodeRequest) -> AppResult<Uuid>;
}

/// Schedules transcodes as `transcode` tasks in the deposit's latest flow.
pub struct FlowTranscoder {
    flows: Arc<dyn FlowStore>,
}

impl FlowTranscoder {
    pub fn new(flows: Arc<dyn FlowStore>) -> Self {
        Self { flows }
    }
}

#[async_trait]
impl Transcoder for FlowTranscoder {
    #[tracing::instrument(skip(self, request), fields(deposit_id = %request.deposit_pid, quality = %request.quality))]
    async fn transcode(&self, request: &TranscodeRequest) -> AppResult<Uuid> {
        let flow = self
            .flows
            .latest_flow_for_deposit(&request.deposit_pid)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("No flow for deposit {}", request.deposit_pid))
            })?;

        let payload = serde_json::json!({
            "deposit_id": request.deposit_pid,
            "version_id": request.master_version_id,
            "key": request.master_key,
            "preset_quality": request.quality.name,
            "height": request.quality.height,
            "subformat_key": subformat_key(&request.master_key, &request.quality),
        });
        let task = self
            .flows
            .enqueue_task(flow.id, TaskKind::Transcode, payload)
            .await?;
        Ok(task.id)
    }
}

struct MasterVideo {
    deposit_pid: String,
    master: TaggedVersion,
    existing: BTreeSet<String>,
}

impl MasterVideo {
    fn height(&self) -> Option<u32> {
        self.master.tag(HEIGHT_TAG).and_then(|h| h.parse().ok())
    }
}

pub struct SubformatService {
    store: Arc<dyn Store>,
    resolver: EntityResolver,
    transcoder: Arc<dyn Transcoder>,
    qualities: Vec<Quality>,
}

impl SubformatService {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: EntityResolver,
        transcoder: Arc<dyn Transcoder>,
        qualities: Vec<Quality>,
    ) -> Self {
        Self {
            store,
            resolver,
            transcoder,
            qualities,
        }
    }

    /// Configured quality names, lowest first.
    pub fn quality_names(&self) -> Vec<&str> {
        self.qualities.iter().map(|q| q.name.as_str()).collect()
    }

    /// Request every transcodable quality that has no subformat yet.
    #[tracing::instrument(skip(self), fields(entity = %id))]
    pub async fn create_all_missing(&self, id: &EntityId) -> AppResult<Vec<SubformatDescriptor>> {
        let video = self.master_video(id).await?;
        let height = video.height();
        let missing: Vec<&Quality> = self
            .qualities
            .iter()
            .filter(|q| q.fits(height) && !video.existing.contains(&q.name))
            .collect();

        let mut created = Vec::with_capacity(missing.len());
        for quality in missing {
            created.push(self.request(&video, quality).await?);
        }
        Ok(created)
    }

    /// Request one quality. `None` when the master is too small for it.
    #[tracing::instrument(skip(self), fields(entity = %id))]
    pub async fn create(
        &self,
        id: &EntityId,
        quality: &str,
    ) -> AppResult<Option<SubformatDescriptor>> {
        let quality = self
            .qualities
            .iter()
            .find(|q| q.name == quality)
            .ok_or_else(|| {
                AppError::InvalidInput(format!(
                    "Input quality must be one of {}",
                    self.quality_names().join(", ")
                ))
            })?;

        let video = self.master_video(id).await?;
        if !quality.fits(video.height()) {
            tracing::info!(quality = %quality, height = ?video.height(), "Master too small for quality");
            return Ok(None);
        }
        self.request(&video, quality).await.map(Some)
    }

    /// Request every transcodable quality, whether or not it already exists.
    #[tracing::instrument(skip(self), fields(entity = %id))]
    pub async fn create_all(&self, id: &EntityId) -> AppResult<Vec<SubformatDescriptor>> {
        let video = self.master_video(id).await?;
        let height = video.height();

        let mut created = Vec::new();
        for quality in self.qualities.iter().filter(|q| q.fits(height)) {
            created.push(self.request(&video, quality).await?);
        }
        Ok(created)
    }

    async fn request(
        &self,
        video: &MasterVideo,
        quality: &Quality,
    ) -> AppResult<SubformatDescriptor> {
        let request = TranscodeRequest {
            deposit_pid: video.deposit_pid.clone(),
            master_version_id: video.master.version.version_id,
            master_key: video.master.version.key.clone(),
            quality: quality.clone(),
        };
        let task_id = self.transcoder.transcode(&request).await?;

        tracing::info!(
            deposit_id = %video.deposit_pid,
            quality = %quality,
            task_id = %task_id,
            "Subformat requested"
        );
        Ok(SubformatDescriptor {
            key: subformat_key(&request.master_key, quality),
            preset_quality: quality.name.clone(),
            master_version_id: request.master_version_id,
            task_id,
        })
    }

    async fn master_video(&self, id: &EntityId) -> AppResult<MasterVideo> {
        let mut tx = self.store.begin().await?;
        let video = self.inspect(tx.as_mut(), id).await;
        tx.rollback().await?;
        video
    }

    async fn inspect(&self, tx: &mut dyn StoreTx, id: &EntityId) -> AppResult<MasterVideo> {
        let deposit = self.resolver.resolve_deposit(tx, id).await?;
        let deposit_pid = deposit
            .deposit_pid()
            .map(str::to_owned)
            .ok_or_else(|| AppError::NotFound(format!("Deposit {} has no identifier", deposit.id)))?;
        let association = AssociationRepository::new()
            .get(tx, deposit.id, BucketRole::Deposit)
            .await?;

        let heads = tagged_heads(tx, association.bucket_id).await?;
        let existing = heads
            .iter()
            .filter(|t| t.is_slave())
            .filter_map(|t| t.tag(PRESET_QUALITY_TAG))
            .map(str::to_owned)
            .collect();
        let master = heads
            .into_iter()
            .find(TaggedVersion::is_canonical_candidate)
            .ok_or_else(|| {
                AppError::NotFound(format!("No master video in deposit {}", deposit_pid))
            })?;

        Ok(MasterVideo {
            deposit_pid,
            master,
            existing,
        })
    }
}

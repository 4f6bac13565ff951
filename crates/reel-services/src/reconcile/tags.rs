use reel_core::constants::MASTER_TAG;
use reel_core::models::{ObjectVersion, ObjectVersionTag, TaggedVersion};
use reel_core::AppResult;
use reel_storage::StoreTx;
use uuid::Uuid;

/// Head versions of a bucket joined with their tags.
pub(crate) async fn tagged_heads(
    tx: &mut dyn StoreTx,
    bucket_id: Uuid,
) -> AppResult<Vec<TaggedVersion>> {
    let versions = tx.head_versions(bucket_id).await?;
    let tags = tx.head_tags(bucket_id).await?;
    Ok(TaggedVersion::assemble(versions, tags))
}

/// Master/slave relationship between the canonical rendition and its subformats.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagModel;

impl TagModel {
    pub fn new() -> Self {
        Self
    }

    /// The canonical rendition of a bucket, if it has one.
    #[tracing::instrument(skip(self, tx))]
    pub async fn locate_canonical(
        &self,
        tx: &mut dyn StoreTx,
        bucket_id: Uuid,
    ) -> AppResult<Option<ObjectVersion>> {
        let mut candidates = tagged_heads(tx, bucket_id)
            .await?
            .into_iter()
            .filter(TaggedVersion::is_canonical_candidate);

        let Some(first) = candidates.next() else {
            return Ok(None);
        };
        let others: Vec<String> = candidates.map(|c| c.version.key).collect();
        if !others.is_empty() {
            tracing::warn!(
                bucket_id = %bucket_id,
                chosen = %first.version.key,
                ignored = ?others,
                "Several master renditions found, using the first by key"
            );
        }
        Ok(Some(first.version))
    }

    /// Point every slave of `bucket_id` at `canonical`. Returns the number of tags rewritten.
    #[tracing::instrument(skip(self, tx, canonical), fields(canonical_version_id = %canonical.version_id))]
    pub async fn propagate(
        &self,
        tx: &mut dyn StoreTx,
        bucket_id: Uuid,
        canonical: &ObjectVersion,
    ) -> AppResult<usize> {
        let master = canonical.version_id.to_string();
        let mut rewritten = 0usize;
        for slave in tagged_heads(tx, bucket_id)
            .await?
            .iter()
            .filter(|t| t.is_slave())
        {
            if slave.tag(MASTER_TAG) == Some(master.as_str()) {
                continue;
            }
            tx.put_tag(&ObjectVersionTag::new(
                slave.version.version_id,
                MASTER_TAG,
                master.as_str(),
            ))
            .await?;
            rewritten += 1;
        }

        tracing::info!(bucket_id = %bucket_id, rewritten, "Subformat tags propagated");
        Ok(rewritten)
    }
}

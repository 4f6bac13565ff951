//! Postgres store: buckets, object versions, tags, associations and entities.
//!
//! Every operation runs inside the transaction opened by `PgStore::begin`. Optimistic
//! checks are expressed as `WHERE revision = $n` updates, so a concurrent writer either
//! blocks on the row lock and then fails the check, or is rejected with a
//! serialization error that maps to `StoreError::Conflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reel_core::models::{
    Association, Bucket, BucketRole, EntityDocument, EntityKind, EntityMetadata, ObjectVersion,
    ObjectVersionTag, PidType,
};
use reel_storage::{
    AssociationStore, BucketStore, EntityStore, Store, StoreError, StoreResult, StoreTx,
};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::error::classify;

#[derive(Debug, sqlx::FromRow)]
struct BucketRow {
    id: Uuid,
    locked: bool,
    quota_size: Option<i64>,
    size: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BucketRow {
    fn to_bucket(self) -> Bucket {
        Bucket {
            id: self.id,
            locked: self.locked,
            quota_size: self.quota_size,
            size: self.size,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct VersionRow {
    version_id: Uuid,
    bucket_id: Uuid,
    key: String,
    file_id: Option<Uuid>,
    size: i64,
    is_head: bool,
    created_at: DateTime<Utc>,
}

impl VersionRow {
    fn to_version(self) -> ObjectVersion {
        ObjectVersion {
            version_id: self.version_id,
            bucket_id: self.bucket_id,
            key: self.key,
            file_id: self.file_id,
            size: self.size,
            is_head: self.is_head,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TagRow {
    version_id: Uuid,
    key: String,
    value: String,
}

#[derive(Debug, sqlx::FromRow)]
struct AssociationRow {
    entity_id: Uuid,
    role: String,
    bucket_id: Uuid,
    revision: i64,
    updated_at: DateTime<Utc>,
}

impl AssociationRow {
    fn to_association(self) -> StoreResult<Association> {
        let role = self
            .role
            .parse::<BucketRole>()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Association {
            entity_id: self.entity_id,
            role,
            bucket_id: self.bucket_id,
            revision: self.revision,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    id: Uuid,
    kind: String,
    document: serde_json::Value,
    revision: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EntityRow {
    fn to_entity(self) -> StoreResult<EntityMetadata> {
        let kind = self
            .kind
            .parse::<EntityKind>()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let document: EntityDocument = serde_json::from_value(self.document).map_err(|e| {
            StoreError::Backend(format!("Entity {} has a malformed document: {}", self.id, e))
        })?;
        Ok(EntityMetadata {
            id: self.id,
            kind,
            document,
            revision: self.revision,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const BUCKET_COLUMNS: &str = "id, locked, quota_size, size, created_at, updated_at";
const VERSION_COLUMNS: &str = "version_id, bucket_id, key, file_id, size, is_head, created_at";
const ASSOCIATION_COLUMNS: &str = "entity_id, role, bucket_id, revision, updated_at";
const ENTITY_COLUMNS: &str = "id, kind, document, revision, created_at, updated_at";

/// Store backed by a Postgres connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    #[tracing::instrument(skip(self))]
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let transaction = self.pool.begin().await.map_err(classify)?;
        Ok(Box::new(PgStoreTx {
            transaction: Some(transaction),
        }))
    }
}

/// One Postgres transaction. Dropped without commit, it is rolled back by the pool.
pub struct PgStoreTx {
    transaction: Option<Transaction<'static, Postgres>>,
}

impl PgStoreTx {
    fn conn(&mut self) -> StoreResult<&mut PgConnection> {
        self.transaction.as_deref_mut().ok_or(StoreError::Closed)
    }
}

impl Drop for PgStoreTx {
    fn drop(&mut self) {
        if self.transaction.is_some() {
            tracing::warn!(
                "Store transaction was dropped without explicit commit or rollback - rolling back"
            );
        }
    }
}

#[async_trait]
impl BucketStore for PgStoreTx {
    #[tracing::instrument(skip(self), fields(db.table = "buckets", db.record_id = %id))]
    async fn get_bucket(&mut self, id: Uuid) -> StoreResult<Option<Bucket>> {
        let row: Option<BucketRow> = sqlx::query_as::<Postgres, BucketRow>(&format!(
            "SELECT {} FROM buckets WHERE id = $1",
            BUCKET_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.conn()?)
        .await
        .map_err(classify)?;
        Ok(row.map(BucketRow::to_bucket))
    }

    #[tracing::instrument(skip(self, bucket), fields(db.table = "buckets", db.record_id = %bucket.id))]
    async fn insert_bucket(&mut self, bucket: &Bucket) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO buckets (id, locked, quota_size, size, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(bucket.id)
        .bind(bucket.locked)
        .bind(bucket.quota_size)
        .bind(bucket.size)
        .bind(bucket.created_at)
        .bind(bucket.updated_at)
        .execute(self.conn()?)
        .await
        .map_err(classify)?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "buckets", db.record_id = %id))]
    async fn set_bucket_locked(&mut self, id: Uuid, locked: bool) -> StoreResult<()> {
        let result = sqlx::query("UPDATE buckets SET locked = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(locked)
            .execute(self.conn()?)
            .await
            .map_err(classify)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Bucket {} not found", id)));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "buckets", db.record_id = %id))]
    async fn remove_bucket(&mut self, id: Uuid) -> StoreResult<()> {
        let conn = self.conn()?;
        let locked: Option<bool> =
            sqlx::query_scalar("SELECT locked FROM buckets WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(classify)?;
        match locked {
            None => return Err(StoreError::NotFound(format!("Bucket {} not found", id))),
            Some(true) => return Err(StoreError::Locked(id)),
            Some(false) => {}
        }

        let references: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM bucket_associations WHERE bucket_id = $1")
                .bind(id)
                .fetch_one(&mut *conn)
                .await
                .map_err(classify)?;
        if references > 0 {
            return Err(StoreError::Conflict(format!(
                "Bucket {} is still referenced by {} association(s)",
                id, references
            )));
        }

        // Versions and tags go with the bucket (ON DELETE CASCADE).
        sqlx::query("DELETE FROM buckets WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(classify)?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "object_versions", bucket_id = %bucket_id))]
    async fn head_versions(&mut self, bucket_id: Uuid) -> StoreResult<Vec<ObjectVersion>> {
        let conn = self.conn()?;
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM buckets WHERE id = $1)")
            .bind(bucket_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(classify)?;
        if !exists {
            return Err(StoreError::NotFound(format!("Bucket {} not found", bucket_id)));
        }

        let rows: Vec<VersionRow> = sqlx::query_as::<Postgres, VersionRow>(&format!(
            "SELECT {} FROM object_versions WHERE bucket_id = $1 AND is_head ORDER BY key",
            VERSION_COLUMNS
        ))
        .bind(bucket_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(classify)?;
        Ok(rows.into_iter().map(VersionRow::to_version).collect())
    }

    #[tracing::instrument(
        skip(self, version),
        fields(db.table = "object_versions", bucket_id = %version.bucket_id, key = %version.key)
    )]
    async fn insert_version(&mut self, version: &ObjectVersion) -> StoreResult<()> {
        let conn = self.conn()?;

        let grown: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE buckets
            SET size = size + $2, updated_at = NOW()
            WHERE id = $1
              AND NOT locked
              AND (quota_size IS NULL OR size + $2 <= quota_size)
            RETURNING id
            "#,
        )
        .bind(version.bucket_id)
        .bind(version.size)
        .fetch_optional(&mut *conn)
        .await
        .map_err(classify)?;

        if grown.is_none() {
            let bucket: Option<BucketRow> = sqlx::query_as::<Postgres, BucketRow>(&format!(
                "SELECT {} FROM buckets WHERE id = $1",
                BUCKET_COLUMNS
            ))
            .bind(version.bucket_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(classify)?;
            return Err(match bucket {
                None => StoreError::NotFound(format!("Bucket {} not found", version.bucket_id)),
                Some(b) if b.locked => StoreError::Locked(b.id),
                Some(b) => StoreError::Exhausted(format!(
                    "Bucket {} quota of {} bytes exceeded",
                    b.id,
                    b.quota_size.unwrap_or_default()
                )),
            });
        }

        if version.is_head {
            sqlx::query(
                "UPDATE object_versions SET is_head = FALSE WHERE bucket_id = $1 AND key = $2 AND is_head",
            )
            .bind(version.bucket_id)
            .bind(&version.key)
            .execute(&mut *conn)
            .await
            .map_err(classify)?;
        }

        sqlx::query(
            r#"
            INSERT INTO object_versions (version_id, bucket_id, key, file_id, size, is_head, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(version.version_id)
        .bind(version.bucket_id)
        .bind(&version.key)
        .bind(version.file_id)
        .bind(version.size)
        .bind(version.is_head)
        .bind(version.created_at)
        .execute(&mut *conn)
        .await
        .map_err(classify)?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "object_version_tags", bucket_id = %bucket_id))]
    async fn head_tags(&mut self, bucket_id: Uuid) -> StoreResult<Vec<ObjectVersionTag>> {
        let rows: Vec<TagRow> = sqlx::query_as::<Postgres, TagRow>(
            r#"
            SELECT t.version_id, t.key, t.value
            FROM object_version_tags t
            JOIN object_versions v ON v.version_id = t.version_id
            WHERE v.bucket_id = $1 AND v.is_head
            ORDER BY v.key, t.key
            "#,
        )
        .bind(bucket_id)
        .fetch_all(self.conn()?)
        .await
        .map_err(classify)?;
        Ok(rows
            .into_iter()
            .map(|r| ObjectVersionTag::new(r.version_id, r.key, r.value))
            .collect())
    }

    #[tracing::instrument(
        skip(self, tag),
        fields(db.table = "object_version_tags", version_id = %tag.version_id, key = %tag.key)
    )]
    async fn put_tag(&mut self, tag: &ObjectVersionTag) -> StoreResult<()> {
        let conn = self.conn()?;
        let result = sqlx::query(
            r#"
            INSERT INTO object_version_tags (version_id, key, value)
            SELECT v.version_id, $2, $3
            FROM object_versions v
            JOIN buckets b ON b.id = v.bucket_id
            WHERE v.version_id = $1 AND NOT b.locked
            ON CONFLICT (version_id, key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(tag.version_id)
        .bind(&tag.key)
        .bind(&tag.value)
        .execute(&mut *conn)
        .await
        .map_err(classify)?;

        if result.rows_affected() == 0 {
            let bucket_id: Option<Uuid> =
                sqlx::query_scalar("SELECT bucket_id FROM object_versions WHERE version_id = $1")
                    .bind(tag.version_id)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(classify)?;
            return Err(match bucket_id {
                Some(bucket_id) => StoreError::Locked(bucket_id),
                None => StoreError::NotFound(format!(
                    "Object version {} not found",
                    tag.version_id
                )),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AssociationStore for PgStoreTx {
    #[tracing::instrument(skip(self), fields(db.table = "bucket_associations", entity_id = %entity_id, role = %role))]
    async fn get_association(
        &mut self,
        entity_id: Uuid,
        role: BucketRole,
    ) -> StoreResult<Option<Association>> {
        let row: Option<AssociationRow> = sqlx::query_as::<Postgres, AssociationRow>(&format!(
            "SELECT {} FROM bucket_associations WHERE entity_id = $1 AND role = $2",
            ASSOCIATION_COLUMNS
        ))
        .bind(entity_id)
        .bind(role.to_string())
        .fetch_optional(self.conn()?)
        .await
        .map_err(classify)?;
        row.map(AssociationRow::to_association).transpose()
    }

    #[tracing::instrument(
        skip(self, association),
        fields(db.table = "bucket_associations", entity_id = %association.entity_id, role = %association.role)
    )]
    async fn insert_association(&mut self, association: &Association) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bucket_associations (entity_id, role, bucket_id, revision, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(association.entity_id)
        .bind(association.role.to_string())
        .bind(association.bucket_id)
        .bind(association.revision)
        .bind(association.updated_at)
        .execute(self.conn()?)
        .await
        .map_err(classify)?;
        Ok(())
    }

    #[tracing::instrument(
        skip(self),
        fields(db.table = "bucket_associations", entity_id = %entity_id, role = %role)
    )]
    async fn compare_and_set_association(
        &mut self,
        entity_id: Uuid,
        role: BucketRole,
        expected_revision: i64,
        bucket_id: Uuid,
    ) -> StoreResult<Option<Association>> {
        let row: Option<AssociationRow> = sqlx::query_as::<Postgres, AssociationRow>(&format!(
            r#"
            UPDATE bucket_associations
            SET bucket_id = $4, revision = revision + 1, updated_at = NOW()
            WHERE entity_id = $1 AND role = $2 AND revision = $3
            RETURNING {}
            "#,
            ASSOCIATION_COLUMNS
        ))
        .bind(entity_id)
        .bind(role.to_string())
        .bind(expected_revision)
        .bind(bucket_id)
        .fetch_optional(self.conn()?)
        .await
        .map_err(classify)?;
        row.map(AssociationRow::to_association).transpose()
    }

    #[tracing::instrument(skip(self), fields(db.table = "bucket_associations", bucket_id = %bucket_id))]
    async fn count_bucket_references(&mut self, bucket_id: Uuid) -> StoreResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM bucket_associations WHERE bucket_id = $1")
            .bind(bucket_id)
            .fetch_one(self.conn()?)
            .await
            .map_err(classify)
    }
}

#[async_trait]
impl EntityStore for PgStoreTx {
    #[tracing::instrument(skip(self), fields(db.table = "persistent_identifiers"))]
    async fn resolve_pid(&mut self, pid_type: PidType, value: &str) -> StoreResult<Option<Uuid>> {
        sqlx::query_scalar(
            "SELECT entity_id FROM persistent_identifiers WHERE pid_type = $1 AND pid_value = $2",
        )
        .bind(pid_type.to_string())
        .bind(value)
        .fetch_optional(self.conn()?)
        .await
        .map_err(classify)
    }

    #[tracing::instrument(skip(self), fields(db.table = "persistent_identifiers"))]
    async fn register_pid(
        &mut self,
        pid_type: PidType,
        value: &str,
        entity_id: Uuid,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO persistent_identifiers (pid_type, pid_value, entity_id) VALUES ($1, $2, $3)",
        )
        .bind(pid_type.to_string())
        .bind(value)
        .bind(entity_id)
        .execute(self.conn()?)
        .await
        .map_err(classify)?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "entities", db.record_id = %id))]
    async fn get_entity(&mut self, id: Uuid) -> StoreResult<Option<EntityMetadata>> {
        let row: Option<EntityRow> = sqlx::query_as::<Postgres, EntityRow>(&format!(
            "SELECT {} FROM entities WHERE id = $1",
            ENTITY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.conn()?)
        .await
        .map_err(classify)?;
        row.map(EntityRow::to_entity).transpose()
    }

    #[tracing::instrument(skip(self, entity), fields(db.table = "entities", db.record_id = %entity.id))]
    async fn insert_entity(&mut self, entity: &EntityMetadata) -> StoreResult<()> {
        let document = serde_json::to_value(&entity.document)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO entities (id, kind, document, revision, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entity.id)
        .bind(entity.kind.to_string())
        .bind(document)
        .bind(entity.revision)
        .bind(entity.created_at)
        .bind(entity.updated_at)
        .execute(self.conn()?)
        .await
        .map_err(classify)?;
        Ok(())
    }

    #[tracing::instrument(
        skip(self, entity),
        fields(db.table = "entities", db.record_id = %entity.id, revision = entity.revision)
    )]
    async fn update_entity(&mut self, entity: &EntityMetadata) -> StoreResult<EntityMetadata> {
        let document = serde_json::to_value(&entity.document)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let conn = self.conn()?;
        let row: Option<EntityRow> = sqlx::query_as::<Postgres, EntityRow>(&format!(
            r#"
            UPDATE entities
            SET document = $2, revision = revision + 1, updated_at = NOW()
            WHERE id = $1 AND revision = $3
            RETURNING {}
            "#,
            ENTITY_COLUMNS
        ))
        .bind(entity.id)
        .bind(document)
        .bind(entity.revision)
        .fetch_optional(&mut *conn)
        .await
        .map_err(classify)?;

        match row {
            Some(row) => row.to_entity(),
            None => {
                let stored: Option<i64> =
                    sqlx::query_scalar("SELECT revision FROM entities WHERE id = $1")
                        .bind(entity.id)
                        .fetch_optional(&mut *conn)
                        .await
                        .map_err(classify)?;
                Err(match stored {
                    Some(stored) => StoreError::Conflict(format!(
                        "Entity {} changed concurrently (revision {} expected, {} stored)",
                        entity.id, entity.revision, stored
                    )),
                    None => StoreError::NotFound(format!("Entity {} not found", entity.id)),
                })
            }
        }
    }
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn commit(&mut self) -> StoreResult<()> {
        let transaction = self.transaction.take().ok_or(StoreError::Closed)?;
        transaction.commit().await.map_err(classify)?;
        tracing::debug!("Store transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        let transaction = self.transaction.take().ok_or(StoreError::Closed)?;
        transaction.rollback().await.map_err(classify)?;
        tracing::debug!("Store transaction rolled back");
        Ok(())
    }
}

// ABOUTME: Storage layer for boxes and their per-box deploy marker
// ABOUTME: Lifecycle transitions are conditional updates so concurrent writers cannot regress a box

use crate::error::{is_unique_violation, Result, StorageError};
use crate::ledger::{complete_step_on, skip_pending_on};
use crate::models::{
    parse_optional_timestamp, parse_timestamp, BoxRecord, BoxStatus, FinalizeOutcome, NewBox,
};
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

const BOX_COLUMNS: &str = r#"
    id, name, subdomain, provider, instance_id, instance_url, instance_attempt, status, error_message,
    current_attempt, skills, last_health_check, created_at, updated_at, deleted_at
"#;

#[derive(Clone)]
pub struct BoxStorage {
    pool: SqlitePool,
}

impl BoxStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // BOX RECORDS
    // ========================================================================

    pub async fn create_box(&self, new_box: NewBox) -> Result<BoxRecord> {
        let id = format!("box_{}", uuid::Uuid::new_v4().simple());
        let now = Utc::now().to_rfc3339();
        let skills_json = serde_json::to_string(&new_box.skills)?;

        let result = sqlx::query(
            r#"
            INSERT INTO boxes (
                id, name, subdomain, provider, status, current_attempt, skills,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?6)
            "#,
        )
        .bind(&id)
        .bind(&new_box.name)
        .bind(&new_box.subdomain)
        .bind(&new_box.provider)
        .bind(&skills_json)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StorageError::DuplicateSubdomain(new_box.subdomain));
            }
            Err(e) => return Err(e.into()),
        }

        info!("Recorded box {} ({})", id, new_box.subdomain);
        self.get_box(&id).await
    }

    pub async fn get_box(&self, id: &str) -> Result<BoxRecord> {
        let row = sqlx::query(&format!("SELECT {} FROM boxes WHERE id = ?1", BOX_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_box(&row),
            None => Err(StorageError::BoxNotFound(id.to_string())),
        }
    }

    pub async fn get_status(&self, id: &str) -> Result<BoxStatus> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM boxes WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match status {
            Some(status) => BoxStatus::from_str(&status),
            None => Err(StorageError::BoxNotFound(id.to_string())),
        }
    }

    /// Boxes in any of the given statuses, oldest first
    pub async fn list_boxes(&self, statuses: &[BoxStatus]) -> Result<Vec<BoxRecord>> {
        let mut query = format!("SELECT {} FROM boxes", BOX_COLUMNS);
        if !statuses.is_empty() {
            let placeholders: Vec<String> =
                (1..=statuses.len()).map(|i| format!("?{}", i)).collect();
            query.push_str(&format!(" WHERE status IN ({})", placeholders.join(", ")));
        }
        query.push_str(" ORDER BY created_at ASC");

        let mut q = sqlx::query(&query);
        for status in statuses {
            q = q.bind(status.as_str());
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_box).collect()
    }

    // ========================================================================
    // DEPLOYMENT ATTEMPTS
    // ========================================================================

    /// Take the box's in-flight marker and move it to `deploying` under a new attempt number.
    /// The marker insert is the atomic check-and-set that prevents double provisioning.
    pub async fn begin_attempt(&self, id: &str) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let lock = sqlx::query(
            "INSERT INTO box_deploy_locks (box_id, attempt, acquired_at) VALUES (?1, 0, ?2)",
        )
        .bind(id)
        .bind(&now)
        .execute(&mut *tx)
        .await;

        match lock {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StorageError::AlreadyDeploying(id.to_string()));
            }
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                return Err(StorageError::BoxNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let updated = sqlx::query(
            r#"
            UPDATE boxes
            SET status = 'deploying', current_attempt = current_attempt + 1, updated_at = ?1
            WHERE id = ?2 AND status IN ('pending', 'error')
            "#,
        )
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM boxes WHERE id = ?1")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;

            return match status {
                None => Err(StorageError::BoxNotFound(id.to_string())),
                Some(status) if status == BoxStatus::Deploying.as_str() => {
                    Err(StorageError::AlreadyDeploying(id.to_string()))
                }
                Some(status) => Err(StorageError::InvalidTransition {
                    box_id: id.to_string(),
                    from: status,
                    to: BoxStatus::Deploying.as_str().to_string(),
                }),
            };
        }

        let attempt: i64 = sqlx::query_scalar("SELECT current_attempt FROM boxes WHERE id = ?1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("UPDATE box_deploy_locks SET attempt = ?1 WHERE box_id = ?2")
            .bind(attempt)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!("Box {} entered deploying (attempt {})", id, attempt);
        Ok(attempt)
    }

    /// Whether `attempt` is the box's current, still in-flight attempt
    pub async fn is_attempt_active(&self, id: &str, attempt: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM boxes
            WHERE id = ?1 AND status = 'deploying' AND current_attempt = ?2
            "#,
        )
        .bind(id)
        .bind(attempt)
        .fetch_one(&self.pool)
        .await?;

        Ok(count == 1)
    }

    /// Attempt number held by the in-flight marker, if any
    pub async fn deploy_marker(&self, id: &str) -> Result<Option<i64>> {
        let attempt = sqlx::query_scalar("SELECT attempt FROM box_deploy_locks WHERE box_id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(attempt)
    }

    /// Record the provider instance for the attempt. Returns false (and writes nothing)
    /// if the attempt is no longer current, e.g. the box was deleted meanwhile.
    pub async fn record_instance(
        &self,
        id: &str,
        attempt: i64,
        instance_id: &str,
        instance_url: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE boxes
            SET instance_id = ?1, instance_url = ?2, instance_attempt = ?5, updated_at = ?3
            WHERE id = ?4 AND status = 'deploying' AND current_attempt = ?5
            "#,
        )
        .bind(instance_id)
        .bind(instance_url)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(attempt)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Complete the finalize step and, if the attempt is still current, move the box to
    /// `running` and release the marker, all in one transaction.
    pub async fn complete_deployment(
        &self,
        id: &str,
        attempt: i64,
        finalize_step_id: &str,
        metadata: JsonValue,
    ) -> Result<FinalizeOutcome> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let activated = sqlx::query(
            r#"
            UPDATE boxes SET status = 'running', error_message = NULL, updated_at = ?1
            WHERE id = ?2 AND status = 'deploying' AND current_attempt = ?3
            "#,
        )
        .bind(&now)
        .bind(id)
        .bind(attempt)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let outcome = if activated {
            sqlx::query("DELETE FROM box_deploy_locks WHERE box_id = ?1 AND attempt = ?2")
                .bind(id)
                .bind(attempt)
                .execute(&mut *tx)
                .await?;
            FinalizeOutcome::Activated
        } else {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM boxes WHERE id = ?1")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let status = status.ok_or_else(|| StorageError::BoxNotFound(id.to_string()))?;
            FinalizeOutcome::Stale(BoxStatus::from_str(&status)?)
        };

        let mut metadata = metadata;
        if let (FinalizeOutcome::Stale(status), Some(map)) = (outcome, metadata.as_object_mut()) {
            map.insert("box_status".to_string(), status.as_str().into());
        }

        if !complete_step_on(&mut *tx, finalize_step_id, Some(&metadata)).await? {
            // The finalize step must be running for the box to go live
            tx.rollback().await?;
            return Err(StorageError::StepNotFound(finalize_step_id.to_string()));
        }

        tx.commit().await?;

        match outcome {
            FinalizeOutcome::Activated => info!("Box {} is running (attempt {})", id, attempt),
            FinalizeOutcome::Stale(status) => debug!(
                "Finalize for box {} attempt {} left box untouched ({})",
                id,
                attempt,
                status.as_str()
            ),
        }

        Ok(outcome)
    }

    /// Abort an attempt: skip its un-started steps, move the box to `error` with `message`
    /// (only if the attempt is still current) and release the marker.
    /// Returns true if the box status changed.
    pub async fn fail_deployment(&self, id: &str, attempt: i64, message: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let failed = sqlx::query(
            r#"
            UPDATE boxes SET status = 'error', error_message = ?1, updated_at = ?2
            WHERE id = ?3 AND status = 'deploying' AND current_attempt = ?4
            "#,
        )
        .bind(message)
        .bind(&now)
        .bind(id)
        .bind(attempt)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let skipped = skip_pending_on(&mut *tx, id, attempt).await?;

        sqlx::query("DELETE FROM box_deploy_locks WHERE box_id = ?1 AND attempt = ?2")
            .bind(id)
            .bind(attempt)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if failed {
            info!(
                "Box {} attempt {} failed ({} steps skipped): {}",
                id, attempt, skipped, message
            );
        }
        Ok(failed)
    }

    /// Soft-delete. Returns the record as it was before deletion so the caller can
    /// release provider resources; deleting an already-deleted box is a no-op.
    pub async fn mark_deleted(&self, id: &str) -> Result<BoxRecord> {
        let now = Utc::now().to_rfc3339();
        let before = self.get_box(id).await?;
        if before.status == BoxStatus::Deleted {
            return Ok(before);
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE boxes SET status = 'deleted', deleted_at = ?1, updated_at = ?1
            WHERE id = ?2 AND status != 'deleted'
            "#,
        )
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        skip_pending_on(&mut *tx, id, before.current_attempt).await?;

        sqlx::query("DELETE FROM box_deploy_locks WHERE box_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!("Box {} deleted", id);
        Ok(before)
    }

    // ========================================================================
    // RECONCILIATION
    // ========================================================================

    /// Refresh the health timestamp without touching status
    pub async fn touch_health_check(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE boxes SET last_health_check = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a `running` box to `error`. Returns false if the box is no longer running.
    pub async fn mark_running_box_error(&self, id: &str, message: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE boxes SET status = 'error', error_message = ?1, last_health_check = ?2, updated_at = ?2
            WHERE id = ?3 AND status = 'running'
            "#,
        )
        .bind(message)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn row_to_box(row: &SqliteRow) -> Result<BoxRecord> {
    let status: String = row.try_get("status")?;
    let skills: String = row.try_get("skills")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(BoxRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        subdomain: row.try_get("subdomain")?,
        provider: row.try_get("provider")?,
        instance_id: row.try_get("instance_id")?,
        instance_url: row.try_get("instance_url")?,
        instance_attempt: row.try_get("instance_attempt")?,
        status: BoxStatus::from_str(&status)?,
        error_message: row.try_get("error_message")?,
        current_attempt: row.try_get("current_attempt")?,
        skills: serde_json::from_str(&skills)?,
        last_health_check: parse_optional_timestamp(row.try_get("last_health_check")?)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        deleted_at: parse_optional_timestamp(row.try_get("deleted_at")?)?,
    })
}

// ABOUTME: Step ledger recording every deployment step of every attempt
// ABOUTME: Single-row idempotent writes keyed by (box, attempt, parent, key); tree rebuilt at read time

use crate::error::{Result, StorageError};
use crate::models::{
    parse_optional_timestamp, parse_timestamp, DeployStep, NewStep, StepNode, StepStatus,
};
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use tracing::debug;

const STEP_COLUMNS: &str = r#"
    id, box_id, attempt, parent_id, step_key, step_order, name, status,
    started_at, completed_at, error_message, metadata, created_at
"#;

#[derive(Clone)]
pub struct StepLedger {
    pool: SqlitePool,
}

impl StepLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert the step as `pending` unless a row with the same key exists; returns the row id either way
    pub async fn upsert_step(&self, step: &NewStep) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO deploy_steps (
                id, box_id, attempt, parent_id, step_key, step_order, name, status, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&step.box_id)
        .bind(step.attempt)
        .bind(&step.parent_id)
        .bind(&step.step_key)
        .bind(step.step_order)
        .bind(&step.name)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let existing = self
            .find_step(
                &step.box_id,
                step.attempt,
                step.parent_id.as_deref(),
                &step.step_key,
            )
            .await?
            .ok_or_else(|| StorageError::StepNotFound(step.step_key.clone()))?;

        if existing.id != id {
            debug!(
                "Step {} for box {} attempt {} already recorded as {}",
                step.step_key, step.box_id, step.attempt, existing.id
            );
        }

        Ok(existing.id)
    }

    pub async fn get_step(&self, id: &str) -> Result<DeployStep> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM deploy_steps WHERE id = ?1",
            STEP_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_step(&row),
            None => Err(StorageError::StepNotFound(id.to_string())),
        }
    }

    pub async fn find_step(
        &self,
        box_id: &str,
        attempt: i64,
        parent_id: Option<&str>,
        step_key: &str,
    ) -> Result<Option<DeployStep>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM deploy_steps
            WHERE box_id = ?1 AND attempt = ?2 AND COALESCE(parent_id, '') = ?3 AND step_key = ?4
            "#,
            STEP_COLUMNS
        ))
        .bind(box_id)
        .bind(attempt)
        .bind(parent_id.unwrap_or(""))
        .bind(step_key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_step).transpose()
    }

    /// pending -> running. Re-marking a running step (a retry) keeps the original start time.
    /// Returns false when the step is already terminal.
    pub async fn mark_running(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deploy_steps
            SET status = 'running', started_at = COALESCE(started_at, ?1)
            WHERE id = ?2 AND status IN ('pending', 'running')
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// running -> completed
    pub async fn mark_completed(&self, id: &str, metadata: Option<JsonValue>) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        complete_step_on(&mut conn, id, metadata.as_ref()).await
    }

    /// running -> failed
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deploy_steps
            SET status = 'failed', completed_at = ?1, error_message = ?2
            WHERE id = ?3 AND status = 'running'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// pending -> skipped
    pub async fn mark_skipped(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deploy_steps SET status = 'skipped', completed_at = ?1 WHERE id = ?2 AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Skip every step of the attempt that never started
    pub async fn skip_pending(&self, box_id: &str, attempt: i64) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        skip_pending_on(&mut conn, box_id, attempt).await
    }

    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<DeployStep>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM deploy_steps WHERE parent_id = ?1 ORDER BY step_order ASC, created_at ASC",
            STEP_COLUMNS
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_step).collect()
    }

    /// Complete a running group parent once every child is completed or skipped.
    /// Returns true if the parent is completed after the call.
    pub async fn complete_group_if_settled(&self, parent_id: &str) -> Result<bool> {
        let children = self.list_children(parent_id).await?;
        let settled = children.iter().all(|c| c.status.is_settled_ok());

        if settled {
            let metadata = serde_json::json!({ "children": children.len() });
            if self.mark_completed(parent_id, Some(metadata)).await? {
                debug!("Step group {} completed", parent_id);
            }
        }

        Ok(self.get_step(parent_id).await?.status == StepStatus::Completed)
    }

    /// Every step of one attempt, nested as top-level steps with their children
    pub async fn list_by_attempt(&self, box_id: &str, attempt: i64) -> Result<Vec<StepNode>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM deploy_steps
            WHERE box_id = ?1 AND attempt = ?2
            ORDER BY step_order ASC, created_at ASC
            "#,
            STEP_COLUMNS
        ))
        .bind(box_id)
        .bind(attempt)
        .fetch_all(&self.pool)
        .await?;

        let steps = rows
            .iter()
            .map(row_to_step)
            .collect::<Result<Vec<_>>>()?;

        Ok(build_tree(steps))
    }
}

fn build_tree(steps: Vec<DeployStep>) -> Vec<StepNode> {
    let (roots, leaves): (Vec<_>, Vec<_>) = steps.into_iter().partition(|s| s.parent_id.is_none());

    let mut nodes: Vec<StepNode> = roots
        .into_iter()
        .map(|step| StepNode {
            step,
            children: Vec::new(),
        })
        .collect();
    let index: HashMap<String, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.step.id.clone(), i))
        .collect();

    for leaf in leaves {
        match leaf.parent_id.as_ref().and_then(|p| index.get(p)) {
            Some(&i) => nodes[i].children.push(leaf),
            // Deeper nesting is not modelled; surface such rows at the top level
            None => nodes.push(StepNode {
                step: leaf,
                children: Vec::new(),
            }),
        }
    }

    nodes
}

pub(crate) async fn complete_step_on(
    conn: &mut SqliteConnection,
    id: &str,
    metadata: Option<&JsonValue>,
) -> Result<bool> {
    let metadata_json = metadata.map(serde_json::to_string).transpose()?;

    let result = sqlx::query(
        r#"
        UPDATE deploy_steps
        SET status = 'completed', completed_at = ?1, metadata = ?2
        WHERE id = ?3 AND status = 'running'
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(metadata_json)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub(crate) async fn skip_pending_on(
    conn: &mut SqliteConnection,
    box_id: &str,
    attempt: i64,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE deploy_steps SET status = 'skipped', completed_at = ?1
        WHERE box_id = ?2 AND attempt = ?3 AND status = 'pending'
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(box_id)
    .bind(attempt)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

fn row_to_step(row: &SqliteRow) -> Result<DeployStep> {
    let status: String = row.try_get("status")?;
    let metadata: Option<String> = row.try_get("metadata")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(DeployStep {
        id: row.try_get("id")?,
        box_id: row.try_get("box_id")?,
        attempt: row.try_get("attempt")?,
        parent_id: row.try_get("parent_id")?,
        step_key: row.try_get("step_key")?,
        step_order: row.try_get("step_order")?,
        name: row.try_get("name")?,
        status: StepStatus::from_str(&status)?,
        started_at: parse_optional_timestamp(row.try_get("started_at")?)?,
        completed_at: parse_optional_timestamp(row.try_get("completed_at")?)?,
        error_message: row.try_get("error_message")?,
        metadata: metadata
            .map(|m| serde_json::from_str::<JsonValue>(&m))
            .transpose()?,
        created_at: parse_timestamp(&created_at)?,
    })
}

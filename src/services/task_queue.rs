use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// One-shot named tasks. Task names are globally unique, which is what
/// makes the scheduler's next-day self-enqueue idempotent: re-enqueueing
/// an existing name is a soft success, not a duplicate run.
pub struct TaskQueue {
    pool: PgPool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Scheduled,
    AlreadyScheduled,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub task_name: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub fire_at: DateTime<Utc>,
    pub status: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DailyRunPayload {
    pub campaign_id: Uuid,
    pub tenant_id: Uuid,
    pub scheduled_for: NaiveDate,
}

pub const TASK_DAILY_CAMPAIGN_RUN: &str = "daily_campaign_run";

impl TaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(
        &self,
        task_name: &str,
        task_type: &str,
        fire_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Result<EnqueueResult, String> {
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_tasks (id, task_name, task_type, payload, fire_at, status, retry_count, max_retries, created_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, 3, NOW())
            ON CONFLICT (task_name) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(task_name)
        .bind(task_type)
        .bind(&payload)
        .bind(fire_at)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to enqueue task {}: {}", task_name, e))?;

        if result.rows_affected() > 0 {
            Ok(EnqueueResult::Scheduled)
        } else {
            Ok(EnqueueResult::AlreadyScheduled)
        }
    }

    pub async fn enqueue_daily_run(
        &self,
        payload: &DailyRunPayload,
        fire_at: DateTime<Utc>,
    ) -> Result<EnqueueResult, String> {
        let task_name = daily_run_task_name(payload.campaign_id, payload.scheduled_for);
        self.enqueue(
            &task_name,
            TASK_DAILY_CAMPAIGN_RUN,
            fire_at,
            serde_json::to_value(payload).map_err(|e| e.to_string())?,
        )
        .await
    }

    /// Atomically claim due tasks with FOR UPDATE SKIP LOCKED so parallel
    /// workers never double-claim.
    pub async fn claim_due(&self, limit: i64) -> Result<Vec<ScheduledTask>, String> {
        sqlx::query_as::<_, ScheduledTask>(
            r#"
            WITH claimed AS (
                SELECT id FROM scheduled_tasks
                WHERE (status = 'pending' AND fire_at <= NOW())
                   OR (status = 'scheduled' AND next_retry_at <= NOW())
                ORDER BY fire_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE scheduled_tasks
            SET status = 'processing',
                started_at = NOW(),
                retry_count = retry_count + 1
            FROM claimed
            WHERE scheduled_tasks.id = claimed.id
            RETURNING scheduled_tasks.id, scheduled_tasks.task_name, scheduled_tasks.task_type,
                      scheduled_tasks.payload, scheduled_tasks.fire_at, scheduled_tasks.status,
                      scheduled_tasks.retry_count, scheduled_tasks.max_retries, scheduled_tasks.created_at
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| format!("Failed to claim tasks: {}", e))
    }

    pub async fn mark_completed(&self, task_id: Uuid) -> Result<(), String> {
        sqlx::query(
            "UPDATE scheduled_tasks SET status = 'completed', completed_at = NOW() WHERE id = $1",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
    }

    /// Exponential backoff: 5min, 20min, 80min; failed for good after the
    /// retry budget.
    pub async fn mark_failed(&self, task_id: Uuid, error: &str) -> Result<(), String> {
        sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET status = CASE
                    WHEN retry_count >= max_retries THEN 'failed'
                    ELSE 'scheduled'
                END,
                error = $2,
                next_retry_at = CASE
                    WHEN retry_count < max_retries
                    THEN NOW() + interval '5 minutes' * POWER(2, retry_count)
                    ELSE NULL
                END
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
    }
}

pub fn daily_run_task_name(campaign_id: Uuid, scheduled_for: NaiveDate) -> String {
    format!("daily-campaign-{}-{}", campaign_id, scheduled_for)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_name_is_stable_per_campaign_day() {
        let id = Uuid::parse_str("3fa85f64-5717-4562-b3fc-2c963f66afa6").unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();
        assert_eq!(
            daily_run_task_name(id, day),
            "daily-campaign-3fa85f64-5717-4562-b3fc-2c963f66afa6-2024-06-02"
        );
        // Same inputs, same name: the unique index makes re-enqueue a no-op.
        assert_eq!(daily_run_task_name(id, day), daily_run_task_name(id, day));
    }
}

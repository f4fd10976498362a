use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::activity::{Activity, ActivityStatus, NewActivity};

/// Append-only execution ledger. The partial unique index on
/// (campaign_lead_id, step_id) over the terminal-success statuses is the
/// authority for the one-success-per-step invariant; this service surfaces
/// conflicts instead of swallowing them.
pub struct ActivityLedger {
    pool: PgPool,
}

impl ActivityLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, activity: &NewActivity) -> Result<Uuid, String> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO campaign_lead_activities
                (id, tenant_id, campaign_id, campaign_lead_id, step_id, step_type,
                 action_type, channel, status, message_content, error_message, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            "#,
        )
        .bind(id)
        .bind(activity.tenant_id)
        .bind(activity.campaign_id)
        .bind(activity.campaign_lead_id)
        .bind(activity.step_id)
        .bind(&activity.step_type)
        .bind(&activity.action_type)
        .bind(&activity.channel)
        .bind(activity.status.as_str())
        .bind(&activity.message_content)
        .bind(&activity.error_message)
        .bind(&activity.metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to record activity: {}", e))?;

        Ok(id)
    }

    /// Promote a previously recorded activity. A unique-violation here means
    /// another writer already landed the terminal success for this step; the
    /// promotion is then redundant, not an error.
    pub async fn promote(
        &self,
        activity_id: Uuid,
        status: ActivityStatus,
        error_message: Option<&str>,
    ) -> Result<(), String> {
        let result = sqlx::query(
            "UPDATE campaign_lead_activities SET status = $1, error_message = COALESCE($2, error_message) WHERE id = $3",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(activity_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(()),
            Err(e) => Err(format!("Failed to promote activity {}: {}", activity_id, e)),
        }
    }

    /// Merge a JSON patch into an activity's metadata (dispatch details:
    /// account used, strategy, provider ids).
    pub async fn attach_metadata(
        &self,
        activity_id: Uuid,
        patch: serde_json::Value,
    ) -> Result<(), String> {
        sqlx::query(
            "UPDATE campaign_lead_activities SET metadata = metadata || $1 WHERE id = $2",
        )
        .bind(&patch)
        .bind(activity_id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| format!("Failed to attach metadata to {}: {}", activity_id, e))
    }

    pub async fn latest_success_for_lead(
        &self,
        campaign_lead_id: Uuid,
    ) -> Result<Option<Activity>, String> {
        sqlx::query_as::<_, Activity>(
            r#"
            SELECT * FROM campaign_lead_activities
            WHERE campaign_lead_id = $1 AND status IN ('delivered', 'connected', 'replied')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(campaign_lead_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| format!("DB error: {}", e))
    }

    pub async fn latest_success(
        &self,
        campaign_lead_id: Uuid,
        step_id: Uuid,
    ) -> Result<Option<Activity>, String> {
        sqlx::query_as::<_, Activity>(
            r#"
            SELECT * FROM campaign_lead_activities
            WHERE campaign_lead_id = $1 AND step_id = $2
              AND status IN ('delivered', 'connected', 'replied')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(campaign_lead_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| format!("DB error: {}", e))
    }

    pub async fn has_terminal_success(
        &self,
        campaign_lead_id: Uuid,
        step_id: Uuid,
    ) -> Result<bool, String> {
        Ok(self.latest_success(campaign_lead_id, step_id).await?.is_some())
    }

    /// Lead has any activity with the given status (condition evaluation).
    pub async fn lead_has_status(
        &self,
        campaign_lead_id: Uuid,
        status: ActivityStatus,
    ) -> Result<bool, String> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM campaign_lead_activities WHERE campaign_lead_id = $1 AND status = $2",
        )
        .bind(campaign_lead_id)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| format!("DB error: {}", e))?;
        Ok(count > 0)
    }

    pub async fn count_by_tenant_and_status(
        &self,
        tenant_id: Uuid,
        step_type: &str,
        statuses: &[&str],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64, String> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM campaign_lead_activities
            WHERE tenant_id = $1 AND step_type = $2 AND status = ANY($3)
              AND created_at >= $4 AND created_at < $5
            "#,
        )
        .bind(tenant_id)
        .bind(step_type)
        .bind(&statuses)
        .bind(since)
        .bind(until)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| format!("DB error: {}", e))
    }

    pub async fn count_for_step(
        &self,
        campaign_id: Uuid,
        step_id: Uuid,
        status: ActivityStatus,
    ) -> Result<i64, String> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM campaign_lead_activities WHERE campaign_id = $1 AND step_id = $2 AND status = $3",
        )
        .bind(campaign_id)
        .bind(step_id)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| format!("DB error: {}", e))
    }
}

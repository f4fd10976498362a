use chrono::{NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use rand::Rng;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::campaign::{Campaign, CampaignStatus};
use crate::models::step::{Step, StepType};
use crate::services::context::AppContext;
use crate::services::lead_sourcer::LeadSourcer;
use crate::services::task_queue::DailyRunPayload;
use crate::services::workflow::{LeadOutcome, WorkflowDriver};

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Skipped { reason: String },
    CampaignEnded,
    Completed { sourced: i64, leads_processed: i64, leads_stopped: i64 },
}

/// One campaign-day execution: single-run-per-day gate under a row lock,
/// sourcing, per-lead workflow advancement, and the next-day self-enqueue.
pub struct DailyScheduler<'a> {
    ctx: &'a AppContext,
}

impl<'a> DailyScheduler<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    fn pool(&self) -> &PgPool {
        &self.ctx.pool
    }

    pub async fn run_daily(
        &self,
        campaign_id: Uuid,
        tenant_id: Uuid,
        scheduled_for: NaiveDate,
    ) -> Result<RunOutcome, String> {
        let tz = self.ctx.tenant_timezone(tenant_id).await;
        let today = Utc::now().with_timezone(&tz).date_naive();

        // The claim phase holds the row lock just long enough to settle
        // eligibility and stamp last_run_date; provider work happens after
        // commit so a slow run never blocks the campaign row.
        let campaign = match self.claim_run(campaign_id, tenant_id, today).await? {
            ClaimResult::Skipped(reason) => {
                self.log_execution(campaign_id, scheduled_for, "skipped", &reason).await;
                return Ok(RunOutcome::Skipped { reason });
            }
            ClaimResult::Ended => {
                self.log_execution(campaign_id, scheduled_for, "completed", "campaign end date passed")
                    .await;
                self.ctx.events.campaigns_list_updated(tenant_id).await;
                return Ok(RunOutcome::CampaignEnded);
            }
            ClaimResult::Claimed(campaign) => campaign,
        };

        match self.execute_run(&campaign).await {
            Ok((sourced, processed, stopped)) => {
                self.log_execution(
                    campaign.id,
                    scheduled_for,
                    "completed",
                    &format!("sourced={} processed={} stopped={}", sourced, processed, stopped),
                )
                .await;

                self.enqueue_next_run(&campaign, tz, today).await?;
                self.publish_stats(&campaign).await;

                Ok(RunOutcome::Completed {
                    sourced,
                    leads_processed: processed,
                    leads_stopped: stopped,
                })
            }
            Err(e) => {
                // Recorded, then re-raised so the task queue retries with
                // its own backoff policy.
                error!("Daily run for campaign {} failed: {}", campaign.id, e);
                self.log_execution(campaign.id, scheduled_for, "failed", &e).await;
                // Tomorrow's task still gets enqueued: a failed day must
                // not end the campaign's schedule.
                self.enqueue_next_run(&campaign, tz, today).await?;
                Err(e)
            }
        }
    }

    async fn claim_run(
        &self,
        campaign_id: Uuid,
        tenant_id: Uuid,
        today: NaiveDate,
    ) -> Result<ClaimResult, String> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| format!("Failed to open transaction: {}", e))?;

        let campaign = sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE id = $1 AND tenant_id = $2 FOR UPDATE SKIP LOCKED",
        )
        .bind(campaign_id)
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| format!("Failed to lock campaign: {}", e))?;

        let campaign = match campaign {
            Some(campaign) => campaign,
            None => return Ok(ClaimResult::Skipped("campaign not found or busy".to_string())),
        };

        if campaign.is_deleted {
            return Ok(ClaimResult::Skipped("campaign deleted".to_string()));
        }
        if CampaignStatus::parse(&campaign.status) != Some(CampaignStatus::Running) {
            return Ok(ClaimResult::Skipped(format!("campaign status {}", campaign.status)));
        }
        if campaign.last_run_date == Some(today) {
            return Ok(ClaimResult::Skipped("already_ran_today".to_string()));
        }

        let config = crate::models::campaign::CampaignConfig::from_value(&campaign.config);
        if config.end_date.map_or(false, |end| end < today) {
            sqlx::query("UPDATE campaigns SET status = 'completed', updated_at = NOW() WHERE id = $1")
                .bind(campaign.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| format!("Failed to complete campaign: {}", e))?;
            tx.commit().await.map_err(|e| e.to_string())?;
            return Ok(ClaimResult::Ended);
        }

        // Stamped while the lock is held: a second worker claiming this
        // campaign today sees already_ran_today.
        sqlx::query("UPDATE campaigns SET last_run_date = $1, updated_at = NOW() WHERE id = $2")
            .bind(today)
            .bind(campaign.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| format!("Failed to stamp last_run_date: {}", e))?;

        tx.commit().await.map_err(|e| e.to_string())?;
        Ok(ClaimResult::Claimed(campaign))
    }

    async fn execute_run(&self, campaign: &Campaign) -> Result<(i64, i64, i64), String> {
        let steps = load_steps(self.pool(), campaign.id).await?;

        let mut sourced = 0i64;
        if let Some(step) = steps
            .iter()
            .find(|s| s.kind() == Some(StepType::LeadGeneration))
        {
            let sourcer = LeadSourcer::new(self.ctx);
            match sourcer.run(campaign, step).await {
                Ok(outcome) if !outcome.skipped => sourced = outcome.inserted,
                Ok(_) => {}
                Err(e) => warn!("Lead sourcing failed for campaign {}: {}", campaign.id, e),
            }
        }

        let lead_ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM campaign_leads WHERE campaign_id = $1 AND status = 'active' ORDER BY created_at ASC",
        )
        .bind(campaign.id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| format!("Failed to list active leads: {}", e))?;

        let driver = WorkflowDriver::new(self.ctx);
        let mut processed = 0i64;
        let mut stopped = 0i64;
        let mut internal_errors = 0i64;

        for lead_id in lead_ids {
            match driver.advance_lead(campaign, &steps, lead_id).await {
                Ok(LeadOutcome::Stopped { .. }) => {
                    processed += 1;
                    stopped += 1;
                }
                Ok(_) => processed += 1,
                Err(e) => {
                    internal_errors += 1;
                    error!("Lead {} crashed mid-advance: {}", lead_id, e);
                }
            }
        }

        if internal_errors > 0 {
            return Err(format!(
                "{} of {} leads crashed during the run",
                internal_errors, processed + internal_errors
            ));
        }
        Ok((sourced, processed, stopped))
    }

    /// Tomorrow at local midnight, with a small jitter so a fleet of
    /// campaigns in one timezone does not stampede the providers.
    async fn enqueue_next_run(&self, campaign: &Campaign, tz: Tz, today: NaiveDate) -> Result<(), String> {
        let tomorrow = match today.succ_opt() {
            Some(day) => day,
            None => return Ok(()),
        };

        let config = crate::models::campaign::CampaignConfig::from_value(&campaign.config);
        if config.end_date.map_or(false, |end| end < tomorrow) {
            info!("Campaign {} reaches its end date, not rescheduling", campaign.id);
            return Ok(());
        }

        let jitter_minutes = rand::thread_rng().gen_range(0..30u32);
        let fire_at = tz
            .from_local_datetime(&tomorrow.and_hms_opt(0, 0, 0).unwrap())
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(24))
            + chrono::Duration::minutes(jitter_minutes as i64);

        let payload = DailyRunPayload {
            campaign_id: campaign.id,
            tenant_id: campaign.tenant_id,
            scheduled_for: tomorrow,
        };
        // AlreadyScheduled is a soft success: the task name is unique per
        // campaign-day.
        self.ctx.tasks().enqueue_daily_run(&payload, fire_at).await.map(|_| ())
    }

    async fn publish_stats(&self, campaign: &Campaign) {
        self.ctx.events.campaigns_list_updated(campaign.tenant_id).await;
        self.ctx
            .events
            .campaign_stats_updated(campaign.id, serde_json::json!({ "reason": "daily_run" }))
            .await;
    }

    async fn log_execution(&self, campaign_id: Uuid, scheduled_for: NaiveDate, status: &str, detail: &str) {
        let result = sqlx::query(
            r#"
            INSERT INTO campaign_execution_log (id, campaign_id, scheduled_for, status, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(campaign_id)
        .bind(scheduled_for)
        .bind(status)
        .bind(detail)
        .execute(self.pool())
        .await;

        if let Err(e) = result {
            warn!("Failed to write execution log for campaign {}: {}", campaign_id, e);
        }
    }
}

enum ClaimResult {
    Skipped(String),
    Ended,
    Claimed(Campaign),
}

pub async fn load_steps(pool: &PgPool, campaign_id: Uuid) -> Result<Vec<Step>, String> {
    sqlx::query_as::<_, Step>(
        "SELECT * FROM campaign_steps WHERE campaign_id = $1 ORDER BY step_order ASC",
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await
    .map_err(|e| format!("Failed to load steps: {}", e))
}

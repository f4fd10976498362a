use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::activity::{Activity, ActivityStatus, NewActivity};
use crate::models::campaign::Campaign;
use crate::models::lead::{CampaignLead, LeadStatus};
use crate::models::step::{Step, StepType};
use crate::services::context::AppContext;
use crate::services::step_executor::{ExecOutcome, StepExecutor};
use crate::services::step_validator::{delay_duration, validate_step, ConditionType};

/// Where a lead ended up after one advancement pass.
#[derive(Debug, Clone, PartialEq)]
pub enum LeadOutcome {
    Completed,
    Stopped { reason: String },
    Waiting { reason: String },
    Advanced,
    AlreadyTerminal,
}

/// Per-lead state machine. The cursor is implicit: it is re-derived from
/// the latest terminal-success activity on every pass, so repeated passes
/// without new provider events are no-ops.
pub struct WorkflowDriver<'a> {
    ctx: &'a AppContext,
}

impl<'a> WorkflowDriver<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    fn pool(&self) -> &PgPool {
        &self.ctx.pool
    }

    pub async fn advance_lead(
        &self,
        campaign: &Campaign,
        steps: &[Step],
        lead_id: Uuid,
    ) -> Result<LeadOutcome, String> {
        let ledger = self.ctx.ledger();

        let lead = match self.load_lead(lead_id).await? {
            Some(lead) => lead,
            None => return Err(format!("Lead {} disappeared mid-run", lead_id)),
        };
        if lead.status != LeadStatus::Active.as_str() {
            return Ok(LeadOutcome::AlreadyTerminal);
        }

        let last_success = ledger.latest_success_for_lead(lead.id).await?;
        // The delay gate measures from whatever success preceded it; a
        // fresh lead measures from its own creation.
        let mut anchor = last_success
            .as_ref()
            .map(|a| a.created_at)
            .unwrap_or(lead.created_at);
        let mut idx = next_step_index(steps, last_success.as_ref());

        while let Some(step) = steps.get(idx) {
            // Idempotency: a step that already has a terminal success is
            // skipped, never re-executed.
            if let Some(existing) = ledger.latest_success(lead.id, step.id).await? {
                anchor = existing.created_at;
                self.set_cursor(&lead, step.step_order + 1).await?;
                idx += 1;
                continue;
            }

            let kind = step.kind();

            // Synthetic markers and the campaign-level sourcing step carry
            // no per-lead work; they are scanned over in place.
            if matches!(kind, Some(StepType::Start) | Some(StepType::LeadGeneration)) {
                self.set_cursor(&lead, step.step_order + 1).await?;
                idx += 1;
                continue;
            }
            if kind == Some(StepType::End) {
                self.complete_lead(&lead).await?;
                return Ok(LeadOutcome::Completed);
            }

            let validation = validate_step(step);
            if !validation.valid {
                let error = validation
                    .error
                    .unwrap_or_else(|| format!("Step {} failed validation", step.step_type));
                self.record_step_error(campaign, step, &lead, &error).await?;
                self.stop_lead(&lead, &error).await?;
                return Ok(LeadOutcome::Stopped { reason: error });
            }

            match kind {
                Some(StepType::Delay) => {
                    let wait = delay_duration(&step.config)
                        .ok_or_else(|| "Delay step passed validation without a duration".to_string())?;
                    let gate_time = anchor + wait;
                    if Utc::now() < gate_time {
                        return Ok(LeadOutcome::Waiting {
                            reason: format!("delay_until_{}", gate_time.to_rfc3339()),
                        });
                    }
                    // An elapsed delay is a success; its row anchors any
                    // following delay at the gate-passing time.
                    self.pass_through(&lead, step).await?;
                    anchor = Utc::now();
                    idx += 1;
                }
                Some(StepType::Condition) => {
                    if self.condition_met(&lead, step).await? {
                        self.pass_through(&lead, step).await?;
                        anchor = Utc::now();
                        idx += 1;
                    } else {
                        let reason = format!(
                            "condition_{}_not_met",
                            step.config.get("conditionType").and_then(|v| v.as_str()).unwrap_or("unknown")
                        );
                        self.stop_lead(&lead, &reason).await?;
                        return Ok(LeadOutcome::Stopped { reason });
                    }
                }
                _ => {
                    let executor = StepExecutor::new(self.ctx);
                    let outcome = executor.execute(campaign, step, &lead).await?;
                    match outcome {
                        ExecOutcome::Success { .. } => {
                            // One provider action per pass: the next
                            // invocation re-reads the ledger and picks the
                            // successor.
                            self.set_cursor(&lead, step.step_order + 1).await?;
                            info!("Lead {} advanced through step {}", lead.id, step.step_type);
                            return Ok(LeadOutcome::Advanced);
                        }
                        ExecOutcome::Skipped { reason } => {
                            return Ok(LeadOutcome::Waiting { reason });
                        }
                        ExecOutcome::ValidationFailed { error } => {
                            self.stop_lead(&lead, &error).await?;
                            return Ok(LeadOutcome::Stopped { reason: error });
                        }
                        ExecOutcome::Failed { kind, message } => {
                            if kind.stops_lead() {
                                let reason = format!("{}: {}", kind.as_str(), message);
                                self.stop_lead(&lead, &reason).await?;
                                return Ok(LeadOutcome::Stopped { reason });
                            }
                            // Transient: the lead stays active and the next
                            // daily run retries the same step.
                            return Ok(LeadOutcome::Waiting {
                                reason: format!("retry: {}", message),
                            });
                        }
                    }
                }
            }
        }

        // Workflow exhausted.
        self.complete_lead(&lead).await?;
        Ok(LeadOutcome::Completed)
    }

    /// Gate and synthetic steps succeed without a provider call; the
    /// delivered row anchors the cursor past them.
    async fn pass_through(&self, lead: &CampaignLead, step: &Step) -> Result<(), String> {
        let kind = step.kind().map(|k| k.channel()).unwrap_or("system");
        let activity = NewActivity::for_step(
            lead.tenant_id,
            lead.campaign_id,
            lead.id,
            step.id,
            &step.step_type,
            kind,
            ActivityStatus::Delivered,
        );
        match self.ctx.ledger().record(&activity).await {
            Ok(_) => {}
            // A concurrent pass already anchored this step.
            Err(e) if e.contains("duplicate key") => {}
            Err(e) => return Err(e),
        }
        self.set_cursor(lead, step.step_order + 1).await
    }

    async fn condition_met(&self, lead: &CampaignLead, step: &Step) -> Result<bool, String> {
        let condition = step
            .config
            .get("conditionType")
            .and_then(|v| v.as_str())
            .and_then(ConditionType::parse)
            .ok_or_else(|| "Condition step passed validation without a type".to_string())?;

        let ledger = self.ctx.ledger();
        let status = match condition {
            ConditionType::Connected => ActivityStatus::Connected,
            ConditionType::Replied => ActivityStatus::Replied,
            ConditionType::Opened => ActivityStatus::Opened,
        };
        ledger.lead_has_status(lead.id, status).await
    }

    async fn load_lead(&self, lead_id: Uuid) -> Result<Option<CampaignLead>, String> {
        sqlx::query_as::<_, CampaignLead>("SELECT * FROM campaign_leads WHERE id = $1")
            .bind(lead_id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| format!("DB error: {}", e))
    }

    async fn set_cursor(&self, lead: &CampaignLead, step_order: i32) -> Result<(), String> {
        sqlx::query(
            "UPDATE campaign_leads SET current_step_order = GREATEST(current_step_order, $1), updated_at = NOW() WHERE id = $2",
        )
        .bind(step_order)
        .bind(lead.id)
        .execute(self.pool())
        .await
        .map(|_| ())
        .map_err(|e| format!("Failed to move cursor for lead {}: {}", lead.id, e))
    }

    async fn complete_lead(&self, lead: &CampaignLead) -> Result<(), String> {
        self.transition(lead, LeadStatus::Completed).await?;
        info!("Lead {} completed its workflow", lead.id);
        Ok(())
    }

    async fn stop_lead(&self, lead: &CampaignLead, reason: &str) -> Result<(), String> {
        self.transition(lead, LeadStatus::Stopped).await?;
        warn!("Lead {} stopped: {}", lead.id, reason);
        Ok(())
    }

    /// Terminal statuses are absorbing: the guard keeps a stale pass from
    /// resurrecting a lead another writer already settled.
    async fn transition(&self, lead: &CampaignLead, to: LeadStatus) -> Result<(), String> {
        sqlx::query(
            "UPDATE campaign_leads SET status = $1, updated_at = NOW() WHERE id = $2 AND status = 'active'",
        )
        .bind(to.as_str())
        .bind(lead.id)
        .execute(self.pool())
        .await
        .map(|_| ())
        .map_err(|e| format!("Failed to transition lead {}: {}", lead.id, e))
    }

    async fn record_step_error(
        &self,
        campaign: &Campaign,
        step: &Step,
        lead: &CampaignLead,
        error: &str,
    ) -> Result<(), String> {
        let activity = NewActivity::for_step(
            lead.tenant_id,
            campaign.id,
            lead.id,
            step.id,
            &step.step_type,
            step.kind().map(|k| k.channel()).unwrap_or("system"),
            ActivityStatus::Error,
        )
        .with_error(error);
        self.ctx.ledger().record(&activity).await.map(|_| ())
    }
}

/// The implicit cursor: index right after the step of the latest terminal
/// success, or 0 for a fresh lead. Activities whose step no longer exists
/// (list was replaced) restart the scan from the top; the per-step
/// terminal-success check keeps that from re-executing anything.
pub fn next_step_index(steps: &[Step], last_success: Option<&Activity>) -> usize {
    match last_success {
        None => 0,
        Some(activity) => match activity.step_id {
            None => 0,
            Some(step_id) => steps
                .iter()
                .position(|s| s.id == step_id)
                .map(|i| i + 1)
                .unwrap_or(0),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn step(order: i32, step_type: &str) -> Step {
        Step {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            step_order: order,
            step_type: step_type.to_string(),
            title: None,
            config: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    fn success_for(step: &Step) -> Activity {
        Activity {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            campaign_id: step.campaign_id,
            campaign_lead_id: Uuid::new_v4(),
            step_id: Some(step.id),
            step_type: step.step_type.clone(),
            action_type: step.step_type.clone(),
            channel: "linkedin".into(),
            status: "delivered".into(),
            message_content: None,
            error_message: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_fresh_lead_starts_at_zero() {
        let steps = vec![step(0, "start"), step(1, "linkedin_visit")];
        assert_eq!(next_step_index(&steps, None), 0);
    }

    #[test]
    fn test_cursor_lands_after_latest_success() {
        let steps = vec![step(0, "start"), step(1, "linkedin_visit"), step(2, "linkedin_connect")];
        let activity = success_for(&steps[1]);
        assert_eq!(next_step_index(&steps, Some(&activity)), 2);
    }

    #[test]
    fn test_cursor_past_last_step_means_done() {
        let steps = vec![step(0, "linkedin_visit")];
        let activity = success_for(&steps[0]);
        assert_eq!(next_step_index(&steps, Some(&activity)), 1);
    }

    #[test]
    fn test_vanished_step_restarts_scan() {
        let steps = vec![step(0, "linkedin_visit")];
        let mut activity = success_for(&steps[0]);
        activity.step_id = Some(Uuid::new_v4());
        assert_eq!(next_step_index(&steps, Some(&activity)), 0);
    }
}

use std::collections::HashMap;
use std::time::Duration;

use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::account::ProviderAccount;
use crate::models::invitation::{InvitationStatus, InvitationTrack};
use crate::models::lead::CampaignLead;
use crate::services::context::AppContext;
use crate::services::unipile_connector::extract_public_id;

/// Inter-tenant pacing so the sweep never bursts the provider.
const INTER_TENANT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Clone, Copy)]
pub struct PollSummary {
    pub tenants_polled: usize,
    pub accepted: i64,
    pub declined: i64,
}

/// Cron-driven reconciler: walks tenants with active LinkedIn accounts and
/// live campaigns, compares the provider's sent-invitation list against the
/// local invitation tracks, and promotes connect activities on acceptance.
pub struct InvitationPoller<'a> {
    ctx: &'a AppContext,
}

impl<'a> InvitationPoller<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    fn pool(&self) -> &PgPool {
        &self.ctx.pool
    }

    pub async fn run_once(&self) -> Result<PollSummary, String> {
        let tenants: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT la.tenant_id FROM linkedin_accounts la
            WHERE la.provider = 'linkedin' AND la.status = 'active'
              AND EXISTS (
                  SELECT 1 FROM campaigns c
                  WHERE c.tenant_id = la.tenant_id
                    AND c.status IN ('running', 'active', 'paused')
                    AND NOT c.is_deleted
              )
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| format!("Failed to list pollable tenants: {}", e))?;

        let mut summary = PollSummary::default();
        for (i, tenant_id) in tenants.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(INTER_TENANT_DELAY).await;
            }
            match self.poll_tenant(*tenant_id).await {
                Ok((accepted, declined)) => {
                    summary.tenants_polled += 1;
                    summary.accepted += accepted;
                    summary.declined += declined;
                }
                Err(e) => warn!("Invitation poll failed for tenant {}: {}", tenant_id, e),
            }
        }

        info!(
            "Invitation poll finished: {} tenants, {} accepted, {} declined",
            summary.tenants_polled, summary.accepted, summary.declined
        );
        Ok(summary)
    }

    async fn poll_tenant(&self, tenant_id: Uuid) -> Result<(i64, i64), String> {
        let accounts = sqlx::query_as::<_, ProviderAccount>(
            r#"
            SELECT * FROM linkedin_accounts
            WHERE tenant_id = $1 AND provider = 'linkedin' AND status = 'active'
            ORDER BY created_at DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| format!("DB error: {}", e))?;

        let Some(primary) = accounts.first() else {
            return Ok((0, 0));
        };

        // The provider only lists invitations still awaiting an answer, so
        // "still listed" means pending and "gone" needs a relation check.
        let mut still_pending: HashMap<String, String> = HashMap::new();
        for account in &accounts {
            match self.ctx.unipile.list_sent_invitations(&account.external_account_id).await {
                Ok(items) => {
                    for item in items {
                        let status = item.status.unwrap_or_else(|| "pending".to_string());
                        still_pending.insert(item.id, status);
                    }
                }
                Err(e) => warn!("Invitation list failed for account {}: {}", account.id, e),
            }
        }

        let tracks = sqlx::query_as::<_, InvitationTrack>(
            r#"
            SELECT * FROM invitation_tracks
            WHERE tenant_id = $1 AND last_seen_status IN ('pending', 'unknown')
              AND sent_at > NOW() - INTERVAL '30 days'
            "#,
        )
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| format!("DB error: {}", e))?;

        let mut accepted = 0i64;
        let mut declined = 0i64;

        for track in tracks {
            let observed = match track
                .external_invitation_id
                .as_deref()
                .and_then(|id| still_pending.get(id))
            {
                Some(status) => InvitationStatus::parse(status),
                None => self.confirm_by_relation(&track, primary).await,
            };

            let current = InvitationStatus::parse(&track.last_seen_status);
            if observed == current || observed == InvitationStatus::Unknown {
                continue;
            }

            self.update_track(&track, observed).await?;
            match observed {
                InvitationStatus::Accepted => {
                    self.promote_connect(&track, "connected", None).await?;
                    self.ctx
                        .events
                        .campaign_stats_updated(
                            track.campaign_id,
                            serde_json::json!({
                                "reason": "invitation_accepted",
                                "campaign_lead_id": track.campaign_lead_id,
                            }),
                        )
                        .await;
                    accepted += 1;
                }
                InvitationStatus::Declined | InvitationStatus::Withdrawn => {
                    self.promote_connect(&track, "error", Some("invitation_declined")).await?;
                    declined += 1;
                }
                _ => {}
            }
        }

        Ok((accepted, declined))
    }

    /// An invitation gone from the sent list was answered; a first-degree
    /// relation means it was accepted. An unreachable profile leaves the
    /// track untouched for the next sweep.
    async fn confirm_by_relation(
        &self,
        track: &InvitationTrack,
        account: &ProviderAccount,
    ) -> InvitationStatus {
        let lead = sqlx::query_as::<_, CampaignLead>("SELECT * FROM campaign_leads WHERE id = $1")
            .bind(track.campaign_lead_id)
            .fetch_optional(self.pool())
            .await
            .ok()
            .flatten();

        let public_id = lead
            .as_ref()
            .and_then(|l| l.linkedin_url())
            .as_deref()
            .and_then(extract_public_id);

        let Some(public_id) = public_id else {
            return InvitationStatus::Unknown;
        };

        let outcome = self
            .ctx
            .unipile
            .lookup(&public_id, &account.external_account_id)
            .await;
        if !outcome.success {
            return InvitationStatus::Unknown;
        }

        let distance = outcome
            .data
            .as_ref()
            .and_then(|d| d.get("network_distance"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_uppercase();

        match distance.as_str() {
            "FIRST" | "FIRST_DEGREE" | "DISTANCE_1" | "1ST" => InvitationStatus::Accepted,
            "SECOND" | "DISTANCE_2" | "THIRD" | "DISTANCE_3" | "OUT_OF_NETWORK" => {
                InvitationStatus::Declined
            }
            _ => InvitationStatus::Unknown,
        }
    }

    async fn update_track(&self, track: &InvitationTrack, status: InvitationStatus) -> Result<(), String> {
        sqlx::query(
            "UPDATE invitation_tracks SET last_seen_status = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(status.as_str())
        .bind(track.id)
        .execute(self.pool())
        .await
        .map(|_| ())
        .map_err(|e| format!("Failed to update invitation track {}: {}", track.id, e))
    }

    /// Settle the connect activity for this lead: delivered → connected on
    /// acceptance, delivered → error on decline/withdrawal.
    async fn promote_connect(
        &self,
        track: &InvitationTrack,
        status: &str,
        error: Option<&str>,
    ) -> Result<(), String> {
        sqlx::query(
            r#"
            UPDATE campaign_lead_activities
            SET status = $1, error_message = COALESCE($2, error_message)
            WHERE campaign_lead_id = $3 AND step_type = 'linkedin_connect' AND status = 'delivered'
            "#,
        )
        .bind(status)
        .bind(error)
        .bind(track.campaign_lead_id)
        .execute(self.pool())
        .await
        .map(|_| ())
        .map_err(|e| {
            format!(
                "Failed to promote connect activity for lead {}: {}",
                track.campaign_lead_id, e
            )
        })
    }
}

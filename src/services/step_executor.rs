use std::time::Duration;

use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::activity::{ActivityStatus, NewActivity};
use crate::models::campaign::{Campaign, CampaignConfig};
use crate::models::invitation::InvitationStatus;
use crate::models::lead::{CampaignLead, LeadSnapshot};
use crate::models::step::{Step, StepType};
use crate::services::account_pool::ReconnectOutcome;
use crate::services::context::AppContext;
use crate::services::provider::{ErrorCategory, ProviderOutcome};
use crate::services::quota::QuotaScope;
use crate::services::step_validator::{substitute_variables, validate_step};
use crate::services::unipile_connector::extract_public_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteStrategy {
    WithMessage,
    WithoutMessage,
    FallbackToWithoutMessage,
}

impl InviteStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            InviteStrategy::WithMessage => "with_message",
            InviteStrategy::WithoutMessage => "without_message",
            InviteStrategy::FallbackToWithoutMessage => "fallback_to_without_message",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    DailyQuota,
    WeeklyQuota,
    NoValidAccounts,
    WeeklyInviteLimit,
    MissingContactData,
    Transient,
}

impl FailureKind {
    /// Failures that cannot resolve by retrying on a later daily run.
    pub fn stops_lead(&self) -> bool {
        matches!(
            self,
            FailureKind::DailyQuota
                | FailureKind::WeeklyQuota
                | FailureKind::NoValidAccounts
                | FailureKind::WeeklyInviteLimit
                | FailureKind::MissingContactData
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::DailyQuota => "quota.daily",
            FailureKind::WeeklyQuota => "quota.weekly",
            FailureKind::NoValidAccounts => "no_valid_accounts",
            FailureKind::WeeklyInviteLimit => "weekly_limit",
            FailureKind::MissingContactData => "missing_contact_data",
            FailureKind::Transient => "transient",
        }
    }
}

#[derive(Debug)]
pub enum ExecOutcome {
    Success { strategy: Option<InviteStrategy> },
    Skipped { reason: String },
    ValidationFailed { error: String },
    Failed { kind: FailureKind, message: String },
}

/// Executes one (step, lead) pair: validates, appends the ledger rows,
/// dispatches to the owning provider, and settles the ledger row with the
/// outcome. Gate steps (delay/condition) and synthetic steps never reach
/// this service.
pub struct StepExecutor<'a> {
    ctx: &'a AppContext,
}

impl<'a> StepExecutor<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    fn pool(&self) -> &PgPool {
        &self.ctx.pool
    }

    pub async fn execute(
        &self,
        campaign: &Campaign,
        step: &Step,
        lead: &CampaignLead,
    ) -> Result<ExecOutcome, String> {
        let kind = match step.kind() {
            Some(kind) => kind,
            None => {
                let error = format!("Unknown step type {}", step.step_type);
                self.record_error(campaign, step, lead, &error).await?;
                return Ok(ExecOutcome::ValidationFailed { error });
            }
        };

        let validation = validate_step(step);
        if !validation.valid {
            let error = validation
                .error
                .unwrap_or_else(|| format!("Step {} failed validation", step.step_type));
            self.record_error(campaign, step, lead, &error).await?;
            return Ok(ExecOutcome::ValidationFailed { error });
        }

        // The quota gate runs before the sent row lands: a refused attempt
        // must neither contact the provider nor count toward the window.
        if kind == StepType::LinkedinConnect {
            if let Some(refusal) = self.check_connect_quota(lead).await {
                if let ExecOutcome::Failed { kind: fk, message } = &refusal {
                    let detail = format!("{}: {}", fk.as_str(), message);
                    self.record_error(campaign, step, lead, &detail).await?;
                }
                return Ok(refusal);
            }
        }

        let ledger = self.ctx.ledger();
        let mut sent = NewActivity::for_step(
            lead.tenant_id,
            campaign.id,
            lead.id,
            step.id,
            kind.as_str(),
            kind.channel(),
            ActivityStatus::Sent,
        );
        if let Some(preview) = message_preview(kind, step, lead) {
            sent = sent.with_message(preview);
        }
        let sent_id = ledger.record(&sent).await?;

        let outcome = self.dispatch(campaign, step, kind, lead, sent_id).await?;

        match &outcome {
            ExecOutcome::Success { strategy } => {
                if let Some(strategy) = strategy {
                    ledger
                        .attach_metadata(sent_id, serde_json::json!({ "strategy": strategy.as_str() }))
                        .await?;
                }
                // linkedin_connect stays delivered until the poller observes
                // acceptance; linkedin_message stays delivered until the
                // inbound webhook observes a reply.
                ledger.promote(sent_id, ActivityStatus::Delivered, None).await?;
            }
            ExecOutcome::Skipped { reason } => {
                ledger
                    .promote(sent_id, ActivityStatus::Skipped, Some(reason))
                    .await?;
            }
            ExecOutcome::Failed { kind, message } => {
                let detail = format!("{}: {}", kind.as_str(), message);
                ledger
                    .promote(sent_id, ActivityStatus::Error, Some(&detail))
                    .await?;
            }
            ExecOutcome::ValidationFailed { .. } => {}
        }

        Ok(outcome)
    }

    async fn dispatch(
        &self,
        campaign: &Campaign,
        step: &Step,
        kind: StepType,
        lead: &CampaignLead,
        sent_id: Uuid,
    ) -> Result<ExecOutcome, String> {
        match kind {
            StepType::LinkedinVisit => self.execute_visit(lead).await,
            StepType::LinkedinConnect => self.execute_connect(campaign, step, lead, sent_id).await,
            StepType::LinkedinMessage => self.execute_message(step, lead).await,
            StepType::LinkedinFollow => self.execute_follow(lead).await,
            StepType::EmailSend | StepType::EmailFollowup => self.execute_email(step, lead).await,
            StepType::WhatsappSend => self.execute_whatsapp(step, lead).await,
            StepType::InstagramDm => self.execute_instagram(step, lead).await,
            StepType::VoiceAgentCall => self.execute_voice(step, lead).await,
            // Synthetic markers are success no-ops if they ever get here.
            StepType::Start | StepType::End => Ok(ExecOutcome::Success { strategy: None }),
            StepType::Delay | StepType::Condition | StepType::LeadGeneration => Err(format!(
                "Step type {} must not reach the executor",
                kind
            )),
        }
    }

    /// LinkedIn steps need a profile URL; enrich once if it is missing.
    async fn linkedin_target(&self, lead: &CampaignLead) -> Result<Option<(CampaignLead, String)>, String> {
        let lead = if lead.linkedin_url().is_none() {
            self.ctx.enrichment().enrich(lead).await?.lead
        } else {
            lead.clone()
        };

        match lead.linkedin_url().as_deref().and_then(extract_public_id) {
            Some(public_id) => Ok(Some((lead, public_id))),
            None => Ok(None),
        }
    }

    async fn execute_visit(&self, lead: &CampaignLead) -> Result<ExecOutcome, String> {
        let (lead, public_id) = match self.linkedin_target(lead).await? {
            Some(found) => found,
            None => return Ok(missing_linkedin_url()),
        };

        let account = match self.ctx.accounts.pick(lead.tenant_id, "linkedin").await? {
            Some(account) => account,
            None => return Ok(no_valid_accounts()),
        };

        let mut outcome = self
            .ctx
            .unipile
            .get_profile(&public_id, &account.external_account_id)
            .await;

        // One alternate account on expired credentials.
        if outcome.category == ErrorCategory::CredentialsExpired {
            let _ = self.ctx.accounts.on_unauthorized(&account).await;
            let order = self
                .ctx
                .accounts
                .fallback_order(lead.tenant_id, "linkedin", &account)
                .await?;
            if let Some(alternate) = order.into_iter().nth(1) {
                outcome = self
                    .ctx
                    .unipile
                    .get_profile(&public_id, &alternate.external_account_id)
                    .await;
            }
        }

        if !outcome.success {
            return Ok(provider_failure(&outcome));
        }

        let profile = outcome.data.unwrap_or(serde_json::json!({}));
        let mut harvest = harvest_profile(&profile);
        if let Some(url) = self.ctx.config.summarizer_url.as_deref() {
            harvest.profile_summary = self.summarize_profile(url, &profile).await;
        }
        self.persist_snapshot(lead.id, &lead.snapshot, &harvest).await?;

        Ok(ExecOutcome::Success { strategy: None })
    }

    /// Some(refusal) when either connection window is exhausted.
    async fn check_connect_quota(&self, lead: &CampaignLead) -> Option<ExecOutcome> {
        let tz = self.ctx.tenant_timezone(lead.tenant_id).await;
        let quota = self.ctx.quota();

        let daily = quota.check(lead.tenant_id, QuotaScope::Daily, tz).await;
        if !daily.allowed {
            return Some(ExecOutcome::Failed {
                kind: FailureKind::DailyQuota,
                message: "Daily connection limit reached for tenant".to_string(),
            });
        }
        let weekly = quota.check(lead.tenant_id, QuotaScope::Weekly, tz).await;
        if !weekly.allowed {
            return Some(ExecOutcome::Failed {
                kind: FailureKind::WeeklyQuota,
                message: "Weekly connection limit reached for tenant".to_string(),
            });
        }
        None
    }

    async fn execute_connect(
        &self,
        campaign: &Campaign,
        step: &Step,
        lead: &CampaignLead,
        sent_id: Uuid,
    ) -> Result<ExecOutcome, String> {
        let (lead, public_id) = match self.linkedin_target(lead).await? {
            Some(found) => found,
            None => return Ok(missing_linkedin_url()),
        };

        let snapshot = lead.snapshot();
        let config = CampaignConfig::from_value(&campaign.config);
        let template = step
            .config
            .get("message")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or(config.connection_message);
        let message = template
            .map(|t| substitute_variables(&t, &snapshot))
            .filter(|m| !m.trim().is_empty());

        let primary = match self.ctx.accounts.pick(lead.tenant_id, "linkedin").await? {
            Some(account) => account,
            None => return Ok(no_valid_accounts()),
        };
        let order = self
            .ctx
            .accounts
            .fallback_order(lead.tenant_id, "linkedin", &primary)
            .await?;

        self.dispatch_connection(&lead, &public_id, message.as_deref(), &order, sent_id)
            .await
    }

    /// Fallback matrix over (account, message-inclusion): with-message first
    /// on each account when the user asked for one, dropping the message on
    /// rate limits before rotating accounts.
    async fn dispatch_connection(
        &self,
        lead: &CampaignLead,
        public_id: &str,
        message: Option<&str>,
        accounts: &[crate::models::account::ProviderAccount],
        sent_id: Uuid,
    ) -> Result<ExecOutcome, String> {
        let wants_message = message.is_some();
        let mut credential_errors = 0u32;
        let mut rate_limit_errors = 0u32;
        let mut other_errors = 0u32;

        for account in accounts {
            let lookup = self
                .ctx
                .unipile
                .lookup(public_id, &account.external_account_id)
                .await;
            let provider_id = match lookup
                .data
                .as_ref()
                .and_then(|d| d.get("provider_id"))
                .and_then(|v| v.as_str())
            {
                Some(id) if lookup.success => id.to_string(),
                _ => {
                    tally(&lookup.category, &mut credential_errors, &mut rate_limit_errors, &mut other_errors);
                    if lookup.category == ErrorCategory::CredentialsExpired {
                        let _ = self.ctx.accounts.on_unauthorized(account).await;
                    }
                    continue;
                }
            };

            let mut try_without_message = !wants_message;

            if wants_message {
                let outcome = self
                    .invite_with_quiescence(&provider_id, &account.external_account_id, message)
                    .await;
                if outcome.success {
                    self.finish_connection(lead, account.id, sent_id, &outcome, InviteStrategy::WithMessage, false)
                        .await?;
                    return Ok(ExecOutcome::Success {
                        strategy: Some(InviteStrategy::WithMessage),
                    });
                }
                match outcome.category {
                    // Personalized-invite allowance exhausted: same account,
                    // plain invitation.
                    ErrorCategory::RateLimit => {
                        rate_limit_errors += 1;
                        try_without_message = true;
                    }
                    ErrorCategory::CredentialsExpired => {
                        credential_errors += 1;
                        if self.ctx.accounts.on_unauthorized(account).await == ReconnectOutcome::RetryNow {
                            let retried = self
                                .invite_with_quiescence(&provider_id, &account.external_account_id, message)
                                .await;
                            if retried.success {
                                self.finish_connection(lead, account.id, sent_id, &retried, InviteStrategy::WithMessage, false)
                                    .await?;
                                return Ok(ExecOutcome::Success {
                                    strategy: Some(InviteStrategy::WithMessage),
                                });
                            }
                        }
                    }
                    _ => {
                        other_errors += 1;
                    }
                }
            }

            if try_without_message {
                let outcome = self
                    .invite_with_quiescence(&provider_id, &account.external_account_id, None)
                    .await;
                if outcome.success {
                    let strategy = if wants_message {
                        InviteStrategy::FallbackToWithoutMessage
                    } else {
                        InviteStrategy::WithoutMessage
                    };
                    self.finish_connection(lead, account.id, sent_id, &outcome, strategy, wants_message)
                        .await?;
                    return Ok(ExecOutcome::Success { strategy: Some(strategy) });
                }
                tally(&outcome.category, &mut credential_errors, &mut rate_limit_errors, &mut other_errors);
                if outcome.category == ErrorCategory::CredentialsExpired {
                    let _ = self.ctx.accounts.on_unauthorized(account).await;
                }
            }
        }

        // All accounts exhausted: report the dominant failure class.
        warn!(
            "Connection dispatch exhausted {} accounts for lead {} (credentials={}, rate_limit={}, other={})",
            accounts.len(), lead.id, credential_errors, rate_limit_errors, other_errors
        );
        Ok(classify_exhaustion(credential_errors, rate_limit_errors, other_errors))
    }

    async fn invite_with_quiescence(
        &self,
        provider_id: &str,
        account_id: &str,
        message: Option<&str>,
    ) -> ProviderOutcome {
        let outcome = self.ctx.unipile.invite(provider_id, account_id, message).await;
        // Fixed post-invite quiescence regardless of outcome, smoothing
        // per-account velocity.
        let quiescence = self.ctx.config.post_invite_quiescence_ms;
        if quiescence > 0 {
            tokio::time::sleep(Duration::from_millis(quiescence)).await;
        }
        outcome
    }

    async fn finish_connection(
        &self,
        lead: &CampaignLead,
        account_id: Uuid,
        sent_id: Uuid,
        outcome: &ProviderOutcome,
        strategy: InviteStrategy,
        message_skipped: bool,
    ) -> Result<(), String> {
        let invitation_id = outcome
            .data
            .as_ref()
            .and_then(|d| d.get("invitation_id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        sqlx::query(
            r#"
            INSERT INTO invitation_tracks
                (id, tenant_id, campaign_id, campaign_lead_id, external_invitation_id, sent_at, last_seen_status, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), 'pending', NOW())
            ON CONFLICT (campaign_lead_id) DO UPDATE
            SET external_invitation_id = EXCLUDED.external_invitation_id,
                sent_at = NOW(),
                last_seen_status = 'pending',
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(lead.tenant_id)
        .bind(lead.campaign_id)
        .bind(lead.id)
        .bind(&invitation_id)
        .execute(self.pool())
        .await
        .map_err(|e| format!("Failed to track invitation: {}", e))?;

        self.ctx
            .ledger()
            .attach_metadata(
                sent_id,
                serde_json::json!({
                    "provider_account_id": account_id,
                    "invitation_id": invitation_id,
                    "messageSkipped": message_skipped,
                    "strategy": strategy.as_str(),
                }),
            )
            .await
    }

    async fn execute_message(&self, step: &Step, lead: &CampaignLead) -> Result<ExecOutcome, String> {
        if !self.connection_accepted(lead).await? {
            return Ok(ExecOutcome::Skipped {
                reason: "waiting_acceptance".to_string(),
            });
        }

        let (lead, public_id) = match self.linkedin_target(lead).await? {
            Some(found) => found,
            None => return Ok(missing_linkedin_url()),
        };

        let account = match self.ctx.accounts.pick(lead.tenant_id, "linkedin").await? {
            Some(account) => account,
            None => return Ok(no_valid_accounts()),
        };

        let text = step
            .config
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let text = substitute_variables(text, &lead.snapshot());

        let lookup = self
            .ctx
            .unipile
            .lookup(&public_id, &account.external_account_id)
            .await;
        let provider_id = match lookup
            .data
            .as_ref()
            .and_then(|d| d.get("provider_id"))
            .and_then(|v| v.as_str())
        {
            Some(id) if lookup.success => id.to_string(),
            _ => return Ok(provider_failure(&lookup)),
        };

        let outcome = self
            .ctx
            .unipile
            .send_message(&provider_id, &account.external_account_id, &text)
            .await;
        if outcome.success {
            info!("LinkedIn message sent to lead {}", lead.id);
            Ok(ExecOutcome::Success { strategy: None })
        } else {
            if outcome.category == ErrorCategory::CredentialsExpired {
                let _ = self.ctx.accounts.on_unauthorized(&account).await;
            }
            Ok(provider_failure(&outcome))
        }
    }

    /// Accepted either per the invitation track (poller's view) or an
    /// already promoted `connected` ledger row (webhook path).
    async fn connection_accepted(&self, lead: &CampaignLead) -> Result<bool, String> {
        let track: Option<String> = sqlx::query_scalar(
            "SELECT last_seen_status FROM invitation_tracks WHERE campaign_lead_id = $1",
        )
        .bind(lead.id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| format!("DB error: {}", e))?;

        if track.as_deref() == Some(InvitationStatus::Accepted.as_str()) {
            return Ok(true);
        }
        self.ctx
            .ledger()
            .lead_has_status(lead.id, ActivityStatus::Connected)
            .await
    }

    async fn execute_follow(&self, lead: &CampaignLead) -> Result<ExecOutcome, String> {
        let (lead, public_id) = match self.linkedin_target(lead).await? {
            Some(found) => found,
            None => return Ok(missing_linkedin_url()),
        };

        let account = match self.ctx.accounts.pick(lead.tenant_id, "linkedin").await? {
            Some(account) => account,
            None => return Ok(no_valid_accounts()),
        };

        let lookup = self
            .ctx
            .unipile
            .lookup(&public_id, &account.external_account_id)
            .await;
        let provider_id = match lookup
            .data
            .as_ref()
            .and_then(|d| d.get("provider_id"))
            .and_then(|v| v.as_str())
        {
            Some(id) if lookup.success => id.to_string(),
            _ => return Ok(provider_failure(&lookup)),
        };

        let outcome = self
            .ctx
            .unipile
            .follow(&provider_id, &account.external_account_id)
            .await;
        if outcome.success {
            Ok(ExecOutcome::Success { strategy: None })
        } else {
            if outcome.category == ErrorCategory::CredentialsExpired {
                let _ = self.ctx.accounts.on_unauthorized(&account).await;
            }
            Ok(provider_failure(&outcome))
        }
    }

    async fn execute_email(&self, step: &Step, lead: &CampaignLead) -> Result<ExecOutcome, String> {
        let to_email = match lead.email() {
            Some(email) => email,
            None => {
                return Ok(ExecOutcome::Failed {
                    kind: FailureKind::MissingContactData,
                    message: "Lead has no email address".to_string(),
                })
            }
        };

        let snapshot = lead.snapshot();
        let subject = substitute_variables(
            step.config.get("subject").and_then(|v| v.as_str()).unwrap_or_default(),
            &snapshot,
        );
        let body = substitute_variables(
            step.config.get("body").and_then(|v| v.as_str()).unwrap_or_default(),
            &snapshot,
        );

        let outcome = self
            .ctx
            .email()
            .send(&self.ctx.config, lead.tenant_id, &to_email, &snapshot.full_name(), &subject, &body)
            .await;

        if outcome.success {
            Ok(ExecOutcome::Success { strategy: None })
        } else {
            Ok(provider_failure(&outcome))
        }
    }

    async fn execute_whatsapp(&self, step: &Step, lead: &CampaignLead) -> Result<ExecOutcome, String> {
        let snapshot = lead.snapshot();
        let phone = match snapshot.phone.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(phone) => phone.to_string(),
            None => {
                return Ok(ExecOutcome::Failed {
                    kind: FailureKind::MissingContactData,
                    message: "Lead has no phone number".to_string(),
                })
            }
        };

        let account = match self.ctx.accounts.pick(lead.tenant_id, "whatsapp").await? {
            Some(account) => account,
            None => return Ok(no_valid_accounts()),
        };

        let text = substitute_variables(
            step.config.get("whatsappMessage").and_then(|v| v.as_str()).unwrap_or_default(),
            &snapshot,
        );

        let outcome = self
            .ctx
            .unipile
            .send_chat_message(&account.external_account_id, &phone, &text)
            .await;
        if outcome.success {
            Ok(ExecOutcome::Success { strategy: None })
        } else {
            Ok(provider_failure(&outcome))
        }
    }

    async fn execute_instagram(&self, step: &Step, lead: &CampaignLead) -> Result<ExecOutcome, String> {
        let snapshot = lead.snapshot();
        let username = step
            .config
            .get("instagramUsername")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let username = substitute_variables(username, &snapshot);

        let account = match self.ctx.accounts.pick(lead.tenant_id, "instagram").await? {
            Some(account) => account,
            None => return Ok(no_valid_accounts()),
        };

        let text = substitute_variables(
            step.config.get("instagramDmMessage").and_then(|v| v.as_str()).unwrap_or_default(),
            &snapshot,
        );

        let outcome = self
            .ctx
            .unipile
            .send_chat_message(&account.external_account_id, &username, &text)
            .await;
        if outcome.success {
            Ok(ExecOutcome::Success { strategy: None })
        } else {
            Ok(provider_failure(&outcome))
        }
    }

    async fn execute_voice(&self, step: &Step, lead: &CampaignLead) -> Result<ExecOutcome, String> {
        let snapshot = lead.snapshot();
        let phone = match snapshot.phone.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(phone) => phone.to_string(),
            None => {
                return Ok(ExecOutcome::Failed {
                    kind: FailureKind::MissingContactData,
                    message: "Lead has no phone number".to_string(),
                })
            }
        };

        let agent_id = step
            .config
            .get("voiceAgentId")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let context = step
            .config
            .get("voiceContext")
            .or_else(|| step.config.get("added_context"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let context = substitute_variables(context, &snapshot);

        let outcome = self
            .ctx
            .voice
            .trigger_call(agent_id, &phone, &context, &snapshot.full_name())
            .await;
        if outcome.success {
            Ok(ExecOutcome::Success { strategy: None })
        } else {
            Ok(provider_failure(&outcome))
        }
    }

    async fn summarize_profile(&self, url: &str, profile: &serde_json::Value) -> Option<String> {
        let client = reqwest::Client::new();
        let result = client
            .post(url)
            .json(&serde_json::json!({ "profile": profile }))
            .timeout(Duration::from_secs(20))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("summary").and_then(|s| s.as_str()).map(|s| s.to_string())),
            Ok(response) => {
                warn!("Profile summarizer returned {}", response.status());
                None
            }
            Err(e) => {
                warn!("Profile summarizer call failed: {}", e);
                None
            }
        }
    }

    async fn persist_snapshot(
        &self,
        lead_id: Uuid,
        current: &serde_json::Value,
        harvest: &LeadSnapshot,
    ) -> Result<(), String> {
        let merged = harvest.merge_into(current);
        sqlx::query("UPDATE campaign_leads SET snapshot = $1, updated_at = NOW() WHERE id = $2")
            .bind(&merged)
            .bind(lead_id)
            .execute(self.pool())
            .await
            .map(|_| ())
            .map_err(|e| format!("Failed to persist profile harvest: {}", e))
    }

    async fn record_error(
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

/// The outbound text this step will carry, substituted, for the ledger row.
fn message_preview(kind: StepType, step: &Step, lead: &CampaignLead) -> Option<String> {
    let snapshot = lead.snapshot();
    let field = match kind {
        StepType::LinkedinConnect | StepType::LinkedinMessage => "message",
        StepType::EmailSend | StepType::EmailFollowup => "body",
        StepType::WhatsappSend => "whatsappMessage",
        StepType::InstagramDm => "instagramDmMessage",
        _ => return None,
    };
    step.config
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|t| !t.trim().is_empty())
        .map(|t| substitute_variables(t, &snapshot))
}

fn tally(category: &ErrorCategory, credentials: &mut u32, rate_limits: &mut u32, other: &mut u32) {
    match category {
        ErrorCategory::CredentialsExpired | ErrorCategory::Checkpoint => *credentials += 1,
        ErrorCategory::RateLimit => *rate_limits += 1,
        _ => *other += 1,
    }
}

fn classify_exhaustion(credentials: u32, rate_limits: u32, other: u32) -> ExecOutcome {
    if credentials + rate_limits + other == 0 {
        return no_valid_accounts();
    }
    if rate_limits >= credentials && rate_limits >= other && rate_limits > 0 {
        ExecOutcome::Failed {
            kind: FailureKind::WeeklyInviteLimit,
            message: "LinkedIn weekly invitation limit reached on all accounts".to_string(),
        }
    } else if credentials >= other && credentials > 0 {
        no_valid_accounts()
    } else {
        ExecOutcome::Failed {
            kind: FailureKind::Transient,
            message: "Connection request failed on all accounts".to_string(),
        }
    }
}

fn no_valid_accounts() -> ExecOutcome {
    ExecOutcome::Failed {
        kind: FailureKind::NoValidAccounts,
        message: "No valid LinkedIn accounts available".to_string(),
    }
}

fn missing_linkedin_url() -> ExecOutcome {
    ExecOutcome::Failed {
        kind: FailureKind::MissingContactData,
        message: "linkedin_url_missing".to_string(),
    }
}

fn provider_failure(outcome: &ProviderOutcome) -> ExecOutcome {
    let message: String = outcome
        .error
        .clone()
        .unwrap_or_else(|| "Provider call failed".to_string())
        .chars()
        .take(300)
        .collect();
    ExecOutcome::Failed {
        kind: FailureKind::Transient,
        message,
    }
}

/// Contact details worth keeping from a full profile fetch.
fn harvest_profile(profile: &serde_json::Value) -> LeadSnapshot {
    let contact = profile.get("contact_info").unwrap_or(&serde_json::Value::Null);
    let first_of = |key: &str| -> Option<String> {
        contact
            .get(key)
            .and_then(|v| v.as_array())
            .and_then(|items| items.first())
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };

    LeadSnapshot {
        phone: first_of("phones"),
        email: first_of("emails"),
        headline: profile
            .get("headline")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        summary: profile
            .get("summary")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_classification() {
        // Rate limits dominate: weekly invite limit.
        match classify_exhaustion(1, 3, 0) {
            ExecOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::WeeklyInviteLimit),
            other => panic!("unexpected outcome {:?}", other),
        }
        // Credential errors dominate: no valid accounts.
        match classify_exhaustion(3, 1, 1) {
            ExecOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::NoValidAccounts),
            other => panic!("unexpected outcome {:?}", other),
        }
        // Generic failures dominate: transient, lead stays retryable.
        match classify_exhaustion(0, 0, 2) {
            ExecOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::Transient),
            other => panic!("unexpected outcome {:?}", other),
        }
        // No accounts tried at all.
        match classify_exhaustion(0, 0, 0) {
            ExecOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::NoValidAccounts),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_stops_lead_matrix() {
        assert!(FailureKind::DailyQuota.stops_lead());
        assert!(FailureKind::WeeklyQuota.stops_lead());
        assert!(FailureKind::NoValidAccounts.stops_lead());
        assert!(FailureKind::WeeklyInviteLimit.stops_lead());
        assert!(FailureKind::MissingContactData.stops_lead());
        assert!(!FailureKind::Transient.stops_lead());
    }

    #[test]
    fn test_harvest_profile_picks_first_contacts() {
        let profile = serde_json::json!({
            "headline": "VP Engineering",
            "summary": "Builds things.",
            "contact_info": {
                "phones": ["+1-555-0100", "+1-555-0101"],
                "emails": ["alice@acme.com"]
            }
        });
        let harvest = harvest_profile(&profile);
        assert_eq!(harvest.phone.as_deref(), Some("+1-555-0100"));
        assert_eq!(harvest.email.as_deref(), Some("alice@acme.com"));
        assert_eq!(harvest.headline.as_deref(), Some("VP Engineering"));
        assert_eq!(harvest.summary.as_deref(), Some("Builds things."));
    }
}

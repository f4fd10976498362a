use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::activity::{ActivityStatus, NewActivity};
use crate::models::campaign::{Campaign, CampaignConfig};
use crate::models::lead::LeadSnapshot;
use crate::models::step::Step;
use crate::services::apollo_connector::{LeadSearchFilters, SourcedPerson};
use crate::services::context::AppContext;

const DEFAULT_LEADS_PER_DAY: i64 = 50;
const PROVIDER_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct SourcingOutcome {
    pub skipped: bool,
    pub requested: i64,
    pub inserted: i64,
}

/// Daily lead sourcing for one campaign: pages through the provider with a
/// persistent offset, consults previously sourced people first, and bulk
/// inserts under the per-campaign uniqueness rule.
pub struct LeadSourcer<'a> {
    ctx: &'a AppContext,
}

impl<'a> LeadSourcer<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    fn pool(&self) -> &PgPool {
        &self.ctx.pool
    }

    pub async fn run(&self, campaign: &Campaign, step: &Step) -> Result<SourcingOutcome, String> {
        let config = CampaignConfig::from_value(&campaign.config);
        let requested = leads_per_day(&config, &step.config);
        if requested <= 0 {
            return Err(format!("Campaign {} has a non-positive daily lead limit", campaign.id));
        }

        let tz = self.ctx.tenant_timezone(campaign.tenant_id).await;
        let today = Utc::now().with_timezone(&tz).date_naive();
        if config.last_lead_gen_date == Some(today) {
            return Ok(SourcingOutcome { skipped: true, requested, inserted: 0 });
        }

        let offset = config.lead_gen_offset.unwrap_or(0).max(0);
        let (page, offset_in_page) = page_position(offset);
        let filters = search_filters(&step.config);

        let mut candidates = self.search_cached(campaign, &filters, requested).await?;
        if (candidates.len() as i64) < requested {
            match self.ctx.apollo.search(&filters, page, PROVIDER_PAGE_SIZE).await {
                Ok(people) => {
                    candidates.extend(people.into_iter().skip(offset_in_page as usize));
                }
                Err(e) => {
                    // Cache hits alone may still fill part of today's batch.
                    warn!("Provider lead search failed for campaign {}: {}", campaign.id, e);
                    if candidates.is_empty() {
                        return Err(e);
                    }
                }
            }
        }
        candidates.truncate(requested as usize);

        let mut inserted = 0i64;
        let mut first_lead_id: Option<Uuid> = None;
        for person in &candidates {
            if let Some(id) = self.insert_lead(campaign, person).await? {
                inserted += 1;
                first_lead_id.get_or_insert(id);
            }
        }

        self.update_campaign_config(campaign, &config, offset + inserted, today).await?;

        if let Some(lead_id) = first_lead_id {
            let activity = NewActivity::for_step(
                campaign.tenant_id,
                campaign.id,
                lead_id,
                step.id,
                &step.step_type,
                "system",
                ActivityStatus::Sent,
            )
            .with_metadata(serde_json::json!({
                "requested": requested,
                "inserted": inserted,
                "offset": offset,
            }));
            self.ctx.ledger().record(&activity).await?;
        }

        info!(
            "Campaign {} sourced {} leads ({} requested, offset {})",
            campaign.id, inserted, requested, offset
        );
        Ok(SourcingOutcome { skipped: false, requested, inserted })
    }

    /// People already revealed by earlier sourcing runs anywhere in the
    /// system, matching the step filters and not yet in this campaign.
    async fn search_cached(
        &self,
        campaign: &Campaign,
        filters: &LeadSearchFilters,
        limit: i64,
    ) -> Result<Vec<SourcedPerson>, String> {
        if filters.is_empty() {
            return Ok(Vec::new());
        }

        let roles: Vec<String> = filters.roles.iter().map(|r| format!("%{}%", r)).collect();
        let industries = filters.industries.clone();

        #[derive(sqlx::FromRow)]
        struct CachedRow {
            external_person_id: String,
            snapshot: serde_json::Value,
        }

        let rows = sqlx::query_as::<_, CachedRow>(
            r#"
            SELECT DISTINCT ON (external_person_id) external_person_id, snapshot
            FROM campaign_leads
            WHERE ($1::TEXT[] = '{}' OR snapshot->>'title' ILIKE ANY($1))
              AND ($2::TEXT[] = '{}' OR snapshot->>'industry' = ANY($2))
              AND external_person_id NOT IN (
                  SELECT external_person_id FROM campaign_leads WHERE campaign_id = $3
              )
            ORDER BY external_person_id, created_at DESC
            LIMIT $4
            "#,
        )
        .bind(&roles)
        .bind(&industries)
        .bind(campaign.id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| format!("Cached lead search failed: {}", e))?;

        Ok(rows
            .into_iter()
            .map(|row| SourcedPerson {
                external_person_id: row.external_person_id,
                snapshot: LeadSnapshot::from_value(&row.snapshot),
            })
            .collect())
    }

    /// Returns the new lead id, or None when the person is already in the
    /// campaign.
    async fn insert_lead(
        &self,
        campaign: &Campaign,
        person: &SourcedPerson,
    ) -> Result<Option<Uuid>, String> {
        let id = Uuid::new_v4();
        let snapshot = serde_json::to_value(&person.snapshot).map_err(|e| e.to_string())?;
        let result = sqlx::query(
            r#"
            INSERT INTO campaign_leads
                (id, campaign_id, tenant_id, external_person_id, status, current_step_order, snapshot, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'active', 0, $5, NOW(), NOW())
            ON CONFLICT (campaign_id, external_person_id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(campaign.id)
        .bind(campaign.tenant_id)
        .bind(&person.external_person_id)
        .bind(&snapshot)
        .execute(self.pool())
        .await
        .map_err(|e| format!("Failed to insert lead: {}", e))?;

        Ok((result.rows_affected() > 0).then_some(id))
    }

    async fn update_campaign_config(
        &self,
        campaign: &Campaign,
        config: &CampaignConfig,
        new_offset: i64,
        today: chrono::NaiveDate,
    ) -> Result<(), String> {
        let mut updated = config.clone();
        // The offset never moves backwards.
        updated.lead_gen_offset = Some(new_offset.max(config.lead_gen_offset.unwrap_or(0)));
        updated.last_lead_gen_date = Some(today);
        let merged = updated.merge_into(&campaign.config);

        sqlx::query("UPDATE campaigns SET config = $1, updated_at = NOW() WHERE id = $2")
            .bind(&merged)
            .bind(campaign.id)
            .execute(self.pool())
            .await
            .map(|_| ())
            .map_err(|e| format!("Failed to update sourcing bookkeeping: {}", e))
    }
}

fn leads_per_day(config: &CampaignConfig, step_config: &serde_json::Value) -> i64 {
    config
        .leads_per_day
        .or_else(|| step_config.get("leadGenerationLimit").and_then(|v| v.as_i64()))
        .or_else(|| step_config.get("leads_per_day").and_then(|v| v.as_i64()))
        .unwrap_or(DEFAULT_LEADS_PER_DAY)
}

/// Provider pages are fixed at 100; the persistent offset maps to a
/// 1-based page plus a skip inside it.
fn page_position(offset: i64) -> (i64, i64) {
    (offset / PROVIDER_PAGE_SIZE + 1, offset % PROVIDER_PAGE_SIZE)
}

fn search_filters(step_config: &serde_json::Value) -> LeadSearchFilters {
    step_config
        .get("leadGenerationFilters")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_position() {
        assert_eq!(page_position(0), (1, 0));
        assert_eq!(page_position(99), (1, 99));
        assert_eq!(page_position(100), (2, 0));
        assert_eq!(page_position(250), (3, 50));
    }

    #[test]
    fn test_leads_per_day_precedence() {
        let campaign = CampaignConfig {
            leads_per_day: Some(10),
            ..Default::default()
        };
        let step = serde_json::json!({"leadGenerationLimit": 30});
        assert_eq!(leads_per_day(&campaign, &step), 10);

        let campaign = CampaignConfig::default();
        assert_eq!(leads_per_day(&campaign, &step), 30);

        let step = serde_json::json!({"leads_per_day": 5});
        assert_eq!(leads_per_day(&campaign, &step), 5);

        assert_eq!(leads_per_day(&campaign, &serde_json::json!({})), DEFAULT_LEADS_PER_DAY);
    }

    #[test]
    fn test_search_filters_parsing() {
        let config = serde_json::json!({
            "leadGenerationFilters": {"roles": ["CTO"], "location": "Berlin"}
        });
        let filters = search_filters(&config);
        assert_eq!(filters.roles, vec!["CTO"]);
        assert_eq!(filters.location.as_deref(), Some("Berlin"));

        assert!(search_filters(&serde_json::json!({})).is_empty());
    }
}

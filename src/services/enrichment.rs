use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::lead::{CampaignLead, LeadSnapshot};
use crate::services::apollo_connector::ApolloConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentSource {
    AlreadyEnriched,
    CrossTenantHit,
    Provider,
    Unavailable,
}

#[derive(Debug)]
pub struct EnrichmentResult {
    pub lead: CampaignLead,
    pub source: EnrichmentSource,
    pub credits_used: i32,
}

/// Contact-reveal cache. Before paying the provider, look for the same
/// person already enriched anywhere in the system (any tenant); paid
/// enrichment data is shared once revealed.
pub struct EnrichmentService {
    pool: PgPool,
    apollo: ApolloConnector,
}

#[derive(Debug, sqlx::FromRow)]
struct EnrichedHit {
    enriched_email: Option<String>,
    enriched_linkedin_url: Option<String>,
}

impl EnrichmentService {
    pub fn new(pool: PgPool, apollo: ApolloConnector) -> Self {
        Self { pool, apollo }
    }

    pub async fn enrich(&self, lead: &CampaignLead) -> Result<EnrichmentResult, String> {
        // Credits are counted once per (lead, campaign): an enriched row is
        // never re-enriched.
        if lead.enriched_at.is_some() {
            return Ok(EnrichmentResult {
                lead: lead.clone(),
                source: EnrichmentSource::AlreadyEnriched,
                credits_used: 0,
            });
        }

        if let Some(hit) = self.cross_tenant_lookup(lead).await? {
            let updated = self
                .write_enrichment(lead.id, hit.enriched_email.as_deref(), hit.enriched_linkedin_url.as_deref(), None)
                .await?;
            info!("Lead {} enriched from cross-tenant cache", lead.id);
            return Ok(EnrichmentResult {
                lead: updated,
                source: EnrichmentSource::CrossTenantHit,
                credits_used: 0,
            });
        }

        let snapshot = lead.snapshot();
        match self.apollo.enrich_person(&lead.external_person_id, &snapshot).await {
            Ok(person) => {
                if person.email.is_none() && person.linkedin_url.is_none() {
                    // Never stamp enriched_at without at least one revealed field.
                    warn!("Enrichment for lead {} revealed no contact fields", lead.id);
                    return Ok(EnrichmentResult {
                        lead: lead.clone(),
                        source: EnrichmentSource::Unavailable,
                        credits_used: person.credits_used,
                    });
                }

                let name_update = match (&person.first_name, &person.last_name) {
                    (None, None) => None,
                    (first, last) => Some(LeadSnapshot {
                        first_name: first.clone().or(snapshot.first_name.clone()),
                        last_name: last.clone().or(snapshot.last_name.clone()),
                        ..Default::default()
                    }),
                };

                let updated = self
                    .write_enrichment(
                        lead.id,
                        person.email.as_deref(),
                        person.linkedin_url.as_deref(),
                        name_update,
                    )
                    .await?;
                Ok(EnrichmentResult {
                    lead: updated,
                    source: EnrichmentSource::Provider,
                    credits_used: person.credits_used,
                })
            }
            Err(e) => {
                // Soft failure: the step executor decides whether a missing
                // field is fatal for its action.
                warn!("Provider enrichment failed for lead {}: {}", lead.id, e);
                Ok(EnrichmentResult {
                    lead: lead.clone(),
                    source: EnrichmentSource::Unavailable,
                    credits_used: 0,
                })
            }
        }
    }

    /// Most recent enriched row for the same person across all tenants,
    /// matched by provider id first, then by the (email, name, company)
    /// tuple for leads sourced outside the provider.
    async fn cross_tenant_lookup(&self, lead: &CampaignLead) -> Result<Option<EnrichedHit>, String> {
        let by_person_id = sqlx::query_as::<_, EnrichedHit>(
            r#"
            SELECT enriched_email, enriched_linkedin_url FROM campaign_leads
            WHERE external_person_id = $1 AND enriched_at IS NOT NULL AND id != $2
            ORDER BY enriched_at DESC
            LIMIT 1
            "#,
        )
        .bind(&lead.external_person_id)
        .bind(lead.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| format!("DB error: {}", e))?;

        if by_person_id.is_some() {
            return Ok(by_person_id);
        }

        let snapshot = lead.snapshot();
        let (email, company) = (lead.email(), snapshot.company_name.clone());
        let name = snapshot.full_name();
        if email.is_none() || name.is_empty() || company.is_none() {
            return Ok(None);
        }

        sqlx::query_as::<_, EnrichedHit>(
            r#"
            SELECT enriched_email, enriched_linkedin_url FROM campaign_leads
            WHERE enriched_at IS NOT NULL AND id != $1
              AND (enriched_email = $2 OR snapshot->>'email' = $2)
              AND TRIM(CONCAT(snapshot->>'first_name', ' ', snapshot->>'last_name')) = $3
              AND snapshot->>'company_name' = $4
            ORDER BY enriched_at DESC
            LIMIT 1
            "#,
        )
        .bind(lead.id)
        .bind(email)
        .bind(name)
        .bind(company)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| format!("DB error: {}", e))
    }

    async fn write_enrichment(
        &self,
        lead_id: Uuid,
        email: Option<&str>,
        linkedin_url: Option<&str>,
        name_update: Option<LeadSnapshot>,
    ) -> Result<CampaignLead, String> {
        sqlx::query(
            r#"
            UPDATE campaign_leads
            SET enriched_email = COALESCE($1, enriched_email),
                enriched_linkedin_url = COALESCE($2, enriched_linkedin_url),
                enriched_at = NOW(),
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(email)
        .bind(linkedin_url)
        .bind(lead_id)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to write enrichment: {}", e))?;

        if let Some(names) = name_update {
            let current: Option<serde_json::Value> =
                sqlx::query_scalar("SELECT snapshot FROM campaign_leads WHERE id = $1")
                    .bind(lead_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| format!("DB error: {}", e))?;
            if let Some(current) = current {
                let merged = merge_names(&current, &names);
                sqlx::query("UPDATE campaign_leads SET snapshot = $1 WHERE id = $2")
                    .bind(&merged)
                    .bind(lead_id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| format!("Failed to update snapshot: {}", e))?;
            }
        }

        self.reload(lead_id).await
    }

    async fn reload(&self, lead_id: Uuid) -> Result<CampaignLead, String> {
        sqlx::query_as::<_, CampaignLead>("SELECT * FROM campaign_leads WHERE id = $1")
            .bind(lead_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| format!("DB error: {}", e))
    }
}

fn merge_names(snapshot: &serde_json::Value, names: &LeadSnapshot) -> serde_json::Value {
    let mut out = match snapshot {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let Some(first) = &names.first_name {
        out.insert("first_name".into(), serde_json::json!(first));
    }
    if let Some(last) = &names.last_name {
        out.insert("last_name".into(), serde_json::json!(last));
    }
    serde_json::Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_names_keeps_existing_fields() {
        let snapshot = serde_json::json!({"title": "CTO", "first_name": "Al"});
        let names = LeadSnapshot {
            first_name: Some("Alice".into()),
            last_name: Some("Ng".into()),
            ..Default::default()
        };
        let merged = merge_names(&snapshot, &names);
        assert_eq!(merged["title"], "CTO");
        assert_eq!(merged["first_name"], "Alice");
        assert_eq!(merged["last_name"], "Ng");
    }
}

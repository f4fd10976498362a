use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::models::lead::LeadSnapshot;

/// Apollo-backed lead source and person enrichment client.
#[derive(Clone)]
pub struct ApolloConnector {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

/// Search filters carried by a `lead_generation` step config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadSearchFilters {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub industries: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl LeadSearchFilters {
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
            && self.industries.is_empty()
            && self.location.as_deref().map_or(true, |l| l.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct SourcedPerson {
    pub external_person_id: String,
    pub snapshot: LeadSnapshot,
}

#[derive(Debug, Clone)]
pub struct EnrichedPerson {
    pub email: Option<String>,
    pub linkedin_url: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub credits_used: i32,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    people: Vec<PersonPayload>,
}

#[derive(Debug, Deserialize)]
struct MatchResponse {
    person: Option<PersonPayload>,
}

#[derive(Debug, Deserialize)]
struct PersonPayload {
    id: String,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    linkedin_url: Option<String>,
    #[serde(default)]
    organization: Option<OrganizationPayload>,
}

#[derive(Debug, Deserialize)]
struct OrganizationPayload {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    industry: Option<String>,
}

impl ApolloConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.apollo_base_url.trim_end_matches('/').to_string(),
            api_key: config.apollo_api_key.clone(),
        }
    }

    fn api_key(&self) -> Result<&str, String> {
        self.api_key
            .as_deref()
            .ok_or_else(|| "APOLLO_API_KEY not configured".to_string())
    }

    /// One page of the people search. `page` is 1-based; Apollo caps
    /// `per_page` at 100, which the offset math in the sourcer relies on.
    pub async fn search(
        &self,
        filters: &LeadSearchFilters,
        page: i64,
        per_page: i64,
    ) -> Result<Vec<SourcedPerson>, String> {
        let api_key = self.api_key()?;

        let mut body = serde_json::json!({
            "page": page,
            "per_page": per_page.clamp(1, 100),
        });
        if !filters.roles.is_empty() {
            body["person_titles"] = serde_json::json!(filters.roles);
        }
        if !filters.industries.is_empty() {
            body["q_organization_keyword_tags"] = serde_json::json!(filters.industries);
        }
        if let Some(location) = filters.location.as_deref().filter(|l| !l.trim().is_empty()) {
            body["person_locations"] = serde_json::json!([location]);
        }

        let response = self
            .client
            .post(format!("{}/mixed_people/search", self.base_url))
            .header("X-Api-Key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("Apollo request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Apollo search error {}: {}", status, body.chars().take(300).collect::<String>()));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse Apollo search: {}", e))?;

        info!("Apollo search page {} returned {} people", page, parsed.people.len());
        Ok(parsed.people.into_iter().map(to_sourced).collect())
    }

    /// Reveal contact details for one person. Costs credits on success.
    pub async fn enrich_person(
        &self,
        external_id: &str,
        context: &LeadSnapshot,
    ) -> Result<EnrichedPerson, String> {
        let api_key = self.api_key()?;

        let mut body = serde_json::json!({
            "id": external_id,
            "reveal_personal_emails": true,
        });
        // Name and company context improves Apollo's match rate when the id
        // alone is stale.
        if let Some(first) = &context.first_name {
            body["first_name"] = serde_json::json!(first);
        }
        if let Some(last) = &context.last_name {
            body["last_name"] = serde_json::json!(last);
        }
        if let Some(company) = &context.company_name {
            body["organization_name"] = serde_json::json!(company);
        }

        let response = self
            .client
            .post(format!("{}/people/match", self.base_url))
            .header("X-Api-Key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("Apollo request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Apollo enrichment for {} failed: {}", external_id, status);
            return Err(format!("Apollo match error {}: {}", status, body.chars().take(300).collect::<String>()));
        }

        let parsed: MatchResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse Apollo match: {}", e))?;

        let person = parsed
            .person
            .ok_or_else(|| format!("Apollo returned no match for {}", external_id))?;

        Ok(EnrichedPerson {
            email: person.email.filter(|e| !e.trim().is_empty()),
            linkedin_url: person.linkedin_url.filter(|u| !u.trim().is_empty()),
            first_name: person.first_name,
            last_name: person.last_name,
            credits_used: 1,
        })
    }
}

fn to_sourced(person: PersonPayload) -> SourcedPerson {
    let (company_name, industry) = person
        .organization
        .map(|o| (o.name, o.industry))
        .unwrap_or((None, None));

    SourcedPerson {
        external_person_id: person.id,
        snapshot: LeadSnapshot {
            first_name: person.first_name,
            last_name: person.last_name,
            title: person.title,
            company_name,
            industry,
            linkedin_url: person.linkedin_url,
            email: person.email,
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_empty_detection() {
        assert!(LeadSearchFilters::default().is_empty());
        assert!(LeadSearchFilters {
            location: Some("   ".into()),
            ..Default::default()
        }
        .is_empty());
        assert!(!LeadSearchFilters {
            roles: vec!["CTO".into()],
            ..Default::default()
        }
        .is_empty());
    }
}

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CampaignLead {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub tenant_id: Uuid,
    /// Provider-side person identifier (e.g. the Apollo person id).
    pub external_person_id: String,
    pub status: String,
    pub current_step_order: i32,
    pub enriched_email: Option<String>,
    pub enriched_linkedin_url: Option<String>,
    pub enriched_at: Option<DateTime<Utc>>,
    pub snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignLead {
    pub fn snapshot(&self) -> LeadSnapshot {
        LeadSnapshot::from_value(&self.snapshot)
    }

    /// Best-known LinkedIn URL: enrichment wins over the sourcing snapshot.
    pub fn linkedin_url(&self) -> Option<String> {
        self.enriched_linkedin_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| self.snapshot().linkedin_url)
    }

    pub fn email(&self) -> Option<String> {
        self.enriched_email
            .clone()
            .filter(|e| !e.trim().is_empty())
            .or_else(|| self.snapshot().email)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum LeadStatus {
    Active,
    Completed,
    Stopped,
    Error,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Active => "active",
            LeadStatus::Completed => "completed",
            LeadStatus::Stopped => "stopped",
            LeadStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Denormalized person data captured at sourcing time and enriched later
/// (profile harvest, enrichment cache). Stored in `campaign_leads.snapshot`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linkedin_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_summary: Option<String>,
}

impl LeadSnapshot {
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn merge_into(&self, bag: &serde_json::Value) -> serde_json::Value {
        let mut out = match bag {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        if let Ok(serde_json::Value::Object(typed)) = serde_json::to_value(self) {
            for (k, v) in typed {
                out.insert(k, v);
            }
        }
        serde_json::Value::Object(out)
    }

    pub fn full_name(&self) -> String {
        format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        )
        .trim()
        .to_string()
    }
}

#[derive(Debug, Deserialize)]
pub struct LeadFilters {
    pub status: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linkedin_url_prefers_enrichment() {
        let lead = CampaignLead {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            external_person_id: "apollo-1".into(),
            status: "active".into(),
            current_step_order: 0,
            enriched_email: None,
            enriched_linkedin_url: Some("https://www.linkedin.com/in/enriched".into()),
            enriched_at: None,
            snapshot: serde_json::json!({"linkedin_url": "https://www.linkedin.com/in/sourced"}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(
            lead.linkedin_url().as_deref(),
            Some("https://www.linkedin.com/in/enriched")
        );
    }

    #[test]
    fn test_blank_enrichment_falls_back_to_snapshot() {
        let lead = CampaignLead {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            external_person_id: "apollo-2".into(),
            status: "active".into(),
            current_step_order: 0,
            enriched_email: Some("  ".into()),
            enriched_linkedin_url: None,
            enriched_at: None,
            snapshot: serde_json::json!({"email": "alice@example.com"}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(lead.email().as_deref(), Some("alice@example.com"));
    }
}

use serde::{Deserialize, Serialize};
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;
use sqlx::FromRow;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct Campaign {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub status: String,
    pub config: serde_json::Value,
    pub execution_state: serde_json::Value,
    pub last_run_date: Option<NaiveDate>,
    pub created_by_user_id: Option<Uuid>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum CampaignStatus {
    Draft,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Stopped => "stopped",
            CampaignStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(CampaignStatus::Draft),
            // "active" is a legacy synonym still present in old rows.
            "running" | "active" => Some(CampaignStatus::Running),
            "paused" => Some(CampaignStatus::Paused),
            "stopped" => Some(CampaignStatus::Stopped),
            "completed" => Some(CampaignStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recognized keys of the `campaigns.config` JSONB bag. Unknown keys are
/// preserved on write by merging, never dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leads_per_day: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_gen_offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_lead_gen_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
}

impl CampaignConfig {
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// Merge the typed keys back into the raw bag, preserving anything else.
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
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCampaignRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateCampaignRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct CampaignFilters {
    pub status: Option<String>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_accepts_legacy_active() {
        assert_eq!(CampaignStatus::parse("active"), Some(CampaignStatus::Running));
        assert_eq!(CampaignStatus::parse("running"), Some(CampaignStatus::Running));
        assert_eq!(CampaignStatus::parse("archived"), None);
    }

    #[test]
    fn test_config_merge_preserves_unknown_keys() {
        let bag = serde_json::json!({"leads_per_day": 10, "ui_color": "teal"});
        let mut config = CampaignConfig::from_value(&bag);
        assert_eq!(config.leads_per_day, Some(10));

        config.lead_gen_offset = Some(40);
        let merged = config.merge_into(&bag);
        assert_eq!(merged["ui_color"], "teal");
        assert_eq!(merged["lead_gen_offset"], 40);
        assert_eq!(merged["leads_per_day"], 10);
    }
}

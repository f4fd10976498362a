use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use sqlx::FromRow;

/// One row of the append-only execution ledger. Activities are never
/// updated except for the status promotion paths (`sent` → `delivered`,
/// `delivered` → `connected`/`replied`) and never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Activity {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub campaign_id: Uuid,
    pub campaign_lead_id: Uuid,
    pub step_id: Option<Uuid>,
    pub step_type: String,
    pub action_type: String,
    pub channel: String,
    pub status: String,
    pub message_content: Option<String>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ActivityStatus {
    Sent,
    Delivered,
    Connected,
    Replied,
    Opened,
    Clicked,
    Skipped,
    Error,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Sent => "sent",
            ActivityStatus::Delivered => "delivered",
            ActivityStatus::Connected => "connected",
            ActivityStatus::Replied => "replied",
            ActivityStatus::Opened => "opened",
            ActivityStatus::Clicked => "clicked",
            ActivityStatus::Skipped => "skipped",
            ActivityStatus::Error => "error",
        }
    }

    /// The terminal-success set: at most one per (lead, step).
    pub fn is_terminal_success(&self) -> bool {
        matches!(
            self,
            ActivityStatus::Delivered | ActivityStatus::Connected | ActivityStatus::Replied
        )
    }
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub tenant_id: Uuid,
    pub campaign_id: Uuid,
    pub campaign_lead_id: Uuid,
    pub step_id: Option<Uuid>,
    pub step_type: String,
    pub action_type: String,
    pub channel: String,
    pub status: ActivityStatus,
    pub message_content: Option<String>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewActivity {
    pub fn for_step(
        tenant_id: Uuid,
        campaign_id: Uuid,
        campaign_lead_id: Uuid,
        step_id: Uuid,
        step_type: &str,
        channel: &str,
        status: ActivityStatus,
    ) -> Self {
        Self {
            tenant_id,
            campaign_id,
            campaign_lead_id,
            step_id: Some(step_id),
            step_type: step_type.to_string(),
            action_type: step_type.to_string(),
            channel: channel.to_string(),
            status,
            message_content: None,
            error_message: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message_content = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_success_set() {
        assert!(ActivityStatus::Delivered.is_terminal_success());
        assert!(ActivityStatus::Connected.is_terminal_success());
        assert!(ActivityStatus::Replied.is_terminal_success());
        assert!(!ActivityStatus::Sent.is_terminal_success());
        assert!(!ActivityStatus::Skipped.is_terminal_success());
        assert!(!ActivityStatus::Error.is_terminal_success());
    }
}

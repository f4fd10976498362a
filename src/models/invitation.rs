use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use sqlx::FromRow;

/// Reconciled view of a LinkedIn invitation, written by the step executor
/// at send time and kept current by the polling worker.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvitationTrack {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub campaign_id: Uuid,
    pub campaign_lead_id: Uuid,
    pub external_invitation_id: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub last_seen_status: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
    Withdrawn,
    Unknown,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Declined => "declined",
            InvitationStatus::Withdrawn => "withdrawn",
            InvitationStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pending" | "sent" | "invited" => InvitationStatus::Pending,
            "accepted" | "connected" => InvitationStatus::Accepted,
            "declined" | "ignored" | "rejected" => InvitationStatus::Declined,
            "withdrawn" | "canceled" | "cancelled" => InvitationStatus::Withdrawn,
            _ => InvitationStatus::Unknown,
        }
    }
}

impl std::fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provider_vocabulary() {
        assert_eq!(InvitationStatus::parse("ACCEPTED"), InvitationStatus::Accepted);
        assert_eq!(InvitationStatus::parse("invited"), InvitationStatus::Pending);
        assert_eq!(InvitationStatus::parse("cancelled"), InvitationStatus::Withdrawn);
        assert_eq!(InvitationStatus::parse("???"), InvitationStatus::Unknown);
    }
}

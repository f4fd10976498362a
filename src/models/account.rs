use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProviderAccount {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub provider: String,
    /// Provider-side account identifier (e.g. the Unipile account id).
    pub external_account_id: String,
    pub status: String,
    pub needs_reconnect: bool,
    pub daily_cap: i32,
    pub weekly_cap: Option<i32>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderAccount {
    pub fn is_healthy(&self) -> bool {
        self.status == AccountStatus::Active.as_str() && !self.needs_reconnect
    }

    pub fn display_name(&self) -> String {
        self.metadata
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.external_account_id.clone())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum AccountStatus {
    Active,
    Connecting,
    CredentialsExpired,
    Error,
    Stopped,
    Inactive,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Connecting => "connecting",
            AccountStatus::CredentialsExpired => "credentials_expired",
            AccountStatus::Error => "error",
            AccountStatus::Stopped => "stopped",
            AccountStatus::Inactive => "inactive",
        }
    }

    /// Map a provider-side status token to an internal status. Unknown
    /// tokens default to `active` (permissive); callers log them.
    pub fn from_provider_token(token: &str) -> (Self, bool) {
        let status = match token.to_uppercase().as_str() {
            "OK" | "CONNECTED" | "CREATION_SUCCESS" | "RECONNECTED" | "SYNC_SUCCESS" => {
                AccountStatus::Active
            }
            "CONNECTING" | "CREATION_PENDING" | "SYNCING" => AccountStatus::Connecting,
            "CREDENTIALS" | "CREDENTIALS_EXPIRED" | "DISCONNECTED" | "RECONNECT_NEEDED" => {
                AccountStatus::CredentialsExpired
            }
            "ERROR" | "SYNC_ERROR" | "PERMANENT_ERROR" => AccountStatus::Error,
            "STOPPED" | "PAUSED" => AccountStatus::Stopped,
            "DELETED" | "REVOKED" | "NOT_FOUND" => AccountStatus::Inactive,
            _ => return (AccountStatus::Active, false),
        };
        (status, true)
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_token_mapping() {
        assert_eq!(
            AccountStatus::from_provider_token("OK"),
            (AccountStatus::Active, true)
        );
        assert_eq!(
            AccountStatus::from_provider_token("credentials"),
            (AccountStatus::CredentialsExpired, true)
        );
        assert_eq!(
            AccountStatus::from_provider_token("DELETED"),
            (AccountStatus::Inactive, true)
        );
        // Unknown tokens stay permissive so a provider vocabulary change
        // never bricks an account.
        assert_eq!(
            AccountStatus::from_provider_token("SOMETHING_NEW"),
            (AccountStatus::Active, false)
        );
    }
}

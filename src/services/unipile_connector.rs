use std::time::Duration;

use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::services::provider::{classify_linkedin_response, ErrorCategory, ProviderOutcome};

/// Unipile-backed LinkedIn client. Also carries the chat endpoint used for
/// WhatsApp and Instagram accounts connected through the same provider.
#[derive(Clone)]
pub struct UnipileConnector {
    client: Client,
    dsn: String,
    token: String,
    lookup_timeout: Duration,
    profile_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct UserLookupResponse {
    provider_id: Option<String>,
    public_identifier: Option<String>,
    #[serde(default)]
    network_distance: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InviteResponse {
    invitation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SentInvitation {
    pub id: String,
    #[serde(default)]
    pub invited_user_id: Option<String>,
    #[serde(default)]
    pub invited_user_public_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InvitationListResponse {
    #[serde(default)]
    items: Vec<SentInvitation>,
}

#[derive(Debug, Deserialize)]
struct AccountStatusResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    sources: Vec<AccountSource>,
}

#[derive(Debug, Deserialize)]
struct AccountSource {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct InviteRequest<'a> {
    provider_id: &'a str,
    account_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

impl UnipileConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::builder()
                .build()
                .unwrap_or_else(|_| Client::new()),
            dsn: config.unipile_dsn.trim_end_matches('/').to_string(),
            token: config.unipile_token.clone(),
            lookup_timeout: Duration::from_millis(config.unipile_lookup_timeout_ms),
            profile_timeout: Duration::from_millis(config.unipile_profile_timeout_ms),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.dsn, path)
    }

    /// Resolve a LinkedIn public identifier to the provider-internal id
    /// required by the action endpoints.
    pub async fn lookup(&self, public_id: &str, account_id: &str) -> ProviderOutcome {
        let url = self.url(&format!("/users/{}", public_id));
        let response = self
            .client
            .get(&url)
            .header("X-API-KEY", &self.token)
            .query(&[("account_id", account_id)])
            .timeout(self.lookup_timeout)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return transport_outcome(e),
        };

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let (success, category) = classify_linkedin_response(status, &body);
        if !success {
            warn!("Unipile lookup {} failed ({}): {}", public_id, status, truncate(&body));
            return ProviderOutcome::failure(category, body).with_status(status);
        }

        match serde_json::from_str::<UserLookupResponse>(&body) {
            Ok(user) => match user.provider_id {
                Some(provider_id) => ProviderOutcome::ok(serde_json::json!({
                    "provider_id": provider_id,
                    "public_identifier": user.public_identifier,
                    "network_distance": user.network_distance,
                }))
                .with_status(status),
                None => ProviderOutcome::failure(
                    ErrorCategory::NotFound,
                    format!("No provider id for {}", public_id),
                )
                .with_status(status),
            },
            Err(e) => ProviderOutcome::failure(
                ErrorCategory::Unknown,
                format!("Unexpected lookup payload: {}", e),
            )
            .with_status(status),
        }
    }

    /// Send a connection invitation. Including a message burns into the
    /// account's monthly personalized-invite allowance; the caller decides.
    pub async fn invite(
        &self,
        provider_id: &str,
        account_id: &str,
        message: Option<&str>,
    ) -> ProviderOutcome {
        let url = self.url("/users/invite");
        let request = InviteRequest {
            provider_id,
            account_id,
            message,
        };

        let response = self
            .client
            .post(&url)
            .header("X-API-KEY", &self.token)
            .json(&request)
            .timeout(self.lookup_timeout)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return transport_outcome(e),
        };

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let (success, category) = classify_linkedin_response(status, &body);

        if success {
            let invitation_id = serde_json::from_str::<InviteResponse>(&body)
                .ok()
                .and_then(|r| r.invitation_id);
            info!(
                "Invite sent via account {} (with_message={})",
                account_id,
                message.is_some()
            );
            ProviderOutcome::ok(serde_json::json!({ "invitation_id": invitation_id }))
                .with_status(status)
        } else {
            warn!("Invite via account {} failed ({}): {}", account_id, status, truncate(&body));
            ProviderOutcome::failure(category, body).with_status(status)
        }
    }

    /// Direct message to an accepted connection.
    pub async fn send_message(
        &self,
        provider_id: &str,
        account_id: &str,
        text: &str,
    ) -> ProviderOutcome {
        let url = self.url("/chats");
        let response = self
            .client
            .post(&url)
            .header("X-API-KEY", &self.token)
            .json(&serde_json::json!({
                "account_id": account_id,
                "attendees_ids": [provider_id],
                "text": text,
            }))
            .timeout(self.lookup_timeout)
            .send()
            .await;

        self.wrap_action(response, account_id, "message").await
    }

    pub async fn follow(&self, provider_id: &str, account_id: &str) -> ProviderOutcome {
        let url = self.url(&format!("/users/{}/follow", provider_id));
        let response = self
            .client
            .post(&url)
            .header("X-API-KEY", &self.token)
            .json(&serde_json::json!({ "account_id": account_id }))
            .timeout(self.lookup_timeout)
            .send()
            .await;

        self.wrap_action(response, account_id, "follow").await
    }

    /// Full profile fetch (all sections); slower than a lookup, so it gets
    /// the longer timeout.
    pub async fn get_profile(&self, public_id: &str, account_id: &str) -> ProviderOutcome {
        let url = self.url(&format!("/users/{}", public_id));
        let response = self
            .client
            .get(&url)
            .header("X-API-KEY", &self.token)
            .query(&[("account_id", account_id), ("linkedin_sections", "*")])
            .timeout(self.profile_timeout)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return transport_outcome(e),
        };

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let (success, category) = classify_linkedin_response(status, &body);
        if success {
            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(profile) => ProviderOutcome::ok(profile).with_status(status),
                Err(e) => ProviderOutcome::failure(
                    ErrorCategory::Unknown,
                    format!("Unexpected profile payload: {}", e),
                )
                .with_status(status),
            }
        } else {
            warn!("Profile fetch {} failed ({}): {}", public_id, status, truncate(&body));
            ProviderOutcome::failure(category, body).with_status(status)
        }
    }

    /// Invitations sent from this account, most recent first.
    pub async fn list_sent_invitations(
        &self,
        account_id: &str,
    ) -> Result<Vec<SentInvitation>, String> {
        let url = self.url("/users/invite/sent");
        let response = self
            .client
            .get(&url)
            .header("X-API-KEY", &self.token)
            .query(&[("account_id", account_id), ("limit", "100")])
            .timeout(self.profile_timeout)
            .send()
            .await
            .map_err(|e| format!("Unipile request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Unipile invitations error {}: {}", status, truncate(&body)));
        }

        let parsed: InvitationListResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse invitations: {}", e))?;
        Ok(parsed.items)
    }

    /// Provider-side account status token (e.g. "OK", "CREDENTIALS").
    pub async fn get_account_status(&self, account_id: &str) -> Result<String, String> {
        let url = self.url(&format!("/accounts/{}", account_id));
        let response = self
            .client
            .get(&url)
            .header("X-API-KEY", &self.token)
            .timeout(self.lookup_timeout)
            .send()
            .await
            .map_err(|e| format!("Unipile request failed: {}", e))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok("NOT_FOUND".to_string());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Unipile account status error {}: {}", status, truncate(&body)));
        }

        let parsed: AccountStatusResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse account status: {}", e))?;

        Ok(parsed
            .sources
            .into_iter()
            .filter_map(|s| s.status)
            .next()
            .or(parsed.status)
            .unwrap_or_else(|| "OK".to_string()))
    }

    /// Start (or continue) a chat on a non-LinkedIn messaging account.
    /// `attendee` is a phone number for WhatsApp, a username for Instagram.
    pub async fn send_chat_message(
        &self,
        account_id: &str,
        attendee: &str,
        text: &str,
    ) -> ProviderOutcome {
        let url = self.url("/chats");
        let response = self
            .client
            .post(&url)
            .header("X-API-KEY", &self.token)
            .json(&serde_json::json!({
                "account_id": account_id,
                "attendees_ids": [attendee],
                "text": text,
            }))
            .timeout(self.lookup_timeout)
            .send()
            .await;

        self.wrap_action(response, account_id, "chat").await
    }

    pub async fn register_webhook(&self, callback_url: &str) -> Result<(), String> {
        let url = self.url("/webhooks");
        let response = self
            .client
            .post(&url)
            .header("X-API-KEY", &self.token)
            .json(&serde_json::json!({
                "source": "account_status",
                "request_url": callback_url,
            }))
            .timeout(self.lookup_timeout)
            .send()
            .await
            .map_err(|e| format!("Unipile request failed: {}", e))?;

        if response.status().is_success() {
            info!("Registered Unipile account-status webhook at {}", callback_url);
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(format!("Webhook registration error {}: {}", status, truncate(&body)))
        }
    }

    async fn wrap_action(
        &self,
        response: Result<reqwest::Response, reqwest::Error>,
        account_id: &str,
        action: &str,
    ) -> ProviderOutcome {
        let response = match response {
            Ok(r) => r,
            Err(e) => return transport_outcome(e),
        };

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let (success, category) = classify_linkedin_response(status, &body);
        if success {
            let data = serde_json::from_str(&body).unwrap_or(serde_json::json!({}));
            ProviderOutcome::ok(data).with_status(status)
        } else {
            warn!("Unipile {} via account {} failed ({}): {}", action, account_id, status, truncate(&body));
            ProviderOutcome::failure(category, body).with_status(status)
        }
    }
}

fn transport_outcome(e: reqwest::Error) -> ProviderOutcome {
    // Deadline exceeded and connection resets both read as transient.
    ProviderOutcome::failure(ErrorCategory::Transient, format!("Transport error: {}", e))
}

fn truncate(body: &str) -> String {
    body.chars().take(300).collect()
}

/// Extract the public identifier from a LinkedIn profile URL.
pub fn extract_public_id(linkedin_url: &str) -> Option<String> {
    let re = Regex::new(r"linkedin\.com/in/([^/?#]+)").ok()?;
    re.captures(linkedin_url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_public_id() {
        assert_eq!(
            extract_public_id("https://www.linkedin.com/in/alice").as_deref(),
            Some("alice")
        );
        assert_eq!(
            extract_public_id("https://linkedin.com/in/bob-smith-123/?utm=x").as_deref(),
            Some("bob-smith-123")
        );
        assert_eq!(extract_public_id("https://example.com/in/alice"), None);
    }
}

use std::time::Duration;

use reqwest::Client;
use tracing::warn;

use crate::services::provider::{ErrorCategory, ProviderOutcome};

/// VAPI outbound-call trigger. The call itself runs asynchronously on the
/// provider side; a successful trigger is a `delivered` step.
#[derive(Clone)]
pub struct VoiceConnector {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl VoiceConnector {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: std::env::var("VAPI_BASE_URL")
                .unwrap_or_else(|_| "https://api.vapi.ai".to_string()),
            api_key: std::env::var("VAPI_API_KEY").ok(),
        }
    }

    pub async fn trigger_call(
        &self,
        voice_agent_id: &str,
        phone: &str,
        context: &str,
        lead_name: &str,
    ) -> ProviderOutcome {
        let api_key = match self.api_key.as_deref() {
            Some(k) => k,
            None => {
                return ProviderOutcome::failure(
                    ErrorCategory::CredentialsExpired,
                    "VAPI_API_KEY not configured",
                )
            }
        };

        let response = self
            .client
            .post(format!("{}/call", self.base_url))
            .bearer_auth(api_key)
            .json(&serde_json::json!({
                "assistantId": voice_agent_id,
                "customer": { "number": phone, "name": lead_name },
                "assistantOverrides": {
                    "variableValues": { "context": context }
                },
            }))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                return ProviderOutcome::failure(
                    ErrorCategory::Transient,
                    format!("Transport error: {}", e),
                )
            }
        };

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        match status {
            200..=299 => {
                let data = serde_json::from_str(&body).unwrap_or(serde_json::json!({}));
                ProviderOutcome::ok(data).with_status(status)
            }
            401 | 403 => ProviderOutcome::failure(ErrorCategory::CredentialsExpired, body)
                .with_status(status),
            429 => ProviderOutcome::failure(ErrorCategory::RateLimit, body).with_status(status),
            400 | 422 => {
                warn!(
                    "Voice call rejected for agent {}: {}",
                    voice_agent_id,
                    body.chars().take(200).collect::<String>()
                );
                ProviderOutcome::failure(ErrorCategory::Validation, body).with_status(status)
            }
            500..=599 => ProviderOutcome::failure(ErrorCategory::Transient, body).with_status(status),
            _ => ProviderOutcome::failure(ErrorCategory::Unknown, body).with_status(status),
        }
    }
}

impl Default for VoiceConnector {
    fn default() -> Self {
        Self::new()
    }
}

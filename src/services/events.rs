use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;

/// Best-effort fan-out to the realtime push layer. A publish failure must
/// never fail the state change it narrates, so every error lands in the
/// logs and nowhere else.
#[derive(Clone)]
pub struct EventPublisher {
    client: Client,
    base_url: Option<String>,
}

impl EventPublisher {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.backend_internal_url.clone(),
        }
    }

    pub async fn publish(&self, topic: &str, event: serde_json::Value) {
        let base = match &self.base_url {
            Some(base) => base.trim_end_matches('/'),
            None => {
                debug!("Event fan-out disabled, dropping {}", topic);
                return;
            }
        };

        let result = self
            .client
            .post(format!("{}/internal/events", base))
            .json(&serde_json::json!({ "topic": topic, "event": event }))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!("Event publish to {} returned {}", topic, response.status());
            }
            Err(e) => {
                warn!("Event publish to {} failed: {}", topic, e);
            }
        }
    }

    pub async fn campaign_stats_updated(&self, campaign_id: Uuid, event: serde_json::Value) {
        self.publish(&format!("campaign:{}:stats", campaign_id), event).await;
    }

    pub async fn campaigns_list_updated(&self, tenant_id: Uuid) {
        self.publish(
            "campaigns:list:updates",
            serde_json::json!({ "tenant_id": tenant_id }),
        )
        .await;
    }

    pub async fn linkedin_account_status(&self, account_id: Uuid, status: &str) {
        self.publish(
            "linkedin:account:status",
            serde_json::json!({ "account_id": account_id, "status": status }),
        )
        .await;
    }
}

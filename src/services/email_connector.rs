use lettre::{
    message::header::ContentType,
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::services::encryption::EncryptionService;
use crate::services::provider::{ErrorCategory, ProviderOutcome};

/// SMTP sender for the `email_send` / `email_followup` steps, routed
/// through the tenant's connected email account.
pub struct EmailConnector {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct InboxCredentials {
    id: Uuid,
    email: String,
    smtp_host: String,
    smtp_port: i32,
    smtp_username: String,
    smtp_password_encrypted: Option<Vec<u8>>,
}

impl EmailConnector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn send(
        &self,
        config: &Config,
        tenant_id: Uuid,
        to_email: &str,
        to_name: &str,
        subject: &str,
        body: &str,
    ) -> ProviderOutcome {
        let inbox = match self.pick_inbox(tenant_id).await {
            Ok(Some(inbox)) => inbox,
            Ok(None) => {
                return ProviderOutcome::failure(
                    ErrorCategory::NotFound,
                    "No active email account for tenant",
                )
            }
            Err(e) => return ProviderOutcome::failure(ErrorCategory::Transient, e),
        };

        let password = match self.smtp_password(config, &inbox) {
            Ok(p) => p,
            Err(e) => return ProviderOutcome::failure(ErrorCategory::CredentialsExpired, e),
        };

        let to = if to_name.is_empty() {
            to_email.to_string()
        } else {
            format!("{} <{}>", to_name, to_email)
        };

        let message = Message::builder()
            .from(match inbox.email.parse() {
                Ok(m) => m,
                Err(e) => {
                    return ProviderOutcome::failure(
                        ErrorCategory::Validation,
                        format!("Invalid from address: {}", e),
                    )
                }
            })
            .to(match to.parse() {
                Ok(m) => m,
                Err(e) => {
                    return ProviderOutcome::failure(
                        ErrorCategory::Validation,
                        format!("Invalid to address: {}", e),
                    )
                }
            })
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string());

        let message = match message {
            Ok(m) => m,
            Err(e) => {
                return ProviderOutcome::failure(
                    ErrorCategory::Validation,
                    format!("Failed to build email: {}", e),
                )
            }
        };

        let mailer: AsyncSmtpTransport<Tokio1Executor> =
            match AsyncSmtpTransport::<Tokio1Executor>::relay(&inbox.smtp_host) {
                Ok(builder) => builder
                    .credentials(Credentials::new(inbox.smtp_username.clone(), password))
                    .port(inbox.smtp_port as u16)
                    .build(),
                Err(e) => {
                    return ProviderOutcome::failure(
                        ErrorCategory::Transient,
                        format!("Failed to create transport: {}", e),
                    )
                }
            };

        match mailer.send(message).await {
            Ok(response) => {
                let message_id = response.message().collect::<Vec<_>>().join("");
                ProviderOutcome::ok(serde_json::json!({
                    "message_id": message_id,
                    "inbox_id": inbox.id,
                }))
            }
            Err(e) => {
                warn!("SMTP send via {} failed: {}", inbox.email, e);
                let category = if e.is_permanent() {
                    ErrorCategory::Validation
                } else {
                    ErrorCategory::Transient
                };
                ProviderOutcome::failure(category, format!("SMTP error: {}", e))
            }
        }
    }

    async fn pick_inbox(&self, tenant_id: Uuid) -> Result<Option<InboxCredentials>, String> {
        sqlx::query_as::<_, InboxCredentials>(
            r#"
            SELECT id, email, smtp_host, smtp_port, smtp_username, smtp_password_encrypted
            FROM email_accounts
            WHERE tenant_id = $1 AND status = 'active'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| format!("DB error: {}", e))
    }

    fn smtp_password(&self, config: &Config, inbox: &InboxCredentials) -> Result<String, String> {
        let blob = inbox
            .smtp_password_encrypted
            .as_deref()
            .ok_or("Email account has no stored credentials")?;
        let service = EncryptionService::from_config(config)?;
        service.decrypt(blob)
    }
}

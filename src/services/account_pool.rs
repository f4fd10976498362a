use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::models::account::{AccountStatus, ProviderAccount};
use crate::services::unipile_connector::UnipileConnector;

/// Result of probing an account at the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    Valid,
    NeedsCheckpoint,
    NotFound,
    Transient,
}

/// What the caller should do after a 401 on this account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Verified healthy within the attempt budget: re-issue the call.
    RetryNow,
    /// Provider wants an interactive checkpoint; never auto-retried.
    RequiresUserIntervention,
    /// Account is gone at the provider; marked inactive locally.
    AccountInactive,
    /// Probe failed for an unknown reason; caller may back off.
    Transient,
    /// Attempt budget for the window is exhausted.
    AttemptsExhausted,
}

struct AttemptWindow {
    count: u32,
    window_start: Instant,
}

/// Per-tenant LinkedIn account selection, health probing, and bounded
/// 401-recovery. The attempt counters are an advisory in-memory cache
/// (5-minute rolling window, cap 3); correctness never depends on them.
pub struct AccountPool {
    pool: PgPool,
    unipile: UnipileConnector,
    attempts: Mutex<HashMap<Uuid, AttemptWindow>>,
    max_attempts: u32,
    attempt_window: Duration,
}

impl AccountPool {
    pub fn new(pool: PgPool, unipile: UnipileConnector, config: &Config) -> Self {
        Self {
            pool,
            unipile,
            attempts: Mutex::new(HashMap::new()),
            max_attempts: config.max_reconnect_attempts,
            attempt_window: Duration::from_millis(config.reconnect_attempt_window_ms),
        }
    }

    /// Most recently connected healthy account, or None.
    pub async fn pick(&self, tenant_id: Uuid, provider: &str) -> Result<Option<ProviderAccount>, String> {
        sqlx::query_as::<_, ProviderAccount>(
            r#"
            SELECT * FROM linkedin_accounts
            WHERE tenant_id = $1 AND provider = $2
              AND status = 'active' AND NOT needs_reconnect
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| format!("DB error: {}", e))
    }

    /// Primary first, then the remaining healthy accounts newest-first.
    pub async fn fallback_order(
        &self,
        tenant_id: Uuid,
        provider: &str,
        primary: &ProviderAccount,
    ) -> Result<Vec<ProviderAccount>, String> {
        let mut accounts = sqlx::query_as::<_, ProviderAccount>(
            r#"
            SELECT * FROM linkedin_accounts
            WHERE tenant_id = $1 AND provider = $2
              AND status = 'active' AND NOT needs_reconnect
            ORDER BY created_at DESC
            "#,
        )
        .bind(tenant_id)
        .bind(provider)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| format!("DB error: {}", e))?;

        accounts.retain(|a| a.id != primary.id);
        let mut ordered = vec![primary.clone()];
        ordered.extend(accounts);
        Ok(ordered)
    }

    /// Probe the provider for the account's live status.
    pub async fn verify(&self, account: &ProviderAccount) -> VerifyResult {
        match self.unipile.get_account_status(&account.external_account_id).await {
            Ok(token) => match token.to_uppercase().as_str() {
                "OK" | "CONNECTED" | "SYNC_SUCCESS" => VerifyResult::Valid,
                "CHECKPOINT" | "CAPTCHA" | "IN_APP_VALIDATION" | "2FA" | "OTP" => {
                    VerifyResult::NeedsCheckpoint
                }
                "NOT_FOUND" | "DELETED" => VerifyResult::NotFound,
                other => {
                    warn!("Account {} probe returned unexpected token {}", account.id, other);
                    VerifyResult::Transient
                }
            },
            Err(e) => {
                warn!("Account {} probe failed: {}", account.id, e);
                VerifyResult::Transient
            }
        }
    }

    /// Bounded 401 recovery: register an attempt in the rolling window,
    /// probe the account, and tell the caller what to do next.
    pub async fn on_unauthorized(&self, account: &ProviderAccount) -> ReconnectOutcome {
        if !self.register_attempt(account.id, Instant::now()) {
            warn!(
                "Account {} exceeded {} reconnect attempts in window",
                account.id, self.max_attempts
            );
            self.mark_needs_reconnect(account.id).await;
            return ReconnectOutcome::AttemptsExhausted;
        }

        match self.verify(account).await {
            VerifyResult::Valid => {
                info!("Account {} verified healthy after 401, retrying", account.id);
                ReconnectOutcome::RetryNow
            }
            VerifyResult::NeedsCheckpoint => {
                self.set_status(account.id, AccountStatus::CredentialsExpired, true).await;
                ReconnectOutcome::RequiresUserIntervention
            }
            VerifyResult::NotFound => {
                self.set_status(account.id, AccountStatus::Inactive, false).await;
                ReconnectOutcome::AccountInactive
            }
            VerifyResult::Transient => ReconnectOutcome::Transient,
        }
    }

    /// True while the account is under the attempt cap for the window.
    fn register_attempt(&self, account_id: Uuid, now: Instant) -> bool {
        let mut attempts = match self.attempts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = attempts.entry(account_id).or_insert(AttemptWindow {
            count: 0,
            window_start: now,
        });
        if now.duration_since(entry.window_start) > self.attempt_window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;
        entry.count <= self.max_attempts
    }

    pub async fn set_status(&self, account_id: Uuid, status: AccountStatus, needs_reconnect: bool) {
        let result = sqlx::query(
            "UPDATE linkedin_accounts SET status = $1, needs_reconnect = $2, updated_at = NOW() WHERE id = $3",
        )
        .bind(status.as_str())
        .bind(needs_reconnect)
        .bind(account_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!("Failed to update account {} status: {}", account_id, e);
        }
    }

    async fn mark_needs_reconnect(&self, account_id: Uuid) {
        self.set_status(account_id, AccountStatus::CredentialsExpired, true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_for_test(max_attempts: u32, window: Duration) -> AccountPool {
        // The DB handle is never touched by the attempt-window logic.
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        let config = crate::config::Config {
            database_url: String::new(),
            jwt_secret: String::new(),
            default_tz: "UTC".into(),
            poll_schedule: String::new(),
            unipile_dsn: "https://unipile.test".into(),
            unipile_token: String::new(),
            unipile_lookup_timeout_ms: 1000,
            unipile_profile_timeout_ms: 1000,
            apollo_api_key: None,
            apollo_base_url: String::new(),
            backend_internal_url: None,
            summarizer_url: None,
            max_reconnect_attempts: max_attempts,
            reconnect_attempt_window_ms: window.as_millis() as u64,
            post_invite_quiescence_ms: 0,
            encryption_key: None,
        };
        let unipile = UnipileConnector::new(&config);
        AccountPool::new(pool, unipile, &config)
    }

    #[tokio::test]
    async fn test_attempt_cap_within_window() {
        let pool = pool_for_test(3, Duration::from_secs(300));
        let id = Uuid::new_v4();
        let t0 = Instant::now();

        assert!(pool.register_attempt(id, t0));
        assert!(pool.register_attempt(id, t0));
        assert!(pool.register_attempt(id, t0));
        assert!(!pool.register_attempt(id, t0));
    }

    #[tokio::test]
    async fn test_window_reset_restores_budget() {
        let pool = pool_for_test(3, Duration::from_secs(300));
        let id = Uuid::new_v4();
        let t0 = Instant::now();

        for _ in 0..4 {
            pool.register_attempt(id, t0);
        }
        assert!(!pool.register_attempt(id, t0));

        let later = t0 + Duration::from_secs(301);
        assert!(pool.register_attempt(id, later));
    }

    #[tokio::test]
    async fn test_accounts_tracked_independently() {
        let pool = pool_for_test(1, Duration::from_secs(300));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let t0 = Instant::now();

        assert!(pool.register_attempt(a, t0));
        assert!(!pool.register_attempt(a, t0));
        assert!(pool.register_attempt(b, t0));
    }
}

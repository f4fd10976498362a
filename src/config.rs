use std::env;

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    /// Fallback scheduler timezone when a tenant has none configured.
    pub default_tz: String,
    /// Cron expression driving the invitation poller.
    pub poll_schedule: String,
    pub unipile_dsn: String,
    pub unipile_token: String,
    pub unipile_lookup_timeout_ms: u64,
    pub unipile_profile_timeout_ms: u64,
    pub apollo_api_key: Option<String>,
    pub apollo_base_url: String,
    /// In-cluster base URL for event fan-out.
    pub backend_internal_url: Option<String>,
    pub summarizer_url: Option<String>,
    pub max_reconnect_attempts: u32,
    pub reconnect_attempt_window_ms: u64,
    pub post_invite_quiescence_ms: u64,
    pub encryption_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .expect("DATABASE_URL must be set"),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| "default-secret-change-in-production".to_string()),
            default_tz: env::var("TZ").unwrap_or_else(|_| "UTC".to_string()),
            // Three runs daily: 07:00, 13:00, 19:00.
            poll_schedule: env::var("POLL_SCHEDULE")
                .unwrap_or_else(|_| "0 0 7,13,19 * * *".to_string()),
            unipile_dsn: env::var("UNIPILE_DSN")
                .unwrap_or_else(|_| "https://api.unipile.com:13443".to_string()),
            unipile_token: env::var("UNIPILE_TOKEN").unwrap_or_default(),
            unipile_lookup_timeout_ms: env_u64("UNIPILE_LOOKUP_TIMEOUT_MS", 15_000),
            unipile_profile_timeout_ms: env_u64("UNIPILE_PROFILE_TIMEOUT_MS", 30_000),
            apollo_api_key: env::var("APOLLO_API_KEY").ok(),
            apollo_base_url: env::var("APOLLO_BASE_URL")
                .unwrap_or_else(|_| "https://api.apollo.io/api/v1".to_string()),
            backend_internal_url: env::var("BACKEND_INTERNAL_URL").ok(),
            summarizer_url: env::var("SUMMARIZER_URL").ok(),
            max_reconnect_attempts: env_u64("MAX_RECONNECT_ATTEMPTS", 3) as u32,
            reconnect_attempt_window_ms: env_u64("RECONNECT_ATTEMPT_WINDOW_MS", 300_000),
            post_invite_quiescence_ms: env_u64("POST_INVITE_QUIESCENCE_MS", 10_000),
            encryption_key: env::var("ENCRYPTION_KEY").ok(),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

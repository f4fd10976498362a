use chrono_tz::Tz;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::services::account_pool::AccountPool;
use crate::services::activity_ledger::ActivityLedger;
use crate::services::apollo_connector::ApolloConnector;
use crate::services::email_connector::EmailConnector;
use crate::services::enrichment::EnrichmentService;
use crate::services::events::EventPublisher;
use crate::services::quota::QuotaGate;
use crate::services::task_queue::TaskQueue;
use crate::services::unipile_connector::UnipileConnector;
use crate::services::voice_connector::VoiceConnector;

/// Shared dependency bundle, built once per process and passed by
/// reference. Holds the long-lived pieces (DB pool, HTTP clients, the
/// account pool's attempt counters); the cheap per-call services are
/// constructed on demand from it.
pub struct AppContext {
    pub pool: PgPool,
    pub config: Config,
    pub unipile: UnipileConnector,
    pub apollo: ApolloConnector,
    pub voice: VoiceConnector,
    pub events: EventPublisher,
    pub accounts: AccountPool,
}

impl AppContext {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let unipile = UnipileConnector::new(&config);
        let apollo = ApolloConnector::new(&config);
        let voice = VoiceConnector::new();
        let events = EventPublisher::new(&config);
        let accounts = AccountPool::new(pool.clone(), unipile.clone(), &config);
        Self {
            pool,
            config,
            unipile,
            apollo,
            voice,
            events,
            accounts,
        }
    }

    pub fn ledger(&self) -> ActivityLedger {
        ActivityLedger::new(self.pool.clone())
    }

    pub fn quota(&self) -> QuotaGate {
        QuotaGate::new(self.pool.clone())
    }

    pub fn enrichment(&self) -> EnrichmentService {
        EnrichmentService::new(self.pool.clone(), self.apollo.clone())
    }

    pub fn email(&self) -> EmailConnector {
        EmailConnector::new(self.pool.clone())
    }

    pub fn tasks(&self) -> TaskQueue {
        TaskQueue::new(self.pool.clone())
    }

    /// The tenant's scheduling timezone. Unknown tenants and unparsable
    /// names fall back to the configured default, then UTC.
    pub async fn tenant_timezone(&self, tenant_id: Uuid) -> Tz {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT tz FROM tenants WHERE id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await
                .unwrap_or_else(|e| {
                    warn!("Timezone lookup failed for tenant {}: {}", tenant_id, e);
                    None
                });

        let name = stored.unwrap_or_else(|| self.config.default_tz.clone());
        name.parse().unwrap_or_else(|_| {
            warn!("Invalid timezone {:?} for tenant {}, using UTC", name, tenant_id);
            chrono_tz::UTC
        })
    }
}

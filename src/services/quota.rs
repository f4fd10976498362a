use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

/// Window over which connection volume is measured. Daily follows the
/// tenant's calendar day; weekly is a strict rolling 7×24h, never a
/// calendar week.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    Daily,
    Weekly,
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: i64,
}

/// Pre-dispatch gate for LinkedIn connection volume: the sum of the
/// tenant's active account caps against the recent ledger.
pub struct QuotaGate {
    pool: PgPool,
}

impl QuotaGate {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn check(&self, tenant_id: Uuid, scope: QuotaScope, tz: Tz) -> QuotaDecision {
        let cap = match self.sum_caps(tenant_id, scope).await {
            Ok(cap) => cap,
            Err(e) => {
                // Transient capacity-query failure fails open; a zero cap
                // (below) still closes the gate.
                warn!("Quota capacity query failed for tenant {}: {}", tenant_id, e);
                return QuotaDecision { allowed: true, remaining: i64::MAX };
            }
        };

        if cap <= 0 {
            return QuotaDecision { allowed: false, remaining: 0 };
        }

        let (since, until) = window_bounds(Utc::now(), scope, tz);
        let used = match self.count_connects(tenant_id, since, until).await {
            Ok(used) => used,
            Err(e) => {
                warn!("Quota usage query failed for tenant {}: {}", tenant_id, e);
                return QuotaDecision { allowed: true, remaining: cap };
            }
        };

        QuotaDecision {
            allowed: used < cap,
            remaining: (cap - used).max(0),
        }
    }

    async fn sum_caps(&self, tenant_id: Uuid, scope: QuotaScope) -> Result<i64, String> {
        let query = match scope {
            QuotaScope::Daily => {
                r#"
                SELECT COALESCE(SUM(daily_cap), 0)::BIGINT FROM linkedin_accounts
                WHERE tenant_id = $1 AND provider = 'linkedin'
                  AND status = 'active' AND NOT needs_reconnect
                "#
            }
            QuotaScope::Weekly => {
                r#"
                SELECT COALESCE(SUM(COALESCE(weekly_cap, daily_cap * 7)), 0)::BIGINT
                FROM linkedin_accounts
                WHERE tenant_id = $1 AND provider = 'linkedin'
                  AND status = 'active' AND NOT needs_reconnect
                "#
            }
        };

        sqlx::query_scalar(query)
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| format!("DB error: {}", e))
    }

    async fn count_connects(
        &self,
        tenant_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64, String> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM campaign_lead_activities
            WHERE tenant_id = $1 AND step_type = 'linkedin_connect'
              AND status IN ('sent', 'delivered', 'connected')
              AND created_at >= $2 AND created_at < $3
            "#,
        )
        .bind(tenant_id)
        .bind(since)
        .bind(until)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| format!("DB error: {}", e))
    }
}

/// UTC bounds of the measurement window ending at `now`.
pub fn window_bounds(now: DateTime<Utc>, scope: QuotaScope, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    match scope {
        QuotaScope::Daily => {
            let local_day = now.with_timezone(&tz).date_naive();
            let start = tz
                .from_local_datetime(&local_day.and_hms_opt(0, 0, 0).unwrap())
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(now - Duration::hours(24));
            (start, now)
        }
        QuotaScope::Weekly => (now - Duration::days(7), now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_daily_window_follows_tenant_timezone() {
        // 02:00 UTC on June 2nd is still June 1st in New York.
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 2, 0, 0).unwrap();
        let (start, until) = window_bounds(now, QuotaScope::Daily, chrono_tz::America::New_York);

        assert_eq!(until, now);
        // Local midnight June 1st EDT = 04:00 UTC June 1st.
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 6, 1, 4, 0, 0).unwrap());
    }

    #[test]
    fn test_daily_window_utc() {
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 2, 0, 0).unwrap();
        let (start, _) = window_bounds(now, QuotaScope::Daily, chrono_tz::UTC);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_weekly_window_is_rolling() {
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 2, 0, 0).unwrap();
        let (start, until) = window_bounds(now, QuotaScope::Weekly, chrono_tz::America::New_York);
        assert_eq!(until - start, Duration::days(7));
        assert_eq!(until, now);
    }
}

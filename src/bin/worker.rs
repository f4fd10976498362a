use chrono::Utc;
use cron::Schedule;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use uuid::Uuid;

use reachflow::config::Config;
use reachflow::services::context::AppContext;
use reachflow::services::daily_scheduler::{DailyScheduler, RunOutcome};
use reachflow::services::invitation_poller::InvitationPoller;
use reachflow::services::task_queue::{DailyRunPayload, ScheduledTask, TASK_DAILY_CAMPAIGN_RUN};

/// Bound on concurrently executing daily runs; per-campaign exclusivity
/// comes from the campaign row lock, this only caps parallelism.
const MAX_CONCURRENT_RUNS: usize = 4;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("Failed to create pool");

    let schedule = Schedule::from_str(&config.poll_schedule)
        .expect("POLL_SCHEDULE must be a valid cron expression");

    let ctx = Arc::new(AppContext::new(pool, config));
    let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_RUNS));

    println!("🔄 Reachflow worker started");
    println!("   - Executing daily campaign runs");
    println!("   - Reconciling LinkedIn invitations on {}", ctx.config.poll_schedule);

    let mut next_poll = schedule.upcoming(Utc).next();
    let mut iteration = 0u64;

    loop {
        iteration += 1;

        // Claim and run due campaign tasks.
        match ctx.tasks().claim_due(10).await {
            Ok(tasks) => {
                if !tasks.is_empty() {
                    println!("[{}] Claimed {} tasks", iteration, tasks.len());
                }
                for task in tasks {
                    let ctx = ctx.clone();
                    let permits = permits.clone();
                    tokio::spawn(async move {
                        let _permit = match permits.acquire().await {
                            Ok(permit) => permit,
                            Err(_) => return,
                        };
                        process_task(&ctx, task).await;
                    });
                }
            }
            Err(e) => eprintln!("Error claiming tasks: {}", e),
        }

        // Fire the invitation poller on its cron.
        if let Some(when) = next_poll {
            if Utc::now() >= when {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let poller = InvitationPoller::new(&ctx);
                    if let Err(e) = poller.run_once().await {
                        eprintln!("Invitation poll failed: {}", e);
                    }
                });
                next_poll = schedule.upcoming(Utc).next();
            }
        }

        // Catch-up sweep (~10 minutes): campaigns that lost their next-day
        // task (crash between run and enqueue) get one re-issued.
        if iteration % 120 == 1 {
            if let Err(e) = enqueue_missing_daily_tasks(&ctx).await {
                eprintln!("Catch-up enqueue failed: {}", e);
            }
        }

        sleep(Duration::from_secs(5)).await;
    }
}

async fn process_task(ctx: &AppContext, task: ScheduledTask) {
    let result = match task.task_type.as_str() {
        TASK_DAILY_CAMPAIGN_RUN => run_daily_task(ctx, &task).await,
        other => Err(format!("Unknown task type: {}", other)),
    };

    match result {
        Ok(summary) => {
            println!("✅ Task {} done: {}", task.task_name, summary);
            if let Err(e) = ctx.tasks().mark_completed(task.id).await {
                eprintln!("Failed to mark task {} completed: {}", task.id, e);
            }
        }
        Err(e) => {
            eprintln!("Task {} failed: {}", task.task_name, e);
            if let Err(mark_err) = ctx.tasks().mark_failed(task.id, &e).await {
                eprintln!("Failed to mark task {} failed: {}", task.id, mark_err);
            }
        }
    }
}

async fn run_daily_task(ctx: &AppContext, task: &ScheduledTask) -> Result<String, String> {
    let payload: DailyRunPayload = serde_json::from_value(task.payload.clone())
        .map_err(|e| format!("Invalid payload: {}", e))?;

    let scheduler = DailyScheduler::new(ctx);
    let outcome = scheduler
        .run_daily(payload.campaign_id, payload.tenant_id, payload.scheduled_for)
        .await?;

    Ok(match outcome {
        RunOutcome::Skipped { reason } => format!("skipped ({})", reason),
        RunOutcome::CampaignEnded => "campaign ended".to_string(),
        RunOutcome::Completed { sourced, leads_processed, leads_stopped } => format!(
            "sourced {} leads, processed {}, stopped {}",
            sourced, leads_processed, leads_stopped
        ),
    })
}

/// Running campaigns with no live daily task get one for today, firing
/// immediately. The scheduler's own already_ran_today gate makes this safe.
async fn enqueue_missing_daily_tasks(ctx: &AppContext) -> Result<(), String> {
    #[derive(sqlx::FromRow)]
    struct Orphan {
        id: Uuid,
        tenant_id: Uuid,
    }

    let orphans = sqlx::query_as::<_, Orphan>(
        r#"
        SELECT c.id, c.tenant_id FROM campaigns c
        WHERE c.status IN ('running', 'active') AND NOT c.is_deleted
          AND NOT EXISTS (
              SELECT 1 FROM scheduled_tasks t
              WHERE t.task_type = $1
                AND t.status IN ('pending', 'scheduled', 'processing')
                AND (t.payload->>'campaign_id')::UUID = c.id
          )
        "#,
    )
    .bind(TASK_DAILY_CAMPAIGN_RUN)
    .fetch_all(&ctx.pool)
    .await
    .map_err(|e| format!("Orphan sweep query failed: {}", e))?;

    for orphan in orphans {
        let tz = ctx.tenant_timezone(orphan.tenant_id).await;
        let today = Utc::now().with_timezone(&tz).date_naive();
        let payload = DailyRunPayload {
            campaign_id: orphan.id,
            tenant_id: orphan.tenant_id,
            scheduled_for: today,
        };
        if let Err(e) = ctx.tasks().enqueue_daily_run(&payload, Utc::now()).await {
            eprintln!("Failed to re-enqueue campaign {}: {}", orphan.id, e);
        }
    }

    Ok(())
}

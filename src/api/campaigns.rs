use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use crate::middleware::auth::{extract_claims, get_tenant_id, get_user_id};
use crate::models::activity::Activity;
use crate::models::campaign::{
    Campaign, CampaignFilters, CreateCampaignRequest, UpdateCampaignRequest,
};
use crate::models::lead::{CampaignLead, LeadFilters};
use crate::models::step::{ReplaceStepsRequest, Step, StepType};
use crate::services::context::AppContext;
use crate::services::task_queue::DailyRunPayload;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/campaigns")
            .route("", web::get().to(list_campaigns))
            .route("", web::post().to(create_campaign))
            .route("/stats", web::get().to(campaign_stats))
            .route("/{id}", web::get().to(get_campaign))
            .route("/{id}", web::put().to(update_campaign))
            .route("/{id}", web::delete().to(delete_campaign))
            .route("/{id}/start", web::post().to(start_campaign))
            .route("/{id}/pause", web::post().to(pause_campaign))
            .route("/{id}/stop", web::post().to(stop_campaign))
            .route("/{id}/leads", web::get().to(list_leads))
            .route("/{id}/activities", web::get().to(list_activities))
            .route("/{id}/steps", web::get().to(list_steps))
            .route("/{id}/steps", web::put().to(replace_steps)),
    );
}

fn internal(e: impl std::fmt::Display) -> actix_web::Error {
    actix_web::error::ErrorInternalServerError(e.to_string())
}

async fn list_campaigns(
    ctx: web::Data<AppContext>,
    query: web::Query<CampaignFilters>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;

    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let page = query.page.unwrap_or(1).max(1);
    let offset = (page - 1) * limit;
    let search = query.search.as_deref().map(|s| format!("%{}%", s));

    let campaigns = sqlx::query_as::<_, Campaign>(
        r#"
        SELECT * FROM campaigns
        WHERE tenant_id = $1 AND NOT is_deleted
          AND ($2::TEXT IS NULL OR status = $2)
          AND ($3::TEXT IS NULL OR name ILIKE $3)
        ORDER BY created_at DESC
        LIMIT $4 OFFSET $5
        "#,
    )
    .bind(tenant_id)
    .bind(&query.status)
    .bind(&search)
    .bind(limit)
    .bind(offset)
    .fetch_all(&ctx.pool)
    .await
    .map_err(internal)?;

    Ok(HttpResponse::Ok().json(campaigns))
}

async fn campaign_stats(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;

    #[derive(sqlx::FromRow, serde::Serialize)]
    struct StatusCount {
        status: String,
        count: i64,
    }

    let by_status = sqlx::query_as::<_, StatusCount>(
        "SELECT status, COUNT(*) as count FROM campaigns WHERE tenant_id = $1 AND NOT is_deleted GROUP BY status",
    )
    .bind(tenant_id)
    .fetch_all(&ctx.pool)
    .await
    .map_err(internal)?;

    #[derive(sqlx::FromRow, serde::Serialize)]
    struct CampaignCounters {
        campaign_id: Uuid,
        name: String,
        status: String,
        total_leads: i64,
        sent: i64,
        connected: i64,
        replied: i64,
        errors: i64,
    }

    let counters = sqlx::query_as::<_, CampaignCounters>(
        r#"
        SELECT c.id as campaign_id, c.name, c.status,
               (SELECT COUNT(*) FROM campaign_leads cl WHERE cl.campaign_id = c.id) as total_leads,
               COUNT(a.id) FILTER (WHERE a.status IN ('sent', 'delivered', 'connected', 'replied')) as sent,
               COUNT(a.id) FILTER (WHERE a.status = 'connected') as connected,
               COUNT(a.id) FILTER (WHERE a.status = 'replied') as replied,
               COUNT(a.id) FILTER (WHERE a.status = 'error') as errors
        FROM campaigns c
        LEFT JOIN campaign_lead_activities a ON a.campaign_id = c.id
        WHERE c.tenant_id = $1 AND NOT c.is_deleted
        GROUP BY c.id, c.name, c.status
        ORDER BY c.created_at DESC
        "#,
    )
    .bind(tenant_id)
    .fetch_all(&ctx.pool)
    .await
    .map_err(internal)?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "by_status": by_status,
        "campaigns": counters,
    })))
}

async fn get_campaign(
    ctx: web::Data<AppContext>,
    path: web::Path<Uuid>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;

    let campaign = sqlx::query_as::<_, Campaign>(
        "SELECT * FROM campaigns WHERE id = $1 AND tenant_id = $2 AND NOT is_deleted",
    )
    .bind(path.into_inner())
    .bind(tenant_id)
    .fetch_optional(&ctx.pool)
    .await
    .map_err(internal)?;

    match campaign {
        Some(c) => Ok(HttpResponse::Ok().json(c)),
        None => Ok(HttpResponse::NotFound().json(serde_json::json!({"error": "Campaign not found"}))),
    }
}

async fn create_campaign(
    ctx: web::Data<AppContext>,
    body: web::Json<CreateCampaignRequest>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;
    let user_id = get_user_id(&claims)?;
    body.validate()
        .map_err(actix_web::error::ErrorBadRequest)?;

    let campaign_id = Uuid::new_v4();
    let config = body.config.clone().unwrap_or(serde_json::json!({}));

    sqlx::query(
        r#"
        INSERT INTO campaigns (id, tenant_id, name, status, config, execution_state, created_by_user_id, is_deleted, created_at, updated_at)
        VALUES ($1, $2, $3, 'draft', $4, '{}', $5, FALSE, NOW(), NOW())
        "#,
    )
    .bind(campaign_id)
    .bind(tenant_id)
    .bind(&body.name)
    .bind(&config)
    .bind(user_id)
    .execute(&ctx.pool)
    .await
    .map_err(internal)?;

    ctx.events.campaigns_list_updated(tenant_id).await;

    Ok(HttpResponse::Created().json(serde_json::json!({
        "id": campaign_id,
        "name": body.name,
        "status": "draft",
    })))
}

async fn update_campaign(
    ctx: web::Data<AppContext>,
    path: web::Path<Uuid>,
    body: web::Json<UpdateCampaignRequest>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;
    body.validate()
        .map_err(actix_web::error::ErrorBadRequest)?;

    if body.name.is_none() && body.config.is_none() {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({"error": "No fields to update"})));
    }

    let result = sqlx::query(
        r#"
        UPDATE campaigns
        SET name = COALESCE($1, name),
            config = COALESCE($2, config),
            updated_at = NOW()
        WHERE id = $3 AND tenant_id = $4 AND NOT is_deleted
        "#,
    )
    .bind(&body.name)
    .bind(&body.config)
    .bind(path.into_inner())
    .bind(tenant_id)
    .execute(&ctx.pool)
    .await
    .map_err(internal)?;

    if result.rows_affected() > 0 {
        ctx.events.campaigns_list_updated(tenant_id).await;
        Ok(HttpResponse::Ok().json(serde_json::json!({"updated": true})))
    } else {
        Ok(HttpResponse::NotFound().json(serde_json::json!({"error": "Campaign not found"})))
    }
}

async fn delete_campaign(
    ctx: web::Data<AppContext>,
    path: web::Path<Uuid>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;

    // Soft delete; a deleted campaign can never be running.
    let result = sqlx::query(
        "UPDATE campaigns SET is_deleted = TRUE, status = 'stopped', updated_at = NOW() WHERE id = $1 AND tenant_id = $2 AND NOT is_deleted",
    )
    .bind(path.into_inner())
    .bind(tenant_id)
    .execute(&ctx.pool)
    .await
    .map_err(internal)?;

    if result.rows_affected() > 0 {
        ctx.events.campaigns_list_updated(tenant_id).await;
        Ok(HttpResponse::Ok().json(serde_json::json!({"deleted": true})))
    } else {
        Ok(HttpResponse::NotFound().json(serde_json::json!({"error": "Campaign not found"})))
    }
}

async fn start_campaign(
    ctx: web::Data<AppContext>,
    path: web::Path<Uuid>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;
    let campaign_id = path.into_inner();

    let result = sqlx::query(
        "UPDATE campaigns SET status = 'running', updated_at = NOW() WHERE id = $1 AND tenant_id = $2 AND NOT is_deleted AND status IN ('draft', 'paused')",
    )
    .bind(campaign_id)
    .bind(tenant_id)
    .execute(&ctx.pool)
    .await
    .map_err(internal)?;

    if result.rows_affected() == 0 {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "error": "Campaign not found or cannot be started"
        })));
    }

    // Kick off today's run; the scheduler takes over self-enqueueing from
    // here. A duplicate name means today's task already exists.
    let tz = ctx.tenant_timezone(tenant_id).await;
    let today = Utc::now().with_timezone(&tz).date_naive();
    let payload = DailyRunPayload {
        campaign_id,
        tenant_id,
        scheduled_for: today,
    };
    ctx.tasks()
        .enqueue_daily_run(&payload, Utc::now())
        .await
        .map_err(internal)?;

    ctx.events.campaigns_list_updated(tenant_id).await;
    Ok(HttpResponse::Ok().json(serde_json::json!({"status": "running"})))
}

async fn pause_campaign(
    ctx: web::Data<AppContext>,
    path: web::Path<Uuid>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;

    let result = sqlx::query(
        "UPDATE campaigns SET status = 'paused', updated_at = NOW() WHERE id = $1 AND tenant_id = $2 AND status IN ('running', 'active')",
    )
    .bind(path.into_inner())
    .bind(tenant_id)
    .execute(&ctx.pool)
    .await
    .map_err(internal)?;

    if result.rows_affected() > 0 {
        ctx.events.campaigns_list_updated(tenant_id).await;
        Ok(HttpResponse::Ok().json(serde_json::json!({"status": "paused"})))
    } else {
        Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "error": "Campaign not found or not running"
        })))
    }
}

async fn stop_campaign(
    ctx: web::Data<AppContext>,
    path: web::Path<Uuid>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;

    let result = sqlx::query(
        "UPDATE campaigns SET status = 'stopped', updated_at = NOW() WHERE id = $1 AND tenant_id = $2 AND status IN ('running', 'active', 'paused')",
    )
    .bind(path.into_inner())
    .bind(tenant_id)
    .execute(&ctx.pool)
    .await
    .map_err(internal)?;

    if result.rows_affected() > 0 {
        ctx.events.campaigns_list_updated(tenant_id).await;
        Ok(HttpResponse::Ok().json(serde_json::json!({"status": "stopped"})))
    } else {
        Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "error": "Campaign not found or already stopped"
        })))
    }
}

async fn list_leads(
    ctx: web::Data<AppContext>,
    path: web::Path<Uuid>,
    query: web::Query<LeadFilters>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;

    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let page = query.page.unwrap_or(1).max(1);
    let offset = (page - 1) * limit;

    let leads = sqlx::query_as::<_, CampaignLead>(
        r#"
        SELECT * FROM campaign_leads
        WHERE campaign_id = $1 AND tenant_id = $2
          AND ($3::TEXT IS NULL OR status = $3)
        ORDER BY created_at DESC
        LIMIT $4 OFFSET $5
        "#,
    )
    .bind(path.into_inner())
    .bind(tenant_id)
    .bind(&query.status)
    .bind(limit)
    .bind(offset)
    .fetch_all(&ctx.pool)
    .await
    .map_err(internal)?;

    Ok(HttpResponse::Ok().json(leads))
}

#[derive(serde::Deserialize)]
struct ActivityFilters {
    page: Option<i64>,
    limit: Option<i64>,
}

async fn list_activities(
    ctx: web::Data<AppContext>,
    path: web::Path<Uuid>,
    query: web::Query<ActivityFilters>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;

    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let page = query.page.unwrap_or(1).max(1);
    let offset = (page - 1) * limit;

    let activities = sqlx::query_as::<_, Activity>(
        r#"
        SELECT * FROM campaign_lead_activities
        WHERE campaign_id = $1 AND tenant_id = $2
        ORDER BY created_at DESC
        LIMIT $3 OFFSET $4
        "#,
    )
    .bind(path.into_inner())
    .bind(tenant_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(&ctx.pool)
    .await
    .map_err(internal)?;

    Ok(HttpResponse::Ok().json(activities))
}

async fn list_steps(
    ctx: web::Data<AppContext>,
    path: web::Path<Uuid>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;
    let campaign_id = path.into_inner();

    let steps = sqlx::query_as::<_, Step>(
        r#"
        SELECT s.* FROM campaign_steps s
        JOIN campaigns c ON c.id = s.campaign_id
        WHERE s.campaign_id = $1 AND c.tenant_id = $2
        ORDER BY s.step_order ASC
        "#,
    )
    .bind(campaign_id)
    .bind(tenant_id)
    .fetch_all(&ctx.pool)
    .await
    .map_err(internal)?;

    Ok(HttpResponse::Ok().json(steps))
}

/// Replace the whole ordered step list in one transaction.
async fn replace_steps(
    ctx: web::Data<AppContext>,
    path: web::Path<Uuid>,
    body: web::Json<ReplaceStepsRequest>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;
    let campaign_id = path.into_inner();

    for step in &body.steps {
        if StepType::parse(&step.step_type).is_none() {
            return Ok(HttpResponse::BadRequest().json(serde_json::json!({
                "error": format!("Unknown step type {}", step.step_type)
            })));
        }
        if step.step_order < 0 {
            return Ok(HttpResponse::BadRequest().json(serde_json::json!({
                "error": "Step order must be non-negative"
            })));
        }
    }

    let mut orders: Vec<i32> = body.steps.iter().map(|s| s.step_order).collect();
    orders.sort_unstable();
    orders.dedup();
    if orders.len() != body.steps.len() {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "error": "Step orders must be unique"
        })));
    }

    let owned = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM campaigns WHERE id = $1 AND tenant_id = $2 AND NOT is_deleted",
    )
    .bind(campaign_id)
    .bind(tenant_id)
    .fetch_one(&ctx.pool)
    .await
    .map_err(internal)?;
    if owned == 0 {
        return Ok(HttpResponse::NotFound().json(serde_json::json!({"error": "Campaign not found"})));
    }

    let mut tx = ctx.pool.begin().await.map_err(internal)?;

    sqlx::query("DELETE FROM campaign_steps WHERE campaign_id = $1")
        .bind(campaign_id)
        .execute(&mut *tx)
        .await
        .map_err(internal)?;

    for step in &body.steps {
        sqlx::query(
            r#"
            INSERT INTO campaign_steps (id, campaign_id, step_order, step_type, title, config, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(campaign_id)
        .bind(step.step_order)
        .bind(&step.step_type)
        .bind(&step.title)
        .bind(&step.config)
        .execute(&mut *tx)
        .await
        .map_err(internal)?;
    }

    tx.commit().await.map_err(internal)?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "replaced": body.steps.len(),
        "campaign_id": campaign_id,
    })))
}

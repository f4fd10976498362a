use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::middleware::auth::{extract_claims, get_tenant_id};
use crate::models::account::{AccountStatus, ProviderAccount};
use crate::services::context::AppContext;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/linkedin")
            .route("/accounts", web::get().to(list_accounts))
            .route("/accounts/{id}/status", web::get().to(account_status))
            .route("/accounts/{id}/disconnect", web::post().to(disconnect_account))
            .route("/accounts/{id}/sync", web::post().to(sync_account))
            .route("/webhook/register", web::post().to(register_webhook))
            // Receive path is public: the provider does not sign in.
            .route("/webhook", web::post().to(receive_webhook)),
    );
}

fn internal(e: impl std::fmt::Display) -> actix_web::Error {
    actix_web::error::ErrorInternalServerError(e.to_string())
}

async fn list_accounts(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;

    let accounts = sqlx::query_as::<_, ProviderAccount>(
        "SELECT * FROM linkedin_accounts WHERE tenant_id = $1 ORDER BY created_at DESC",
    )
    .bind(tenant_id)
    .fetch_all(&ctx.pool)
    .await
    .map_err(internal)?;

    Ok(HttpResponse::Ok().json(accounts))
}

async fn account_status(
    ctx: web::Data<AppContext>,
    path: web::Path<Uuid>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;

    let account = load_account(&ctx, path.into_inner(), tenant_id).await?;
    let Some(account) = account else {
        return Ok(HttpResponse::NotFound().json(serde_json::json!({"error": "Account not found"})));
    };

    let live = ctx.accounts.verify(&account).await;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "id": account.id,
        "status": account.status,
        "needs_reconnect": account.needs_reconnect,
        "live_check": format!("{:?}", live).to_lowercase(),
    })))
}

async fn disconnect_account(
    ctx: web::Data<AppContext>,
    path: web::Path<Uuid>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;

    let result = sqlx::query(
        "UPDATE linkedin_accounts SET status = 'stopped', updated_at = NOW() WHERE id = $1 AND tenant_id = $2",
    )
    .bind(*path)
    .bind(tenant_id)
    .execute(&ctx.pool)
    .await
    .map_err(internal)?;

    if result.rows_affected() > 0 {
        ctx.events.linkedin_account_status(*path, "stopped").await;
        Ok(HttpResponse::Ok().json(serde_json::json!({"status": "stopped"})))
    } else {
        Ok(HttpResponse::NotFound().json(serde_json::json!({"error": "Account not found"})))
    }
}

/// Probe the provider and refresh the stored status.
async fn sync_account(
    ctx: web::Data<AppContext>,
    path: web::Path<Uuid>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let tenant_id = get_tenant_id(&claims)?;

    let account = load_account(&ctx, path.into_inner(), tenant_id).await?;
    let Some(account) = account else {
        return Ok(HttpResponse::NotFound().json(serde_json::json!({"error": "Account not found"})));
    };

    let token = ctx
        .unipile
        .get_account_status(&account.external_account_id)
        .await
        .map_err(internal)?;

    let (status, recognized) = AccountStatus::from_provider_token(&token);
    if !recognized {
        warn!("Unknown provider status token {:?} for account {}", token, account.id);
    }
    let needs_reconnect = status == AccountStatus::CredentialsExpired;
    ctx.accounts.set_status(account.id, status, needs_reconnect).await;
    ctx.events.linkedin_account_status(account.id, status.as_str()).await;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "id": account.id,
        "provider_token": token,
        "status": status.as_str(),
    })))
}

async fn register_webhook(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
) -> Result<HttpResponse, actix_web::Error> {
    let claims = extract_claims(&req)?;
    let _tenant_id = get_tenant_id(&claims)?;

    let base = ctx
        .config
        .backend_internal_url
        .as_deref()
        .ok_or_else(|| actix_web::error::ErrorBadRequest("BACKEND_INTERNAL_URL not configured"))?;
    let callback = format!("{}/api/linkedin/webhook", base.trim_end_matches('/'));

    ctx.unipile
        .register_webhook(&callback)
        .await
        .map_err(internal)?;

    Ok(HttpResponse::Ok().json(serde_json::json!({"registered": callback})))
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    account_id: String,
    #[serde(default)]
    account_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Provider push for account status changes. Unknown tokens map to
/// `active` (permissive) and are logged.
async fn receive_webhook(
    ctx: web::Data<AppContext>,
    body: web::Json<WebhookPayload>,
) -> Result<HttpResponse, actix_web::Error> {
    let token = body
        .status
        .as_deref()
        .or(body.message.as_deref())
        .unwrap_or("");

    let account = sqlx::query_as::<_, ProviderAccount>(
        "SELECT * FROM linkedin_accounts WHERE external_account_id = $1",
    )
    .bind(&body.account_id)
    .fetch_optional(&ctx.pool)
    .await
    .map_err(internal)?;

    let Some(account) = account else {
        // Accounts connect asynchronously; the webhook can race the row.
        warn!(
            "Webhook for unknown account {} (type {:?})",
            body.account_id, body.account_type
        );
        return Ok(HttpResponse::Ok().json(serde_json::json!({"ignored": true})));
    };

    let (status, recognized) = AccountStatus::from_provider_token(token);
    if !recognized {
        warn!("Unknown webhook status token {:?} for account {}", token, account.id);
    }
    let needs_reconnect = status == AccountStatus::CredentialsExpired;
    ctx.accounts.set_status(account.id, status, needs_reconnect).await;
    ctx.events.linkedin_account_status(account.id, status.as_str()).await;

    info!("Account {} moved to {} via webhook", account.id, status);
    Ok(HttpResponse::Ok().json(serde_json::json!({"status": status.as_str()})))
}

async fn load_account(
    ctx: &AppContext,
    id: Uuid,
    tenant_id: Uuid,
) -> Result<Option<ProviderAccount>, actix_web::Error> {
    sqlx::query_as::<_, ProviderAccount>(
        "SELECT * FROM linkedin_accounts WHERE id = $1 AND tenant_id = $2",
    )
    .bind(id)
    .bind(tenant_id)
    .fetch_optional(&ctx.pool)
    .await
    .map_err(internal)
}

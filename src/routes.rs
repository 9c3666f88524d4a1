use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::broadcast::BroadcastDispatcher;
use crate::directory::{User, UserDirectory};
use crate::error::{AppError, AppResult};
use crate::leases::{LeaseError, ResourceLeaseManager};
use crate::payments::{
    PaymentService, PlanKind, PurchaseError, ReconcileError, ReconcileOutcome,
};
use crate::webhooks;

/// Everything the HTTP surface needs; installed as individual extensions so
/// handlers pull only what they use.
#[derive(Clone)]
pub struct AppContext {
    pub payments: PaymentService,
    pub reconciliation: crate::payments::ReconciliationHandle,
    pub leases: Arc<ResourceLeaseManager>,
    pub broadcasts: Arc<BroadcastDispatcher>,
    pub directory: Arc<dyn UserDirectory>,
}

pub fn api_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/webhook/gateway", post(webhooks::gateway_webhook))
        .route("/api/payments", post(create_payment))
        .route("/api/payments/:id/check", post(check_payment))
        .route("/api/leases", post(acquire_lease))
        .route(
            "/api/broadcasts",
            get(list_broadcasts).post(start_broadcast),
        )
        .route("/api/broadcasts/:id", get(broadcast_status))
        .route("/api/broadcasts/:id/resume", post(resume_broadcast))
        .route("/api/broadcasts/:id/cancel", post(cancel_broadcast))
        .layer(Extension(ctx.payments))
        .layer(Extension(ctx.reconciliation))
        .layer(Extension(ctx.leases))
        .layer(Extension(ctx.broadcasts))
        .layer(Extension(ctx.directory))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "accessd",
        "timestamp": Utc::now(),
    }))
}

async fn stats(
    Extension(directory): Extension<Arc<dyn UserDirectory>>,
    Extension(leases): Extension<Arc<ResourceLeaseManager>>,
    Extension(broadcasts): Extension<Arc<BroadcastDispatcher>>,
) -> AppResult<Json<Value>> {
    let now = Utc::now();
    let total_users = directory.count().await?;
    let active_leases = leases.active_count(now).await?;
    let recent = broadcasts.recent(10).await?;
    Ok(Json(json!({
        "total_users": total_users,
        "active_leases": active_leases,
        "available_pool_members": leases.pool().available_count(),
        "recent_broadcasts": recent.len(),
        "timestamp": now,
    })))
}

#[derive(Debug, Deserialize)]
struct CreatePaymentRequest {
    user_id: i64,
    plan: PlanKind,
    payer_email: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct PaymentEnvelope {
    payment_id: String,
    status: &'static str,
    plan: &'static str,
    amount_cents: i64,
    qr_code: String,
    qr_code_base64: String,
    ticket_url: String,
    expires_at: chrono::DateTime<Utc>,
}

async fn create_payment(
    Extension(payments): Extension<PaymentService>,
    Extension(directory): Extension<Arc<dyn UserDirectory>>,
    Json(request): Json<CreatePaymentRequest>,
) -> AppResult<(StatusCode, Json<PaymentEnvelope>)> {
    let now = Utc::now();
    directory
        .upsert(User {
            user_id: request.user_id,
            username: request.username,
            first_name: request.first_name,
            created_at: now,
        })
        .await?;

    let record = payments
        .initiate(request.user_id, request.plan, &request.payer_email, now)
        .await
        .map_err(|err| match err {
            PurchaseError::Gateway(err) => AppError::Gateway(err.to_string()),
            PurchaseError::Internal(err) => AppError::Message(err.to_string()),
        })?;

    Ok((
        StatusCode::CREATED,
        Json(PaymentEnvelope {
            payment_id: record.payment_id.clone(),
            status: record.status.as_str(),
            plan: record.plan.as_str(),
            amount_cents: record.amount_cents,
            qr_code: record.qr_code.clone(),
            qr_code_base64: record.qr_code_base64.clone(),
            ticket_url: record.ticket_url.clone(),
            expires_at: record.expires_at,
        }),
    ))
}

fn outcome_label(outcome: ReconcileOutcome) -> &'static str {
    match outcome {
        ReconcileOutcome::Applied(_) => "applied",
        ReconcileOutcome::AlreadySettled(_) => "already_settled",
        ReconcileOutcome::StillPending => "still_pending",
    }
}

async fn check_payment(
    Extension(payments): Extension<PaymentService>,
    Path(payment_id): Path<String>,
) -> AppResult<Json<Value>> {
    let result = payments
        .check(&payment_id, Utc::now())
        .await
        .map_err(|err| match err {
            ReconcileError::InvalidIntent(_) => AppError::NotFound,
            ReconcileError::Gateway(err) => AppError::Gateway(err.to_string()),
            ReconcileError::Internal(err) => AppError::Message(err.to_string()),
        })?;

    Ok(Json(json!({
        "payment_id": result.record.payment_id,
        "status": result.record.status.as_str(),
        "outcome": outcome_label(result.outcome),
        "paid_at": result.record.paid_at,
    })))
}

#[derive(Debug, Deserialize)]
struct AcquireLeaseRequest {
    user_id: i64,
}

async fn acquire_lease(
    Extension(leases): Extension<Arc<ResourceLeaseManager>>,
    Json(request): Json<AcquireLeaseRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let lease = leases
        .try_acquire(request.user_id, Utc::now())
        .await
        .map_err(|err| match err {
            LeaseError::CooldownActive { remaining_secs } => AppError::Denied(format!(
                "cooldown active, retry in {remaining_secs} seconds"
            )),
            LeaseError::PoolExhausted => {
                AppError::Denied("no pool members available".to_string())
            }
            LeaseError::Provisioning(detail) => AppError::Gateway(detail),
            LeaseError::Internal(err) => AppError::Message(err.to_string()),
        })?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "lease_id": lease.id,
            "pool_member_id": lease.pool_member_id,
            "username": lease.username,
            "password": lease.password,
            "issued_at": lease.issued_at,
            "expires_at": lease.expires_at,
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct StartBroadcastRequest {
    message: String,
}

async fn start_broadcast(
    Extension(broadcasts): Extension<Arc<BroadcastDispatcher>>,
    Json(request): Json<StartBroadcastRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    if request.message.trim().is_empty() {
        return Err(AppError::BadRequest("message must not be empty".into()));
    }
    let job_id = broadcasts.start(request.message, Utc::now()).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

fn job_stats(job: &crate::broadcast::BroadcastJob) -> Value {
    json!({
        "job_id": job.job_id,
        "total_recipients": job.total_recipients,
        "sent_count": job.sent_count,
        "failed_count": job.failed_count,
        "completed": job.completed,
        "created_at": job.created_at,
    })
}

async fn broadcast_status(
    Extension(broadcasts): Extension<Arc<BroadcastDispatcher>>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let job = broadcasts
        .status(job_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(job_stats(&job)))
}

async fn resume_broadcast(
    Extension(broadcasts): Extension<Arc<BroadcastDispatcher>>,
    Path(job_id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let job = broadcasts
        .resume(job_id)
        .await
        .map_err(|_| AppError::NotFound)?;
    Ok((StatusCode::ACCEPTED, Json(job_stats(&job))))
}

async fn cancel_broadcast(
    Extension(broadcasts): Extension<Arc<BroadcastDispatcher>>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let cancelled = broadcasts.cancel(job_id);
    Ok(Json(json!({ "job_id": job_id, "cancelled": cancelled })))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    10
}

async fn list_broadcasts(
    Extension(broadcasts): Extension<Arc<BroadcastDispatcher>>,
    Query(query): Query<RecentQuery>,
) -> AppResult<Json<Vec<Value>>> {
    let jobs = broadcasts.recent(query.limit.clamp(1, 100)).await?;
    Ok(Json(jobs.iter().map(job_stats).collect()))
}

//! The single invocation surface.
//!
//! One POST endpoint accepts an optional action selector. Without one, the
//! dispatcher polls and processes due events; `retry`, `config` and `health`
//! are management actions, and `meta`/`events` are read-only per-invoice
//! proxies guarded by caller identity.
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{AppError, Result};
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: Arc<DispatcherConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionRequest {
    pub action: Option<String>,
    pub invoice_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Resolve the caller from the bearer token and require that the invoice
/// belongs to the caller's company.
async fn require_invoice_access(
    state: &AppState,
    headers: &HeaderMap,
    invoice_id: Uuid,
) -> Result<()> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))?;

    let key = DecodingKey::from_secret(state.config.jwt_secret.as_bytes());
    let claims = decode::<Claims>(token, &key, &Validation::default())
        .map_err(|e| AppError::Unauthorized(e.to_string()))?
        .claims;
    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| AppError::Unauthorized("invalid subject claim".into()))?;

    let user_company = state
        .store
        .user_company(user_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized("unknown user".into()))?;
    let invoice_company = state
        .store
        .invoice_company(invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound("invoice not found".into()))?;

    if user_company != invoice_company {
        return Err(AppError::NotFound("invoice not found".into()));
    }
    Ok(())
}

/// POST / — action router.
pub async fn invoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<ActionRequest>>,
) -> Result<Json<Value>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    match request.action.as_deref() {
        None => {
            let dispatcher = Dispatcher::new(state.store.clone(), (*state.config).clone());
            let summary = dispatcher.run_once().await?;
            Ok(Json(serde_json::to_value(summary).map_err(|e| {
                AppError::Internal(e.to_string())
            })?))
        }
        Some("retry") => {
            let invoice_id = request
                .invoice_id
                .ok_or_else(|| AppError::BadRequest("retry requires invoice_id".into()))?;
            match state.store.reset_latest_rejected(invoice_id).await? {
                Some(event_id) => Ok(Json(json!({ "ok": true, "retried_event_id": event_id }))),
                None => Ok(Json(json!({
                    "ok": false,
                    "message": "No rejected event to retry for invoice"
                }))),
            }
        }
        Some("config") => Ok(Json(json!({
            "ok": true,
            "maxAttempts": state.config.max_attempts,
            "backoffMinutes": state.config.backoff_minutes,
            "mode": state.config.mode.as_str(),
            "fallbackEnabled": state.config.fallback_enabled,
        }))),
        Some("health") => {
            let summary = state.store.health_summary().await?;
            Ok(Json(json!({
                "ok": true,
                "pending": summary.pending,
                "lastEventAt": summary.last_event_at,
                "lastAcceptedAt": summary.last_accepted_at,
                "lastRejectedAt": summary.last_rejected_at,
            })))
        }
        Some("meta") => {
            let invoice_id = request
                .invoice_id
                .ok_or_else(|| AppError::BadRequest("meta requires invoice_id".into()))?;
            require_invoice_access(&state, &headers, invoice_id).await?;
            let meta = state.store.meta_for_invoice(invoice_id).await?;
            Ok(Json(json!({ "ok": true, "meta": meta })))
        }
        Some("events") => {
            let invoice_id = request
                .invoice_id
                .ok_or_else(|| AppError::BadRequest("events requires invoice_id".into()))?;
            require_invoice_access(&state, &headers, invoice_id).await?;
            let limit = request.limit.unwrap_or(5).clamp(1, 100);
            let events = state.store.events_for_invoice(invoice_id, limit).await?;
            Ok(Json(json!({ "ok": true, "events": events })))
        }
        Some(other) => Err(AppError::BadRequest(format!("unknown action: {other}"))),
    }
}

/// GET /health — liveness only; queue state comes from the `health` action.
pub async fn liveness() -> Json<Value> {
    Json(json!({ "ok": true }))
}

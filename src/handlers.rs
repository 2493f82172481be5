//! # HTTP Request Handlers
//!
//! All request handlers for the ratelimitd API.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │  POST /check                    the rate limit decision (single or     │
//! │                                 composite), 429 + Retry-After on deny  │
//! │  /admin/limits/*                per-key / pattern / default configs    │
//! │  /admin/schedules/*             time-windowed overlays                 │
//! │  /admin/geo/*                   location overlays + detection test     │
//! │  /adaptive/*                    status, overrides, global parameters   │
//! │  /benchmark                     synthetic load through the real path   │
//! │  /health /ready /metrics        probes and expositions                 │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Response Headers
//!
//! | Header                  | Description                          |
//! |-------------------------|--------------------------------------|
//! | `X-RateLimit-Limit`     | Effective capacity for the key       |
//! | `X-RateLimit-Remaining` | Tokens left after this request       |
//! | `Retry-After`           | Seconds until retry is useful (429)  |

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::adaptive::{KeyAdaptiveStatus, ManualOverride};
use crate::composite::{CompositeConfig, ComponentResult};
use crate::config::Config;
use crate::error::Error;
use crate::geo::{GeoLocation, GeoRule};
use crate::limits::RateLimitConfig;
use crate::resolver::RequestContext;
use crate::schedule::{Schedule, ScheduleType, Transition};
use crate::service::{BenchmarkRequest, RateLimitService};
use crate::validation::RequestValidator;

static START_TIME: std::sync::LazyLock<Instant> = std::sync::LazyLock::new(Instant::now);

/// Shared application state: the service graph plus the input validator.
pub struct AppState {
    pub service: Arc<RateLimitService>,
    pub validator: RequestValidator,
}

pub type SharedState = Arc<AppState>;

// ---------------------------------------------------------------- check

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub key: String,
    #[serde(default = "default_tokens")]
    pub tokens: u64,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
    /// `COMPOSITE` routes through the composite limiter.
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub composite_config: Option<CompositeConfig>,
}

fn default_tokens() -> u64 {
    1
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub key: String,
    pub tokens_requested: u64,
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_results: Option<Vec<ComponentResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limiting_component: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptive_info: Option<KeyAdaptiveStatus>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

fn request_context(client_info: Option<&ClientInfo>) -> RequestContext {
    let Some(info) = client_info else {
        return RequestContext::default();
    };
    let mut location = info
        .headers
        .as_ref()
        .map(|headers| {
            let normalized: HashMap<String, String> = headers
                .iter()
                .map(|(name, value)| (name.to_lowercase(), value.clone()))
                .collect();
            GeoLocation::from_headers(&normalized)
        })
        .unwrap_or_default();
    if let Some(country) = &info.country_code {
        let country = country.to_uppercase();
        location.compliance_zone = crate::geo::derive_compliance_zone(&country);
        location.country_code = Some(country);
    }
    if let Some(region) = &info.region {
        location.region = Some(region.clone());
    }
    RequestContext::with_location(location)
}

/// The rate limit decision endpoint.
///
/// Denied checks answer 429 with `Retry-After`; allowed checks answer 200.
/// Both carry the standard `X-RateLimit-*` headers.
pub async fn check(
    State(state): State<SharedState>,
    Json(request): Json<CheckRequest>,
) -> Result<impl IntoResponse, Error> {
    state.validator.validate_key(&request.key)?;
    state.validator.validate_tokens(request.tokens)?;
    tracing::trace!(
        key = %request.key,
        api_key = request.api_key.as_deref().unwrap_or("-"),
        source_ip = request
            .client_info
            .as_ref()
            .and_then(|i| i.source_ip.as_deref())
            .unwrap_or("-"),
        "check request"
    );

    let wants_composite = match request.algorithm.as_deref() {
        Some(name) if name.eq_ignore_ascii_case("COMPOSITE") => true,
        // a concrete algorithm name is legal but the resolver decides;
        // anything else is a typo worth rejecting
        Some(name) => {
            name.parse::<crate::limits::Algorithm>()?;
            request.composite_config.is_some()
        }
        None => request.composite_config.is_some(),
    };

    let outcome = if wants_composite {
        let config = request.composite_config.as_ref().ok_or_else(|| {
            Error::InvalidInput("COMPOSITE algorithm requires compositeConfig".to_string())
        })?;
        state
            .service
            .check_composite(&request.key, request.tokens, config)
            .await?
    } else {
        let context = request_context(request.client_info.as_ref());
        state
            .service
            .check(&request.key, request.tokens, &context)
            .await?
    };

    let adaptive_info = {
        let static_config = state.service.resolver.resolve_static(&request.key);
        let status = state.service.adaptive.status(&request.key, &static_config);
        match status.mode {
            crate::adaptive::AdaptiveMode::Static => None,
            _ => Some(status),
        }
    };

    let retry_after_sec = (!outcome.allowed).then(|| outcome.retry_after_ms.div_ceil(1000).max(1));
    let response = CheckResponse {
        key: outcome.key.clone(),
        tokens_requested: outcome.tokens_requested,
        allowed: outcome.allowed,
        remaining: outcome.remaining,
        limit: outcome.limit,
        retry_after_sec,
        component_results: outcome.components.clone(),
        limiting_component: outcome.limiting_component.clone(),
        adaptive_info,
        degraded: outcome.degraded,
    };

    let allowed = outcome.allowed;
    let mut resp = Json(response).into_response();
    if !allowed {
        *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    }
    let headers = resp.headers_mut();
    if let Ok(value) = outcome.limit.to_string().parse() {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = outcome.remaining.to_string().parse() {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if !allowed {
        if let Some(secs) = retry_after_sec {
            if let Ok(value) = secs.to_string().parse() {
                headers.insert("Retry-After", value);
            }
        }
    }
    Ok(resp)
}

// ---------------------------------------------------------------- admin

#[derive(Debug, Serialize)]
pub struct AdminAck {
    pub status: &'static str,
    pub message: String,
}

impl AdminAck {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "success",
            message: message.into(),
        })
    }
}

pub async fn list_keys(State(state): State<SharedState>) -> impl IntoResponse {
    let keys = state.service.active_keys();
    Json(serde_json::json!({ "count": keys.len(), "keys": keys }))
}

pub async fn get_key_limits(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.validator.validate_key(&key)?;
    let static_limit = state.service.limits.key_limit(&key);
    let effective = state
        .service
        .resolver
        .resolve(&key, &RequestContext::default());
    Ok(Json(serde_json::json!({
        "key": key,
        "static": static_limit,
        "effective": effective.as_ref(),
    })))
}

pub async fn set_key_limits(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Json(limits): Json<RateLimitConfig>,
) -> Result<impl IntoResponse, Error> {
    state.validator.validate_key(&key)?;
    state.service.limits.set_key_limit(&key, limits)?;
    state.service.resolver.invalidate();
    Ok(AdminAck::ok(format!("limits set for '{}'", key)))
}

pub async fn delete_key_limits(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.validator.validate_key(&key)?;
    let removed = state.service.limits.remove_key_limit(&key);
    state.service.reset_key(&key).await?;
    state.service.resolver.invalidate();
    if removed {
        Ok(AdminAck::ok(format!("limits deleted for '{}'", key)))
    } else {
        Err(Error::InvalidInput(format!("no per-key limits for '{}'", key)))
    }
}

#[derive(Debug, Deserialize)]
pub struct PatternBody {
    pub pattern: String,
    pub limits: Option<RateLimitConfig>,
}

pub async fn set_pattern_limits(
    State(state): State<SharedState>,
    Json(body): Json<PatternBody>,
) -> Result<impl IntoResponse, Error> {
    state.validator.validate_pattern(&body.pattern)?;
    let limits = body
        .limits
        .ok_or_else(|| Error::InvalidInput("pattern rule requires limits".to_string()))?;
    state.service.limits.set_pattern_limit(&body.pattern, limits)?;
    state.service.resolver.invalidate();
    Ok(AdminAck::ok(format!("pattern '{}' set", body.pattern)))
}

pub async fn delete_pattern_limits(
    State(state): State<SharedState>,
    Json(body): Json<PatternBody>,
) -> Result<impl IntoResponse, Error> {
    state.validator.validate_pattern(&body.pattern)?;
    let removed = state.service.limits.remove_pattern_limit(&body.pattern);
    state.service.resolver.invalidate();
    if removed {
        Ok(AdminAck::ok(format!("pattern '{}' deleted", body.pattern)))
    } else {
        Err(Error::InvalidInput(format!(
            "no pattern rule '{}'",
            body.pattern
        )))
    }
}

pub async fn set_default_limits(
    State(state): State<SharedState>,
    Json(limits): Json<RateLimitConfig>,
) -> Result<impl IntoResponse, Error> {
    state.service.limits.set_defaults(limits)?;
    state.service.resolver.invalidate();
    Ok(AdminAck::ok("default limits updated"))
}

/// Rebuilds the limit snapshot from the environment and swaps it in
/// atomically.
pub async fn reload(State(state): State<SharedState>) -> Result<impl IntoResponse, Error> {
    let config = Config::from_env()?;
    state.service.limits.replace(&config)?;
    state.service.resolver.invalidate();
    tracing::info!("configuration reloaded");
    Ok(AdminAck::ok("configuration reloaded"))
}

pub async fn cache_stats(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.service.resolver.cache_stats())
}

// ------------------------------------------------------------ schedules

/// Creation body: the id is optional, everything else mirrors
/// [`Schedule`].
#[derive(Debug, Deserialize)]
pub struct ScheduleBody {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    pub key_pattern: String,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub active_limits: RateLimitConfig,
    #[serde(default)]
    pub fallback_limits: Option<RateLimitConfig>,
    #[serde(default)]
    pub transition: Option<Transition>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

impl ScheduleBody {
    fn into_schedule(self, id: Uuid) -> Schedule {
        Schedule {
            id,
            name: self.name,
            key_pattern: self.key_pattern,
            schedule_type: self.schedule_type,
            cron: self.cron,
            timezone: self.timezone,
            start_time: self.start_time,
            end_time: self.end_time,
            priority: self.priority,
            enabled: self.enabled,
            active_limits: self.active_limits,
            fallback_limits: self.fallback_limits,
            transition: self.transition,
            created_at: Utc::now(),
        }
    }
}

pub async fn list_schedules(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.service.schedules.list())
}

pub async fn create_schedule(
    State(state): State<SharedState>,
    Json(body): Json<ScheduleBody>,
) -> Result<impl IntoResponse, Error> {
    let id = body.id.unwrap_or_else(Uuid::new_v4);
    let schedule = body.into_schedule(id);
    state.service.schedules.create(schedule.clone())?;
    state.service.schedule_tick();
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn get_schedule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, Error> {
    state
        .service
        .schedules
        .get(id)
        .map(Json)
        .ok_or_else(|| Error::InvalidInput(format!("no schedule {}", id)))
}

pub async fn update_schedule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ScheduleBody>,
) -> Result<impl IntoResponse, Error> {
    let schedule = body.into_schedule(id);
    state.service.schedules.update(id, schedule.clone())?;
    state.service.schedule_tick();
    Ok(Json(schedule))
}

pub async fn delete_schedule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, Error> {
    if !state.service.schedules.remove(id) {
        return Err(Error::InvalidInput(format!("no schedule {}", id)));
    }
    state.service.schedule_tick();
    Ok(AdminAck::ok(format!("schedule {} deleted", id)))
}

// ------------------------------------------------------------------ geo

#[derive(Debug, Deserialize)]
pub struct GeoRuleBody {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub key_pattern: String,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub compliance_zone: Option<String>,
    pub limits: RateLimitConfig,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

pub async fn list_geo_rules(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.service.geo.list())
}

pub async fn create_geo_rule(
    State(state): State<SharedState>,
    Json(body): Json<GeoRuleBody>,
) -> Result<impl IntoResponse, Error> {
    let rule = GeoRule {
        id: body.id.unwrap_or_else(Uuid::new_v4),
        key_pattern: body.key_pattern,
        country_code: body.country_code.map(|c| c.to_uppercase()),
        region: body.region,
        compliance_zone: body.compliance_zone,
        limits: body.limits,
        priority: body.priority,
        valid_from: body.valid_from,
        valid_until: body.valid_until,
        enabled: body.enabled,
        created_at: Utc::now(),
    };
    let id = state.service.geo.upsert(rule.clone())?;
    state.service.resolver.invalidate();
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id, "rule": rule }))))
}

pub async fn update_geo_rule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(body): Json<GeoRuleBody>,
) -> Result<impl IntoResponse, Error> {
    if state.service.geo.list().iter().all(|r| r.id != id) {
        return Err(Error::InvalidInput(format!("no geo rule {}", id)));
    }
    let rule = GeoRule {
        id,
        key_pattern: body.key_pattern,
        country_code: body.country_code.map(|c| c.to_uppercase()),
        region: body.region,
        compliance_zone: body.compliance_zone,
        limits: body.limits,
        priority: body.priority,
        valid_from: body.valid_from,
        valid_until: body.valid_until,
        enabled: body.enabled,
        created_at: Utc::now(),
    };
    state.service.geo.upsert(rule.clone())?;
    state.service.resolver.invalidate();
    Ok(Json(rule))
}

pub async fn delete_geo_rule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, Error> {
    if !state.service.geo.remove(id) {
        return Err(Error::InvalidInput(format!("no geo rule {}", id)));
    }
    state.service.resolver.invalidate();
    Ok(AdminAck::ok(format!("geo rule {} deleted", id)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoTestBody {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub source_ip: Option<String>,
}

/// Echoes the location the service would derive for a header bundle.
pub async fn test_geo_detection(Json(body): Json<GeoTestBody>) -> impl IntoResponse {
    let headers: HashMap<String, String> = body
        .headers
        .into_iter()
        .map(|(name, value)| (name.to_lowercase(), value))
        .collect();
    let location = GeoLocation::from_headers(&headers);
    Json(serde_json::json!({
        "sourceIp": body.source_ip,
        "detected": location,
    }))
}

// ------------------------------------------------------------- adaptive

pub async fn adaptive_status(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.validator.validate_key(&key)?;
    let static_config = state.service.resolver.resolve_static(&key);
    Ok(Json(state.service.adaptive.status(&key, &static_config)))
}

pub async fn adaptive_config(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.service.adaptive.params().clone())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideBody {
    pub capacity: u64,
    pub refill_rate: u64,
    #[serde(default)]
    pub reason: String,
}

pub async fn set_adaptive_override(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Json(body): Json<OverrideBody>,
) -> Result<impl IntoResponse, Error> {
    state.validator.validate_key(&key)?;
    state.service.adaptive.set_override(
        &key,
        ManualOverride {
            capacity: body.capacity,
            refill_rate: body.refill_rate,
            reason: body.reason,
        },
    )?;
    state.service.resolver.invalidate();
    Ok(AdminAck::ok(format!("override set for '{}'", key)))
}

pub async fn delete_adaptive_override(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.validator.validate_key(&key)?;
    if !state.service.adaptive.remove_override(&key) {
        return Err(Error::InvalidInput(format!("no override for '{}'", key)));
    }
    state.service.resolver.invalidate();
    Ok(AdminAck::ok(format!("override removed for '{}'", key)))
}

// ------------------------------------------------------------ benchmark

/// Guard rails so a benchmark cannot take the service down.
const MAX_BENCH_TASKS: usize = 256;
const MAX_BENCH_REQUESTS_PER_TASK: usize = 100_000;

pub async fn benchmark(
    State(state): State<SharedState>,
    Json(request): Json<BenchmarkRequest>,
) -> Result<impl IntoResponse, Error> {
    if request.concurrent_tasks == 0 || request.concurrent_tasks > MAX_BENCH_TASKS {
        return Err(Error::InvalidInput(format!(
            "concurrent_tasks must be 1..={}",
            MAX_BENCH_TASKS
        )));
    }
    if request.requests_per_task == 0 || request.requests_per_task > MAX_BENCH_REQUESTS_PER_TASK {
        return Err(Error::InvalidInput(format!(
            "requests_per_task must be 1..={}",
            MAX_BENCH_REQUESTS_PER_TASK
        )));
    }
    let report = Arc::clone(&state.service).run_benchmark(request).await;
    Ok(Json(report))
}

// -------------------------------------------------------- health/metrics

pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let backend_healthy = state.service.healthy().await;
    let status = if backend_healthy { "healthy" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "redis_connected": state.service.metrics.redis_connected(),
        "fail_open": state.service.fail_open(),
        "uptime_seconds": START_TIME.elapsed().as_secs(),
        "version": crate::VERSION,
    }))
}

pub async fn readiness(State(state): State<SharedState>) -> impl IntoResponse {
    let backend_healthy = state.service.healthy().await;
    if backend_healthy {
        Json(serde_json::json!({ "status": "ready", "backend": "connected" }))
    } else {
        // still ready: fail-open keeps serving, fail-closed sheds load
        Json(serde_json::json!({
            "status": "ready",
            "backend": "disconnected",
            "note": "running on the fail-open/fail-closed policy"
        }))
    }
}

pub async fn metrics_prometheus(State(state): State<SharedState>) -> impl IntoResponse {
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.service.metrics.prometheus(),
    )
}

pub async fn metrics_json(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.service.metrics.json())
}

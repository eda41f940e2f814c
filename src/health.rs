//! # Health and Metrics Endpoints
//!
//! `GET /health` answers "can this instance take another conversation, and are its
//! backends behaving". It is derived from the live session table: how many sessions are
//! in each state, how many turn-level failures they have absorbed, and which adapters
//! some session has flagged unhealthy after a missed cancellation.
//!
//! `GET /api/v1/metrics` breaks the HTTP counters down per endpoint.
//!
//! ## Status values:
//! - **healthy**: below 90% of the session limit, no adapter flagged
//! - **degraded**: a live session has flagged an adapter unhealthy
//! - **saturated**: at the session limit; new sessions are refused with 503

use crate::adapters::AdapterKind;
use crate::error::SoftErrorCounts;
use crate::session::SessionStatus;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

/// Aggregate view over every session the supervisor still tracks.
#[derive(Debug, Default, Serialize)]
pub struct SessionHealth {
    pub live: usize,
    pub closed: usize,
    pub by_state: BTreeMap<&'static str, usize>,
    pub soft_errors: SoftErrorCounts,
    pub unhealthy_adapters: BTreeSet<String>,
}

impl SessionHealth {
    pub fn from_sessions(sessions: &[SessionStatus]) -> Self {
        let mut health = SessionHealth::default();
        for status in sessions {
            *health.by_state.entry(status.state.as_str()).or_insert(0) += 1;
            if status.state.is_live() {
                health.live += 1;
                health
                    .unhealthy_adapters
                    .extend(status.unhealthy_adapters.iter().map(AdapterKind::to_string));
            } else {
                health.closed += 1;
            }
            let counts = &status.soft_errors;
            let total = &mut health.soft_errors;
            total.buffer_overflow += counts.buffer_overflow;
            total.detector_failure += counts.detector_failure;
            total.recognition_failure += counts.recognition_failure;
            total.dialogue_failure += counts.dialogue_failure;
            total.synthesis_failure += counts.synthesis_failure;
            total.cancellation_timeout += counts.cancellation_timeout;
        }
        health
    }
}

fn overall_status(health: &SessionHealth, active: usize, max_sessions: usize) -> &'static str {
    if active >= max_sessions {
        "saturated"
    } else if !health.unhealthy_adapters.is_empty() {
        "degraded"
    } else {
        "healthy"
    }
}

fn session_usage(active: usize, max_sessions: usize) -> f64 {
    if max_sessions > 0 {
        active as f64 / max_sessions as f64
    } else {
        0.0
    }
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let sessions = state.supervisor.list_sessions();
    let health = SessionHealth::from_sessions(&sessions);
    let active = state.active_sessions();
    let max_sessions = state.supervisor.max_concurrent_sessions();
    let usage = session_usage(active, max_sessions);

    HttpResponse::Ok().json(json!({
        "status": overall_status(&health, active, max_sessions),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "capacity": {
            "active_sessions": active,
            "max_sessions": max_sessions,
            "session_usage_percent": (usage * 100.0).round(),
            "accepting": active < max_sessions
        },
        "sessions": health,
        "backends": {
            "vad": config.backends.vad,
            "dialogue": config.backends.dialogue,
            "stt_model": config.backends.openai.stt_model,
            "llm_model": config.backends.openai.llm_model,
            "tts_model": config.backends.openai.tts_model,
            "base_url": config.backends.openai.base_url
        },
        "memory": process_memory()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoints: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms()
            })
        })
        .collect();
    endpoints.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "requests": {
            "total": metrics.request_count,
            "errors": metrics.error_count,
            "per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "sessions": {
            "active": state.active_sessions(),
            "created": metrics.sessions_created,
            "rejected": metrics.sessions_rejected,
            "max_concurrent": state.supervisor.max_concurrent_sessions(),
            "closed_session_ttl_secs": state.get_config().performance.closed_session_ttl_secs
        },
        "endpoints": endpoints,
        "memory": process_memory()
    }))
}

/// Resident and virtual size of this process, from `/proc` where available.
fn process_memory() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };
            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({ "available": false })
}

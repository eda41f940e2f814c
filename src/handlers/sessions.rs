//! # Session REST API Handlers
//!
//! The control surface for voice sessions. Audio itself flows over the WebSocket
//! bridge (`/ws/sessions/{id}`); these endpoints only create, inspect and end sessions.
//!
//! ## Available Endpoints:
//! - `POST /api/v1/sessions` - Create a session, optionally overriding session config
//! - `GET /api/v1/sessions` - Status of every session (closed ones until reaped)
//! - `GET /api/v1/sessions/{id}` - Status of one session
//! - `DELETE /api/v1/sessions/{id}` - End a session gracefully

use crate::error::{AppError, VoiceError};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Request body for creating a session. The body may be omitted entirely.
#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    /// Partial session config applied over the server defaults,
    /// e.g. `{"barge_in_enabled": false}`
    #[serde(default)]
    pub overrides: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub media_url: String,
}

/// Create a new voice session.
///
/// ## Endpoint: `POST /api/v1/sessions`
///
/// ## Response:
/// ```json
/// { "session_id": "6f1c...", "media_url": "/ws/sessions/6f1c..." }
/// ```
///
/// ## Errors:
/// - 400 if the overrides produce an invalid session config
/// - 503 if the concurrency limit is reached
pub async fn create_session(
    state: web::Data<AppState>,
    body: Option<web::Json<CreateSessionRequest>>,
) -> Result<HttpResponse, AppError> {
    let request = body.map(web::Json::into_inner).unwrap_or_default();
    let defaults = state.get_config().session;

    let session_config = match &request.overrides {
        Some(overrides) if !overrides.is_object() => {
            return Err(AppError::BadRequest("overrides must be a JSON object".to_string()));
        }
        Some(overrides) => defaults
            .with_overrides(overrides)
            .map_err(|e| AppError::ValidationError(e.to_string()))?,
        None => defaults,
    };

    let session_id = match state
        .supervisor
        .create_session(session_config, state.get_adapters())
    {
        Ok(id) => id,
        Err(e @ VoiceError::SessionLimitReached(_)) => {
            state.record_session_rejected();
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    state.record_session_created();

    Ok(HttpResponse::Created().json(CreateSessionResponse {
        media_url: format!("/ws/sessions/{}", session_id),
        session_id,
    }))
}

/// `GET /api/v1/sessions`
pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.supervisor.list_sessions();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active": state.active_sessions(),
        "max_concurrent_sessions": state.supervisor.max_concurrent_sessions(),
        "sessions": sessions
    })))
}

/// `GET /api/v1/sessions/{id}`
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let status = state.supervisor.session_status(&path.into_inner())?;
    Ok(HttpResponse::Ok().json(status))
}

/// End a session. A reply that is being spoken may finish first, bounded by the drain
/// timeout. Ending an already closed session succeeds.
///
/// ## Endpoint: `DELETE /api/v1/sessions/{id}`
pub async fn end_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    state.supervisor.end_session(&session_id).await?;
    let status = state.supervisor.session_status(&session_id)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "closed",
        "session": status
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    fn routes(cfg: &mut web::ServiceConfig) {
        cfg.service(
            web::scope("/api/v1")
                .route("/sessions", web::post().to(create_session))
                .route("/sessions", web::get().to(list_sessions))
                .route("/sessions/{id}", web::get().to(get_session))
                .route("/sessions/{id}", web::delete().to(end_session)),
        );
    }

    #[actix_web::test]
    async fn test_session_lifecycle_over_http() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::post().uri("/api/v1/sessions").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 201);
        let body: serde_json::Value = test::read_body_json(resp).await;
        let id = body["session_id"].as_str().unwrap().to_string();

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/sessions/{}", id))
            .to_request();
        let status: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status["session_id"], id.as_str());
        assert_eq!(status["turn_count"], 0);

        for _ in 0..2 {
            let req = test::TestRequest::delete()
                .uri(&format!("/api/v1/sessions/{}", id))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert!(resp.status().is_success());
        }
        assert_eq!(state.active_sessions(), 0);
    }

    #[actix_web::test]
    async fn test_overrides_and_errors() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/sessions")
            .set_json(json!({"overrides": {"vad_attack_frames": 0}}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 400);

        let req = test::TestRequest::get().uri("/api/v1/sessions/nope").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 404);

        // test_state allows two sessions
        for expected in [201u16, 201, 503] {
            let req = test::TestRequest::post()
                .uri("/api/v1/sessions")
                .set_json(json!({"overrides": {"barge_in_enabled": false}}))
                .to_request();
            assert_eq!(test::call_service(&app, req).await.status(), expected);
        }
        assert_eq!(state.get_metrics_snapshot().sessions_rejected, 1);
    }
}

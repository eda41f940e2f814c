//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket bridge: the live configuration,
//! the session supervisor, the backends new sessions are built with, and request metrics.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every actix worker holds a reference to the same data
//! - **RwLock**: many concurrent readers (config lookups on every session create) or one
//!   writer (a `PUT /api/v1/config`)
//! - Locks are only held to copy data in or out, never across an `.await`
//!
//! ## Runtime config updates:
//! A config update swaps the stored config and rebuilds the adapter set. Sessions that
//! are already running keep the config and adapters they were created with; only new
//! sessions see the change.

use crate::adapters::AdapterSet;
use crate::config::AppConfig;
use crate::error::VoiceResult;
use crate::session::SessionSupervisor;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Backends injected into newly created sessions
    pub adapters: Arc<RwLock<AdapterSet>>,

    /// Owns every voice session
    pub supervisor: Arc<SessionSupervisor>,

    /// Request and session counters, updated by middleware and handlers
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests and sessions.
///
/// ## Why these metrics matter:
/// - **request_count** / **error_count**: load and reliability of the control plane
/// - **sessions_created** / **sessions_rejected**: demand versus the concurrency limit
/// - **endpoint_metrics**: per-endpoint latency
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Sessions successfully created since server start
    pub sessions_created: u64,

    /// Session creations refused because the concurrency limit was reached
    pub sessions_rejected: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    /// Create the state, building the configured backends and a supervisor.
    ///
    /// Must be called inside a tokio runtime (the supervisor spawns its notice loop).
    pub fn new(config: AppConfig) -> VoiceResult<Self> {
        let adapters = AdapterSet::from_config(&config.backends, config.session.frame_ms)?;
        Ok(Self::with_adapters(config, adapters))
    }

    /// Create the state around an existing adapter set.
    pub fn with_adapters(config: AppConfig, adapters: AdapterSet) -> Self {
        let supervisor = SessionSupervisor::new(config.performance.max_concurrent_sessions);
        Self {
            config: Arc::new(RwLock::new(config)),
            adapters: Arc::new(RwLock::new(adapters)),
            supervisor,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_adapters(&self) -> AdapterSet {
        self.adapters.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// ## Effects:
    /// - The adapter set is rebuilt from the new `backends` section
    /// - The supervisor's concurrency limit follows `performance.max_concurrent_sessions`
    /// - Nothing changes if validation or backend construction fails
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        let adapters = AdapterSet::from_config(&new_config.backends, new_config.session.frame_ms)
            .map_err(|e| e.to_string())?;

        self.supervisor
            .set_max_concurrent_sessions(new_config.performance.max_concurrent_sessions);
        *self.adapters.write().unwrap_or_else(PoisonError::into_inner) = adapters;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: The API endpoint (e.g., "GET /health", "POST /api/v1/sessions")
    /// - **duration_ms**: How long the request took to process (in milliseconds)
    /// - **is_error**: Whether this request resulted in an error
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_session_created(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.sessions_created += 1;
    }

    pub fn record_session_rejected(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.sessions_rejected += 1;
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// The copy means the lock is not held while the response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            sessions_created: metrics.sessions_created,
            sessions_rejected: metrics.sessions_rejected,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Number of sessions that are not closed.
    pub fn active_sessions(&self) -> usize {
        self.supervisor.active_count()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average = Total Duration ÷ Number of Requests
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate in [0.0, 1.0].
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adapters::energy::EnergyVad;
    use crate::adapters::testing::{ScriptedDialogue, ScriptedSynthesizer, ScriptedTranscriber};
    use std::time::Duration;

    pub(crate) fn test_state() -> AppState {
        let adapters = AdapterSet {
            vad: Arc::new(EnergyVad::default()),
            transcriber: Arc::new(ScriptedTranscriber::new(Vec::new())),
            dialogue: Arc::new(ScriptedDialogue::replying("ok")),
            synthesizer: Arc::new(ScriptedSynthesizer::new(1, Duration::from_millis(1))),
        };
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 2;
        AppState::with_adapters(config, adapters)
    }

    #[tokio::test]
    async fn test_endpoint_metrics() {
        let state = test_state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_update_config_adjusts_session_limit() {
        let state = test_state();
        let mut config = state.get_config();
        config.performance.max_concurrent_sessions = 7;
        state.update_config(config).unwrap();
        assert_eq!(state.supervisor.max_concurrent_sessions(), 7);

        let mut invalid = state.get_config();
        invalid.server.port = 0;
        assert!(state.update_config(invalid).is_err());
        assert_eq!(state.get_config().server.port, 8080);
    }
}

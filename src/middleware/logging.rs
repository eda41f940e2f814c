use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, error, info};

/// Logs the start and outcome of every request, tagged with the session id when the
/// route has one.
pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

fn is_websocket_upgrade(req: &ServiceRequest) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();
        let upgrade = is_websocket_upgrade(&req);

        // Health probes and metrics scrapes are frequent; keep them out of info logs
        let quiet = req.path().ends_with("/health") || req.path().ends_with("/metrics");
        if quiet {
            debug!(method = %method, uri = %uri, "Request started");
        } else {
            info!(
                method = %method,
                uri = %uri,
                remote_addr = %remote_addr,
                websocket = upgrade,
                "Request started"
            );
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration = start_time.elapsed();

            match &result {
                Ok(response) if quiet => {
                    debug!(
                        uri = %uri,
                        status = response.status().as_u16(),
                        duration_ms = %duration.as_millis(),
                        "Request completed"
                    );
                }
                Ok(response) => {
                    // Routing has run by now, so the path parameters are available
                    let session_id = response.request().match_info().get("id").unwrap_or("-");
                    info!(
                        method = %method,
                        uri = %uri,
                        remote_addr = %remote_addr,
                        session_id = session_id,
                        status = response.status().as_u16(),
                        duration_ms = %duration.as_millis(),
                        "{}",
                        if upgrade { "WebSocket upgrade completed" } else { "Request completed" }
                    );
                }
                Err(err) => {
                    error!(
                        method = %method,
                        uri = %uri,
                        remote_addr = %remote_addr,
                        duration_ms = %duration.as_millis(),
                        error = %err,
                        "Request failed"
                    );
                }
            }

            result
        })
    }
}

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

/// Logs method, path, status and latency of every request.
pub async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    let status = response.status();
    if status.is_server_error() {
        tracing::warn!("{} {} -> {} in {:.2?}", method, path, status.as_u16(), start.elapsed());
    } else {
        tracing::info!("{} {} -> {} in {:.2?}", method, path, status.as_u16(), start.elapsed());
    }
    response
}

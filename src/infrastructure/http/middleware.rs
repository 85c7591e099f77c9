//! HTTP Middleware
//!
//! 请求日志：4xx / 5xx 和慢请求记录日志，响应附带耗时头

use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use std::time::{Duration, Instant};

/// 响应耗时头
pub const RESPONSE_TIME_HEADER: &str = "x-response-time-ms";

/// API 请求只做提交 / 查询，超过该时长视为异常
const SLOW_REQUEST: Duration = Duration::from_secs(1);

/// 一次请求的日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestOutcome {
    Quiet,
    Slow,
    ClientError,
    ServerError,
}

fn classify(status: StatusCode, elapsed: Duration) -> RequestOutcome {
    if status.is_server_error() {
        RequestOutcome::ServerError
    } else if status.is_client_error() {
        RequestOutcome::ClientError
    } else if status != StatusCode::SWITCHING_PROTOCOLS && elapsed >= SLOW_REQUEST {
        // WebSocket 升级后的连接时长不计入
        RequestOutcome::Slow
    } else {
        RequestOutcome::Quiet
    }
}

/// 请求日志中间件
///
/// 业务错误（errno != 0）走 HTTP 200，在 ApiError::into_response() 中记录
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let mut response = next.run(request).await;
    let elapsed = started.elapsed();
    let status = response.status();
    let elapsed_ms = elapsed.as_millis() as u64;

    if let Ok(value) = HeaderValue::from_str(&elapsed_ms.to_string()) {
        response.headers_mut().insert(RESPONSE_TIME_HEADER, value);
    }

    match classify(status, elapsed) {
        RequestOutcome::ServerError => tracing::error!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            elapsed_ms = elapsed_ms,
            "HTTP server error"
        ),
        RequestOutcome::ClientError => tracing::warn!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            elapsed_ms = elapsed_ms,
            "HTTP client error"
        ),
        RequestOutcome::Slow => tracing::warn!(
            method = %method,
            path = %path,
            elapsed_ms = elapsed_ms,
            "Slow HTTP request"
        ),
        RequestOutcome::Quiet => {}
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest, routing::get, Router};
    use tower::util::ServiceExt;

    fn router() -> Router {
        Router::new()
            .route("/api/ping", get(|| async { "pong" }))
            .route(
                "/api/busy",
                get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
            )
            .layer(axum::middleware::from_fn(request_logging_middleware))
    }

    async fn send(uri: &str) -> Response {
        let request = HttpRequest::builder().uri(uri).body(Body::empty()).unwrap();
        router().oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_response_carries_elapsed_header() {
        let response = send("/api/ping").await;
        assert_eq!(response.status(), StatusCode::OK);
        let elapsed: u64 = response.headers()[RESPONSE_TIME_HEADER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(elapsed < 1000);
    }

    #[tokio::test]
    async fn test_error_statuses_pass_through() {
        let busy = send("/api/busy").await;
        assert_eq!(busy.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(busy.headers().contains_key(RESPONSE_TIME_HEADER));

        assert_eq!(send("/api/missing").await.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_classify() {
        let fast = Duration::from_millis(5);
        assert_eq!(classify(StatusCode::OK, fast), RequestOutcome::Quiet);
        assert_eq!(classify(StatusCode::OK, SLOW_REQUEST), RequestOutcome::Slow);
        assert_eq!(
            classify(StatusCode::SWITCHING_PROTOCOLS, Duration::from_secs(60)),
            RequestOutcome::Quiet
        );
        assert_eq!(classify(StatusCode::BAD_REQUEST, fast), RequestOutcome::ClientError);
        assert_eq!(
            classify(StatusCode::BAD_GATEWAY, SLOW_REQUEST),
            RequestOutcome::ServerError
        );
    }
}

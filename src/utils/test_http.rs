//! Local HTTP endpoint for exercising the HTTP adapters in tests

use axum::http::StatusCode;
use axum::{Json, Router};
use serde_json::Value;

/// Answer every request with `status` and `body`. Returns the base URL.
pub async fn serve_json(status: u16, body: Value) -> String {
    let status = StatusCode::from_u16(status).unwrap();
    let app = Router::new().fallback(move || {
        let body = body.clone();
        async move { (status, Json(body)) }
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

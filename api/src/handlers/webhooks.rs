use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::errors::WebhookError;
use common::telemetry;
use common::webhook::WebhookOutcome;
use serde::Serialize;

use crate::handlers::ErrorResponse;
use crate::state::AppState;

const EVENT_HEADER: &str = "x-github-event";
const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const DELIVERY_HEADER: &str = "x-github-delivery";

/// Acknowledgement body for accepted deliveries
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Receive a GitHub delivery. Only a bad signature is refused; every other
/// delivery is acknowledged with 202 and any sync runs in the background.
#[tracing::instrument(skip(state, headers, body), fields(body_len = body.len()))]
pub async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event_type = header(&headers, EVENT_HEADER).unwrap_or_default().to_string();
    let signature = header(&headers, SIGNATURE_HEADER).unwrap_or_default();
    let delivery_id = header(&headers, DELIVERY_HEADER)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    tracing::info!(
        event_type = %event_type,
        delivery_id = ?delivery_id,
        "Received webhook delivery"
    );

    if !state.ingestor.validate_signature(&body, signature) {
        tracing::warn!(delivery_id = ?delivery_id, "Webhook signature rejected");
        telemetry::record_webhook_event(&event_type, "unauthorized");
        return ErrorResponse::from(WebhookError::InvalidSignature).into_response();
    }

    if let Some(id) = &delivery_id {
        if !state.deliveries.remember(id) {
            tracing::info!(delivery_id = %id, "Duplicate webhook delivery ignored");
            telemetry::record_webhook_event(&event_type, "duplicate");
            return accepted(WebhookResponse {
                status: "duplicate",
                message: Some(WebhookError::DuplicateDelivery(id.clone()).to_string()),
                delivery_id,
            });
        }
    }

    let response = match state.ingestor.process(&event_type, &body) {
        WebhookOutcome::Dispatched(request) => WebhookResponse {
            status: "dispatched",
            message: Some(format!("Sync requested for {}@{}", request.repository, request.branch)),
            delivery_id,
        },
        WebhookOutcome::Ignored(reason) => WebhookResponse {
            status: "ignored",
            message: Some(reason),
            delivery_id,
        },
        WebhookOutcome::Rejected(reason) => {
            // A corrected redelivery of an unreadable payload gets another chance
            if let Some(id) = &delivery_id {
                state.deliveries.forget(id);
            }
            WebhookResponse {
                status: "rejected",
                message: Some(reason),
                delivery_id,
            }
        }
    };
    accepted(response)
}

fn accepted(body: WebhookResponse) -> Response {
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use crate::routes::create_router;
    use crate::state::AppState;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use common::config::Settings;
    use common::webhook::{sign_payload, SyncDispatcher, SyncRequest, WebhookIngestor};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    const SECRET: &str = "api-test-secret";

    #[derive(Default)]
    struct RecordingDispatcher {
        requests: Mutex<Vec<SyncRequest>>,
    }

    impl SyncDispatcher for RecordingDispatcher {
        fn dispatch(&self, request: SyncRequest) {
            self.requests.lock().unwrap().push(request);
        }
    }

    fn app() -> (axum::Router, Arc<RecordingDispatcher>) {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let ingestor = WebhookIngestor::new(SECRET, dispatcher.clone());
        let state = AppState::new(ingestor, Settings::default());
        (create_router(state), dispatcher)
    }

    fn push_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "ref": "refs/heads/main",
            "repository": {"full_name": "acme/scripts"},
            "commits": [{"added": ["a.ps1"], "modified": [], "removed": []}]
        }))
        .unwrap()
    }

    fn delivery(event: &str, delivery_id: &str, signature: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhooks/github")
            .header("content-type", "application/json")
            .header("X-GitHub-Event", event)
            .header("X-GitHub-Delivery", delivery_id)
            .header("X-Hub-Signature-256", signature)
            .body(Body::from(body))
            .unwrap()
    }

    async fn status_field(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        value["status"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_signed_push_is_accepted_and_dispatched() {
        let (app, dispatcher) = app();
        let body = push_body();
        let signature = sign_payload(&body, SECRET);

        let response = app.oneshot(delivery("push", "d-1", &signature, body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(status_field(response).await, "dispatched");
        assert_eq!(dispatcher.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_signature_is_unauthorized() {
        let (app, dispatcher) = app();
        let body = push_body();
        let signature = sign_payload(&body, "someone-else");

        let response = app.oneshot(delivery("push", "d-1", &signature, body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(dispatcher.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_is_acknowledged_once() {
        let (app, dispatcher) = app();
        let body = push_body();
        let signature = sign_payload(&body, SECRET);

        let first = app
            .clone()
            .oneshot(delivery("push", "same-id", &signature, body.clone()))
            .await
            .unwrap();
        let second = app
            .oneshot(delivery("push", "same-id", &signature, body))
            .await
            .unwrap();

        assert_eq!(first.status(), StatusCode::ACCEPTED);
        assert_eq!(second.status(), StatusCode::ACCEPTED);
        assert_eq!(status_field(second).await, "duplicate");
        assert_eq!(dispatcher.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_events_are_still_accepted() {
        let (app, dispatcher) = app();

        let garbage = b"{not json".to_vec();
        let signature = sign_payload(&garbage, SECRET);
        let response = app
            .clone()
            .oneshot(delivery("push", "d-2", &signature, garbage))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(status_field(response).await, "rejected");

        let body = br#"{"zen":"Keep it logically awesome."}"#.to_vec();
        let signature = sign_payload(&body, SECRET);
        let response = app.oneshot(delivery("ping", "d-3", &signature, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(status_field(response).await, "ignored");

        assert!(dispatcher.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_delivery_can_be_redelivered() {
        let (app, dispatcher) = app();

        let garbage = b"[]".to_vec();
        let signature = sign_payload(&garbage, SECRET);
        let response = app
            .clone()
            .oneshot(delivery("push", "retry-me", &signature, garbage))
            .await
            .unwrap();
        assert_eq!(status_field(response).await, "rejected");

        let body = push_body();
        let signature = sign_payload(&body, SECRET);
        let response = app
            .oneshot(delivery("push", "retry-me", &signature, body))
            .await
            .unwrap();
        assert_eq!(status_field(response).await, "dispatched");
        assert_eq!(dispatcher.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

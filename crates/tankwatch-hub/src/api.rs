use crate::broadcast::{HubFrame, Subscription};
use crate::lifecycle::Lifecycle;
use crate::monitor::MonitorHandle;
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::stream::{self, Stream};
use std::{convert::Infallible, sync::Arc};
use tracing::{debug, warn};

pub fn router(lifecycle: Arc<Lifecycle>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/events", get(events_handler))
        .route("/init", get(init_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(lifecycle)
}

fn unavailable(reason: &str) -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, reason.to_string()).into_response()
}

async fn started(lifecycle: &Lifecycle) -> Result<&MonitorHandle, Response> {
    lifecycle.ensure_started().await.map_err(|err| {
        warn!(event = "monitor_start_error", error = %err);
        unavailable("monitor unavailable")
    })
}

async fn status_handler(State(lifecycle): State<Arc<Lifecycle>>) -> Response {
    let monitor = match started(&lifecycle).await {
        Ok(monitor) => monitor,
        Err(response) => return response,
    };
    match monitor.snapshot().await {
        Some(record) => Json(record).into_response(),
        None => unavailable("monitor stopped"),
    }
}

async fn init_handler(State(lifecycle): State<Arc<Lifecycle>>) -> Response {
    match started(&lifecycle).await {
        Ok(_) => "Initialized".into_response(),
        Err(response) => response,
    }
}

async fn events_handler(State(lifecycle): State<Arc<Lifecycle>>) -> Response {
    let monitor = match started(&lifecycle).await {
        Ok(monitor) => monitor,
        Err(response) => return response,
    };
    let Some(subscription) = monitor.attach().await else {
        return unavailable("monitor stopped");
    };
    debug!(event = "sse_open", conn_id = subscription.conn_id());
    Sse::new(frame_stream(subscription)).into_response()
}

/// Keep-alives come from the hub, so a dead client is noticed on the
/// hub's schedule and not axum's.
fn frame_stream(
    subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(subscription, |mut subscription| async move {
        let frame = subscription.recv().await?;
        let event = match frame {
            HubFrame::Event { name, data } => Event::default().event(name).data(&*data),
            HubFrame::KeepAlive => Event::default().comment("keepalive"),
        };
        Some((Ok(event), subscription))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::HubConfig;
    use crate::detector::DetectorSettings;
    use crate::lifecycle::{Services, StoreLocation};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Utc;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tankwatch_core::{ActivityState, MonitorRecord};
    use tankwatch_storage::MemoryStateStore;
    use tower::ServiceExt;

    fn lifecycle(store: MemoryStateStore) -> Arc<Lifecycle> {
        Arc::new(Lifecycle::new(Services {
            store: StoreLocation::Memory(store),
            detector: DetectorSettings::default(),
            hub: HubConfig {
                keepalive_interval: Duration::ZERO,
                queue_capacity: 8,
            },
            feed: None,
            roster: None,
            roster_interval: Duration::from_secs(1200),
        }))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, String::from_utf8_lossy(&body).to_string())
    }

    #[tokio::test]
    async fn health_does_not_start_monitor() {
        let lifecycle = lifecycle(MemoryStateStore::new());
        let (status, body) = get(router(lifecycle.clone()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
        assert!(lifecycle.started().is_none());
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let lifecycle = lifecycle(MemoryStateStore::new());
        let (status, body) = get(router(lifecycle.clone()), "/init").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Initialized");
        let first = lifecycle.started().cloned().expect("started");

        let (status, _) = get(router(lifecycle.clone()), "/init").await;
        assert_eq!(status, StatusCode::OK);
        assert!(first.same_monitor(lifecycle.started().expect("started")));
    }

    #[tokio::test]
    async fn status_returns_restored_snapshot() {
        let started_at = Utc::now();
        let store = MemoryStateStore::with_record(&MonitorRecord {
            activity: ActivityState::active(started_at, None),
            level: Some(41.5),
            ..MonitorRecord::default()
        })
        .expect("seed");
        let (status, body) = get(router(lifecycle(store)), "/status").await;
        assert_eq!(status, StatusCode::OK);

        let value: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(value["isActive"], true);
        assert_eq!(value["level"], 41.5);
        assert!(value["lastEndedAt"].is_null());
        assert!(value["roster"].as_array().expect("roster").is_empty());
    }

    #[tokio::test]
    async fn status_is_unavailable_when_store_cannot_open() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").expect("write");
        let lifecycle = Arc::new(Lifecycle::new(Services {
            store: StoreLocation::Sqlite(blocker.join("state.db")),
            detector: DetectorSettings::default(),
            hub: HubConfig::default(),
            feed: None,
            roster: None,
            roster_interval: Duration::from_secs(1200),
        }));
        let (status, _) = get(router(lifecycle), "/status").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn event_stream_opens_with_status_frame() {
        let lifecycle = lifecycle(MemoryStateStore::new());
        let response = router(lifecycle.clone())
            .oneshot(
                Request::builder()
                    .uri("/events")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|value| value.to_str().ok()),
            Some("text/event-stream")
        );

        let mut body = response.into_body().into_data_stream();
        let chunk = body.next().await.expect("frame").expect("bytes");
        let text = String::from_utf8_lossy(&chunk).to_string();
        assert!(text.starts_with("event: status\n"), "{text}");
        assert!(text.contains("\"isActive\":false"), "{text}");
    }
}

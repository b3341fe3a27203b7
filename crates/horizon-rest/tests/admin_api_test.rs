//! Admin API tests driven through the router with `oneshot`.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use horizon_config::ServerConfig;
use horizon_core::{DeadLetterId, JobId, TemplateId};
use horizon_jobs::{
    BroadcastNotifier, DeadLetterManager, DeadLetterReason, InMemoryStore, JobCoordinator, JobStatus,
    NewGenerationJob, RecurringTemplate,
};
use horizon_rest::{create_router, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    store: Arc<InMemoryStore>,
    coordinator: JobCoordinator,
    dead_letters: DeadLetterManager,
    template_id: TemplateId,
}

impl TestApp {
    fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let template_id = TemplateId::new();
        store.insert_template(RecurringTemplate {
            id: template_id,
            title: "Weekly report".to_string(),
            anchor_at: Utc::now(),
            interval_secs: 7 * 86_400,
            sync_horizon_days: 14,
            generation_horizon_days: 60,
            generated_through: None,
            active: true,
        });

        let coordinator = JobCoordinator::new(store.clone(), Arc::new(BroadcastNotifier::default()));
        let dead_letters = DeadLetterManager::new(store.clone());
        let router = create_router(
            AppState::new(coordinator.clone(), dead_letters.clone()),
            &ServerConfig::default(),
        );

        Self {
            router,
            store,
            coordinator,
            dead_letters,
            template_id,
        }
    }

    async fn enqueue(&self) -> JobId {
        let from = Utc::now();
        self.coordinator
            .insert_job(NewGenerationJob::new(self.template_id, from, from + ChronoDuration::days(30)))
            .await
            .expect("insert job")
            .id
    }

    async fn dead_letter(&self) -> DeadLetterId {
        let job_id = self.enqueue().await;
        self.coordinator
            .claim_next_job("w1", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("claimed");
        self.dead_letters
            .move_to_dead_letter(job_id, "w1", DeadLetterReason::new("generation", "template rule is invalid"))
            .await
            .expect("dead-lettered")
            .id
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder().method("DELETE").uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let (status, body) = app.send(get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_list_dead_letters() {
    let app = TestApp::new();
    let first = app.dead_letter().await;
    let second = app.dead_letter().await;

    let (status, body) = app.send(get("/api/v1/admin/dead-letters")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let records = body["data"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    let ids: Vec<_> = records.iter().map(|r| r["id"].as_str().unwrap().to_string()).collect();
    assert!(ids.contains(&first.to_string()));
    assert!(ids.contains(&second.to_string()));
    assert_eq!(records[0]["error_type"], "generation");

    let (_, body) = app.send(get("/api/v1/admin/dead-letters?limit=1")).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_retry_dead_letter() {
    let app = TestApp::new();
    let id = app.dead_letter().await;

    let (status, body) = app
        .send(post_json(
            &format!("/api/v1/admin/dead-letters/{id}/retry"),
            json!({ "reviewed_by": "ops@example.com" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let new_job_id: JobId = body["data"]["new_job_id"].as_str().unwrap().parse().unwrap();
    let job = app.coordinator.get_job(new_job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);

    let (status, body) = app
        .send(post_json(
            &format!("/api/v1/admin/dead-letters/{id}/retry"),
            json!({ "reviewed_by": "ops@example.com" }),
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_discard_dead_letter() {
    let app = TestApp::new();
    let id = app.dead_letter().await;

    let (status, _) = app
        .send(post_json(
            &format!("/api/v1/admin/dead-letters/{id}/discard"),
            json!({ "reviewed_by": "ops@example.com", "note": "template deleted" }),
        ))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(app.dead_letters.list_dead_letter_jobs(50).await.unwrap().is_empty());

    let (status, _) = app
        .send(post_json(
            &format!("/api/v1/admin/dead-letters/{}/discard", DeadLetterId::new()),
            json!({ "reviewed_by": "ops@example.com", "note": "" }),
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_blank_reviewer_rejected() {
    let app = TestApp::new();
    let id = app.dead_letter().await;

    let (status, body) = app
        .send(post_json(
            &format!("/api/v1/admin/dead-letters/{id}/retry"),
            json!({ "reviewed_by": "   " }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert_eq!(app.dead_letters.list_dead_letter_jobs(50).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_get_and_cancel_job() {
    let app = TestApp::new();
    let job_id = app.enqueue().await;

    let (status, body) = app.send(get(&format!("/api/v1/admin/jobs/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "pending");

    let (status, _) = app.send(delete(&format!("/api/v1/admin/jobs/{job_id}"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(app.store.jobs()[0].status, JobStatus::Cancelled);

    let (status, _) = app.send(delete(&format!("/api/v1/admin/jobs/{job_id}"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(app.store.jobs()[0].status, JobStatus::Cancelled);

    let (status, _) = app.send(get(&format!("/api/v1/admin/jobs/{}", JobId::new()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = app.send(delete(&format!("/api/v1/admin/jobs/{}", JobId::new()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_finished_job_is_noop() {
    let app = TestApp::new();
    let job_id = app.enqueue().await;
    app.coordinator
        .claim_next_job("w1", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("claimed");
    app.coordinator.complete_job(job_id, "w1").await.unwrap();

    let (status, _) = app.send(delete(&format!("/api/v1/admin/jobs/{job_id}"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, body) = app.send(get(&format!("/api/v1/admin/jobs/{job_id}"))).await;
    assert_eq!(body["data"]["status"], "completed");
}

#[tokio::test]
async fn test_malformed_id_rejected() {
    let app = TestApp::new();
    let (status, _) = app.send(get("/api/v1/admin/jobs/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

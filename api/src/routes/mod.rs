pub mod auth;
pub mod queue;
pub mod summaries;
pub mod usage;

use axum::{
    Router,
    extract::{Query, rejection::QueryRejection},
};
use serde::Deserialize;
use std::sync::Arc;

use crate::AppState;
use crate::constants::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::services::error::{ApiError, LogErr};

/// Build all routes for the API
pub fn build_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(queue::routes())
        .merge(summaries::routes())
        .merge(usage::routes())
}

/// `?limit=&offset=` query parameters shared by list endpoints
#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    limit: Option<i64>,
    offset: Option<i64>,
}

impl Pagination {
    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    /// Unwrap the extractor result, answering malformed values with a JSON 400
    pub fn from_query(query: Result<Query<Self>, QueryRejection>) -> Result<Self, ApiError> {
        let Query(page) = query.log_status(
            "Invalid pagination",
            ApiError::BadRequest("limit and offset must be integers".into()),
        )?;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::models::{LedgerEntry, Plan};
    use crate::services::queue::QueueService;
    use crate::services::session;
    use crate::store::MemoryStore;
    use crate::testing::RecordingDispatcher;

    const SECRET: &[u8] = b"route-test-secret";

    struct Harness {
        app: Router,
        store: Arc<MemoryStore>,
        user: Uuid,
        token: String,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let state = Arc::new(AppState {
            queue: QueueService::new(store.clone(), dispatcher),
            jwt_secret: SECRET.to_vec(),
        });
        let user = Uuid::new_v4();
        let token =
            session::create_access_token(user, SECRET, chrono::Duration::hours(1)).unwrap();

        Harness {
            app: Router::new().nest("/api", build_routes()).with_state(state),
            store,
            user,
            token,
        }
    }

    impl Harness {
        async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let builder = Request::builder()
                .method(method)
                .uri(uri)
                .header("authorization", format!("Bearer {}", self.token))
                .header("x-forwarded-for", "203.0.113.7");
            let request = match body {
                Some(body) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, value)
        }
    }

    #[tokio::test]
    async fn test_requests_without_token_are_unauthorized() {
        let h = harness();
        let request = Request::builder()
            .uri("/api/queue")
            .body(Body::empty())
            .unwrap();
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/api/usage")
            .header("authorization", "Bearer not-a-jwt")
            .body(Body::empty())
            .unwrap();
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_cookie_token_is_accepted() {
        let h = harness();
        let request = Request::builder()
            .uri("/api/usage")
            .header("cookie", format!("access_token={}", h.token))
            .body(Body::empty())
            .unwrap();
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_enqueue_then_list_and_get() {
        let h = harness();
        let (status, body) = h
            .send(
                "POST",
                "/api/queue",
                Some(json!({ "videoUrl": "https://youtu.be/dQw4w9WgXcQ", "videoTitle": "Song" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["position"], 1);
        assert_eq!(body["item"]["status"], "pending");
        assert_eq!(body["item"]["videoId"], "dQw4w9WgXcQ");
        let id = body["item"]["id"].as_str().unwrap().to_string();

        let (status, list) = h.send("GET", "/api/queue", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["items"].as_array().unwrap().len(), 1);

        let (status, item) = h.send("GET", &format!("/api/queue/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(item["videoTitle"], "Song");
    }

    #[tokio::test]
    async fn test_enqueue_error_codes() {
        let h = harness();

        let (status, body) = h
            .send("POST", "/api/queue", Some(json!({ "videoUrl": "not a url" })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_URL");

        let (status, body) = h.send("POST", "/api/queue", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");

        let video = json!({ "videoUrl": "https://www.youtube.com/watch?v=dQw4w9WgXcQ" });
        h.send("POST", "/api/queue", Some(video.clone())).await;
        let (status, body) = h.send("POST", "/api/queue", Some(video)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "DUPLICATE");
    }

    #[tokio::test]
    async fn test_rate_limited_body_carries_limit_and_plan() {
        let h = harness();
        h.store.set_usage(
            h.user,
            LedgerEntry {
                daily_count: 5,
                reset_boundary: chrono::Utc::now().date_naive(),
            },
        );

        let (status, body) = h
            .send(
                "POST",
                "/api/queue",
                Some(json!({ "videoUrl": "https://youtu.be/dQw4w9WgXcQ" })),
            )
            .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["code"], "RATE_LIMITED");
        assert_eq!(body["limit"], 5);
        assert_eq!(body["plan"], "free");

        let (_, usage) = h.send("GET", "/api/usage", None).await;
        assert_eq!(usage["used"], 5);
        assert_eq!(usage["limit"], 5);
    }

    #[tokio::test]
    async fn test_batch_is_pro_only() {
        let h = harness();
        let batch = json!({ "videos": [{ "videoUrl": "https://youtu.be/dQw4w9WgXcQ" }] });

        let (status, body) = h.send("POST", "/api/queue/batch", Some(batch.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "PRO_REQUIRED");
        assert!(body["upgradeUrl"].is_string());

        h.store.set_plan(h.user, Plan::Pro);
        let (status, body) = h.send("POST", "/api/queue/batch", Some(batch)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["items"].as_array().unwrap().len(), 1);
        assert_eq!(body["rateLimited"], false);
        assert_eq!(body["skippedDuplicates"], json!([]));
    }

    #[tokio::test]
    async fn test_retry_and_delete_status_codes() {
        let h = harness();
        let (_, body) = h
            .send(
                "POST",
                "/api/queue",
                Some(json!({ "videoUrl": "https://youtu.be/dQw4w9WgXcQ" })),
            )
            .await;
        let id: Uuid = body["item"]["id"].as_str().unwrap().parse().unwrap();

        let (status, _) = h
            .send("POST", &format!("/api/queue/{}/retry", Uuid::new_v4()), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        use crate::store::QueueStore;
        h.store.mark_processing(id).await.unwrap();
        let (status, body) = h.send("DELETE", &format!("/api/queue/{}", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "INVALID_STATE");

        h.store.fail(id, "Transcript fetch failed").await.unwrap();
        let (status, body) = h
            .send("POST", &format!("/api/queue/{}/retry", id), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");
        assert!(body["errorMessage"].is_null());

        let (status, body) = h.send("DELETE", &format!("/api/queue/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);

        let (status, _) = h.send("GET", &format!("/api/queue/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_summaries_only_show_completed() {
        let h = harness();
        let (_, body) = h
            .send(
                "POST",
                "/api/queue",
                Some(json!({ "videoUrl": "https://youtu.be/dQw4w9WgXcQ" })),
            )
            .await;
        let id = body["item"]["id"].as_str().unwrap().to_string();

        let (status, list) = h.send("GET", "/api/summaries", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(list["summaries"].as_array().unwrap().is_empty());
        assert_eq!(list["total"], 0);

        let (status, _) = h.send("GET", &format!("/api/summaries/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    /// Enqueue a video and drive it to completed with `summary` as its text
    async fn completed_item(h: &Harness, url: &str, title: &str, summary: &str) -> String {
        use crate::models::SummaryJson;
        use crate::store::QueueStore;

        let (_, body) = h
            .send(
                "POST",
                "/api/queue",
                Some(json!({ "videoUrl": url, "videoTitle": title })),
            )
            .await;
        let id: Uuid = body["item"]["id"].as_str().unwrap().parse().unwrap();
        h.store.mark_processing(id).await.unwrap();
        let summary = SummaryJson {
            summary: summary.into(),
            key_points: vec![],
            action_items: vec![],
            timestamps: vec![],
        };
        assert!(h.store.complete(id, &summary).await.unwrap());
        id.to_string()
    }

    #[tokio::test]
    async fn test_summary_list_and_detail_envelopes() {
        let h = harness();
        let id = completed_item(&h, "https://youtu.be/dQw4w9WgXcQ", "Song", "A song.").await;
        completed_item(&h, "https://youtu.be/aaaaaaaaaaa", "Talk", "A talk.").await;

        let (status, list) = h.send("GET", "/api/summaries?limit=1&offset=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["summaries"].as_array().unwrap().len(), 1);
        assert_eq!(list["total"], 2);
        assert_eq!(list["limit"], 1);
        assert_eq!(list["offset"], 1);

        let (status, detail) = h.send("GET", &format!("/api/summaries/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["summary"]["id"], id.as_str());
        assert_eq!(detail["summary"]["summaryJson"]["summary"], "A song.");
    }

    #[tokio::test]
    async fn test_summary_search() {
        let h = harness();
        completed_item(&h, "https://youtu.be/dQw4w9WgXcQ", "Rust async", "Futures.").await;
        completed_item(&h, "https://youtu.be/aaaaaaaaaaa", "Baking", "Bread, rust-coloured.").await;
        completed_item(&h, "https://youtu.be/bbbbbbbbbbb", "Hiking", "Trails.").await;

        let (status, body) = h.send("GET", "/api/summaries/search?q=RUST", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["summaries"].as_array().unwrap().len(), 2);

        let (status, body) = h.send("GET", "/api/summaries/search?q=%22trails%22.", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["summaries"][0]["videoTitle"], "Hiking");

        let (status, body) = h.send("GET", "/api/summaries/search", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
        assert!(body["error"].as_str().unwrap().contains("q is required"));

        let (status, _) = h.send("GET", "/api/summaries/search?q=..", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_summary_delete() {
        let h = harness();
        let id = completed_item(&h, "https://youtu.be/dQw4w9WgXcQ", "Song", "A song.").await;

        let (status, body) = h.send("DELETE", &format!("/api/summaries/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);
        assert_eq!(body["id"], id.as_str());

        let (status, _) = h.send("DELETE", &format!("/api/summaries/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = h.send("GET", &format!("/api/summaries/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = h
            .send("DELETE", &format!("/api/summaries/{}", Uuid::new_v4()), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_pagination_is_a_json_400() {
        let h = harness();
        for uri in [
            "/api/queue?limit=abc",
            "/api/summaries?offset=soon",
            "/api/summaries/search?q=rust&limit=1.5",
        ] {
            let (status, body) = h.send("GET", uri, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(body["code"], "BAD_REQUEST", "{}", uri);
            assert!(body["error"].is_string(), "{}", uri);
        }
    }

    #[test]
    fn test_pagination_bounds() {
        let page = Pagination {
            limit: Some(10_000),
            offset: Some(-3),
        };
        assert_eq!(page.limit(), MAX_PAGE_SIZE);
        assert_eq!(page.offset(), 0);
        assert_eq!(Pagination::default().limit(), DEFAULT_PAGE_SIZE);
    }
}

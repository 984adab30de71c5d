//! HTTP surface
//!
//! One streaming route, a liveness probe, and a small JSON catalog. The
//! server runs as a task inside the same runtime as the upstream client so
//! its background work keeps progressing while requests stream.

mod routes;

pub use routes::create_router;

use crate::config::ServerConfig;
use crate::db::FileRepo;
use crate::error::{Error, Result};
use crate::stream::StreamEngine;
use crate::upstream::Upstream;

use std::sync::Arc;
use tracing::info;

/// Shared state for the request handlers.
pub struct AppState {
    pub upstream: Arc<dyn Upstream>,
    pub repo: Arc<dyn FileRepo>,
    pub engine: StreamEngine,
}

/// Bind and serve until the task is cancelled or the listener fails.
pub async fn serve(config: &ServerConfig, state: Arc<AppState>) -> Result<()> {
    let app = create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app).await.map_err(Error::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::MemoryFileRepo;
    use crate::db::{ArchivedFile, FileKind, FileSource};
    use crate::range::CHUNK;
    use crate::upstream::testing::{patterned, FakeUpstream, FaultKind, StreamScript};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{Duration as ChronoDuration, Utc};
    use http_body_util::BodyExt;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tower::ServiceExt;

    const CH: i64 = -1001234567890;

    fn record(msg_id: i64, name: &str, size: i64, age_secs: i64) -> ArchivedFile {
        ArchivedFile {
            id: None,
            msg_id,
            channel_id: CH,
            file_unique_id: format!("uid{}", msg_id),
            display_name: name.to_string(),
            size_bytes: size,
            mime_type: Some("video/mp4".to_string()),
            kind: FileKind::Video,
            duration_seconds: None,
            quality_label: None,
            source: FileSource::DirectUpload,
            external_url: None,
            uploaded_by: 42,
            stream_link: format!("https://vault.example/stream/{}/{}", CH, msg_id),
            created_at: Utc::now() - ChronoDuration::seconds(age_secs),
            is_active: true,
        }
    }

    fn app_with(
        fake: Arc<FakeUpstream>,
        records: Vec<ArchivedFile>,
    ) -> axum::Router {
        let engine = StreamEngine::new(fake.clone(), Duration::from_secs(5));
        create_router(Arc::new(AppState {
            upstream: fake,
            repo: Arc::new(MemoryFileRepo::with_files(records)),
            engine,
        }))
    }

    fn seeded(size: usize) -> (axum::Router, Arc<FakeUpstream>, Vec<u8>) {
        let fake = Arc::new(FakeUpstream::new());
        let data = patterned(size);
        fake.add_file(CH, 159, data.clone());
        let app = app_with(
            fake.clone(),
            vec![record(159, "movie.mp4", size as i64, 0)],
        );
        (app, fake, data)
    }

    async fn get(app: &axum::Router, uri: &str, range: Option<&str>) -> axum::response::Response {
        let mut request = Request::builder().uri(uri);
        if let Some(range) = range {
            request = request.header("Range", range);
        }
        app.clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    fn header<'r>(resp: &'r axum::response::Response, name: &str) -> &'r str {
        resp.headers()
            .get(name)
            .unwrap_or_else(|| panic!("missing header {}", name))
            .to_str()
            .unwrap()
    }

    async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
        resp.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_health_probe() {
        let (app, _, _) = seeded(10);
        let resp = get(&app, "/", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_bytes(resp).await;
        assert!(String::from_utf8(body).unwrap().contains("Online"));
    }

    #[tokio::test]
    async fn test_s1_full_read() {
        let (app, _, data) = seeded(1_500_000);
        let resp = get(&app, &format!("/stream/{}/159", CH), None).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header(&resp, "content-length"), "1500000");
        assert_eq!(header(&resp, "accept-ranges"), "bytes");
        assert_eq!(header(&resp, "content-type"), "video/mp4");
        assert!(header(&resp, "content-disposition").starts_with("inline; filename=\""));

        let body = body_bytes(resp).await;
        assert_eq!(body, data);
    }

    #[tokio::test]
    async fn test_s2_range_spanning_chunk_boundary() {
        let (app, _, data) = seeded(1_500_000);
        let resp = get(&app, &format!("/stream/{}/159", CH), Some("bytes=500000-1000000")).await;

        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&resp, "content-length"), "500001");
        assert_eq!(
            header(&resp, "content-range"),
            "bytes 500000-1000000/1500000"
        );

        let body = body_bytes(resp).await;
        assert_eq!(body, &data[500_000..=1_000_000]);
    }

    #[tokio::test]
    async fn test_s3_chunk_aligned_range() {
        let (app, _, data) = seeded(1_500_000);
        let resp = get(&app, &format!("/stream/{}/159", CH), Some("bytes=1048576-1499999")).await;

        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&resp, "content-length"), "451424");
        assert_eq!(
            header(&resp, "content-range"),
            "bytes 1048576-1499999/1500000"
        );

        let body = body_bytes(resp).await;
        assert_eq!(body, &data[1_048_576..]);
    }

    #[tokio::test]
    async fn test_s5_range_past_eof_is_416() {
        let (app, fake, _) = seeded(1_500_000);
        let resp = get(&app, &format!("/stream/{}/159", CH), Some("bytes=1600000-1700000")).await;

        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(header(&resp, "content-range"), "bytes */1500000");
        assert_eq!(fake.get_message_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_ranges_are_416() {
        let (app, _, _) = seeded(1_500_000);
        for bad in ["bytes=5-2", "bytes=1500000-", "bytes=0-1,5-6", "bytes=-100"] {
            let resp = get(&app, &format!("/stream/{}/159", CH), Some(bad)).await;
            assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{}", bad);
            assert_eq!(header(&resp, "content-range"), "bytes */1500000");
        }
    }

    #[tokio::test]
    async fn test_unknown_file_is_404_without_upstream_call() {
        let (app, fake, _) = seeded(100);
        let resp = get(&app, &format!("/stream/{}/9999", CH), None).await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(fake.get_message_calls.load(Ordering::SeqCst), 0);
        assert_eq!(fake.open_stream_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_soft_deleted_record_is_404() {
        let fake = Arc::new(FakeUpstream::new());
        fake.add_file(CH, 7, patterned(50));
        let mut hidden = record(7, "gone.mp4", 50, 0);
        hidden.is_active = false;
        let app = app_with(fake.clone(), vec![hidden]);

        let resp = get(&app, &format!("/stream/{}/7", CH), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(fake.get_message_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_head_returns_headers_without_upstream_stream() {
        let (app, fake, _) = seeded(1_500_000);
        let request = Request::builder()
            .method("HEAD")
            .uri(format!("/stream/{}/159", CH))
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(request).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header(&resp, "content-length"), "1500000");
        assert_eq!(header(&resp, "accept-ranges"), "bytes");

        let body = body_bytes(resp).await;
        assert!(body.is_empty());
        assert_eq!(fake.get_message_calls.load(Ordering::SeqCst), 0);
        assert_eq!(fake.open_stream_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_file_serves_empty_body() {
        let fake = Arc::new(FakeUpstream::new());
        fake.add_file(CH, 3, Vec::new());
        let app = app_with(fake.clone(), vec![record(3, "empty.bin", 0, 0)]);

        let resp = get(&app, &format!("/stream/{}/3", CH), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header(&resp, "content-length"), "0");
        assert!(body_bytes(resp).await.is_empty());
        assert_eq!(fake.open_stream_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnected_upstream_is_503_with_retry_after() {
        let fake = Arc::new(FakeUpstream::disconnected());
        let app = app_with(fake, vec![record(1, "a.mp4", 10, 0)]);

        let resp = get(&app, &format!("/stream/{}/1", CH), None).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(header(&resp, "retry-after"), "5");
    }

    #[tokio::test]
    async fn test_stream_survives_reference_expiry_end_to_end() {
        let size = 3 * CHUNK as usize;
        let (app, fake, data) = seeded(size);
        fake.push_script(
            CH,
            159,
            StreamScript::FailAfterBytes(1_500_000, FaultKind::ReferenceExpired),
        );

        let resp = get(&app, &format!("/stream/{}/159", CH), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_bytes(resp).await;
        assert_eq!(body, data);
    }

    #[tokio::test]
    async fn test_content_disposition_encodes_unicode_names() {
        let fake = Arc::new(FakeUpstream::new());
        fake.add_file(CH, 5, patterned(10));
        let app = app_with(fake, vec![record(5, "видео 🎬.mp4", 10, 0)]);

        let resp = get(&app, &format!("/stream/{}/5", CH), None).await;
        let disposition = header(&resp, "content-disposition");
        assert!(disposition.is_ascii());
        assert!(disposition.contains("%"));
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let (app, _, _) = seeded(100);
        let request = Request::builder()
            .uri(format!("/stream/{}/159", CH))
            .header("Origin", "https://player.example")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(request).await.unwrap();

        assert_eq!(header(&resp, "access-control-allow-origin"), "*");
    }

    #[tokio::test]
    async fn test_catalog_pagination_and_clamping() {
        let fake = Arc::new(FakeUpstream::new());
        let records = (1..=5)
            .map(|i| record(i, &format!("file{}.mp4", i), 100, i))
            .collect();
        let app = app_with(fake, records);

        let resp = get(&app, "/api/catalog?page=1&per_page=2", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let page: serde_json::Value =
            serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(page["total"], 5);
        assert_eq!(page["files"].as_array().unwrap().len(), 2);
        // newest first: smallest age
        assert_eq!(page["files"][0]["msg_id"], 1);

        let resp = get(&app, "/api/catalog?page=3&per_page=2", None).await;
        let page: serde_json::Value =
            serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(page["files"].as_array().unwrap().len(), 1);

        // per_page is clamped to 100
        let resp = get(&app, "/api/catalog?per_page=5000", None).await;
        let page: serde_json::Value =
            serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(page["per_page"], 100);
    }
}

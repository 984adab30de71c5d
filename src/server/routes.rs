//! Route table and request handlers

use crate::db::ArchivedFile;
use crate::error::Error;
use crate::range::parse_range;
use crate::server::AppState;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};

/// Extensions Telegram often mislabels as `application/octet-stream`;
/// serving them as video lets browsers play instead of download.
const VIDEO_EXTENSIONS: [&str; 5] = [".mp4", ".mkv", ".webm", ".mov", ".avi"];

/// Characters escaped inside the Content-Disposition filename quotes.
/// Non-ASCII is always percent-encoded.
const FILENAME_ESCAPE: &AsciiSet = &CONTROLS.add(b'"').add(b'\\').add(b'%');

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD])
        .allow_headers([header::RANGE])
        .expose_headers([
            header::CONTENT_RANGE,
            header::ACCEPT_RANGES,
            header::CONTENT_LENGTH,
        ]);

    Router::new()
        .route("/", get(health))
        .route("/stream/{channel_id}/{msg_id}", get(stream_file))
        .route("/api/catalog", get(catalog))
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "Online",
        "service": "streamvault",
    }))
}

/// Main streaming endpoint. 200 for whole-file reads, 206 for ranges,
/// 416 for anything the parser rejects, 404 for unknown or soft-deleted
/// records, 503 until the upstream handle is up. HEAD returns the same
/// headers without touching the upstream.
async fn stream_file(
    State(state): State<Arc<AppState>>,
    Path((channel_id, msg_id)): Path<(i64, i64)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    if !state.upstream.is_connected() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "5")],
            "upstream not connected",
        )
            .into_response();
    }

    let record = match state.repo.get_by_msg_id(channel_id, msg_id).await {
        Ok(Some(record)) if record.is_active => record,
        Ok(_) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("Record lookup failed for {}/{}: {}", channel_id, msg_id, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let size = record.size_bytes.max(0) as u64;

    let range_header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    let range = match parse_range(range_header, size) {
        Ok(range) => range,
        Err(_) => {
            warn!(
                "Unsatisfiable range {:?} for {}/{} (size {})",
                range_header, channel_id, msg_id, size
            );
            return (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", size))],
                Body::empty(),
            )
                .into_response();
        }
    };

    let mut builder = Response::builder()
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, serve_content_type(&record))
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(&record.display_name),
        );

    if range.full {
        builder = builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, size.to_string());
    } else {
        builder = builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_LENGTH, range.want().to_string())
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", range.start, range.end, size),
            );
    }

    // HEAD carries the same headers but must not open an upstream stream
    if method == Method::HEAD || size == 0 {
        return builder.body(Body::empty()).unwrap();
    }

    let remote = match state.upstream.get_message(channel_id, msg_id).await {
        Ok(remote) => remote,
        Err(e) => return upstream_error_response(channel_id, msg_id, e),
    };

    let body = state.engine.open(remote, range);
    builder.body(Body::from_stream(body)).unwrap()
}

/// Map a pre-headers upstream failure onto a status code.
fn upstream_error_response(channel_id: i64, msg_id: i64, e: Error) -> Response {
    match e {
        Error::NotFound(_) => StatusCode::NOT_FOUND.into_response(),
        Error::Unauthorized(_) => {
            error!("Upstream rejected credentials: {}", e);
            StatusCode::FORBIDDEN.into_response()
        }
        other => {
            error!(
                "Upstream fetch failed for {}/{}: {}",
                channel_id, msg_id, other
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn serve_content_type(record: &ArchivedFile) -> String {
    let lowered = record.display_name.to_lowercase();
    if VIDEO_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext)) {
        return "video/mp4".to_string();
    }

    match &record.mime_type {
        Some(mime) if !mime.is_empty() => mime.clone(),
        _ => mime_guess::from_path(&record.display_name)
            .first_or_octet_stream()
            .to_string(),
    }
}

fn content_disposition(display_name: &str) -> String {
    format!(
        "inline; filename=\"{}\"",
        utf8_percent_encode(display_name, FILENAME_ESCAPE)
    )
}

#[derive(Debug, Deserialize)]
struct CatalogParams {
    page: Option<u64>,
    per_page: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CatalogEntry {
    msg_id: i64,
    channel_id: i64,
    display_name: String,
    size_bytes: i64,
    kind: crate::db::FileKind,
    mime_type: Option<String>,
    duration_seconds: Option<i64>,
    quality_label: Option<String>,
    stream_link: String,
    created_at: String,
}

#[derive(Debug, Serialize)]
struct CatalogPage {
    total: u64,
    page: u64,
    per_page: u64,
    files: Vec<CatalogEntry>,
}

/// Paginated JSON listing of active records, newest first. `page` is
/// one-based; `per_page` is clamped to 100.
async fn catalog(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CatalogParams>,
) -> Response {
    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(50).clamp(1, 100);

    let listing = state.repo.list_catalog(page - 1, per_page).await;
    let total = state.repo.count_active().await;

    match (listing, total) {
        (Ok(files), Ok(total)) => Json(CatalogPage {
            total,
            page,
            per_page,
            files: files.into_iter().map(catalog_entry).collect(),
        })
        .into_response(),
        (Err(e), _) | (_, Err(e)) => {
            error!("Catalog query failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn catalog_entry(file: ArchivedFile) -> CatalogEntry {
    CatalogEntry {
        msg_id: file.msg_id,
        channel_id: file.channel_id,
        display_name: file.display_name,
        size_bytes: file.size_bytes,
        kind: file.kind,
        mime_type: file.mime_type,
        duration_seconds: file.duration_seconds,
        quality_label: file.quality_label,
        stream_link: file.stream_link,
        created_at: file.created_at.to_rfc3339(),
    }
}

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use chrono::SecondsFormat;
use frame_relay_common::cache::LatestFrameCache;
use frame_relay_common::frame::stream_content_type;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::session::{SessionPolicy, StreamSession};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

/// One named directory with its cache.
pub struct Source {
    pub name: String,
    pub dir: PathBuf,
    pub cache: Arc<LatestFrameCache>,
    active_sessions: AtomicUsize,
}

impl Source {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>, cache: Arc<LatestFrameCache>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            cache,
            active_sessions: AtomicUsize::new(0),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }
}

pub struct AppState {
    /// Non-empty; the first entry backs `/stream`.
    pub sources: Vec<Arc<Source>>,
    pub policy: Arc<SessionPolicy>,
    /// Placeholder JPEG already wrapped as a multipart part.
    pub placeholder: Bytes,
    /// Cancelled on shutdown; every session holds a child token.
    pub shutdown: CancellationToken,
    next_session_id: AtomicU64,
}

impl AppState {
    pub fn new(
        sources: Vec<Arc<Source>>,
        policy: Arc<SessionPolicy>,
        placeholder: Bytes,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sources,
            policy,
            placeholder,
            shutdown,
            next_session_id: AtomicU64::new(1),
        }
    }

    fn source(&self, name: &str) -> Option<&Arc<Source>> {
        self.sources.iter().find(|s| s.name == name)
    }
}

/// Keeps a source's session count accurate however the session task ends.
struct SessionGuard(Arc<Source>);

impl SessionGuard {
    fn enter(source: Arc<Source>) -> Self {
        source.active_sessions.fetch_add(1, Ordering::Relaxed);
        Self(source)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Serialize)]
struct SourceHealth {
    name: String,
    dir: String,
    last_sequence: Option<u64>,
    fresh: bool,
    frame_age_ms: Option<u64>,
    published_at: Option<String>,
    active_sessions: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stream", get(default_stream))
        .route("/stream/:source", get(named_stream))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /: one <img> per source
async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    let mut page = String::from(
        "<!DOCTYPE html>\n<html>\n<head><title>frame relay</title></head>\n<body>\n",
    );
    for source in &state.sources {
        page.push_str(&format!(
            "<h2>{name}</h2>\n<img src=\"/stream/{name}\" alt=\"{name}\">\n",
            name = source.name
        ));
    }
    page.push_str("</body>\n</html>\n");
    Html(page)
}

/// GET /stream: first configured source
async fn default_stream(State(state): State<Arc<AppState>>) -> Response {
    match state.sources.first() {
        Some(source) => start_stream(&state, Arc::clone(source)),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /stream/:source
async fn named_stream(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.source(&name) {
        Some(source) => start_stream(&state, Arc::clone(source)),
        None => {
            warn!(source = %name, "stream requested for unknown source");
            (StatusCode::NOT_FOUND, format!("unknown source: {name}")).into_response()
        }
    }
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<Vec<SourceHealth>> {
    let report = state
        .sources
        .iter()
        .map(|source| {
            let snap = source.cache.snapshot();
            let frame = snap.frame.as_ref();
            SourceHealth {
                name: source.name.clone(),
                dir: source.dir.display().to_string(),
                last_sequence: snap.last_sequence,
                fresh: frame.is_some() && !snap.stale,
                frame_age_ms: frame.map(|f| f.published_at().elapsed().as_millis() as u64),
                published_at: frame
                    .map(|f| f.published_wall().to_rfc3339_opts(SecondsFormat::Millis, true)),
                active_sessions: source.active_sessions(),
            }
        })
        .collect();
    Json(report)
}

fn start_stream(state: &AppState, source: Arc<Source>) -> Response {
    let id = state.next_session_id.fetch_add(1, Ordering::Relaxed);
    // Capacity 1: a session never runs more than one part ahead of its socket.
    let (tx, rx) = mpsc::channel(1);
    let session = StreamSession::new(
        id,
        source.name.clone(),
        Arc::clone(&source.cache),
        Arc::clone(&state.policy),
        state.placeholder.clone(),
        state.shutdown.child_token(),
    );

    let guard = SessionGuard::enter(source);
    info!(session = id, source = %guard.0.name, active = guard.0.active_sessions(), "client connected");
    tokio::spawn(async move {
        let _guard = guard;
        session.run(tx).await;
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, stream_content_type(&state.policy.boundary)),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
            (header::EXPIRES, "0".to_string()),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

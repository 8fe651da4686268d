//! API server
//!
//! Provides the HTTP API for searching the book index and managing downloads.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /search?q=&page=` - Search the book index
//! - `POST /download` - Start a download, returns `202 {download_id}`
//! - `GET /progress/:id` - Progress of a running download
//! - `GET /status/:id` - Running status or terminal outcome
//! - `DELETE /cancel/:id` - Cancel a running download
//! - `GET /downloads` - Running downloads
//! - `GET /books` - Stored files
//! - `GET /books/:filename` - File bytes
//! - `POST /delete` - Delete a stored file
//!
//! # Example
//!
//! ```no_run
//! use bookfetch::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::from_config(&bookfetch::config::Config::default())?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

use crate::classify::ContentKind;
use crate::config::Config;
use crate::download::{CancelResult, DownloadManager, DownloadRequest, JobId, JobSnapshot};
use crate::errors::{map_upstream_error, ApiResult, UserError};
use crate::storage::StoredFile;
use crate::upstream::{http_client, search::ArchiveSearch, SearchProvider};

// Maximum request body size (64KB); requests only carry small JSON objects
const MAX_BODY_SIZE: usize = 64 * 1024;
// Bound on handler time; downloads themselves run in the background
const REQUEST_TIMEOUT_SECS: u64 = 120;
// Longest accepted search query
const MAX_QUERY_LENGTH: usize = 512;

/// Server state shared across handlers.
pub struct AppState {
    pub manager: DownloadManager,
    pub search: Arc<dyn SearchProvider>,
}

/// API server configuration.
pub struct Server {
    /// Port to listen on.
    port: u16,
    /// Address to bind to (defaults to 127.0.0.1 for security).
    bind_address: String,
    state: Arc<AppState>,
}

impl Server {
    /// Create a server around an existing manager and search provider.
    /// By default, binds to 127.0.0.1 (localhost only) for security.
    pub fn new(port: u16, manager: DownloadManager, search: Arc<dyn SearchProvider>) -> Self {
        Self {
            port,
            bind_address: "127.0.0.1".to_string(),
            state: Arc::new(AppState { manager, search }),
        }
    }

    /// Wire up storage, upstream clients and the download manager from config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let manager = DownloadManager::from_config(config)?;
        let client = http_client(&config.user_agent, config.request_timeout())?;
        let search = Arc::new(ArchiveSearch::new(client, config.search_base_url.clone()));

        Ok(Self::new(config.port, manager, search).with_bind_address(config.bind_address.clone()))
    }

    /// Set the bind address.
    /// Use "0.0.0.0" to allow network access, "127.0.0.1" (default) for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    /// Build the router with all routes.
    pub fn build_router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn manager(&self) -> &DownloadManager {
        &self.state.manager
    }

    /// Start the server with graceful shutdown.
    pub async fn start(&self) -> Result<()> {
        let router = self.build_router();
        let addr = format!("{}:{}", self.bind_address, self.port);

        tracing::info!(
            storage = ?self.state.manager.storage().root(),
            "Starting server on {}",
            addr
        );

        // Security warning if binding to all interfaces
        if self.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the API to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. \
                    Another bookfetch server may be running; stop it or pick a different port with: \
                    bookfetch config set-port <PORT>",
                    self.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        let abandoned = self.state.manager.active_downloads();
        for job in &abandoned {
            self.state.manager.cancel(&job.id);
        }
        if !abandoned.is_empty() {
            tracing::info!(count = abandoned.len(), "Cancelled running downloads on shutdown");
        }

        Ok(())
    }

    /// Get the port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Build the router over shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/search", get(search_handler))
        .route("/download", post(download_handler))
        .route("/progress/:id", get(progress_handler))
        .route("/status/:id", get(status_handler))
        .route("/cancel/:id", delete(cancel_handler))
        .route("/downloads", get(downloads_handler))
        .route("/books", get(list_books_handler))
        .route("/books/:filename", get(get_book_handler))
        .route("/delete", post(delete_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
                .layer(DefaultBodyLimit::max(MAX_BODY_SIZE)),
        )
        .with_state(state)
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    active_downloads: usize,
}

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    page: Option<u32>,
}

/// Fields are optional so missing ones surface as 400, not a rejection.
#[derive(Deserialize)]
struct DownloadBody {
    md5: Option<String>,
    title: Option<String>,
    format: Option<String>,
}

#[derive(Serialize)]
struct DownloadAccepted {
    download_id: JobId,
}

#[derive(Serialize)]
struct ProgressResponse {
    progress: u8,
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

#[derive(Serialize)]
struct DownloadsResponse {
    downloads: Vec<JobSnapshot>,
}

#[derive(Serialize)]
struct FilesResponse {
    files: Vec<StoredFile>,
}

#[derive(Deserialize)]
struct DeleteBody {
    filename: Option<String>,
}

#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
    message: String,
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_downloads: state.manager.registry().active_count(),
    })
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Response> {
    let query = params.q.as_deref().map(str::trim).unwrap_or_default();
    if query.is_empty() {
        return Err(UserError::invalid_request("Missing query parameter", Some("q"), None));
    }
    if query.len() > MAX_QUERY_LENGTH {
        return Err(UserError::invalid_request(
            &format!("Query exceeds maximum length of {} characters", MAX_QUERY_LENGTH),
            Some("q"),
            None,
        ));
    }
    let page = params.page.unwrap_or(1).max(1);

    let results = state
        .search
        .search(query, page)
        .await
        .map_err(|e| map_upstream_error(&e))?;
    tracing::debug!(query = %query, page, hits = results.results.len(), "Search served");

    Ok(Json(results).into_response())
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DownloadBody>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = body.map_err(|e| {
        UserError::invalid_request("Request body must be a JSON object", None, Some(&e.body_text()))
    })?;

    let md5 = required(body.md5, "md5")?;
    let title = required(body.title, "title")?;
    let request = DownloadRequest::new(md5, title, body.format.as_deref());

    let download_id = state.manager.start_download(request)?;
    Ok((StatusCode::ACCEPTED, Json(DownloadAccepted { download_id })).into_response())
}

async fn progress_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProgressResponse>> {
    state
        .manager
        .get_progress(&JobId::from(id))
        .map(|progress| Json(ProgressResponse { progress }))
        .ok_or_else(|| UserError::not_found("download"))
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let status = state
        .manager
        .status(&JobId::from(id))
        .ok_or_else(|| UserError::not_found("download"))?;
    Ok(Json(status).into_response())
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    match state.manager.cancel(&JobId::from(id)) {
        CancelResult::Cancelled => Ok(Json(CancelResponse { cancelled: true })),
        CancelResult::NotFound => Err(UserError::not_found("download")),
    }
}

async fn downloads_handler(State(state): State<Arc<AppState>>) -> Json<DownloadsResponse> {
    Json(DownloadsResponse {
        downloads: state.manager.active_downloads(),
    })
}

async fn list_books_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<FilesResponse>> {
    let files = state.manager.list_files()?;
    Ok(Json(FilesResponse { files }))
}

async fn get_book_handler(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    let bytes = state.manager.open_file(&filename).await?;
    let kind = std::path::Path::new(&filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(ContentKind::from_extension)
        .unwrap_or(ContentKind::Unknown);

    Ok(([(header::CONTENT_TYPE, kind.mime_type())], bytes).into_response())
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DeleteBody>, JsonRejection>,
) -> ApiResult<Json<DeleteResponse>> {
    let Json(body) = body.map_err(|e| {
        UserError::invalid_request("Request body must be a JSON object", None, Some(&e.body_text()))
    })?;
    let filename = required(body.filename, "filename")?;

    state.manager.delete_file(&filename)?;
    Ok(Json(DeleteResponse {
        success: true,
        message: format!("Deleted {}", filename),
    }))
}

fn required(value: Option<String>, field: &str) -> ApiResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(UserError::missing_field(field)),
    }
}

/// Graceful shutdown signal handler.
///
/// Waits for SIGINT/SIGTERM. Running downloads are cancelled once the
/// server has stopped accepting requests.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                _ => {
                    tracing::error!("Failed to install signal handlers; graceful shutdown disabled");
                    std::future::pending::<()>().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }
}

//! The HTTP interface.
//!
//! ```text
//! GET    /                    version banner
//! GET    /healthcheck         liveness
//! GET    /ocr/{pid}           start a job (202), or redirect to its status (303)
//! GET    /ocr/{pid}/status    job status
//! GET    /ocr/{pid}/download  text of a complete job
//! GET    /ocr/{pid}/delete    delete a job
//! DELETE /ocr/{pid}           delete a job
//! ```
//!
//! Every `/ocr` route takes the same identifying query parameters (`unit`,
//! `pages`, `token`), so a job is addressed the same way it was requested.

use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::{Path as UrlPath, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use serde_json::json;
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use self::error::AppError;
use crate::{
    jobs::{
        dispatcher::{Dispatched, Dispatcher},
        identity::{OcrRequest, resolve_identity},
        status::{Fetched, JobState, delete_job, fetch_text, job_status},
    },
    prelude::*,
};

pub mod error;

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    dispatcher: Dispatcher,
}

impl AppState {
    /// Create state around a dispatcher.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

/// The body of a `202 Accepted` reply.
#[derive(Debug, Deserialize, Serialize)]
pub struct Accepted {
    pub key: String,
    pub pages: usize,
    pub status_url: String,
}

/// Build the complete router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(version))
        .route("/healthcheck", get(healthcheck))
        .nest("/ocr", ocr_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn ocr_router() -> Router<AppState> {
    Router::new()
        .route("/{pid}", get(submit).delete(delete))
        .route("/{pid}/status", get(status))
        .route("/{pid}/download", get(download))
        .route("/{pid}/delete", get(delete))
}

/// Fill in the path's `pid` on a query-string request.
fn with_pid(pid: String, mut req: OcrRequest) -> OcrRequest {
    req.pid = pid;
    req
}

/// Where to poll for the status of the job `req` identifies.
fn status_url(req: &OcrRequest) -> String {
    format!(
        "/ocr/{}/status{}",
        urlencoding::encode(&req.pid),
        req.identity_query()
    )
}

async fn version() -> String {
    format!("OCR service version {}", env!("CARGO_PKG_VERSION"))
}

async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /ocr/{pid}
async fn submit(
    State(state): State<AppState>,
    UrlPath(pid): UrlPath<String>,
    Query(req): Query<OcrRequest>,
) -> Result<Response, AppError> {
    let req = with_pid(pid, req);
    let status_url = status_url(&req);
    match state.dispatcher.handle(&req).await? {
        Dispatched::Started { key, pages } => Ok((
            StatusCode::ACCEPTED,
            Json(Accepted {
                key,
                pages,
                status_url,
            }),
        )
            .into_response()),
        Dispatched::Existing { .. } => Ok(Redirect::to(&status_url).into_response()),
    }
}

/// GET /ocr/{pid}/status
async fn status(
    State(state): State<AppState>,
    UrlPath(pid): UrlPath<String>,
    Query(req): Query<OcrRequest>,
) -> Result<Response, AppError> {
    let identity = resolve_identity(&with_pid(pid, req))?;
    let report = job_status(state.dispatcher.results(), &identity.key).await?;
    Ok(Json(report).into_response())
}

/// GET /ocr/{pid}/download
async fn download(
    State(state): State<AppState>,
    UrlPath(pid): UrlPath<String>,
    Query(req): Query<OcrRequest>,
) -> Result<Response, AppError> {
    let identity = resolve_identity(&with_pid(pid, req))?;
    match fetch_text(state.dispatcher.results(), &identity.key).await? {
        Fetched::Text(text) => Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            text,
        )
            .into_response()),
        Fetched::NotReady(JobState::Unknown) => Err(AppError::NotFound(format!(
            "no OCR job for {}",
            identity.key
        ))),
        Fetched::NotReady(job_state) => Err(AppError::NotFound(format!(
            "OCR job for {} is {}",
            identity.key, job_state
        ))),
    }
}

/// GET /ocr/{pid}/delete, DELETE /ocr/{pid}
async fn delete(
    State(state): State<AppState>,
    UrlPath(pid): UrlPath<String>,
    Query(req): Query<OcrRequest>,
) -> Result<Response, AppError> {
    let identity = resolve_identity(&with_pid(pid, req))?;
    if !delete_job(state.dispatcher.results(), &identity.key).await? {
        return Err(AppError::NotFound(format!(
            "no OCR job for {}",
            identity.key
        )));
    }
    Ok(Json(json!({ "key": identity.key, "deleted": true })).into_response())
}

/// Serve `app` on `addr` until Ctrl-C or SIGTERM.
pub async fn serve(addr: SocketAddr, app: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {}", addr))?;
    info!("OCR service listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;
    info!("Server shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown..."),
    }
}

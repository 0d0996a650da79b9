#![cfg(feature = "web-api")]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use deck_core::{CoreError, Deck, ExecPrefs, JobDescriptor, Reply};
use crate::module::{Module, ModuleCtx};

#[derive(Clone)]
struct AppState {
    deck: Arc<Deck>,
    started: Instant,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Status {
    running: Vec<String>,
    scheduled: usize,
    uptime_ms: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobView {
    #[serde(flatten)]
    job: JobDescriptor,
    running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_fire: Option<String>,
}

/// Saved job plus a warning when its schedule did not parse.
#[derive(Serialize)]
struct SavedView {
    #[serde(flatten)]
    job: JobDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

/// One listener the control plane serves on.
enum Listener {
    Http(SocketAddr),
    Https { addr: SocketAddr, cert: String, key: String },
}

pub struct WebServer {
    pub http_addr: Option<SocketAddr>,
    pub https_addr: Option<SocketAddr>,
    pub tls_cert_pem: Option<String>,
    pub tls_key_pem: Option<String>,
}

impl WebServer {
    pub fn new(http: Option<SocketAddr>, https: Option<SocketAddr>, cert: Option<String>, key: Option<String>) -> Self {
        Self { http_addr: http, https_addr: https, tls_cert_pem: cert, tls_key_pem: key }
    }

    fn listeners(&self) -> Vec<Listener> {
        let mut out = Vec::new();
        if let Some(addr) = self.http_addr {
            out.push(Listener::Http(addr));
        }
        if let Some(addr) = self.https_addr {
            match (&self.tls_cert_pem, &self.tls_key_pem) {
                (Some(cert), Some(key)) => out.push(Listener::Https { addr, cert: cert.clone(), key: key.clone() }),
                _ => warn!("https on {addr} needs --cert and --key; not listening"),
            }
        }
        out
    }
}

impl Module for WebServer {
    fn name(&self) -> &'static str { "web" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let app = router(AppState { deck: ctx.deck.clone(), started: Instant::now() });
            let servers: Vec<_> = self
                .listeners()
                .into_iter()
                .map(|l| tokio::spawn(listen(l, app.clone(), ctx.shutdown.clone())))
                .collect();

            let _ = ctx.shutdown.clone().changed().await;
            for s in servers {
                s.await??;
            }
            Ok(())
        })
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/running", get(running))
        .route("/prefs", get(prefs_get).put(prefs_put))
        .route("/jobs", get(jobs_list).post(jobs_save))
        .route("/jobs/:id", get(jobs_get).delete(jobs_delete))
        .route("/jobs/:id/run", post(jobs_run))
        .route("/jobs/:id/stop", post(jobs_stop))
        .with_state(state)
}

/// Serve `app` on one listener until shutdown flips.
async fn listen(listener: Listener, app: Router, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    match listener {
        Listener::Http(addr) => {
            let tcp = tokio::net::TcpListener::bind(addr).await?;
            info!("web http listening on http://{addr}");
            tokio::select! {
                r = axum::serve(tcp, app) => r?,
                _ = shutdown.changed() => {}
            }
        }
        Listener::Https { addr, cert, key } => {
            let config = RustlsConfig::from_pem_file(cert, key).await?;
            info!("web https listening on https://{addr}");
            tokio::select! {
                r = axum_server::bind_rustls(addr, config).serve(app.into_make_service()) => r?,
                _ = shutdown.changed() => {}
            }
        }
    }
    Ok(())
}

fn error_response(e: &CoreError) -> Response {
    let code = match e {
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::NotRunning(_) | CoreError::AlreadyRunning(_) => StatusCode::CONFLICT,
        CoreError::InvalidJobConfiguration(_)
        | CoreError::UnsupportedFileType(_)
        | CoreError::InvalidSchedule { .. } => StatusCode::BAD_REQUEST,
        CoreError::SpawnFailure(_) | CoreError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, Json(Reply::err(e))).into_response()
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_ms = state.started.elapsed().as_millis() as u64;
    Json(Status {
        running: state.deck.list_running(),
        scheduled: state.deck.scheduled_count(),
        uptime_ms,
    })
}

async fn running(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.deck.list_running())
}

async fn prefs_get(State(state): State<AppState>) -> Response {
    match state.deck.exec_prefs() {
        Ok(p) => Json(p).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn prefs_put(State(state): State<AppState>, Json(prefs): Json<ExecPrefs>) -> Response {
    match state.deck.save_exec_prefs(&prefs) {
        Ok(()) => Json(Reply::ok(None)).into_response(),
        Err(e) => error_response(&e),
    }
}

fn view(deck: &Deck, job: JobDescriptor) -> JobView {
    JobView {
        running: deck.list_running().contains(&job.id),
        next_fire: deck.next_fire(&job.id).map(|t| t.to_rfc3339()),
        job,
    }
}

async fn jobs_list(State(state): State<AppState>) -> Response {
    match state.deck.list_jobs() {
        Ok(jobs) => {
            let out: Vec<JobView> = jobs.into_iter().map(|j| view(&state.deck, j)).collect();
            Json(out).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn jobs_get(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.deck.get_job(&id) {
        Ok(job) => Json(view(&state.deck, job)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn jobs_save(State(state): State<AppState>, Json(job): Json<JobDescriptor>) -> Response {
    match state.deck.save_job(job) {
        Ok(saved) => {
            let body = SavedView { warning: saved.schedule_error.map(|e| e.to_string()), job: saved.job };
            (StatusCode::CREATED, Json(body)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn jobs_delete(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.deck.delete_job(&id) {
        Ok(()) => Json(Reply::ok(None)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn jobs_run(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.deck.get_job(&id) {
        Ok(job) => Json(state.deck.execute(&job).await).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn jobs_stop(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.deck.stop(&id) {
        Ok(()) => Json(Reply::ok(Some("stopping".to_string()))).into_response(),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_needs_both_pem_files() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let only_cert = WebServer::new(Some(addr), Some(addr), Some("cert.pem".into()), None);
        let ls = only_cert.listeners();
        assert_eq!(ls.len(), 1);
        assert!(matches!(ls[0], Listener::Http(_)));

        let full = WebServer::new(None, Some(addr), Some("cert.pem".into()), Some("key.pem".into()));
        assert!(matches!(full.listeners().as_slice(), [Listener::Https { .. }]));
    }
}

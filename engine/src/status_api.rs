// --- Loopback diagnostics API ---------------------------------------------
//
// Read-only view for a technician on the box (curl 127.0.0.1:3000/...).
// Binds loopback by default; AUDIO_PLAYER_BIND=off disables it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sysinfo::System;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::model::Snapshot;

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub sys: Arc<tokio::sync::Mutex<System>>,
    pub snapshots: watch::Receiver<Arc<Snapshot>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemSummary {
    pub hostname: Option<String>,
    pub arch: String,
    pub cpu_usage: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub load_1m: f32,
    pub temp_c: Option<f32>,
    pub uptime_secs: u64,
}

/// Expects the caller to have refreshed CPU and memory.
pub fn system_summary(sys: &System) -> SystemSummary {
    SystemSummary {
        hostname: System::host_name(),
        arch: std::env::consts::ARCH.to_string(),
        cpu_usage: sys.global_cpu_usage(),
        memory_used_mb: sys.used_memory() / (1024 * 1024),
        memory_total_mb: sys.total_memory() / (1024 * 1024),
        load_1m: System::load_average().one as f32,
        temp_c: read_temp_c(),
        uptime_secs: System::uptime(),
    }
}

pub fn read_temp_c() -> Option<f32> {
    let paths = [
        "/sys/class/thermal/thermal_zone0/temp",
        "/sys/class/hwmon/hwmon0/temp1_input",
    ];
    for p in paths {
        if let Ok(s) = std::fs::read_to_string(p) {
            if let Ok(v) = s.trim().parse::<f32>() {
                // millidegrees on most kernels
                return Some(if v > 1000.0 { v / 1000.0 } else { v });
            }
        }
    }
    None
}

#[derive(Serialize)]
struct SystemInfo {
    name: String,
    version: String,
    cpu_model: String,
    cpu_cores: usize,
    #[serde(flatten)]
    summary: SystemSummary,
}

async fn status(State(st): State<AppState>) -> Json<Snapshot> {
    let snap = st.snapshots.borrow().clone();
    Json((*snap).clone())
}

async fn system_info(State(st): State<AppState>) -> Json<SystemInfo> {
    let mut sys = st.sys.lock().await;
    sys.refresh_cpu_all();
    sys.refresh_memory();

    let cpu_model = sys
        .cpus()
        .first()
        .map(|c| c.brand().to_string())
        .unwrap_or_else(|| "Unknown CPU".to_string());

    Json(SystemInfo {
        name: "Audio Player".to_string(),
        version: st.version.clone(),
        cpu_model,
        cpu_cores: sys.cpus().len(),
        summary: system_summary(&sys),
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/status", get(status))
        .route("/api/v1/system/info", get(system_info))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `None` when the endpoint is disabled.
pub fn bind_addr_from_env() -> anyhow::Result<Option<SocketAddr>> {
    let raw = std::env::var("AUDIO_PLAYER_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    if raw.trim().eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    Ok(Some(raw.trim().parse()?))
}

/// Serves until `shutdown`. Bind failures are logged, never fatal.
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!("status API disabled, cannot bind {addr}: {e}");
            return;
        }
    };
    tracing::info!("status API listening on http://{addr}");

    let app = build_router(state);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::warn!("status API stopped: {e}");
    }
}

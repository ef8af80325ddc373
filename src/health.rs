//! `/health` and `/metrics` handlers.
//!
//! The health document reports overall status, per-subsystem checks with raw
//! numbers, and the observability block (disconnects by reason, dropped
//! broadcasts by channel, send-buffer saturation percentiles, uptime).
//! HTTP 200 for healthy/degraded, 503 for unhealthy.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::balancer::AppState;
use crate::stats::StatsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct KafkaCheck {
    pub healthy: bool,
    pub connected: bool,
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct GaugeCheck {
    pub healthy: bool,
    pub current: f64,
    pub limit: f64,
    pub percentage: f64,
}

#[derive(Debug, Serialize)]
pub struct CapacityCheck {
    pub healthy: bool,
    pub current: usize,
    pub max: usize,
    pub percentage: f64,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub kafka: KafkaCheck,
    pub cpu: GaugeCheck,
    pub memory: GaugeCheck,
    pub tasks: GaugeCheck,
    pub capacity: CapacityCheck,
}

#[derive(Debug, Serialize)]
pub struct HealthDocument {
    pub status: HealthStatus,
    pub checks: HealthChecks,
    pub observability: StatsSnapshot,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alerts: Vec<String>,
}

fn percentage(current: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        0.0
    } else {
        current / limit * 100.0
    }
}

/// Build the health document from live state.
pub fn build_health(state: &AppState) -> HealthDocument {
    let resources = state.guard.snapshot();
    let limits = state.guard.limits();
    let active = state.total_active();
    let observability = state.stats.snapshot();

    let kafka = match &state.consumer_status {
        Some(status) => {
            let connected = status.is_connected() || status.recently_active();
            KafkaCheck {
                healthy: connected,
                connected,
                enabled: true,
            }
        }
        None => KafkaCheck {
            healthy: true,
            connected: false,
            enabled: false,
        },
    };

    let cpu = GaugeCheck {
        healthy: resources.cpu_percent <= limits.cpu_reject_threshold,
        current: resources.cpu_percent,
        limit: limits.cpu_reject_threshold,
        percentage: percentage(resources.cpu_percent, limits.cpu_reject_threshold),
    };
    let memory = GaugeCheck {
        healthy: resources.memory_bytes <= limits.max_memory_bytes,
        current: resources.memory_bytes as f64,
        limit: limits.max_memory_bytes as f64,
        percentage: percentage(resources.memory_bytes as f64, limits.max_memory_bytes as f64),
    };
    let tasks = GaugeCheck {
        healthy: resources.tasks <= limits.max_tasks,
        current: resources.tasks as f64,
        limit: limits.max_tasks as f64,
        percentage: percentage(resources.tasks as f64, limits.max_tasks as f64),
    };
    // Full capacity is not unhealthy: admission rejects cleanly at the edge.
    let capacity = CapacityCheck {
        healthy: active <= limits.max_connections,
        current: active,
        max: limits.max_connections,
        percentage: percentage(active as f64, limits.max_connections as f64),
    };

    let mut alerts = Vec::new();
    if observability.send_buffer_saturation.p95 > 0.8 {
        alerts.push(format!(
            "send buffer saturation p95 at {:.0}%, slow clients likely",
            observability.send_buffer_saturation.p95 * 100.0
        ));
    }
    if capacity.percentage >= 90.0 {
        alerts.push(format!(
            "connection capacity at {:.0}% ({}/{})",
            capacity.percentage, active, limits.max_connections
        ));
    }
    if observability.bus_publish_drops > 0 {
        alerts.push(format!(
            "{} bus publishes dropped since boot (system-wide overload signal)",
            observability.bus_publish_drops
        ));
    }
    if observability.serialization_errors > 0 {
        alerts.push(format!(
            "{} payloads skipped for serialization errors",
            observability.serialization_errors
        ));
    }

    let unhealthy = !cpu.healthy || !memory.healthy || !tasks.healthy || !kafka.healthy;
    let status = if unhealthy {
        HealthStatus::Unhealthy
    } else if !alerts.is_empty() {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    HealthDocument {
        status,
        checks: HealthChecks {
            kafka,
            cpu,
            memory,
            tasks,
            capacity,
        },
        observability,
        alerts,
    }
}

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let document = build_health(&state);
    let code = match document.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(document))
}

pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        ),
    }
}

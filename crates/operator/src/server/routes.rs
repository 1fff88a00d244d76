use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use futures::TryStreamExt;
use http::{header, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use super::Server;
use crate::{
    client::CreateJobRequest,
    crd::{Condition, ConditionType, TrainingJob},
    metrics, Error, Result,
};

const DEFAULT_WAIT_SECS: u64 = 300;
const DEFAULT_POLL_MS: u64 = 1000;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) | Error::Conflict(_) | Error::JobFailed { .. } => StatusCode::CONFLICT,
            Error::InvalidSpec(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn metrics() -> Result<String> {
    metrics::gather_metrics()
}

pub async fn create_job(
    State(server): State<Arc<Server>>,
    Path(namespace): Path<String>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<TrainingJob>)> {
    info!("Received job submission {}/{}", namespace, request.name);
    let job = server.client.namespaced(namespace).create(request).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list_jobs(
    State(server): State<Arc<Server>>,
    Path(namespace): Path<String>,
) -> Result<Json<Vec<TrainingJob>>> {
    let store = server
        .store
        .as_ref()
        .ok_or_else(|| Error::Unavailable("job listing needs the watch cache".to_string()))?;
    if !store.is_ready() {
        return Err(Error::Unavailable("watch cache not synced yet".to_string()));
    }
    let jobs = store
        .list(Some(&namespace))
        .into_iter()
        .map(|job| job.as_ref().clone())
        .collect();
    Ok(Json(jobs))
}

pub async fn get_job(
    State(server): State<Arc<Server>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<TrainingJob>> {
    Ok(Json(server.client.namespaced(namespace).get(&name).await?))
}

pub async fn delete_job(
    State(server): State<Arc<Server>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<StatusCode> {
    server.client.namespaced(namespace).delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_conditions(
    State(server): State<Arc<Server>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Vec<Condition>>> {
    Ok(Json(server.client.namespaced(namespace).get_conditions(&name).await?))
}

pub async fn list_pods(
    State(server): State<Arc<Server>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Vec<String>>> {
    Ok(Json(server.client.namespaced(namespace).list_pod_names(&name).await?))
}

#[derive(Debug, Deserialize)]
pub struct WaitParams {
    /// Comma separated condition types
    pub conditions: Option<String>,
    pub timeout_secs: Option<u64>,
    pub poll_ms: Option<u64>,
}

fn parse_conditions(raw: Option<&str>) -> Result<Vec<ConditionType>> {
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return Ok(vec![ConditionType::Succeeded]);
    };
    raw.split(',')
        .map(|s| ConditionType::from_str(s).map_err(Error::InvalidSpec))
        .collect()
}

pub async fn wait_for_job(
    State(server): State<Arc<Server>>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<WaitParams>,
) -> Result<Json<TrainingJob>> {
    let expected = parse_conditions(params.conditions.as_deref())?;
    let job = server
        .client
        .namespaced(namespace)
        .wait_for_conditions(
            &name,
            &expected,
            Duration::from_secs(params.timeout_secs.unwrap_or(DEFAULT_WAIT_SECS)),
            Duration::from_millis(params.poll_ms.unwrap_or(DEFAULT_POLL_MS)),
        )
        .await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
pub struct LogParams {
    #[serde(default)]
    pub follow: bool,
}

pub async fn stream_logs(
    State(server): State<Arc<Server>>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<LogParams>,
) -> Result<Response> {
    let lines = server
        .client
        .namespaced(namespace)
        .stream_logs(&name, params.follow)
        .await?
        .map_ok(|l| format!("{}: {}\n", l.pod, l.line));

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(lines),
    )
        .into_response())
}

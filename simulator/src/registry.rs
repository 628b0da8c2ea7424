use crate::telemetry::{SimDevice, SimReading};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

const MAX_PAGE_SIZE: usize = 100;

#[derive(Default)]
pub struct Registry {
    pub devices: Vec<SimDevice>,
    pub readings: HashMap<String, Vec<SimReading>>,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RwLock<Registry>>,
    pub tag: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    auth: Option<String>,
    limit: Option<usize>,
    retrieve_after: Option<String>,
    sort_direction: Option<String>,
    filter: Option<String>,
}

#[derive(Serialize)]
struct Envelope<T> {
    status: u16,
    body: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    retrieve_after_id: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/tags/:tag/devices", get(list_tagged_devices))
        .route("/api/v1/devices/:id", get(get_device))
        .route("/api/v1/devices/:id/readings", get(list_readings))
        .with_state(state)
}

async fn list_devices(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    authorize(&state, &query)?;
    let devices = read(&state)?.devices.clone();
    Ok(page(devices, &query, |d| &d.id))
}

async fn list_tagged_devices(
    State(state): State<AppState>,
    Path(tag): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    authorize(&state, &query)?;
    if tag != state.tag {
        return Err(ApiError::NotFound(format!("tag {}", tag)));
    }
    let devices = read(&state)?.devices.clone();
    Ok(page(devices, &query, |d| &d.id))
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    authorize(&state, &query)?;
    let device = read(&state)?
        .devices
        .iter()
        .find(|d| d.id == id)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("device {}", id)))?;
    Ok(Json(Envelope {
        status: 200,
        body: device,
        retrieve_after_id: None,
    })
    .into_response())
}

async fn list_readings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    authorize(&state, &query)?;
    let mut readings = {
        let registry = read(&state)?;
        if !registry.devices.iter().any(|d| d.id == id) {
            return Err(ApiError::NotFound(format!("device {}", id)));
        }
        registry.readings.get(&id).cloned().unwrap_or_default()
    };

    let required = required_channels(query.filter.as_deref());
    readings.retain(|r| required.iter().all(|c| r.data.channel(c).is_some()));
    if query.sort_direction.as_deref() == Some("asc") {
        readings.reverse();
    }

    debug!("Serving {} readings of device {}", readings.len(), id);
    Ok(page(readings, &query, |r| &r.id))
}

fn authorize(state: &AppState, query: &ListQuery) -> Result<(), ApiError> {
    match &state.api_key {
        Some(key) if query.auth.as_deref() != Some(key.as_str()) => Err(ApiError::Unauthorized),
        _ => Ok(()),
    }
}

fn read(state: &AppState) -> Result<std::sync::RwLockReadGuard<'_, Registry>, ApiError> {
    state
        .registry
        .read()
        .map_err(|_| ApiError::Internal("registry lock poisoned".to_string()))
}

/// Cuts one page after the `retrieve_after` cursor
fn page<T: Serialize>(items: Vec<T>, query: &ListQuery, id: impl Fn(&T) -> &String) -> Response {
    let limit = query.limit.unwrap_or(MAX_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let start = match &query.retrieve_after {
        Some(after) => items
            .iter()
            .position(|item| id(item) == after)
            .map(|i| i + 1)
            .unwrap_or(items.len()),
        None => 0,
    };

    let body: Vec<T> = items.into_iter().skip(start).take(limit).collect();
    let retrieve_after_id = if body.len() == limit {
        body.last().map(|item| id(item).clone())
    } else {
        None
    };

    Json(Envelope {
        status: 200,
        body,
        retrieve_after_id,
    })
    .into_response()
}

/// Channels named in a `data.<channel>!=null&&...` filter
fn required_channels(filter: Option<&str>) -> Vec<String> {
    let Some(filter) = filter else {
        return Vec::new();
    };
    filter
        .split("&&")
        .filter_map(|term| {
            let channel = term.trim().strip_prefix("data.")?.strip_suffix("!=null")?;
            Some(channel.to_string())
        })
        .collect()
}

pub enum ApiError {
    Unauthorized,
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid api key".to_string()),
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
            ApiError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e),
        };
        warn!("Request rejected with {}: {}", status, message);
        (status, Json(json!({ "status": status.as_u16(), "error": message }))).into_response()
    }
}

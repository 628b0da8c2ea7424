use crate::aggregate::StatisticsAggregator;
use crate::errors::Error;
use crate::model::{
    BatchSummary, Device, DeviceFilter, DeviceStatus, InitiationSummary, ReadingsResponse,
    RecomputeSummary, ReconcileSummary, StatisticsSnapshot,
};
use crate::store::Store;
use crate::sync::SyncOrchestrator;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

const DEFAULT_READINGS_LIMIT: usize = 30;
const MAX_READINGS_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub orchestrator: SyncOrchestrator,
    pub aggregator: StatisticsAggregator,
}

#[derive(Debug, Deserialize)]
pub struct DevicesQuery {
    status: Option<DeviceStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    limit: Option<usize>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:id", get(get_device))
        .route("/api/v1/devices/:id/register", post(register_device))
        .route("/api/v1/devices/:id/readings", get(list_readings))
        .route("/api/v1/devices/:id/readings/initiate", post(initiate_readings))
        .route("/api/v1/devices/:id/statistics", get(list_statistics))
        .route("/api/v1/devices/:id/statistics/recompute", post(recompute_statistics))
        .route("/api/v1/sync/devices", post(reconcile_devices))
        .route("/api/v1/sync/readings", post(initiate_pending))
        .route("/api/v1/sync/statistics", post(recompute_all))
        .with_state(state)
}

async fn list_devices(
    State(state): State<AppState>,
    Query(params): Query<DevicesQuery>,
) -> Result<Json<Vec<Device>>, AppError> {
    let filter = DeviceFilter {
        ids: None,
        status: params.status,
    };
    Ok(Json(state.store.find_devices(&filter).await?))
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Device>, AppError> {
    state
        .store
        .get_device(&id)
        .await?
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("No device found with id {}", id)).into())
}

async fn list_readings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_READINGS_LIMIT)
        .clamp(1, MAX_READINGS_LIMIT);

    if state.store.get_device(&id).await?.is_none() {
        return Err(Error::NotFound(format!("No device found with id {}", id)).into());
    }

    let data = state.store.find_readings(&id, Some(limit)).await?;
    Ok(Json(ReadingsResponse {
        device_id: id,
        total: data.len(),
        data,
        limit,
    }))
}

async fn list_statistics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<StatisticsSnapshot>>, AppError> {
    Ok(Json(state.store.find_statistics(&id).await?))
}

async fn reconcile_devices(
    State(state): State<AppState>,
) -> Result<Json<ReconcileSummary>, AppError> {
    Ok(Json(state.orchestrator.reconcile_devices().await?))
}

async fn register_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Device>), AppError> {
    let device = state.orchestrator.register_device(&id).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn initiate_readings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<InitiationSummary>), AppError> {
    let summary = state.orchestrator.initiate_readings(&id).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn initiate_pending(State(state): State<AppState>) -> Result<Json<BatchSummary>, AppError> {
    Ok(Json(state.orchestrator.initiate_pending().await?))
}

async fn recompute_statistics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RecomputeSummary>, AppError> {
    Ok(Json(state.aggregator.recompute(&id).await?))
}

async fn recompute_all(State(state): State<AppState>) -> Result<Json<BatchSummary>, AppError> {
    Ok(Json(state.aggregator.recompute_all().await?))
}

pub struct AppError(Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) | Error::NoData(_) => StatusCode::NOT_FOUND,
            Error::PreconditionFailed(_) => StatusCode::CONFLICT,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            e if e.is_upstream() => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API error: {}", self.0);
        } else {
            warn!("API request rejected: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Reading, ReadingFilter, SortOrder};
    use crate::source::{ExternalDeviceSource, ExternalReadingSource};
    use crate::store::MemoryStore;
    use crate::sync::SyncOptions;
    use async_trait::async_trait;
    use chrono::Utc;

    struct Offline;

    #[async_trait]
    impl ExternalDeviceSource for Offline {
        async fn list_devices(&self, _tag: Option<&str>) -> crate::errors::Result<Vec<Device>> {
            Err(Error::UpstreamUnavailable("offline".to_string()))
        }

        async fn get_device(&self, id: &str) -> crate::errors::Result<Device> {
            Err(Error::NotFound(id.to_string()))
        }
    }

    #[async_trait]
    impl ExternalReadingSource for Offline {
        async fn list_readings(
            &self,
            _device_id: &str,
            _filter: &ReadingFilter,
            _order: SortOrder,
        ) -> crate::errors::Result<Vec<Reading>> {
            Err(Error::UpstreamUnavailable("offline".to_string()))
        }
    }

    fn state(devices: Vec<Device>) -> AppState {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::with_devices(devices));
        let registry = Arc::new(Offline);
        AppState {
            orchestrator: SyncOrchestrator::new(
                registry.clone(),
                registry,
                store.clone(),
                SyncOptions::default(),
            ),
            aggregator: StatisticsAggregator::new(store.clone(), Vec::new()),
            store,
        }
    }

    #[tokio::test]
    async fn test_get_single_device() {
        let device = Device {
            id: "dev-1".to_string(),
            name: "Tank".to_string(),
            slug: "tank".to_string(),
            status: DeviceStatus::Active,
            last_seen: None,
            updated_at: Utc::now(),
            local_updated_at: None,
        };
        let state = state(vec![device.clone()]);

        let Json(found) = get_device(State(state.clone()), Path("dev-1".to_string()))
            .await
            .unwrap_or_else(|_| panic!("device should be found"));
        assert_eq!(found, device);

        let missing = get_device(State(state), Path("ghost".to_string())).await;
        assert!(matches!(missing, Err(AppError(Error::NotFound(_)))));
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::NotFound("d".into()), StatusCode::NOT_FOUND),
            (Error::NoData("d".into()), StatusCode::NOT_FOUND),
            (Error::PreconditionFailed("d".into()), StatusCode::CONFLICT),
            (Error::InvalidInput("d".into()), StatusCode::BAD_REQUEST),
            (Error::UpstreamUnavailable("d".into()), StatusCode::BAD_GATEWAY),
            (Error::RegistryRejected("d".into()), StatusCode::BAD_GATEWAY),
            (Error::Config("d".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError(err).status(), expected);
        }
    }
}

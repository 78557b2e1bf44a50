use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::error::TmsError;
use crate::htm::TrixelId;
use crate::schema::{LevelChange, Measurement, MeasurementType, UniqueSensorId};

/// Declared properties of one sensor within the submitting station.
#[derive(Debug, Deserialize)]
pub struct SensorDeclaration {
    pub measurement_type: MeasurementType,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct BatchUpdateRequest {
    pub k_requirement: u32,
    /// Sensor index -> declaration; every referenced sensor must appear here.
    pub sensors: HashMap<u32, SensorDeclaration>,
    /// Target trixel -> measurements taken by this station's sensors.
    pub updates: HashMap<TrixelId, Vec<Measurement>>,
}

#[derive(Debug, Serialize)]
pub struct BatchUpdateResponse {
    /// Sensors that should renegotiate their target trixel level.
    pub level_changes: HashMap<u32, LevelChange>,
    /// Trixels in the request this TMS is not responsible for.
    pub wrong_tms: Vec<TrixelId>,
}

/// Ingest a station's batch of measurements: register sensors, persist the
/// raw rows, and route everything through the privacy manager.
pub async fn batch_update(
    State(state): State<AppState>,
    Path(ms_uuid): Path<Uuid>,
    Json(request): Json<BatchUpdateRequest>,
) -> Result<impl IntoResponse, TmsError> {
    if request.k_requirement == 0 {
        return Err(TmsError::InvalidInput("k_requirement must be positive".into()));
    }

    for (&sensor_id, declaration) in &request.sensors {
        state.store.upsert_sensor(
            UniqueSensorId { ms_uuid, sensor_id },
            declaration.measurement_type,
            declaration.accuracy,
        )?;
    }

    // Trixels outside our delegations are reported back without persisting or
    // routing anything for them.
    let mut wrong_tms = Vec::new();
    let mut delegated: HashMap<TrixelId, Vec<Measurement>> = HashMap::new();
    for (&trixel_id, measurements) in &request.updates {
        if state.manager.is_delegated(trixel_id) {
            delegated.insert(trixel_id, measurements.clone());
        } else {
            wrong_tms.push(trixel_id);
        }
    }

    // Raw rows go in first; a duplicate (sensor, timestamp) is a client error
    // surfaced by the store's unique constraint.
    for measurements in delegated.values() {
        for measurement in measurements {
            if !request.sensors.contains_key(&measurement.sensor_id) {
                return Err(TmsError::InvalidInput(format!(
                    "measurement references undeclared sensor {}",
                    measurement.sensor_id
                )));
            }
            state.store.insert_measurement(ms_uuid, measurement)?;
        }
    }

    let sensor_types: HashMap<u32, MeasurementType> = request
        .sensors
        .iter()
        .map(|(&sensor_id, declaration)| (sensor_id, declaration.measurement_type))
        .collect();
    let outcome =
        state.manager.batch_contribute(ms_uuid, &delegated, &sensor_types, request.k_requirement)?;

    wrong_tms.extend(outcome.wrong_tms);
    Ok(Json(BatchUpdateResponse { level_changes: outcome.level_changes, wrong_tms }))
}

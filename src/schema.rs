use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::htm::TrixelId;

/// Measurement types supported by the system, with stable integer ids used in
/// the store and on the TLS wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementType {
    AmbientTemperature,
    RelativeHumidity,
}

impl MeasurementType {
    pub const ALL: [MeasurementType; 2] =
        [MeasurementType::AmbientTemperature, MeasurementType::RelativeHumidity];

    pub fn id(self) -> i64 {
        match self {
            MeasurementType::AmbientTemperature => 1,
            MeasurementType::RelativeHumidity => 2,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MeasurementType::AmbientTemperature => "ambient_temperature",
            MeasurementType::RelativeHumidity => "relative_humidity",
        }
    }
}

impl fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sensor identified across the whole system: the owning station plus the
/// sensor index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueSensorId {
    pub ms_uuid: Uuid,
    pub sensor_id: u32,
}

impl fmt::Display for UniqueSensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ms_uuid, self.sensor_id)
    }
}

/// A single reading reported by a sensor. `value = None` means the sensor is
/// alive but the reading is unavailable. Timestamps travel as unix time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    pub sensor_id: u32,
    pub value: Option<f64>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

/// Level-change recommendation returned to a contributing client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelChange {
    Keep,
    Increase,
    Decrease,
}

/// Output state of a privatizer after one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrixelUpdate {
    pub changed: bool,
    pub value: Option<f64>,
    pub measurement_station_count: u32,
    pub sensor_count: u32,
}

/// A persisted per-tick observation for one trixel and measurement type.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub time: DateTime<Utc>,
    pub trixel_id: TrixelId,
    pub measurement_type: MeasurementType,
    pub value: Option<f64>,
    pub measurement_station_count: u32,
    pub sensor_count: u32,
}

/// Why the correlation gate excluded a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    TooYoung,
    UnreliableUptime,
    InsignificantCorrelation,
    LowUpdateInterval,
}

/// Correlation-policy scratch state attached to a sensor lifecycle.
///
/// Statistic caches are keyed by window length in seconds and invalidated at
/// `window / cache_invalidation_factor`.
#[derive(Debug, Clone, Default)]
pub struct CorrelationLifecycle {
    pub exclusion_reason: Option<ExclusionReason>,

    pub average_update_interval: Option<Duration>,
    pub uptime: Option<f64>,
    pub last_uptime_update: Option<DateTime<Utc>>,

    pub age: Option<Duration>,
    pub age_last_update: Option<DateTime<Utc>>,

    pub sensor_statistic: HashMap<u64, Option<f64>>,
    pub sensor_statistic_last_update: HashMap<u64, DateTime<Utc>>,

    pub exponential_moving_average: Option<f64>,
}

/// Policy-specific lifecycle extension, constructed on first use.
#[derive(Debug, Clone, Default)]
pub enum LifecycleExt {
    #[default]
    None,
    Correlation(Box<CorrelationLifecycle>),
}

/// Per-sensor state that outlives privatizer reassignments. A sensor keeps its
/// lifecycle when it moves between trixels; it is dropped only when the sensor
/// itself is removed.
#[derive(Debug, Clone, Default)]
pub struct SensorLifecycle {
    pub contributing: bool,
    pub ext: LifecycleExt,
}

impl SensorLifecycle {
    /// Access the correlation extension, upgrading the lifecycle on first use.
    pub fn correlation_mut(&mut self) -> &mut CorrelationLifecycle {
        if !matches!(self.ext, LifecycleExt::Correlation(_)) {
            self.ext = LifecycleExt::Correlation(Box::default());
        }
        match &mut self.ext {
            LifecycleExt::Correlation(state) => state,
            LifecycleExt::None => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_type_ids_are_stable() {
        assert_eq!(MeasurementType::AmbientTemperature.id(), 1);
        assert_eq!(MeasurementType::RelativeHumidity.id(), 2);
        for t in MeasurementType::ALL {
            assert_eq!(MeasurementType::from_id(t.id()), Some(t));
        }
        assert_eq!(MeasurementType::from_id(0), None);
    }

    #[test]
    fn test_lifecycle_upgrades_once() {
        let mut lifecycle = SensorLifecycle::default();
        assert!(matches!(lifecycle.ext, LifecycleExt::None));
        lifecycle.correlation_mut().uptime = Some(0.5);
        lifecycle.correlation_mut().age = Some(Duration::days(2));
        let state = lifecycle.correlation_mut();
        assert_eq!(state.uptime, Some(0.5));
        assert_eq!(state.age, Some(Duration::days(2)));
    }
}

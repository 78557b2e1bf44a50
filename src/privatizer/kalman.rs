//! Kalman-filter aggregation: every non-shadow measurement and every child
//! trixel value is folded into a two-state filter (value and bias) with
//! per-source measurement noise derived from the reported accuracy.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::config::NaiveKalmanConfig;
use crate::schema::{Measurement, MeasurementType, UniqueSensorId};
use crate::store::Store;

use super::average::stale_scan;
use super::{CoreView, TickContext};

/// Two-state Kalman filter with identity transition and `H = [1, 0]`.
pub struct Kalman2 {
    x: [f64; 2],
    p: [[f64; 2]; 2],
    q: [[f64; 2]; 2],
}

impl Kalman2 {
    /// `process_std` is the process noise standard deviation per time step
    /// `dt`; the process covariance uses the discrete white noise model.
    pub fn new(dt: f64, process_std: f64) -> Self {
        let var = process_std * process_std;
        Self {
            x: [1.0, 0.0],
            p: [[1000.0, 0.0], [0.0, 1000.0]],
            q: [
                [0.25 * dt.powi(4) * var, 0.5 * dt.powi(3) * var],
                [0.5 * dt.powi(3) * var, dt.powi(2) * var],
            ],
        }
    }

    /// With `F = I` the prediction only grows the covariance.
    pub fn predict(&mut self) {
        for i in 0..2 {
            for j in 0..2 {
                self.p[i][j] += self.q[i][j];
            }
        }
    }

    /// Fold in one measurement `z` with measurement noise `r`.
    pub fn update(&mut self, z: f64, r: f64) {
        let s = self.p[0][0] + r;
        let k0 = self.p[0][0] / s;
        let k1 = self.p[1][0] / s;

        let residual = z - self.x[0];
        self.x[0] += k0 * residual;
        self.x[1] += k1 * residual;

        let p00 = self.p[0][0];
        let p01 = self.p[0][1];
        self.p = [
            [(1.0 - k0) * p00, (1.0 - k0) * p01],
            [self.p[1][0] - k1 * p00, self.p[1][1] - k1 * p01],
        ];
    }

    pub fn reset_covariance(&mut self, variance: f64) {
        self.p = [[variance, 0.0], [0.0, variance]];
    }

    pub fn value(&self) -> f64 {
        self.x[0]
    }
}

pub struct KalmanPolicy {
    config: NaiveKalmanConfig,
    measurement_type: MeasurementType,
    filter: Kalman2,
    last_measurement: HashMap<UniqueSensorId, Option<f64>>,
    last_timestamp: HashMap<UniqueSensorId, DateTime<Utc>>,
    update_interval: HashMap<UniqueSensorId, Duration>,
    sensor_accuracies: HashMap<UniqueSensorId, Option<f64>>,
    average_accuracy: Option<f64>,
}

impl KalmanPolicy {
    pub fn new(
        config: NaiveKalmanConfig,
        measurement_type: MeasurementType,
        tick_period_secs: u64,
    ) -> Self {
        let filter = Kalman2::new(tick_period_secs as f64, config.process_std_per_step);
        Self {
            config,
            measurement_type,
            filter,
            last_measurement: HashMap::new(),
            last_timestamp: HashMap::new(),
            update_interval: HashMap::new(),
            sensor_accuracies: HashMap::new(),
            average_accuracy: None,
        }
    }

    /// Mean accuracy of the contributors folded in during the last tick; used
    /// by the parent trixel as this child's pseudo-measurement noise.
    pub fn average_accuracy(&self) -> Option<f64> {
        self.average_accuracy
    }

    pub fn on_sensor_added(&mut self, sensor: UniqueSensorId, store: &Store) {
        let accuracy = match store.get_sensor_accuracy(sensor) {
            Ok(accuracy) => accuracy,
            Err(e) => {
                tracing::warn!("failed to look up accuracy for {sensor}: {e}");
                None
            }
        };
        self.sensor_accuracies.insert(sensor, accuracy);
    }

    pub fn on_sensor_removed(&mut self, sensor: UniqueSensorId) {
        self.last_measurement.remove(&sensor);
        self.last_timestamp.remove(&sensor);
        self.update_interval.remove(&sensor);
        self.sensor_accuracies.remove(&sensor);
    }

    pub fn new_value(&mut self, sensor: UniqueSensorId, measurement: &Measurement, now: DateTime<Utc>) {
        self.last_measurement.insert(sensor, measurement.value);
        let timestamp = measurement.timestamp;

        if now - timestamp > self.config.average.max_measurement_age() {
            self.last_timestamp.insert(sensor, timestamp);
            return;
        }

        if let Some(&previous) = self.last_timestamp.get(&sensor) {
            let interval = timestamp - previous;
            let weight = self.config.average.update_interval_weight;
            let smoothed = match self.update_interval.get(&sensor) {
                Some(&current) => Duration::milliseconds(
                    (current.num_milliseconds() as f64 * (1.0 - weight)
                        + interval.num_milliseconds() as f64 * weight) as i64,
                ),
                None => interval,
            };
            self.update_interval.insert(sensor, smoothed);
        }
        self.last_timestamp.insert(sensor, timestamp);
    }

    pub fn stale_sensors(&self, core: &CoreView<'_>, now: DateTime<Utc>) -> Vec<UniqueSensorId> {
        stale_scan(
            core,
            &self.last_measurement,
            &self.last_timestamp,
            &self.update_interval,
            &self.config.average,
            now,
        )
    }

    pub fn get_value(&mut self, core: &CoreView<'_>, ctx: &TickContext) -> Option<f64> {
        let max_age = self.config.average.max_measurement_age_averaging();
        let default_sensor_accuracy = self
            .config
            .default_sensor_accuracy
            .get(&self.measurement_type)
            .copied()
            .unwrap_or(1.0);
        let default_child_accuracy = self
            .config
            .default_child_trixel_accuracy
            .get(&self.measurement_type)
            .copied()
            .unwrap_or(0.1);

        let mut any_measurement = false;
        let mut accuracy_sum: Option<f64> = None;
        let mut contributor_count = 0u32;

        {
            let lifecycles = ctx.lifecycles.lock().unwrap();
            for sensor in core.sensors {
                if core.in_shadow(*sensor) {
                    continue;
                }
                match self.last_timestamp.get(sensor) {
                    Some(&t) if ctx.now - t <= max_age => {}
                    _ => continue,
                }
                if !lifecycles.get(sensor).map(|l| l.contributing).unwrap_or(false) {
                    continue;
                }
                let Some(Some(value)) = self.last_measurement.get(sensor).copied() else {
                    continue;
                };

                any_measurement = true;
                let accuracy = self
                    .sensor_accuracies
                    .get(sensor)
                    .copied()
                    .flatten()
                    .unwrap_or(default_sensor_accuracy);
                accuracy_sum = Some(accuracy_sum.unwrap_or(0.0) + accuracy);
                contributor_count += 1;

                self.filter.predict();
                self.filter.update(value, accuracy * accuracy);
            }
        }

        // Children contribute one pseudo-measurement each, weighted into the
        // average accuracy by their own contributor count.
        for child in &ctx.children {
            let Some(value) = child.value else { continue };
            any_measurement = true;
            let accuracy = child.average_accuracy.unwrap_or(default_child_accuracy);
            accuracy_sum =
                Some(accuracy_sum.unwrap_or(0.0) + accuracy * child.total_sensor_count as f64);
            contributor_count += child.total_sensor_count;

            self.filter.predict();
            self.filter.update(value, accuracy * accuracy);
        }

        self.average_accuracy = match (accuracy_sum, contributor_count) {
            (Some(sum), count) if count > 0 => Some(sum / count as f64),
            _ => None,
        };

        if !any_measurement {
            self.filter.reset_covariance(100.0);
            return None;
        }
        Some(self.filter.value())
    }
}

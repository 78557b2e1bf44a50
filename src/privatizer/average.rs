//! Averaging aggregation: pool the freshest value of every non-shadow
//! contributing sensor with the child trixel values, each child weighted by
//! its contributing sensor count. Optionally smooths the local and child sums
//! exponentially before pooling.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::config::NaiveAverageConfig;
use crate::schema::{Measurement, UniqueSensorId};

use super::{CoreView, TickContext};

/// Exponential filter over an aggregate sum. When the contributor count
/// changes, the previous sum is rescaled so the smoothed series stays
/// comparable across count changes.
///
/// Returns the updated `(last_value, last_count)` state and the output value.
pub fn exponential_filter(
    smooth_factor: f64,
    value: Option<f64>,
    last_value: Option<f64>,
    contributor_count: u32,
    last_contributor_count: Option<u32>,
) -> (Option<f64>, Option<u32>, Option<f64>) {
    if smooth_factor == 1.0 {
        return (last_value, last_contributor_count, value);
    }

    let Some(value) = value else {
        return (None, None, None);
    };
    let Some(last) = last_value else {
        return (Some(value), Some(contributor_count), Some(value));
    };

    let mut last = last;
    if let Some(last_count) = last_contributor_count {
        if contributor_count != last_count && last_count > 0 {
            last = last / last_count as f64 * contributor_count as f64;
        }
    }
    let smoothed = last * (1.0 - smooth_factor) + value * smooth_factor;
    (Some(smoothed), Some(contributor_count), Some(smoothed))
}

struct SumSmoothing {
    local_factor: f64,
    child_factor: f64,
    local_value: Option<f64>,
    local_count: Option<u32>,
    child_value: Option<f64>,
    child_count: Option<u32>,
}

pub struct AveragePolicy {
    config: NaiveAverageConfig,
    smoothing: Option<SumSmoothing>,
    last_measurement: HashMap<UniqueSensorId, Option<f64>>,
    last_timestamp: HashMap<UniqueSensorId, DateTime<Utc>>,
    update_interval: HashMap<UniqueSensorId, Duration>,
}

impl AveragePolicy {
    /// `smoothing` carries `(local_smooth_factor, child_smooth_factor)` for
    /// the smoothing variant, `None` for the plain average.
    pub fn new(config: NaiveAverageConfig, smoothing: Option<(f64, f64)>) -> Self {
        Self {
            config,
            smoothing: smoothing.map(|(local_factor, child_factor)| SumSmoothing {
                local_factor,
                child_factor,
                local_value: None,
                local_count: None,
                child_value: None,
                child_count: None,
            }),
            last_measurement: HashMap::new(),
            last_timestamp: HashMap::new(),
            update_interval: HashMap::new(),
        }
    }

    pub fn on_sensor_removed(&mut self, sensor: UniqueSensorId) {
        self.last_measurement.remove(&sensor);
        self.last_timestamp.remove(&sensor);
        self.update_interval.remove(&sensor);
    }

    /// Record the measurement and keep an exponentially smoothed estimate of
    /// the sensor's update interval.
    pub fn new_value(&mut self, sensor: UniqueSensorId, measurement: &Measurement, now: DateTime<Utc>) {
        self.last_measurement.insert(sensor, measurement.value);
        let timestamp = measurement.timestamp;

        // An outdated measurement only refreshes the timestamp, which lets the
        // stale scan pick the sensor up.
        if now - timestamp > self.config.max_measurement_age() {
            self.last_timestamp.insert(sensor, timestamp);
            return;
        }

        if let Some(&previous) = self.last_timestamp.get(&sensor) {
            let interval = timestamp - previous;
            let weight = self.config.update_interval_weight;
            let smoothed = match self.update_interval.get(&sensor) {
                Some(&current) => {
                    Duration::milliseconds(
                        (current.num_milliseconds() as f64 * (1.0 - weight)
                            + interval.num_milliseconds() as f64 * weight) as i64,
                    )
                }
                None => interval,
            };
            self.update_interval.insert(sensor, smoothed);
        }
        self.last_timestamp.insert(sensor, timestamp);
    }

    /// Sensors that missed too many updates, measured against their own
    /// smoothed update interval or the absolute age limit.
    pub fn stale_sensors(&self, core: &CoreView<'_>, now: DateTime<Utc>) -> Vec<UniqueSensorId> {
        stale_scan(
            core,
            &self.last_measurement,
            &self.last_timestamp,
            &self.update_interval,
            &self.config,
            now,
        )
    }

    pub fn get_value(&mut self, core: &CoreView<'_>, ctx: &TickContext) -> anyhow::Result<Option<f64>> {
        let max_age = self.config.max_measurement_age_averaging();

        let mut local_sum: Option<f64> = None;
        let mut local_count = 0u32;
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
                // Gated policies may have marked the sensor as non-contributing.
                if !lifecycles.get(sensor).map(|l| l.contributing).unwrap_or(false) {
                    continue;
                }
                if let Some(Some(value)) = self.last_measurement.get(sensor) {
                    local_sum = Some(local_sum.unwrap_or(0.0) + value);
                    local_count += 1;
                }
            }
        }

        let mut child_sum: Option<f64> = None;
        let mut child_count = 0u32;
        for child in &ctx.children {
            if let Some(value) = child.value {
                child_sum = Some(child_sum.unwrap_or(0.0) + value * child.total_sensor_count as f64);
                child_count += child.total_sensor_count;
            }
        }

        if local_sum.is_none() && child_sum.is_none() {
            return Ok(None);
        }

        if let Some(smoothing) = &mut self.smoothing {
            let (value, count, filtered) = exponential_filter(
                smoothing.local_factor,
                local_sum,
                smoothing.local_value,
                local_count,
                smoothing.local_count,
            );
            smoothing.local_value = value;
            smoothing.local_count = count;
            local_sum = filtered;

            let (value, count, filtered) = exponential_filter(
                smoothing.child_factor,
                child_sum,
                smoothing.child_value,
                child_count,
                smoothing.child_count,
            );
            smoothing.child_value = value;
            smoothing.child_count = count;
            child_sum = filtered;
        }

        let total_count = local_count + child_count;
        if total_count == 0 {
            return Ok(None);
        }
        let total = local_sum.unwrap_or(0.0) + child_sum.unwrap_or(0.0);
        Ok(Some(total / total_count as f64))
    }
}

/// Shared stale-sensor scan for the averaging and Kalman policies. A sensor is
/// stale once its silence exceeds either its own update interval or the
/// absolute measurement age limit, scaled by the missed-update threshold.
pub(super) fn stale_scan(
    core: &CoreView<'_>,
    last_measurement: &HashMap<UniqueSensorId, Option<f64>>,
    last_timestamp: &HashMap<UniqueSensorId, DateTime<Utc>>,
    update_interval: &HashMap<UniqueSensorId, Duration>,
    config: &NaiveAverageConfig,
    now: DateTime<Utc>,
) -> Vec<UniqueSensorId> {
    let mut stale = Vec::new();
    for sensor in core.sensors {
        if !last_measurement.contains_key(sensor) {
            continue;
        }
        let Some(&timestamp) = last_timestamp.get(sensor) else {
            continue;
        };
        let silence = now - timestamp;
        let by_interval = update_interval
            .get(sensor)
            .is_some_and(|&interval| silence > mul_duration(interval, config.missed_update_threshold));
        let by_age =
            silence > mul_duration(config.max_measurement_age(), config.missed_update_threshold);
        if by_interval || by_age {
            stale.push(*sensor);
        }
    }
    stale
}

fn mul_duration(duration: Duration, factor: f64) -> Duration {
    Duration::milliseconds((duration.num_milliseconds() as f64 * factor) as i64)
}

//! Sensor quality gate based on long-term statistics.
//!
//! A sensor may only contribute once it is old enough, has reliable uptime,
//! and its measurement statistic correlates with its surroundings: with the
//! other sensors of the same privatizer near the root (local check), or with
//! ancestor trixel observations deeper in the hierarchy (trixel check).
//! Aggregation itself is delegated to an inner policy; this gate additionally
//! blanks impulse noise on the way in.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::config::CorrelationConfig;
use crate::htm::TrixelId;
use crate::schema::{
    CorrelationLifecycle, ExclusionReason, Measurement, SensorLifecycle, UniqueSensorId,
};

use super::{Aggregator, AncestorRef, CoreView, TickContext};

enum Gate {
    Pass,
    Fail(ExclusionReason),
    /// Not enough data to judge; the sensor keeps its previous state.
    Unchanged,
}

pub struct CorrelationGate {
    config: CorrelationConfig,
    inner: Aggregator,

    // Caches keyed by window seconds (and ancestor id where applicable);
    // entries go stale after window / cache_invalidation_factor.
    local_statistic: HashMap<u64, Option<f64>>,
    local_statistic_updated: HashMap<u64, DateTime<Utc>>,
    ancestor_statistic: HashMap<(TrixelId, u64), (Option<f64>, DateTime<Utc>)>,
    parent_observation_count: HashMap<u64, (u64, DateTime<Utc>)>,
}

impl CorrelationGate {
    pub fn new(config: CorrelationConfig, inner: Aggregator) -> Self {
        Self {
            config,
            inner,
            local_statistic: HashMap::new(),
            local_statistic_updated: HashMap::new(),
            ancestor_statistic: HashMap::new(),
            parent_observation_count: HashMap::new(),
        }
    }

    pub fn inner(&self) -> &Aggregator {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut Aggregator {
        &mut self.inner
    }

    /// Blank single spikes against the sensor's exponential moving average
    /// before handing the measurement to the inner aggregator. The EMA itself
    /// still absorbs the spike.
    pub fn new_value(
        &mut self,
        core: &CoreView<'_>,
        sensor: UniqueSensorId,
        mut measurement: Measurement,
        lifecycles: &mut HashMap<UniqueSensorId, SensorLifecycle>,
        now: DateTime<Utc>,
    ) {
        let state = lifecycles.entry(sensor).or_default().correlation_mut();
        let mut outlier = false;
        match (state.exponential_moving_average, measurement.value) {
            (Some(ema), Some(value)) => {
                let threshold = self
                    .config
                    .impulse_noise_threshold
                    .get(&core.measurement_type)
                    .copied()
                    .unwrap_or(f64::INFINITY);
                if (value - ema).abs() > threshold {
                    outlier = true;
                }
                let alpha = self.config.ema_smoothing_factor;
                state.exponential_moving_average = Some(ema * (1.0 - alpha) + alpha * value);
            }
            (_, value) => state.exponential_moving_average = value,
        }
        if outlier {
            measurement.value = None;
        }
        self.inner.new_value(sensor, &measurement, now);
    }

    pub fn evaluate_sensor_quality(
        &mut self,
        core: &CoreView<'_>,
        sensor: UniqueSensorId,
        ctx: &TickContext,
    ) -> anyhow::Result<bool> {
        let mut lifecycles = ctx.lifecycles.lock().unwrap();
        let lifecycle = lifecycles.entry(sensor).or_default();

        match self.gate(core, sensor, ctx, lifecycle)? {
            Gate::Pass => {
                lifecycle.contributing = true;
                lifecycle.correlation_mut().exclusion_reason = None;
            }
            Gate::Fail(reason) => {
                lifecycle.contributing = false;
                lifecycle.correlation_mut().exclusion_reason = Some(reason);
                tracing::debug!(
                    "privatizer ({}, {}): excluded {sensor}: {reason:?}",
                    core.id,
                    core.measurement_type
                );
            }
            Gate::Unchanged => {}
        }
        Ok(lifecycle.contributing)
    }

    fn gate(
        &mut self,
        core: &CoreView<'_>,
        sensor: UniqueSensorId,
        ctx: &TickContext,
        lifecycle: &mut SensorLifecycle,
    ) -> anyhow::Result<Gate> {
        // Age: the sensor must have history within the longest check window.
        let age = {
            let state = lifecycle.correlation_mut();
            let refresh = state
                .age_last_update
                .is_none_or(|t| ctx.now - t > self.config.age_evaluation_interval());
            if refresh {
                state.age = ctx.store.get_sensor_age(sensor, self.config.max_window())?;
                state.age_last_update = Some(ctx.now);
            }
            state.age
        };
        if age.is_none_or(|a| a <= self.config.minimum_sensor_age()) {
            return Ok(Gate::Fail(ExclusionReason::TooYoung));
        }

        let (uptime, average_interval) = self.evaluate_uptime(sensor, ctx, lifecycle)?;
        if uptime <= self.config.uptime_requirement {
            return Ok(Gate::Fail(ExclusionReason::UnreliableUptime));
        }
        if average_interval.is_none_or(|i| i >= self.config.max_update_interval()) {
            return Ok(Gate::Fail(ExclusionReason::LowUpdateInterval));
        }

        if core.level < self.config.split_level {
            // Near the root, compare against the other local sensors. With too
            // small a population the comparison is meaningless; wait instead.
            if core.sensors.len() < self.config.local_check_minimum_sensor_count {
                return Ok(Gate::Unchanged);
            }
            let score = self.local_score(core, sensor, ctx, lifecycle)?;
            if score <= self.config.local_correlation_threshold {
                return Ok(Gate::Fail(ExclusionReason::InsignificantCorrelation));
            }
        } else {
            let score = self.trixel_score(core, sensor, ctx, lifecycle)?;
            if score <= self.config.trixel_correlation_threshold {
                return Ok(Gate::Fail(ExclusionReason::InsignificantCorrelation));
            }
        }

        Ok(Gate::Pass)
    }

    /// Bracketing uptime estimate over a base window and an extended window,
    /// cached on the lifecycle. Also yields the average update interval.
    fn evaluate_uptime(
        &self,
        sensor: UniqueSensorId,
        ctx: &TickContext,
        lifecycle: &mut SensorLifecycle,
    ) -> anyhow::Result<(f64, Option<Duration>)> {
        let state = lifecycle.correlation_mut();
        let fresh = state
            .last_uptime_update
            .is_some_and(|t| ctx.now - t <= self.config.uptime_evaluation_interval());
        if fresh {
            return Ok((state.uptime.unwrap_or(0.0), state.average_update_interval));
        }

        let base = self.config.uptime_base_window();
        let multiplier = self.config.uptime_long_time_multiplier;
        let (total, valid) = ctx.store.get_measurement_count(sensor, base)?;

        if valid == 0 {
            state.uptime = Some(0.0);
            state.average_update_interval = None;
            state.last_uptime_update = Some(ctx.now);
            return Ok((0.0, None));
        }

        let average_interval = base / valid as i32;
        let (long_total, long_valid) =
            ctx.store.get_measurement_count(sensor, base * multiplier as i32)?;
        let uptime = bracketed_uptime(total, valid, long_total, long_valid, multiplier);

        state.uptime = Some(uptime);
        state.average_update_interval = Some(average_interval);
        state.last_uptime_update = Some(ctx.now);
        Ok((uptime, Some(average_interval)))
    }

    /// Deviation of the sensor's statistic from all local sensors, scored per
    /// window; the final score is the worst window.
    fn local_score(
        &mut self,
        core: &CoreView<'_>,
        sensor: UniqueSensorId,
        ctx: &TickContext,
        lifecycle: &mut SensorLifecycle,
    ) -> anyhow::Result<f64> {
        let windows = self.config.local_windows.clone();
        let mut sub_scores = Vec::new();
        for window in &windows {
            let local = self.cached_local_statistic(core, ctx, window.window())?;
            let sensor_stat = cached_sensor_statistic(
                &self.config,
                lifecycle.correlation_mut(),
                ctx,
                sensor,
                window.window(),
            )?;
            let (Some(local), Some(sensor_stat)) = (local, sensor_stat) else {
                return Ok(0.0);
            };

            let delta = (local - sensor_stat).abs();
            let max_delta = window.max_delta(core.measurement_type);
            if max_delta > 0.0 && delta <= max_delta {
                sub_scores.push(1.0 - delta / max_delta);
            } else {
                return Ok(0.0);
            }
        }
        Ok(sub_scores.into_iter().fold(f64::INFINITY, f64::min).min(1.0))
    }

    /// Deviation of the sensor's statistic from ancestor trixel observations,
    /// skipping the immediate parent (the sensor usually contributes there
    /// itself). Tolerances widen toward the root.
    fn trixel_score(
        &mut self,
        core: &CoreView<'_>,
        sensor: UniqueSensorId,
        ctx: &TickContext,
        lifecycle: &mut SensorLifecycle,
    ) -> anyhow::Result<f64> {
        let windows = self.config.trixel_windows.clone();
        let generations = self.config.check_generations as usize;
        let mut sub_scores = Vec::new();

        for window in &windows {
            let sensor_stat = cached_sensor_statistic(
                &self.config,
                lifecycle.correlation_mut(),
                ctx,
                sensor,
                window.window(),
            )?;
            let Some(sensor_stat) = sensor_stat else {
                return Ok(0.0);
            };

            for (i, ancestor) in ctx.ancestors.iter().enumerate().take(generations + 2) {
                if i == 0 {
                    continue;
                }
                let Some(trixel_stat) = self.cached_ancestor_statistic(
                    core,
                    ctx,
                    *ancestor,
                    window.window(),
                )?
                else {
                    return Ok(0.0);
                };

                let mut max_delta = window.max_delta(core.measurement_type);
                if ancestor.level < self.config.split_level {
                    max_delta += (self.config.target_level as f64 - ancestor.level as f64)
                        * self.config.level_scale_factor
                        * max_delta;
                }

                let delta = (trixel_stat - sensor_stat).abs();
                if max_delta > 0.0 && delta <= max_delta {
                    sub_scores.push(1.0 - delta / max_delta);
                } else {
                    return Ok(0.0);
                }
            }
        }

        // No ancestor beyond the parent exists yet; cannot judge.
        if sub_scores.is_empty() {
            return Ok(0.0);
        }
        Ok(sub_scores.into_iter().fold(f64::INFINITY, f64::min).min(1.0))
    }

    fn cached_local_statistic(
        &mut self,
        core: &CoreView<'_>,
        ctx: &TickContext,
        window: Duration,
    ) -> anyhow::Result<Option<f64>> {
        let key = window.num_seconds() as u64;
        let fresh = self
            .local_statistic_updated
            .get(&key)
            .is_some_and(|&t| ctx.now - t <= self.config.cache_validity(window));
        if !fresh {
            let value =
                ctx.store.get_sensors_statistic(self.config.statistic, core.sensors, window)?;
            self.local_statistic.insert(key, value);
            self.local_statistic_updated.insert(key, ctx.now);
        }
        Ok(self.local_statistic.get(&key).copied().flatten())
    }

    fn cached_ancestor_statistic(
        &mut self,
        core: &CoreView<'_>,
        ctx: &TickContext,
        ancestor: AncestorRef,
        window: Duration,
    ) -> anyhow::Result<Option<f64>> {
        let key = (ancestor.trixel_id, window.num_seconds() as u64);
        let fresh = self
            .ancestor_statistic
            .get(&key)
            .is_some_and(|&(_, t)| ctx.now - t <= self.config.cache_validity(window));
        if !fresh {
            let value = ctx.store.get_trixel_statistic(
                self.config.statistic,
                ancestor.trixel_id,
                core.measurement_type,
                window,
            )?;
            self.ancestor_statistic.insert(key, (value, ctx.now));
        }
        Ok(self.ancestor_statistic.get(&key).and_then(|(v, _)| *v))
    }

    /// A trixel may sub-divide (unlock shadow sensors) only once its area has
    /// enough observation history for the trixel checks to work, measured on
    /// the parent trixel. Always allowed at the root.
    pub fn can_subdivide(&mut self, core: &CoreView<'_>, ctx: &TickContext) -> bool {
        if core.level == 0 {
            return true;
        }
        let Some(parent) = core.parent else {
            return true;
        };

        let window = self.config.subdivision_time_requirement();
        let key = window.num_seconds() as u64;
        let fresh = self
            .parent_observation_count
            .get(&key)
            .is_some_and(|&(_, t)| ctx.now - t <= self.config.cache_validity(window));
        if !fresh {
            match ctx.store.get_observation_count(parent, core.measurement_type, window) {
                Ok((_, valid)) => {
                    self.parent_observation_count.insert(key, (valid, ctx.now));
                }
                Err(e) => {
                    tracing::warn!(
                        "privatizer ({}, {}): observation count lookup failed: {e}",
                        core.id,
                        core.measurement_type
                    );
                    return false;
                }
            }
        }
        let count = self.parent_observation_count.get(&key).map(|&(c, _)| c).unwrap_or(0);

        let expected = (window.num_seconds() as f64 / ctx.tick_period_secs.max(1) as f64).max(1.0);
        count as f64 / expected > self.config.subdivision_time_threshold
    }
}

/// Sensor statistic cached on the lifecycle, so it follows the sensor across
/// privatizer reassignments.
fn cached_sensor_statistic(
    config: &CorrelationConfig,
    state: &mut CorrelationLifecycle,
    ctx: &TickContext,
    sensor: UniqueSensorId,
    window: Duration,
) -> anyhow::Result<Option<f64>> {
    let key = window.num_seconds() as u64;
    let fresh = state
        .sensor_statistic_last_update
        .get(&key)
        .is_some_and(|&t| ctx.now - t <= config.cache_validity(window));
    if !fresh {
        let singleton = [sensor].into_iter().collect();
        let value = ctx.store.get_sensors_statistic(config.statistic, &singleton, window)?;
        state.sensor_statistic.insert(key, value);
        state.sensor_statistic_last_update.insert(key, ctx.now);
    }
    Ok(state.sensor_statistic.get(&key).copied().flatten())
}

/// Uptime estimate by bracketing: extrapolate the base-window sample count to
/// the extended window and interpolate the extended count down to the base
/// window; a reliable sensor supports both directions.
pub(crate) fn bracketed_uptime(
    total: u64,
    valid: u64,
    long_total: u64,
    long_valid: u64,
    multiplier: u32,
) -> f64 {
    let extrapolated_count = valid as f64 * multiplier as f64;
    let extrapolated =
        1.0 - ((extrapolated_count - long_total as f64) / extrapolated_count).clamp(0.0, 1.0);

    let interpolated_count = long_valid as f64 / multiplier as f64;
    let interpolated =
        1.0 - ((interpolated_count - total as f64) / interpolated_count).clamp(0.0, 1.0);

    extrapolated.min(interpolated)
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    use uuid::Uuid;

    use crate::config::{NaiveAverageConfig, StatisticWindow};
    use crate::privatizer::average::AveragePolicy;
    use crate::schema::{MeasurementType, Observation};
    use crate::store::Store;

    use super::*;

    fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
        assert!(
            (actual - expected).abs() < epsilon,
            "expected {expected}, got {actual} (diff: {})",
            (actual - expected).abs()
        );
    }

    fn sensor(n: u128) -> UniqueSensorId {
        UniqueSensorId { ms_uuid: Uuid::from_u128(n), sensor_id: 0 }
    }

    fn gate(config: CorrelationConfig) -> CorrelationGate {
        CorrelationGate::new(
            config,
            Aggregator::Average(AveragePolicy::new(NaiveAverageConfig::default(), None)),
        )
    }

    /// Gate config whose age/uptime/interval checks pass for a sensor with a
    /// couple hours of minutely history.
    fn lenient_config() -> CorrelationConfig {
        CorrelationConfig {
            minimum_sensor_age_secs: 60,
            uptime_requirement: 0.001,
            max_update_interval_secs: 7 * 24 * 3600,
            local_check_minimum_sensor_count: 2,
            local_windows: vec![StatisticWindow {
                window_secs: 3600,
                max_delta: MeasurementType::ALL.into_iter().map(|t| (t, 5.0)).collect(),
            }],
            local_correlation_threshold: 0.5,
            trixel_windows: vec![StatisticWindow {
                window_secs: 3600,
                max_delta: MeasurementType::ALL.into_iter().map(|t| (t, 5.0)).collect(),
            }],
            trixel_correlation_threshold: 0.3,
            ..CorrelationConfig::default()
        }
    }

    fn ctx_with(store: Store, ancestors: Vec<AncestorRef>) -> TickContext {
        TickContext {
            now: Utc::now(),
            tick_period_secs: 60,
            children: Vec::new(),
            ancestors,
            store: Arc::new(store),
            k_map: Arc::new(HashMap::new()),
            lifecycles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn core<'a>(
        level: u8,
        sensors: &'a HashSet<UniqueSensorId>,
        shadow: &'a HashMap<UniqueSensorId, bool>,
    ) -> CoreView<'a> {
        CoreView {
            id: 8,
            level,
            measurement_type: MeasurementType::AmbientTemperature,
            parent: Some(2),
            sensors,
            shadow,
        }
    }

    fn fill_history(store: &Store, s: UniqueSensorId, value: f64, count: usize, step_secs: i64) {
        let now = Utc::now();
        for i in 0..count {
            store
                .insert_measurement(
                    s.ms_uuid,
                    &Measurement {
                        sensor_id: s.sensor_id,
                        value: Some(value),
                        timestamp: now - Duration::seconds(step_secs * (i as i64 + 1)),
                    },
                )
                .unwrap();
        }
    }

    fn evaluate(
        gate: &mut CorrelationGate,
        core: &CoreView<'_>,
        s: UniqueSensorId,
        ctx: &TickContext,
    ) -> (bool, Option<ExclusionReason>) {
        let contributing = gate.evaluate_sensor_quality(core, s, ctx).unwrap();
        let reason = {
            let mut lifecycles = ctx.lifecycles.lock().unwrap();
            lifecycles.entry(s).or_default().correlation_mut().exclusion_reason
        };
        (contributing, reason)
    }

    #[test]
    fn test_bracketed_uptime() {
        // A flawless minutely sensor over both windows.
        assert_approx(bracketed_uptime(1440, 1440, 10080, 10080, 7), 1.0, 1e-9);
        // Present only during the last day: extrapolation exposes the gap.
        assert_approx(bracketed_uptime(1440, 1440, 1440, 1440, 7), 1.0 - 8640.0 / 10080.0, 1e-9);
        // Thinned out recently: interpolation exposes it instead.
        assert_approx(bracketed_uptime(720, 720, 10080, 10080, 7), 0.5, 1e-9);
    }

    #[test]
    fn test_impulse_noise_blanks_value_but_updates_ema() {
        let mut g = gate(lenient_config());
        let s = sensor(1);
        let sensors = HashSet::from([s]);
        let shadow = HashMap::new();
        let view = core(1, &sensors, &shadow);
        let mut lifecycles: HashMap<UniqueSensorId, SensorLifecycle> = HashMap::new();
        let now = Utc::now();

        // Establish the EMA at 20.
        g.new_value(
            &view,
            s,
            Measurement { sensor_id: 0, value: Some(20.0), timestamp: now },
            &mut lifecycles,
            now,
        );
        // A 35 spike exceeds the default threshold of 7 and is blanked, while
        // the EMA still moves toward the spike.
        g.new_value(
            &view,
            s,
            Measurement { sensor_id: 0, value: Some(35.0), timestamp: now },
            &mut lifecycles,
            now,
        );

        let state = lifecycles.get_mut(&s).unwrap().correlation_mut();
        assert_approx(state.exponential_moving_average.unwrap(), 23.0, 1e-9);
        match g.inner() {
            Aggregator::Average(_) => {}
            _ => panic!("expected average inner"),
        }
    }

    #[test]
    fn test_young_sensor_is_excluded() {
        let store = Store::open_in_memory().unwrap();
        let s = sensor(1);
        fill_history(&store, s, 20.0, 10, 60);

        let config = CorrelationConfig { minimum_sensor_age_secs: 3600, ..lenient_config() };
        let mut g = gate(config);
        let sensors = HashSet::from([s]);
        let shadow = HashMap::new();
        let ctx = ctx_with(store, Vec::new());

        let (contributing, reason) = evaluate(&mut g, &core(1, &sensors, &shadow), s, &ctx);
        assert!(!contributing);
        assert_eq!(reason, Some(ExclusionReason::TooYoung));
    }

    #[test]
    fn test_slow_sensor_is_excluded() {
        let store = Store::open_in_memory().unwrap();
        let s = sensor(1);
        // Three updates half an hour apart: old enough to pass the age gate,
        // far too slow for the update interval requirement.
        fill_history(&store, s, 20.0, 3, 1800);

        let config = CorrelationConfig { max_update_interval_secs: 600, ..lenient_config() };
        let mut g = gate(config);
        let sensors = HashSet::from([s]);
        let shadow = HashMap::new();
        let ctx = ctx_with(store, Vec::new());

        let (contributing, reason) = evaluate(&mut g, &core(1, &sensors, &shadow), s, &ctx);
        assert!(!contributing);
        assert_eq!(reason, Some(ExclusionReason::LowUpdateInterval));
    }

    #[test]
    fn test_local_check_passes_coherent_and_rejects_outlier() {
        let store = Store::open_in_memory().unwrap();
        let coherent = sensor(1);
        let outlier = sensor(2);
        fill_history(&store, coherent, 20.0, 120, 60);
        fill_history(&store, outlier, 60.0, 120, 60);

        let mut g = gate(lenient_config());
        let sensors = HashSet::from([coherent, outlier]);
        let shadow = HashMap::new();
        let ctx = ctx_with(store, Vec::new());
        let view = core(1, &sensors, &shadow);

        // Local average is 40; both deviate by 20 > max_delta 5.
        let (contributing, reason) = evaluate(&mut g, &view, outlier, &ctx);
        assert!(!contributing);
        assert_eq!(reason, Some(ExclusionReason::InsignificantCorrelation));
    }

    #[test]
    fn test_local_check_small_population_keeps_state() {
        let store = Store::open_in_memory().unwrap();
        let s = sensor(1);
        fill_history(&store, s, 20.0, 120, 60);

        let mut g = gate(lenient_config());
        let sensors = HashSet::from([s]);
        let shadow = HashMap::new();
        let ctx = ctx_with(store, Vec::new());

        // Pre-set contributing; a single sensor is below the minimum
        // population, so the state must survive the evaluation.
        ctx.lifecycles
            .lock()
            .unwrap()
            .insert(s, SensorLifecycle { contributing: true, ..Default::default() });
        let (contributing, reason) = evaluate(&mut g, &core(1, &sensors, &shadow), s, &ctx);
        assert!(contributing);
        assert_eq!(reason, None);
    }

    #[test]
    fn test_trixel_check_uses_grandparent_observations() {
        let store = Store::open_in_memory().unwrap();
        let s = sensor(1);
        fill_history(&store, s, 22.0, 120, 60);

        // Grandparent (trixel 2) observed ~20 over the window.
        let now = Utc::now();
        let observations: Vec<Observation> = (0..10)
            .map(|i| Observation {
                time: now - Duration::seconds(60 * (i + 1)),
                trixel_id: 2,
                measurement_type: MeasurementType::AmbientTemperature,
                value: Some(20.0),
                measurement_station_count: 3,
                sensor_count: 3,
            })
            .collect();
        store.insert_observations(&observations).unwrap();

        let config = CorrelationConfig { split_level: 2, ..lenient_config() };
        let mut g = gate(config);
        let sensors = HashSet::from([s]);
        let shadow = HashMap::new();
        let ancestors = vec![
            AncestorRef { trixel_id: 8, level: 1 },
            AncestorRef { trixel_id: 2, level: 0 },
        ];
        let ctx = ctx_with(store, ancestors);

        // Level 2 runs the trixel check; delta 2 against a scaled tolerance.
        let mut view = core(2, &sensors, &shadow);
        view.id = 32;
        view.parent = Some(8);
        let (contributing, reason) = evaluate(&mut g, &view, s, &ctx);
        assert!(contributing, "reason: {reason:?}");
    }

    #[test]
    fn test_trixel_check_without_ancestors_fails() {
        let store = Store::open_in_memory().unwrap();
        let s = sensor(1);
        fill_history(&store, s, 22.0, 120, 60);

        let mut g = gate(lenient_config());
        let sensors = HashSet::from([s]);
        let shadow = HashMap::new();
        // Only the immediate parent exists; it is skipped, so no comparison
        // is possible and the sensor is rejected.
        let ctx = ctx_with(store, vec![AncestorRef { trixel_id: 8, level: 1 }]);

        let mut view = core(2, &sensors, &shadow);
        view.id = 32;
        view.parent = Some(8);
        let (contributing, reason) = evaluate(&mut g, &view, s, &ctx);
        assert!(!contributing);
        assert_eq!(reason, Some(ExclusionReason::InsignificantCorrelation));
    }

    #[test]
    fn test_can_subdivide_requires_parent_history() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        // 5 of the 5 expected observations within the 300s requirement window.
        let observations: Vec<Observation> = (0..5)
            .map(|i| Observation {
                time: now - Duration::seconds(55 * (i + 1)),
                trixel_id: 8,
                measurement_type: MeasurementType::AmbientTemperature,
                value: Some(20.0),
                measurement_station_count: 2,
                sensor_count: 2,
            })
            .collect();
        store.insert_observations(&observations).unwrap();

        let config = CorrelationConfig {
            subdivision_time_requirement_secs: 300,
            subdivision_time_threshold: 0.8,
            ..lenient_config()
        };
        let mut g = gate(config.clone());
        let sensors = HashSet::new();
        let shadow = HashMap::new();
        let ctx = ctx_with(store, Vec::new());

        let mut view = core(2, &sensors, &shadow);
        view.id = 32;
        view.parent = Some(8);
        assert!(g.can_subdivide(&view, &ctx));

        // A trixel whose parent has no history may not subdivide.
        let mut g = gate(config);
        let ctx = ctx_with(Store::open_in_memory().unwrap(), Vec::new());
        assert!(!g.can_subdivide(&view, &ctx));

        // The root always may.
        let root_view = core(0, &sensors, &shadow);
        assert!(g.can_subdivide(&root_view, &ctx));
    }
}

//! Per-(trixel, measurement type) aggregation state machines.
//!
//! A privatizer owns the sensors routed to its trixel, decides which of them
//! may contribute, and produces one output value per tick. Sensors start out
//! "shadow contributing": absorbed but not counted, until the privatizer can
//! prove their station's k-anonymity requirement is satisfiable here.

pub mod average;
pub mod correlation;
pub mod kalman;
pub mod latest;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{Config, PrivatizerConfig};
use crate::htm::{self, TrixelId};
use crate::schema::{Measurement, MeasurementType, SensorLifecycle, TrixelUpdate, UniqueSensorId};
use crate::store::Store;

use average::AveragePolicy;
use correlation::CorrelationGate;
use kalman::KalmanPolicy;
use latest::LatestPolicy;

/// Read-only snapshot of one existing child privatizer, taken after the
/// deeper level finished its sweep.
#[derive(Debug, Clone)]
pub struct ChildStats {
    pub trixel_id: TrixelId,
    pub value: Option<f64>,
    /// Contributing stations in the child's whole sub-tree.
    pub total_ms_count: u32,
    /// Contributing sensors in the child's whole sub-tree.
    pub total_sensor_count: u32,
    pub average_accuracy: Option<f64>,
}

/// An existing ancestor privatizer, nearest first.
#[derive(Debug, Clone, Copy)]
pub struct AncestorRef {
    pub trixel_id: TrixelId,
    pub level: u8,
}

/// Everything a privatizer may touch during one tick. Child and ancestor
/// state arrives as owned snapshots so concurrent privatizers of one level
/// never read each other.
pub struct TickContext {
    pub now: DateTime<Utc>,
    pub tick_period_secs: u64,
    pub children: Vec<ChildStats>,
    pub ancestors: Vec<AncestorRef>,
    pub store: Arc<Store>,
    pub k_map: Arc<HashMap<Uuid, u32>>,
    pub lifecycles: Arc<Mutex<HashMap<UniqueSensorId, SensorLifecycle>>>,
}

impl TickContext {
    pub fn child_ms_count(&self) -> u32 {
        self.children.iter().map(|c| c.total_ms_count).sum()
    }

    pub fn child_sensor_count(&self) -> u32 {
        self.children.iter().map(|c| c.total_sensor_count).sum()
    }
}

/// Side effects of one privatizer tick, applied by the manager afterwards.
pub struct TickOutcome {
    pub update: TrixelUpdate,
    pub update_tls: bool,
    /// Sensors whose k requirement became satisfiable here; they must leave
    /// the parent privatizer.
    pub unshadowed: Vec<UniqueSensorId>,
    /// Sensors that stopped updating; they must leave the manager entirely.
    pub stale_sensors: Vec<UniqueSensorId>,
}

/// The identity and membership of a privatizer as seen by its policy.
pub struct CoreView<'a> {
    pub id: TrixelId,
    pub level: u8,
    pub measurement_type: MeasurementType,
    pub parent: Option<TrixelId>,
    pub sensors: &'a HashSet<UniqueSensorId>,
    pub shadow: &'a HashMap<UniqueSensorId, bool>,
}

impl CoreView<'_> {
    /// Sensors default to shadow mode until the privatizer unlocks them.
    pub fn in_shadow(&self, sensor: UniqueSensorId) -> bool {
        self.shadow.get(&sensor).copied().unwrap_or(true)
    }
}

macro_rules! core_view {
    ($self:ident) => {
        CoreView {
            id: $self.id,
            level: $self.level,
            measurement_type: $self.measurement_type,
            parent: $self.parent,
            sensors: &$self.sensors,
            shadow: &$self.shadow,
        }
    };
}

/// Value aggregation half of a policy; shared between the naive policies and
/// the correlation-gated combinations.
pub enum Aggregator {
    Average(AveragePolicy),
    Kalman(KalmanPolicy),
}

impl Aggregator {
    fn on_sensor_added(&mut self, sensor: UniqueSensorId, store: &Store) {
        if let Aggregator::Kalman(kalman) = self {
            kalman.on_sensor_added(sensor, store);
        }
    }

    fn on_sensor_removed(&mut self, sensor: UniqueSensorId) {
        match self {
            Aggregator::Average(average) => average.on_sensor_removed(sensor),
            Aggregator::Kalman(kalman) => kalman.on_sensor_removed(sensor),
        }
    }

    fn new_value(&mut self, sensor: UniqueSensorId, measurement: &Measurement, now: DateTime<Utc>) {
        match self {
            Aggregator::Average(average) => average.new_value(sensor, measurement, now),
            Aggregator::Kalman(kalman) => kalman.new_value(sensor, measurement, now),
        }
    }

    fn stale_sensors(&self, core: &CoreView<'_>, now: DateTime<Utc>) -> Vec<UniqueSensorId> {
        match self {
            Aggregator::Average(average) => average.stale_sensors(core, now),
            Aggregator::Kalman(kalman) => kalman.stale_sensors(core, now),
        }
    }

    fn get_value(&mut self, core: &CoreView<'_>, ctx: &TickContext) -> anyhow::Result<Option<f64>> {
        match self {
            Aggregator::Average(average) => average.get_value(core, ctx),
            Aggregator::Kalman(kalman) => Ok(kalman.get_value(core, ctx)),
        }
    }

    fn average_accuracy(&self) -> Option<f64> {
        match self {
            Aggregator::Average(_) => None,
            Aggregator::Kalman(kalman) => kalman.average_accuracy(),
        }
    }
}

/// The pluggable behavior of a privatizer: how sensors are judged and how the
/// output value is computed.
pub enum Policy {
    /// Accepts every sensor, never produces a value.
    Blank,
    Latest(LatestPolicy),
    Naive(Aggregator),
    Correlated(CorrelationGate),
}

impl Policy {
    pub fn from_config(
        config: &PrivatizerConfig,
        measurement_type: MeasurementType,
        tick_period_secs: u64,
    ) -> Self {
        match config {
            PrivatizerConfig::Blank => Policy::Blank,
            PrivatizerConfig::Latest => Policy::Latest(LatestPolicy::default()),
            PrivatizerConfig::NaiveAverage(average) => {
                Policy::Naive(Aggregator::Average(AveragePolicy::new(average.clone(), None)))
            }
            PrivatizerConfig::NaiveSmoothingAverage(smoothing) => Policy::Naive(
                Aggregator::Average(AveragePolicy::new(
                    smoothing.average.clone(),
                    Some((smoothing.local_smooth_factor, smoothing.child_smooth_factor)),
                )),
            ),
            PrivatizerConfig::NaiveKalman(kalman) => Policy::Naive(Aggregator::Kalman(
                KalmanPolicy::new(kalman.clone(), measurement_type, tick_period_secs),
            )),
            PrivatizerConfig::Average { correlation, average } => {
                Policy::Correlated(CorrelationGate::new(
                    correlation.clone(),
                    Aggregator::Average(AveragePolicy::new(average.clone(), None)),
                ))
            }
            PrivatizerConfig::SmoothingAverage { correlation, average } => {
                Policy::Correlated(CorrelationGate::new(
                    correlation.clone(),
                    Aggregator::Average(AveragePolicy::new(
                        average.average.clone(),
                        Some((average.local_smooth_factor, average.child_smooth_factor)),
                    )),
                ))
            }
            PrivatizerConfig::Kalman { correlation, kalman } => {
                Policy::Correlated(CorrelationGate::new(
                    correlation.clone(),
                    Aggregator::Kalman(KalmanPolicy::new(
                        kalman.clone(),
                        measurement_type,
                        tick_period_secs,
                    )),
                ))
            }
        }
    }

    fn on_sensor_added(&mut self, sensor: UniqueSensorId, store: &Store) {
        match self {
            Policy::Blank | Policy::Latest(_) => {}
            Policy::Naive(aggregator) => aggregator.on_sensor_added(sensor, store),
            Policy::Correlated(gate) => gate.inner_mut().on_sensor_added(sensor, store),
        }
    }

    fn on_sensor_removed(&mut self, sensor: UniqueSensorId) {
        match self {
            Policy::Blank => {}
            Policy::Latest(latest) => latest.on_sensor_removed(sensor),
            Policy::Naive(aggregator) => aggregator.on_sensor_removed(sensor),
            Policy::Correlated(gate) => gate.inner_mut().on_sensor_removed(sensor),
        }
    }

    fn new_value(
        &mut self,
        core: &CoreView<'_>,
        sensor: UniqueSensorId,
        measurement: Measurement,
        lifecycles: &mut HashMap<UniqueSensorId, SensorLifecycle>,
        now: DateTime<Utc>,
    ) {
        match self {
            Policy::Blank => {}
            Policy::Latest(latest) => latest.new_value(core, sensor, &measurement),
            Policy::Naive(aggregator) => aggregator.new_value(sensor, &measurement, now),
            Policy::Correlated(gate) => gate.new_value(core, sensor, measurement, lifecycles, now),
        }
    }

    fn pre_processing(&mut self, core: &CoreView<'_>, ctx: &TickContext) -> Vec<UniqueSensorId> {
        match self {
            Policy::Blank => Vec::new(),
            Policy::Latest(latest) => latest.stale_sensors(core),
            Policy::Naive(aggregator) => aggregator.stale_sensors(core, ctx.now),
            Policy::Correlated(gate) => gate.inner_mut().stale_sensors(core, ctx.now),
        }
    }

    fn post_processing(&mut self) {
        if let Policy::Latest(latest) = self {
            latest.end_tick();
        }
    }

    fn evaluate_sensor_quality(
        &mut self,
        core: &CoreView<'_>,
        sensor: UniqueSensorId,
        ctx: &TickContext,
    ) -> anyhow::Result<bool> {
        match self {
            Policy::Blank | Policy::Latest(_) | Policy::Naive(_) => {
                let mut lifecycles = ctx.lifecycles.lock().unwrap();
                lifecycles.entry(sensor).or_default().contributing = true;
                Ok(true)
            }
            Policy::Correlated(gate) => gate.evaluate_sensor_quality(core, sensor, ctx),
        }
    }

    fn get_value(&mut self, core: &CoreView<'_>, ctx: &TickContext) -> anyhow::Result<Option<f64>> {
        match self {
            Policy::Blank => Ok(None),
            Policy::Latest(latest) => Ok(latest.get_value(ctx)),
            Policy::Naive(aggregator) => aggregator.get_value(core, ctx),
            Policy::Correlated(gate) => gate.inner_mut().get_value(core, ctx),
        }
    }

    fn can_subdivide(&mut self, core: &CoreView<'_>, ctx: &TickContext) -> bool {
        match self {
            Policy::Correlated(gate) => gate.can_subdivide(core, ctx),
            _ => true,
        }
    }

    fn average_accuracy(&self) -> Option<f64> {
        match self {
            Policy::Naive(aggregator) => aggregator.average_accuracy(),
            Policy::Correlated(gate) => gate.inner().average_accuracy(),
            _ => None,
        }
    }
}

/// One privatizer: the aggregation state machine for a single trixel and
/// measurement type.
pub struct Privatizer {
    pub id: TrixelId,
    pub measurement_type: MeasurementType,
    pub level: u8,
    pub parent: Option<TrixelId>,
    children: Option<[TrixelId; 4]>,
    neighbors: Vec<TrixelId>,

    sensors: HashSet<UniqueSensorId>,
    shadow: HashMap<UniqueSensorId, bool>,
    evaluate: HashMap<UniqueSensorId, bool>,

    contributing_ms_count: u32,
    contributing_sensor_count: u32,
    tls_ms_count: Option<u32>,
    last_update: Option<TrixelUpdate>,
    stale: bool,

    policy: Policy,
}

impl Privatizer {
    pub fn new(id: TrixelId, measurement_type: MeasurementType, config: &Config) -> Self {
        let level = htm::level(id).unwrap_or(0);
        let children = if level < config.max_level { htm::children(id) } else { None };
        Self {
            id,
            measurement_type,
            level,
            parent: htm::parent(id),
            children,
            neighbors: htm::neighbors(id),
            sensors: HashSet::new(),
            shadow: HashMap::new(),
            evaluate: HashMap::new(),
            contributing_ms_count: 0,
            contributing_sensor_count: 0,
            tls_ms_count: None,
            last_update: None,
            stale: false,
            policy: Policy::from_config(
                &config.privatizer,
                measurement_type,
                config.trixel_update_frequency_secs,
            ),
        }
    }

    pub fn children(&self) -> Option<[TrixelId; 4]> {
        self.children
    }

    pub fn neighbors(&self) -> &[TrixelId] {
        &self.neighbors
    }

    pub fn sensors(&self) -> &HashSet<UniqueSensorId> {
        &self.sensors
    }

    /// The last value this privatizer produced, frozen until its next tick.
    pub fn value(&self) -> Option<f64> {
        self.last_update.as_ref().and_then(|u| u.value)
    }

    pub fn last_update(&self) -> Option<&TrixelUpdate> {
        self.last_update.as_ref()
    }

    /// True when the privatizer serves no purpose and can be destroyed.
    pub fn stale(&self) -> bool {
        self.stale
    }

    /// Contributing stations within this trixel only, excluding sub-trixels.
    pub fn contributing_ms_count(&self) -> u32 {
        self.contributing_ms_count
    }

    pub fn contributing_sensor_count(&self) -> u32 {
        self.contributing_sensor_count
    }

    pub fn set_tls_ms_count(&mut self, count: u32) {
        self.tls_ms_count = Some(count);
    }

    pub fn average_accuracy(&self) -> Option<f64> {
        self.policy.average_accuracy()
    }

    pub fn in_shadow(&self, sensor: UniqueSensorId) -> bool {
        self.shadow.get(&sensor).copied().unwrap_or(true)
    }

    /// Attach a sensor. Idempotent; an existing shadow state is preserved.
    pub fn add_sensor(&mut self, sensor: UniqueSensorId, should_evaluate: bool, store: &Store) {
        self.sensors.insert(sensor);
        self.shadow.entry(sensor).or_insert(true);
        self.evaluate.insert(sensor, should_evaluate);
        self.policy.on_sensor_added(sensor, store);
    }

    /// Detach a sensor and drop its local scratch state. The global lifecycle
    /// is untouched; it may be reused under another privatizer.
    pub fn remove_sensor(&mut self, sensor: UniqueSensorId) {
        self.sensors.remove(&sensor);
        self.shadow.remove(&sensor);
        self.evaluate.remove(&sensor);
        self.policy.on_sensor_removed(sensor);
    }

    /// Absorb a new measurement for an attached sensor.
    pub fn new_value(
        &mut self,
        sensor: UniqueSensorId,
        measurement: Measurement,
        lifecycles: &mut HashMap<UniqueSensorId, SensorLifecycle>,
        now: DateTime<Utc>,
    ) {
        let core = core_view!(self);
        self.policy.new_value(&core, sensor, measurement, lifecycles, now);
    }

    /// One tick of this privatizer: evaluate sensor quality, unlock shadow
    /// contributions where the k requirement became satisfiable, compute the
    /// output value and report what changed.
    ///
    /// Called bottom-up: all child privatizers have finished their tick, so
    /// the child snapshots in `ctx` are final for this tick.
    pub fn process(&mut self, ctx: &TickContext) -> TickOutcome {
        let stale_sensors = {
            let core = core_view!(self);
            self.policy.pre_processing(&core, ctx)
        };
        for &sensor in &stale_sensors {
            self.remove_sensor(sensor);
        }

        // Quality evaluation; sensors owned by a sibling privatizer are read
        // from the lifecycle instead of being re-evaluated here.
        let mut contributing: HashSet<UniqueSensorId> = HashSet::new();
        let sensor_list: Vec<UniqueSensorId> = self.sensors.iter().copied().collect();
        for sensor in sensor_list {
            let should_evaluate = self.evaluate.get(&sensor).copied().unwrap_or(false);
            let is_contributing = if should_evaluate {
                let core = core_view!(self);
                match self.policy.evaluate_sensor_quality(&core, sensor, ctx) {
                    Ok(contributing) => contributing,
                    Err(e) => {
                        tracing::warn!(
                            "privatizer ({}, {}): evaluating {sensor} failed: {e}",
                            self.id,
                            self.measurement_type
                        );
                        lifecycle_contributing(ctx, sensor)
                    }
                }
            } else {
                lifecycle_contributing(ctx, sensor)
            };
            if is_contributing {
                contributing.insert(sensor);
            }
        }

        let shadow_stations: HashSet<Uuid> = contributing.iter().map(|s| s.ms_uuid).collect();
        let child_ms_count = ctx.child_ms_count();

        let mut unshadowed = Vec::new();
        let can_subdivide = {
            let core = core_view!(self);
            self.policy.can_subdivide(&core, ctx)
        };
        if can_subdivide {
            let max_k = max_satisfiable_k(&shadow_stations, &ctx.k_map, child_ms_count);

            // Unlock sensors whose requirement is now satisfiable; everything
            // else falls back into shadow mode.
            for &sensor in &self.sensors {
                let k = ctx.k_map.get(&sensor.ms_uuid).copied();
                if k.is_some_and(|k| k <= max_k) {
                    self.shadow.insert(sensor, false);
                    unshadowed.push(sensor);
                } else {
                    self.shadow.insert(sensor, true);
                }
            }
        }

        let mut contributing_ms: HashSet<Uuid> = HashSet::new();
        let mut contributing_sensor_count = 0;
        for sensor in &contributing {
            if !self.in_shadow(*sensor) {
                contributing_ms.insert(sensor.ms_uuid);
                contributing_sensor_count += 1;
            }
        }
        self.contributing_ms_count = contributing_ms.len() as u32;
        self.contributing_sensor_count = contributing_sensor_count;

        let new_value = {
            let core = core_view!(self);
            match self.policy.get_value(&core, ctx) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        "privatizer ({}, {}): get_value failed: {e}",
                        self.id,
                        self.measurement_type
                    );
                    None
                }
            }
        };

        let measurement_station_count = self.contributing_ms_count + child_ms_count;
        let sensor_count = self.contributing_sensor_count + ctx.child_sensor_count();
        self.stale = measurement_station_count == 0 && self.sensors.is_empty();

        let update_tls = self.tls_ms_count != Some(measurement_station_count);
        let changed = match &self.last_update {
            Some(last) => {
                last.value != new_value
                    || last.measurement_station_count != measurement_station_count
                    || last.sensor_count != sensor_count
            }
            None => false,
        };

        let update = TrixelUpdate {
            changed,
            value: new_value,
            measurement_station_count,
            sensor_count,
        };
        self.last_update = Some(update);
        self.policy.post_processing();

        TickOutcome { update, update_tls, unshadowed, stale_sensors }
    }
}

fn lifecycle_contributing(ctx: &TickContext, sensor: UniqueSensorId) -> bool {
    let lifecycles = ctx.lifecycles.lock().unwrap();
    lifecycles.get(&sensor).map(|l| l.contributing).unwrap_or(false)
}

/// The largest k requirement that the observed shadow stations (plus already
/// verified child stations) can satisfy. A station requiring a smaller k also
/// counts toward every larger k.
fn max_satisfiable_k(
    shadow_stations: &HashSet<Uuid>,
    k_map: &HashMap<Uuid, u32>,
    child_ms_count: u32,
) -> u32 {
    let mut requirements: HashMap<u32, u32> = HashMap::new();
    for station in shadow_stations {
        if let Some(&k) = k_map.get(station) {
            *requirements.entry(k).or_insert(0) += 1;
        }
    }

    let mut max_k = 0;
    for &k in requirements.keys() {
        let satisfiers: u32 = requirements
            .iter()
            .filter(|&(&other, _)| other <= k)
            .map(|(_, &count)| count)
            .sum();
        if satisfiers + child_ms_count >= k && k > max_k {
            max_k = k;
        }
    }
    max_k
}

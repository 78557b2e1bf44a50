//! The privacy manager: owns all privatizers and sensor bookkeeping, routes
//! incoming contributions, and drives the periodic bottom-up sweep.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Notify, watch};
use uuid::Uuid;

use crate::config::Config;
use crate::error::TmsError;
use crate::htm::{self, Delegation, TrixelId};
use crate::privatizer::{AncestorRef, ChildStats, Privatizer, TickContext, TickOutcome};
use crate::schema::{
    LevelChange, Measurement, MeasurementType, Observation, SensorLifecycle, UniqueSensorId,
};
use crate::store::Store;
use crate::tls::CountPublisher;

/// Activation state published by the TLS synchronization at startup.
#[derive(Debug, Clone, Default)]
pub struct TmsStatus {
    pub active: bool,
    pub delegations: Vec<Delegation>,
}

/// Result of a batch contribution: per-sensor level-change hints and the
/// trixels this TMS is not responsible for.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub level_changes: HashMap<u32, LevelChange>,
    pub wrong_tms: Vec<TrixelId>,
}

struct ManagerState {
    /// The responsible privatizer per measurement type and trixel.
    privatizers: HashMap<MeasurementType, HashMap<TrixelId, Privatizer>>,
    /// Trixels with a privatizer in any type, per level.
    level_index: BTreeMap<u8, HashSet<TrixelId>>,
    /// Which privatizer a sensor currently targets.
    sensor_map: HashMap<UniqueSensorId, (MeasurementType, TrixelId)>,
    /// k-anonymity requirement per measurement station.
    k_map: HashMap<Uuid, u32>,
}

pub struct PrivacyManager {
    config: Arc<Config>,
    store: Arc<Store>,
    publisher: Arc<dyn CountPublisher>,
    state: Mutex<ManagerState>,
    /// Sensor lifecycles outlive privatizer reassignments; shared with the
    /// sweep tasks.
    lifecycles: Arc<Mutex<HashMap<UniqueSensorId, SensorLifecycle>>>,
    status_rx: watch::Receiver<TmsStatus>,
    shutdown: Arc<Notify>,
}

impl PrivacyManager {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        publisher: Arc<dyn CountPublisher>,
        status_rx: watch::Receiver<TmsStatus>,
    ) -> Self {
        let privatizers =
            MeasurementType::ALL.into_iter().map(|t| (t, HashMap::new())).collect();
        Self {
            config,
            store,
            publisher,
            state: Mutex::new(ManagerState {
                privatizers,
                level_index: BTreeMap::new(),
                sensor_map: HashMap::new(),
                k_map: HashMap::new(),
            }),
            lifecycles: Arc::new(Mutex::new(HashMap::new())),
            status_rx,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Notified when a critical TLS failure demands a shutdown.
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Create the privatizer for a trixel and type if missing, together with
    /// its whole ancestor chain.
    fn ensure_privatizer(
        &self,
        state: &mut ManagerState,
        trixel_id: TrixelId,
        measurement_type: MeasurementType,
    ) {
        if state
            .privatizers
            .get(&measurement_type)
            .is_some_and(|map| map.contains_key(&trixel_id))
        {
            return;
        }
        if let Some(parent) = htm::parent(trixel_id) {
            self.ensure_privatizer(state, parent, measurement_type);
        }
        let privatizer = Privatizer::new(trixel_id, measurement_type, &self.config);
        state.level_index.entry(privatizer.level).or_default().insert(trixel_id);
        state
            .privatizers
            .entry(measurement_type)
            .or_default()
            .insert(trixel_id, privatizer);
    }

    /// Contributing stations in the sub-tree rooted at `trixel_id`.
    fn total_contributing_ms(
        map: &HashMap<TrixelId, Privatizer>,
        trixel_id: TrixelId,
    ) -> u32 {
        let Some(privatizer) = map.get(&trixel_id) else {
            return 0;
        };
        let mut total = privatizer.contributing_ms_count();
        if let Some(children) = privatizer.children() {
            for child in children {
                total += Self::total_contributing_ms(map, child);
            }
        }
        total
    }

    fn total_contributing_sensors(
        map: &HashMap<TrixelId, Privatizer>,
        trixel_id: TrixelId,
    ) -> u32 {
        let Some(privatizer) = map.get(&trixel_id) else {
            return 0;
        };
        let mut total = privatizer.contributing_sensor_count();
        if let Some(children) = privatizer.children() {
            for child in children {
                total += Self::total_contributing_sensors(map, child);
            }
        }
        total
    }

    pub fn set_k_requirement(&self, ms_uuid: Uuid, k: u32) {
        self.state.lock().unwrap().k_map.insert(ms_uuid, k);
    }

    /// Remove a sensor from its target privatizer and that privatizer's
    /// parent. The lifecycle stays; it may be reused if the sensor returns.
    pub fn remove_sensor(&self, sensor: UniqueSensorId) {
        let mut state = self.state.lock().unwrap();
        Self::remove_sensor_locked(&mut state, sensor);
    }

    fn remove_sensor_locked(state: &mut ManagerState, sensor: UniqueSensorId) {
        let Some((measurement_type, trixel_id)) = state.sensor_map.remove(&sensor) else {
            return;
        };
        let Some(map) = state.privatizers.get_mut(&measurement_type) else {
            return;
        };
        let parent = map.get(&trixel_id).and_then(|p| p.parent);
        if let Some(privatizer) = map.get_mut(&trixel_id) {
            privatizer.remove_sensor(sensor);
        }
        if let Some(parent_privatizer) = parent.and_then(|id| map.get_mut(&id)) {
            parent_privatizer.remove_sensor(sensor);
        }
    }

    /// Route one measurement to the child and parent privatizers of its
    /// target trixel and return the level-change hint for the client.
    ///
    /// A fresh sensor normally shadow-contributes to the parent until the
    /// parent can prove its k requirement; once unlocked there, it starts
    /// shadow-contributing to the child so the finer trixel can populate.
    /// When the parent is a root trixel the child is bootstrapped directly,
    /// since there is no shallower level left to fall back to.
    pub fn contribute(
        &self,
        sub_trixel_id: TrixelId,
        sensor: UniqueSensorId,
        measurement: Measurement,
        measurement_type: MeasurementType,
        k_requirement: u32,
    ) -> Result<LevelChange, TmsError> {
        let level = htm::level(sub_trixel_id)
            .ok_or_else(|| TmsError::InvalidInput(format!("malformed trixel id {sub_trixel_id}")))?;
        if level < 1 || level > self.config.max_level {
            return Err(TmsError::InvalidInput(format!(
                "invalid target level {level}, accepted range is 1..={}",
                self.config.max_level
            )));
        }
        let parent_id = htm::parent(sub_trixel_id)
            .ok_or_else(|| TmsError::InvalidInput(format!("trixel {sub_trixel_id} has no parent")))?;

        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        self.ensure_privatizer(state, sub_trixel_id, measurement_type);
        self.ensure_privatizer(state, parent_id, measurement_type);

        state.k_map.insert(sensor.ms_uuid, k_requirement);

        // A sensor that changed its target trixel leaves its old privatizers.
        let first_contribution = !state.sensor_map.contains_key(&sensor);
        if let Some(&(old_type, old_trixel)) = state.sensor_map.get(&sensor) {
            if (old_type, old_trixel) != (measurement_type, sub_trixel_id) {
                Self::remove_sensor_locked(state, sensor);
            }
        }
        state.sensor_map.insert(sensor, (measurement_type, sub_trixel_id));

        let map = state
            .privatizers
            .get_mut(&measurement_type)
            .ok_or_else(|| TmsError::InvalidInput("unknown measurement type".into()))?;
        let child_populated = Self::total_contributing_ms(map, sub_trixel_id) >= k_requirement;
        let parent_populated = !child_populated
            && Self::total_contributing_ms(map, parent_id) >= k_requirement;

        let shadow_child =
            map.get(&sub_trixel_id).map(|p| p.in_shadow(sensor)).unwrap_or(true);
        let shadow_parent = map.get(&parent_id).map(|p| p.in_shadow(sensor)).unwrap_or(true);
        let parent_is_root = htm::level(parent_id) == Some(0);

        let now = Utc::now();
        let mut lifecycles = self.lifecycles.lock().unwrap();

        enum Action {
            Add { evaluate: bool },
            Remove,
        }
        let (child_action, parent_action) = if child_populated && !shadow_child {
            // The sensor contributes for real in the finer trixel.
            (Action::Add { evaluate: true }, Action::Remove)
        } else if shadow_child && !shadow_parent {
            // Normal case: real contribution at the parent, shadow at the child.
            (Action::Add { evaluate: false }, Action::Add { evaluate: true })
        } else if shadow_child && shadow_parent && parent_is_root {
            // Nothing above the root can absorb the sensor; bootstrap both.
            (Action::Add { evaluate: true }, Action::Add { evaluate: true })
        } else {
            (Action::Remove, Action::Add { evaluate: true })
        };

        match child_action {
            Action::Add { evaluate } => {
                if let Some(child) = map.get_mut(&sub_trixel_id) {
                    child.add_sensor(sensor, evaluate, &self.store);
                    child.new_value(sensor, measurement.clone(), &mut lifecycles, now);
                }
            }
            Action::Remove => {
                if let Some(child) = map.get_mut(&sub_trixel_id) {
                    child.remove_sensor(sensor);
                }
            }
        }
        match parent_action {
            Action::Add { evaluate } => {
                if let Some(parent) = map.get_mut(&parent_id) {
                    parent.add_sensor(sensor, evaluate, &self.store);
                    parent.new_value(sensor, measurement, &mut lifecycles, now);
                }
            }
            Action::Remove => {
                if let Some(parent) = map.get_mut(&parent_id) {
                    parent.remove_sensor(sensor);
                }
            }
        }

        let hint = if child_populated && !shadow_child {
            LevelChange::Increase
        } else if !first_contribution && !parent_is_root && !parent_populated {
            LevelChange::Decrease
        } else {
            LevelChange::Keep
        };
        Ok(hint)
    }

    /// Route a station's batch of measurements. Trixels not delegated to this
    /// TMS are dropped and reported back; non-`Keep` hints are collected per
    /// sensor.
    pub fn batch_contribute(
        &self,
        ms_uuid: Uuid,
        updates: &HashMap<TrixelId, Vec<Measurement>>,
        sensor_types: &HashMap<u32, MeasurementType>,
        k_requirement: u32,
    ) -> Result<BatchOutcome, TmsError> {
        let delegations = self.status_rx.borrow().delegations.clone();
        let mut outcome = BatchOutcome::default();

        for (&trixel_id, measurements) in updates {
            if !htm::is_delegated(trixel_id, &delegations) {
                outcome.wrong_tms.push(trixel_id);
                continue;
            }
            for measurement in measurements {
                let measurement_type =
                    sensor_types.get(&measurement.sensor_id).copied().ok_or_else(|| {
                        TmsError::InvalidInput(format!(
                            "unknown sensor {} for station {ms_uuid}",
                            measurement.sensor_id
                        ))
                    })?;
                let sensor = UniqueSensorId { ms_uuid, sensor_id: measurement.sensor_id };
                let hint = self.contribute(
                    trixel_id,
                    sensor,
                    measurement.clone(),
                    measurement_type,
                    k_requirement,
                )?;
                if hint != LevelChange::Keep {
                    outcome.level_changes.insert(measurement.sensor_id, hint);
                }
            }
        }
        Ok(outcome)
    }

    /// One bottom-up sweep over all measurement types.
    pub async fn process(&self) {
        let sweeps = MeasurementType::ALL.map(|t| self.process_type(t));
        futures_util::future::join_all(sweeps).await;
    }

    /// Sweep one measurement type: deepest level first, privatizers of one
    /// level concurrently, counts and observations flushed per level so the
    /// next shallower level sees final descendant state.
    async fn process_type(&self, measurement_type: MeasurementType) {
        let levels: Vec<u8> = {
            let state = self.state.lock().unwrap();
            state.level_index.keys().rev().copied().collect()
        };

        for level in levels {
            let (batch, k_map) = self.extract_level(measurement_type, level);
            if batch.is_empty() {
                continue;
            }

            let now = Utc::now();
            let tick_period_secs = self.config.trixel_update_frequency_secs;
            let tasks: Vec<_> = batch
                .into_iter()
                .map(|(privatizer, children, ancestors)| {
                    let store = self.store.clone();
                    let lifecycles = self.lifecycles.clone();
                    let k_map = k_map.clone();
                    tokio::spawn(async move {
                        let ctx = TickContext {
                            now,
                            tick_period_secs,
                            children,
                            ancestors,
                            store,
                            k_map,
                            lifecycles,
                        };
                        let mut privatizer = privatizer;
                        let outcome = privatizer.process(&ctx);
                        (privatizer, outcome)
                    })
                })
                .collect();

            let mut results: Vec<(Privatizer, TickOutcome)> = Vec::new();
            for task in futures_util::future::join_all(tasks).await {
                match task {
                    Ok(result) => results.push(result),
                    Err(e) => tracing::error!("privatizer task failed: {e}"),
                }
            }

            let (observations, counts) = self.apply_level_results(measurement_type, results, now);

            if !counts.is_empty() {
                match self.publisher.publish_counts(measurement_type, &counts).await {
                    Ok(()) => {
                        let mut state = self.state.lock().unwrap();
                        if let Some(map) = state.privatizers.get_mut(&measurement_type) {
                            for (trixel_id, count) in &counts {
                                if let Some(privatizer) = map.get_mut(trixel_id) {
                                    privatizer.set_tls_ms_count(*count);
                                }
                            }
                        }
                    }
                    Err(e) if e.is_critical() => {
                        tracing::error!("critical TLS failure while publishing counts: {e}");
                        self.shutdown.notify_waiters();
                    }
                    Err(e) => {
                        // Counts converge on the next tick.
                        tracing::warn!("publishing counts for {measurement_type} failed: {e}");
                    }
                }
            }

            if let Err(e) = self.store.insert_observations(&observations) {
                tracing::error!(
                    "persisting {} observation(s) for {measurement_type} failed: {e}",
                    observations.len()
                );
            }
        }
    }

    /// Move one level's privatizers out of the table together with read-only
    /// snapshots of their children (final: the deeper level is done) and the
    /// ancestor chain ids.
    #[allow(clippy::type_complexity)]
    fn extract_level(
        &self,
        measurement_type: MeasurementType,
        level: u8,
    ) -> (Vec<(Privatizer, Vec<ChildStats>, Vec<AncestorRef>)>, Arc<HashMap<Uuid, u32>>) {
        let mut state = self.state.lock().unwrap();
        let k_map = Arc::new(state.k_map.clone());

        let trixels: Vec<TrixelId> = state
            .level_index
            .get(&level)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let Some(map) = state.privatizers.get_mut(&measurement_type) else {
            return (Vec::new(), k_map);
        };

        let mut extracted = Vec::new();
        for trixel_id in trixels {
            if let Some(privatizer) = map.remove(&trixel_id) {
                extracted.push(privatizer);
            }
        }

        let map = &state.privatizers[&measurement_type];
        let batch = extracted
            .into_iter()
            .map(|privatizer| {
                let children: Vec<ChildStats> = privatizer
                    .children()
                    .into_iter()
                    .flatten()
                    .filter_map(|child_id| {
                        map.get(&child_id).map(|child| ChildStats {
                            trixel_id: child_id,
                            value: child.value(),
                            total_ms_count: Self::total_contributing_ms(map, child_id),
                            total_sensor_count: Self::total_contributing_sensors(map, child_id),
                            average_accuracy: child.average_accuracy(),
                        })
                    })
                    .collect();

                let mut ancestors = Vec::new();
                let mut current = privatizer.parent;
                while let Some(ancestor_id) = current {
                    if !map.contains_key(&ancestor_id) {
                        break;
                    }
                    if let Some(ancestor_level) = htm::level(ancestor_id) {
                        ancestors.push(AncestorRef { trixel_id: ancestor_id, level: ancestor_level });
                    }
                    current = htm::parent(ancestor_id);
                }

                (privatizer, children, ancestors)
            })
            .collect();

        (batch, k_map)
    }

    /// Re-insert processed privatizers, apply their side effects, destroy
    /// stale ones, and collect the level's observations and TLS count updates.
    fn apply_level_results(
        &self,
        measurement_type: MeasurementType,
        results: Vec<(Privatizer, TickOutcome)>,
        now: chrono::DateTime<Utc>,
    ) -> (Vec<Observation>, HashMap<TrixelId, u32>) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let mut observations = Vec::new();
        let mut counts = HashMap::new();

        let mut outcomes: Vec<(TrixelId, TickOutcome)> = Vec::new();
        for (privatizer, outcome) in results {
            let trixel_id = privatizer.id;
            let parent_id = privatizer.parent;
            state
                .privatizers
                .entry(measurement_type)
                .or_default()
                .insert(trixel_id, privatizer);

            // Unshadowed sensors leave the parent privatizer.
            if let Some(parent_id) = parent_id {
                for sensor in &outcome.unshadowed {
                    if let Some(parent) = state
                        .privatizers
                        .get_mut(&measurement_type)
                        .and_then(|map| map.get_mut(&parent_id))
                    {
                        parent.remove_sensor(*sensor);
                    }
                }
            }
            for sensor in &outcome.stale_sensors {
                tracing::debug!(
                    "removing stale sensor {sensor} (privatizer {trixel_id}, {measurement_type})"
                );
                Self::remove_sensor_locked(state, *sensor);
            }
            outcomes.push((trixel_id, outcome));
        }

        for (trixel_id, outcome) in outcomes {
            let map = state.privatizers.entry(measurement_type).or_default();
            let is_stale = map.get(&trixel_id).map(|p| p.stale()).unwrap_or(false);

            if is_stale {
                map.remove(&trixel_id);
                let in_other_type = state
                    .privatizers
                    .iter()
                    .any(|(_, other)| other.contains_key(&trixel_id));
                if !in_other_type {
                    if let Some(level) = htm::level(trixel_id) {
                        if let Some(set) = state.level_index.get_mut(&level) {
                            set.remove(&trixel_id);
                            if set.is_empty() {
                                state.level_index.remove(&level);
                            }
                        }
                    }
                }

                // Downstream consumers see the transition to empty.
                if outcome.update.value.is_some() || outcome.update.changed {
                    observations.push(Observation {
                        time: now,
                        trixel_id,
                        measurement_type,
                        value: None,
                        measurement_station_count: 0,
                        sensor_count: 0,
                    });
                }
                if outcome.update_tls {
                    counts.insert(trixel_id, 0);
                }
                continue;
            }

            if outcome.update.value.is_some() || outcome.update.changed {
                observations.push(Observation {
                    time: now,
                    trixel_id,
                    measurement_type,
                    value: outcome.update.value,
                    measurement_station_count: outcome.update.measurement_station_count,
                    sensor_count: outcome.update.sensor_count,
                });
            }
            if outcome.update_tls {
                counts.insert(trixel_id, outcome.update.measurement_station_count);
            }
        }

        (observations, counts)
    }

    /// Background task: wait for activation, seed the hierarchy with the
    /// populations known to the TLS, then run the sweep on a fixed cadence.
    /// An overrunning sweep skips tick boundaries instead of overlapping.
    pub async fn periodic_processing(self: Arc<Self>) {
        let mut status_rx = self.status_rx.clone();
        loop {
            let ready = {
                let status = status_rx.borrow();
                status.active && !status.delegations.is_empty()
            };
            if ready {
                break;
            }
            if status_rx.changed().await.is_err() {
                return;
            }
        }

        self.seed_from_tls().await;

        let period = self.config.tick_period();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            tracing::debug!("running periodic trixel evaluation");
            let started = Instant::now();
            self.process().await;
            let elapsed = started.elapsed();
            if elapsed > period {
                tracing::warn!(
                    "trixel sweep overran the tick period ({elapsed:?} > {period:?}), \
                     skipping to the next tick boundary"
                );
            }
        }
    }

    /// Pre-create privatizers for every trixel the TLS already reports as
    /// populated, so the hierarchy knows about existing populations.
    async fn seed_from_tls(&self) {
        let delegations = self.status_rx.borrow().delegations.clone();
        for measurement_type in MeasurementType::ALL {
            for delegation in delegations.iter().filter(|d| !d.exclude) {
                match self
                    .publisher
                    .fetch_populated_trixels(measurement_type, delegation.trixel_id)
                    .await
                {
                    Ok(trixels) => {
                        let mut state = self.state.lock().unwrap();
                        for trixel_id in trixels {
                            if htm::level(trixel_id)
                                .is_some_and(|level| level <= self.config.max_level)
                            {
                                self.ensure_privatizer(&mut state, trixel_id, measurement_type);
                            }
                        }
                    }
                    Err(e) if e.is_critical() => {
                        tracing::error!("critical TLS failure while seeding trixels: {e}");
                        self.shutdown.notify_waiters();
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "fetching populated trixels under {} failed: {e}",
                            delegation.trixel_id
                        );
                    }
                }
            }
        }
    }

    /// Test and introspection helper: the current station count of a
    /// privatizer's sub-tree, if it exists.
    pub fn trixel_ms_count(
        &self,
        measurement_type: MeasurementType,
        trixel_id: TrixelId,
    ) -> Option<u32> {
        let state = self.state.lock().unwrap();
        let map = state.privatizers.get(&measurement_type)?;
        map.get(&trixel_id)?;
        Some(Self::total_contributing_ms(map, trixel_id))
    }

    /// Test and introspection helper: a privatizer's last published value.
    pub fn trixel_value(
        &self,
        measurement_type: MeasurementType,
        trixel_id: TrixelId,
    ) -> Option<f64> {
        let state = self.state.lock().unwrap();
        state
            .privatizers
            .get(&measurement_type)
            .and_then(|map| map.get(&trixel_id))
            .and_then(|p| p.value())
    }

    /// Whether the trixel falls under this TMS's current delegations.
    pub fn is_delegated(&self, trixel_id: TrixelId) -> bool {
        htm::is_delegated(trixel_id, &self.status_rx.borrow().delegations)
    }

    /// Whether a privatizer currently exists for the trixel and type.
    pub fn has_privatizer(&self, measurement_type: MeasurementType, trixel_id: TrixelId) -> bool {
        let state = self.state.lock().unwrap();
        state
            .privatizers
            .get(&measurement_type)
            .is_some_and(|map| map.contains_key(&trixel_id))
    }

    /// Whether the sensor is currently routed anywhere.
    pub fn has_sensor(&self, sensor: UniqueSensorId) -> bool {
        self.state.lock().unwrap().sensor_map.contains_key(&sensor)
    }

    /// Privatizers (type, trixel) in which the sensor is attached non-shadow.
    pub fn non_shadow_memberships(&self, sensor: UniqueSensorId) -> Vec<(MeasurementType, TrixelId)> {
        let state = self.state.lock().unwrap();
        let mut memberships = Vec::new();
        for (measurement_type, map) in &state.privatizers {
            for (trixel_id, privatizer) in map {
                if privatizer.sensors().contains(&sensor) && !privatizer.in_shadow(sensor) {
                    memberships.push((*measurement_type, *trixel_id));
                }
            }
        }
        memberships
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::config::PrivatizerConfig;
    use crate::error::TlsError;
    use crate::schema::MeasurementType::AmbientTemperature as Temperature;

    use super::*;

    #[derive(Default)]
    struct StubPublisher {
        published: Mutex<Vec<(MeasurementType, HashMap<TrixelId, u32>)>>,
        populated: Mutex<HashMap<MeasurementType, HashSet<TrixelId>>>,
    }

    #[async_trait]
    impl CountPublisher for StubPublisher {
        async fn publish_counts(
            &self,
            measurement_type: MeasurementType,
            counts: &HashMap<TrixelId, u32>,
        ) -> Result<(), TlsError> {
            self.published.lock().unwrap().push((measurement_type, counts.clone()));
            Ok(())
        }

        async fn fetch_populated_trixels(
            &self,
            measurement_type: MeasurementType,
            under: TrixelId,
        ) -> Result<HashSet<TrixelId>, TlsError> {
            let populated = self.populated.lock().unwrap();
            Ok(populated
                .get(&measurement_type)
                .map(|set| {
                    set.iter().copied().filter(|&t| htm::is_descendant(t, under)).collect()
                })
                .unwrap_or_default())
        }
    }

    struct Harness {
        manager: Arc<PrivacyManager>,
        publisher: Arc<StubPublisher>,
        store: Arc<Store>,
        _status_tx: watch::Sender<TmsStatus>,
    }

    fn harness(privatizer: PrivatizerConfig, delegations: Vec<Delegation>) -> Harness {
        let config = Arc::new(Config { privatizer, ..Config::default() });
        let store = Arc::new(Store::open_in_memory().unwrap());
        let publisher = Arc::new(StubPublisher::default());
        let (status_tx, status_rx) =
            watch::channel(TmsStatus { active: true, delegations });
        let manager = Arc::new(PrivacyManager::new(
            config,
            store.clone(),
            publisher.clone(),
            status_rx,
        ));
        Harness { manager, publisher, store, _status_tx: status_tx }
    }

    fn all_roots() -> Vec<Delegation> {
        vec![
            Delegation { trixel_id: 2, exclude: false },
            Delegation { trixel_id: 3, exclude: false },
        ]
    }

    fn station(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn sensor(n: u128) -> UniqueSensorId {
        UniqueSensorId { ms_uuid: station(n), sensor_id: 0 }
    }

    fn measurement(value: f64) -> Measurement {
        Measurement { sensor_id: 0, value: Some(value), timestamp: Utc::now() }
    }

    fn assert_nonshadow_unique(manager: &PrivacyManager, sensors: &[UniqueSensorId]) {
        for s in sensors {
            let memberships = manager.non_shadow_memberships(*s);
            assert!(
                memberships.len() <= 1,
                "sensor {s} is non-shadow in several privatizers: {memberships:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_scenario_shadow_aggregation_satisfies_k_at_parent() {
        // Three stations target trixel 32 with k=3. Their contributions land
        // in the parent (8), which can satisfy k from shadow contributions.
        let h = harness(PrivatizerConfig::Latest, all_roots());
        let sensors: Vec<UniqueSensorId> = (1..=3).map(sensor).collect();

        for (i, s) in sensors.iter().enumerate() {
            let hint = h
                .manager
                .contribute(32, *s, measurement(20.0 + i as f64), Temperature, 3)
                .unwrap();
            assert_eq!(hint, LevelChange::Keep);
        }

        h.manager.process().await;

        assert_eq!(h.manager.trixel_ms_count(Temperature, 8), Some(3));
        // Values were absorbed in shadow mode, so no output yet.
        assert_eq!(h.manager.trixel_value(Temperature, 8), None);
        // The sub-trixel had no real members and was garbage collected.
        assert!(!h.manager.has_privatizer(Temperature, 32));
        assert_nonshadow_unique(&h.manager, &sensors);

        // The new count reached the TLS.
        {
            let published = h.publisher.published.lock().unwrap();
            assert!(
                published
                    .iter()
                    .any(|(t, counts)| *t == Temperature && counts.get(&8) == Some(&3)),
                "expected a count publish for trixel 8, got {published:?}"
            );
        }

        // Once unshadowed, the next round of contributions produces a value.
        for (i, s) in sensors.iter().enumerate() {
            let hint = h
                .manager
                .contribute(32, *s, measurement(20.0 + i as f64), Temperature, 3)
                .unwrap();
            assert_eq!(hint, LevelChange::Keep);
        }
        h.manager.process().await;
        assert_eq!(h.manager.trixel_ms_count(Temperature, 8), Some(3));
        assert!(h.manager.trixel_value(Temperature, 8).is_some());
        assert_nonshadow_unique(&h.manager, &sensors);
    }

    #[tokio::test]
    async fn test_scenario_root_parent_bootstraps_child() {
        // A single station targets trixel 8 whose parent is a root. With k=2
        // nothing may publish until a second station appears; then the child
        // itself satisfies k and the root privatizer disappears.
        let h = harness(PrivatizerConfig::Latest, all_roots());
        let s1 = sensor(1);

        let hint = h.manager.contribute(8, s1, measurement(20.0), Temperature, 2).unwrap();
        assert_eq!(hint, LevelChange::Keep);

        h.manager.process().await;
        assert_eq!(h.manager.trixel_ms_count(Temperature, 8), Some(0));
        assert_eq!(h.manager.trixel_value(Temperature, 8), None);

        let s2 = sensor(2);
        h.manager.contribute(8, s1, measurement(20.5), Temperature, 2).unwrap();
        h.manager.contribute(8, s2, measurement(21.5), Temperature, 2).unwrap();
        h.manager.process().await;

        assert_eq!(h.manager.trixel_ms_count(Temperature, 8), Some(2));
        assert!(!h.manager.has_privatizer(Temperature, 2));
        assert_nonshadow_unique(&h.manager, &[s1, s2]);

        // With the sensors unshadowed, the next round yields an output value.
        h.manager.contribute(8, s1, measurement(20.5), Temperature, 2).unwrap();
        h.manager.contribute(8, s2, measurement(21.5), Temperature, 2).unwrap();
        h.manager.process().await;
        assert!(h.manager.trixel_value(Temperature, 8).is_some());
    }

    #[tokio::test]
    async fn test_increase_hint_repeats_until_trixel_change() {
        let h = harness(PrivatizerConfig::Latest, all_roots());
        let s1 = sensor(1);
        let s2 = sensor(2);

        h.manager.contribute(8, s1, measurement(20.0), Temperature, 2).unwrap();
        h.manager.contribute(8, s2, measurement(21.0), Temperature, 2).unwrap();
        h.manager.process().await;
        assert_eq!(h.manager.trixel_ms_count(Temperature, 8), Some(2));

        // The trixel is populated and the sensor contributes for real, so the
        // client is told to move deeper, consistently, until it actually does.
        for _ in 0..3 {
            let hint = h.manager.contribute(8, s1, measurement(20.2), Temperature, 2).unwrap();
            assert_eq!(hint, LevelChange::Increase);
        }

        // The client re-negotiated a deeper trixel: no INCREASE any more.
        let hint = h.manager.contribute(33, s1, measurement(20.3), Temperature, 2).unwrap();
        assert_ne!(hint, LevelChange::Increase);
    }

    #[tokio::test]
    async fn test_batch_drops_non_delegated_trixels() {
        // Only the sub-tree below 8 is delegated here.
        let h = harness(
            PrivatizerConfig::Latest,
            vec![Delegation { trixel_id: 8, exclude: false }],
        );
        let ms = station(1);
        let sensor_types = HashMap::from([(0u32, Temperature)]);

        // 40 is outside the delegation; 33 is below trixel 8.
        let updates = HashMap::from([
            (40u64, vec![measurement(19.0)]),
            (33u64, vec![measurement(20.0)]),
        ]);
        let outcome = h.manager.batch_contribute(ms, &updates, &sensor_types, 2).unwrap();

        assert_eq!(outcome.wrong_tms, vec![40]);
        assert!(h.manager.has_sensor(UniqueSensorId { ms_uuid: ms, sensor_id: 0 }));
        assert!(h.manager.has_privatizer(Temperature, 33));
        assert!(!h.manager.has_privatizer(Temperature, 40));
    }

    #[tokio::test]
    async fn test_batch_rejects_unknown_sensor() {
        let h = harness(PrivatizerConfig::Latest, all_roots());
        let updates = HashMap::from([(8u64, vec![measurement(20.0)])]);
        let err = h
            .manager
            .batch_contribute(station(1), &updates, &HashMap::new(), 2)
            .unwrap_err();
        assert!(matches!(err, TmsError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_contribute_rejects_bad_levels() {
        let h = harness(PrivatizerConfig::Latest, all_roots());
        // Root level is not a valid contribution target.
        let err = h
            .manager
            .contribute(2, sensor(1), measurement(20.0), Temperature, 2)
            .unwrap_err();
        assert!(matches!(err, TmsError::InvalidInput(_)));

        // Malformed id.
        let err = h
            .manager
            .contribute(5, sensor(1), measurement(20.0), Temperature, 2)
            .unwrap_err();
        assert!(matches!(err, TmsError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_repeated_contribution_is_stable() {
        let h = harness(PrivatizerConfig::Latest, all_roots());
        let s1 = sensor(1);
        let m = measurement(20.0);

        let first = h.manager.contribute(8, s1, m.clone(), Temperature, 2).unwrap();
        let memberships_before = h.manager.non_shadow_memberships(s1);
        let second = h.manager.contribute(8, s1, m, Temperature, 2).unwrap();

        // Identical submissions route identically; only first_contribution
        // differs, which never upgrades a Keep to Increase here.
        assert_eq!(first, LevelChange::Keep);
        assert_eq!(second, LevelChange::Keep);
        assert_eq!(h.manager.non_shadow_memberships(s1), memberships_before);
    }

    #[tokio::test]
    async fn test_silent_sensor_is_removed_and_final_observation_emitted() {
        let h = harness(PrivatizerConfig::Latest, all_roots());
        let s1 = sensor(1);
        let s2 = sensor(2);
        h.manager.contribute(8, s1, measurement(20.0), Temperature, 2).unwrap();
        h.manager.contribute(8, s2, measurement(21.0), Temperature, 2).unwrap();

        h.manager.process().await;
        assert_eq!(h.manager.trixel_ms_count(Temperature, 8), Some(2));

        // Nobody publishes before the next tick: the latest policy treats a
        // whole missed tick as staleness and drops both sensors.
        h.manager.process().await;
        assert!(!h.manager.has_sensor(s1));
        assert!(!h.manager.has_sensor(s2));
        assert!(!h.manager.has_privatizer(Temperature, 8));

        // The transition to empty was persisted for downstream consumers.
        let (total, non_null) = h
            .store
            .get_observation_count(8, Temperature, chrono::Duration::hours(1))
            .unwrap();
        assert!(total > non_null, "expected a final unknown observation");
    }

    #[tokio::test]
    async fn test_remove_sensor_clears_both_privatizers() {
        let h = harness(PrivatizerConfig::Latest, all_roots());
        let s1 = sensor(1);
        h.manager.contribute(8, s1, measurement(20.0), Temperature, 2).unwrap();
        assert!(h.manager.has_sensor(s1));

        h.manager.remove_sensor(s1);
        assert!(!h.manager.has_sensor(s1));
        assert!(h.manager.non_shadow_memberships(s1).is_empty());
    }

    #[tokio::test]
    async fn test_seeding_creates_privatizers_with_ancestors() {
        let h = harness(PrivatizerConfig::Latest, vec![Delegation { trixel_id: 2, exclude: false }]);
        h.publisher
            .populated
            .lock()
            .unwrap()
            .insert(Temperature, HashSet::from([32]));

        h.manager.seed_from_tls().await;

        assert!(h.manager.has_privatizer(Temperature, 32));
        // The ancestor chain was materialized as well.
        assert!(h.manager.has_privatizer(Temperature, 8));
        assert!(h.manager.has_privatizer(Temperature, 2));
        assert!(!h.manager.has_privatizer(MeasurementType::RelativeHumidity, 32));
    }

    #[tokio::test]
    async fn test_published_count_respects_k_floor() {
        // Property: a published non-zero count is at least the smallest k of
        // the stations contributing to the trixel.
        let h = harness(PrivatizerConfig::Latest, all_roots());
        let sensors: Vec<UniqueSensorId> = (1..=3).map(sensor).collect();
        for s in &sensors {
            h.manager.contribute(32, *s, measurement(20.0), Temperature, 3).unwrap();
        }
        h.manager.process().await;

        let published = h.publisher.published.lock().unwrap();
        for (_, counts) in published.iter() {
            for (&trixel, &count) in counts {
                if count > 0 {
                    assert!(count >= 3, "trixel {trixel} published count {count} below k");
                }
            }
        }
    }
}

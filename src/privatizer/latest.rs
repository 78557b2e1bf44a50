//! The simplest value-producing policy: accept every sensor and publish the
//! latest raw measurement, or the average of the child trixels if any exist.

use std::collections::HashSet;

use crate::schema::{Measurement, UniqueSensorId};

use super::{CoreView, TickContext};

#[derive(Default)]
pub struct LatestPolicy {
    last_value: Option<f64>,
    /// Sensors that delivered a value since the previous tick. Anything that
    /// missed a whole tick is treated as stale.
    current_contributors: HashSet<UniqueSensorId>,
}

impl LatestPolicy {
    pub fn new_value(
        &mut self,
        core: &CoreView<'_>,
        sensor: UniqueSensorId,
        measurement: &Measurement,
    ) {
        if !core.in_shadow(sensor) {
            if let Some(value) = measurement.value {
                self.last_value = Some(value);
            }
        }
        self.current_contributors.insert(sensor);
    }

    pub fn on_sensor_removed(&mut self, sensor: UniqueSensorId) {
        self.current_contributors.remove(&sensor);
    }

    pub fn stale_sensors(&self, core: &CoreView<'_>) -> Vec<UniqueSensorId> {
        core.sensors
            .iter()
            .filter(|s| !self.current_contributors.contains(s))
            .copied()
            .collect()
    }

    pub fn end_tick(&mut self) {
        self.current_contributors.clear();
    }

    pub fn get_value(&self, ctx: &TickContext) -> Option<f64> {
        let mut child_sum = 0.0;
        let mut child_count = 0u32;
        for child in &ctx.children {
            if let Some(value) = child.value {
                child_sum += value;
                child_count += 1;
            }
        }
        if child_count > 0 {
            Some(child_sum / child_count as f64)
        } else {
            self.last_value
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use uuid::Uuid;

    use crate::htm::TrixelId;
    use crate::schema::MeasurementType;
    use crate::store::Store;

    use super::super::ChildStats;
    use super::*;

    fn sensor(n: u128) -> UniqueSensorId {
        UniqueSensorId { ms_uuid: Uuid::from_u128(n), sensor_id: 0 }
    }

    fn ctx_with_children(children: Vec<ChildStats>) -> TickContext {
        TickContext {
            now: Utc::now(),
            tick_period_secs: 60,
            children,
            ancestors: Vec::new(),
            store: Arc::new(Store::open_in_memory().unwrap()),
            k_map: Arc::new(HashMap::new()),
            lifecycles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn core<'a>(
        sensors: &'a HashSet<UniqueSensorId>,
        shadow: &'a HashMap<UniqueSensorId, bool>,
    ) -> CoreView<'a> {
        CoreView {
            id: 8,
            level: 1,
            measurement_type: MeasurementType::AmbientTemperature,
            parent: Some(2),
            sensors,
            shadow,
        }
    }

    fn measurement(value: Option<f64>) -> Measurement {
        Measurement { sensor_id: 0, value, timestamp: Utc::now() }
    }

    #[test]
    fn test_shadow_values_are_ignored() {
        let mut policy = LatestPolicy::default();
        let sensors = HashSet::from([sensor(1)]);
        let shadow = HashMap::from([(sensor(1), true)]);
        policy.new_value(&core(&sensors, &shadow), sensor(1), &measurement(Some(21.0)));
        assert_eq!(policy.get_value(&ctx_with_children(Vec::new())), None);

        let shadow = HashMap::from([(sensor(1), false)]);
        policy.new_value(&core(&sensors, &shadow), sensor(1), &measurement(Some(21.5)));
        assert_eq!(policy.get_value(&ctx_with_children(Vec::new())), Some(21.5));
    }

    #[test]
    fn test_children_average_wins_over_local() {
        let mut policy = LatestPolicy::default();
        let sensors = HashSet::from([sensor(1)]);
        let shadow = HashMap::from([(sensor(1), false)]);
        policy.new_value(&core(&sensors, &shadow), sensor(1), &measurement(Some(30.0)));

        let children = vec![
            ChildStats {
                trixel_id: 32 as TrixelId,
                value: Some(10.0),
                total_ms_count: 2,
                total_sensor_count: 2,
                average_accuracy: None,
            },
            ChildStats {
                trixel_id: 33,
                value: Some(20.0),
                total_ms_count: 2,
                total_sensor_count: 2,
                average_accuracy: None,
            },
            ChildStats {
                trixel_id: 34,
                value: None,
                total_ms_count: 0,
                total_sensor_count: 0,
                average_accuracy: None,
            },
        ];
        assert_eq!(policy.get_value(&ctx_with_children(children)), Some(15.0));
    }

    #[test]
    fn test_missed_tick_marks_sensor_stale() {
        let mut policy = LatestPolicy::default();
        let sensors = HashSet::from([sensor(1), sensor(2)]);
        let shadow = HashMap::new();
        policy.new_value(&core(&sensors, &shadow), sensor(1), &measurement(Some(20.0)));

        let stale = policy.stale_sensors(&core(&sensors, &shadow));
        assert_eq!(stale, vec![sensor(2)]);

        policy.end_tick();
        // After the tick boundary every sensor must report again.
        let stale = policy.stale_sensors(&core(&sensors, &shadow));
        assert_eq!(stale.len(), 2);
    }
}

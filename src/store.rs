use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::config::Statistic;
use crate::error::TmsError;
use crate::htm::TrixelId;
use crate::schema::{Measurement, MeasurementType, Observation, UniqueSensorId};

/// Persistent store for raw sensor measurements, the sensor registry and
/// published observations.
pub struct Store {
    conn: Mutex<Connection>,
}

/// Fixed-width UTC timestamp format; lexicographic order equals time order.
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

fn fmt_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Store {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self { conn: Mutex::new(conn) };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sensor_measurement (
                time      TEXT    NOT NULL,
                ms_uuid   TEXT    NOT NULL,
                sensor_id INTEGER NOT NULL,
                value     REAL,
                UNIQUE (ms_uuid, sensor_id, time)
            );
            CREATE INDEX IF NOT EXISTS idx_measurement_sensor_time
                ON sensor_measurement(ms_uuid, sensor_id, time DESC);

            CREATE TABLE IF NOT EXISTS observation (
                time                      TEXT    NOT NULL,
                trixel_id                 INTEGER NOT NULL,
                measurement_type          INTEGER NOT NULL,
                value                     REAL,
                measurement_station_count INTEGER NOT NULL CHECK(measurement_station_count >= 0),
                sensor_count              INTEGER NOT NULL CHECK(sensor_count >= 0),
                UNIQUE (time, trixel_id, measurement_type)
            );
            CREATE INDEX IF NOT EXISTS idx_observation_trixel
                ON observation(trixel_id, measurement_type, time DESC);

            CREATE TABLE IF NOT EXISTS sensor (
                ms_uuid          TEXT    NOT NULL,
                sensor_id        INTEGER NOT NULL,
                measurement_type INTEGER NOT NULL,
                accuracy         REAL,
                PRIMARY KEY (ms_uuid, sensor_id)
            );
            ",
        )?;
        Ok(())
    }

    /// Insert one raw measurement row. A duplicate `(station, sensor, time)`
    /// is a client error and leaves the store unchanged.
    pub fn insert_measurement(
        &self,
        ms_uuid: Uuid,
        measurement: &Measurement,
    ) -> Result<(), TmsError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sensor_measurement (time, ms_uuid, sensor_id, value) VALUES (?1, ?2, ?3, ?4)",
            params![
                fmt_time(measurement.timestamp),
                ms_uuid.to_string(),
                measurement.sensor_id,
                measurement.value,
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                TmsError::InvalidInput(format!(
                    "duplicate measurement for sensor {}/{} at {}",
                    ms_uuid, measurement.sensor_id, measurement.timestamp
                ))
            } else {
                TmsError::Store(e)
            }
        })?;
        Ok(())
    }

    /// Register or refresh a sensor's type and reported accuracy.
    pub fn upsert_sensor(
        &self,
        sensor: UniqueSensorId,
        measurement_type: MeasurementType,
        accuracy: Option<f64>,
    ) -> Result<(), TmsError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sensor (ms_uuid, sensor_id, measurement_type, accuracy) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(ms_uuid, sensor_id) DO UPDATE SET measurement_type = ?3, accuracy = ?4",
            params![
                sensor.ms_uuid.to_string(),
                sensor.sensor_id,
                measurement_type.id(),
                accuracy,
            ],
        )?;
        Ok(())
    }

    pub fn get_sensor_accuracy(&self, sensor: UniqueSensorId) -> Result<Option<f64>, TmsError> {
        let conn = self.conn.lock().unwrap();
        let accuracy: Option<Option<f64>> = conn
            .query_row(
                "SELECT accuracy FROM sensor WHERE ms_uuid = ?1 AND sensor_id = ?2",
                params![sensor.ms_uuid.to_string(), sensor.sensor_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(accuracy.flatten())
    }

    /// Insert one tick's observations in a single transaction. Any failure
    /// abandons the whole batch; the next tick converges.
    pub fn insert_observations(&self, observations: &[Observation]) -> Result<(), TmsError> {
        if observations.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO observation
                 (time, trixel_id, measurement_type, value, measurement_station_count, sensor_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for obs in observations {
                stmt.execute(params![
                    fmt_time(obs.time),
                    obs.trixel_id as i64,
                    obs.measurement_type.id(),
                    obs.value,
                    obs.measurement_station_count,
                    obs.sensor_count,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Median or mean of the given sensors' values within the window.
    pub fn get_sensors_statistic(
        &self,
        statistic: Statistic,
        sensors: &HashSet<UniqueSensorId>,
        window: Duration,
    ) -> Result<Option<f64>, TmsError> {
        if sensors.is_empty() {
            return Ok(None);
        }

        let cutoff = fmt_time(Utc::now() - window);
        let mut clauses = Vec::new();
        let mut bind: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(cutoff)];
        for sensor in sensors {
            let base = bind.len();
            clauses.push(format!("(ms_uuid = ?{} AND sensor_id = ?{})", base + 1, base + 2));
            bind.push(Box::new(sensor.ms_uuid.to_string()));
            bind.push(Box::new(sensor.sensor_id));
        }
        let matcher = clauses.join(" OR ");
        let bind_refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();

        let conn = self.conn.lock().unwrap();
        match statistic {
            Statistic::Average => {
                let avg: Option<f64> = conn.query_row(
                    &format!(
                        "SELECT AVG(value) FROM sensor_measurement WHERE time > ?1 AND ({matcher})"
                    ),
                    bind_refs.as_slice(),
                    |row| row.get(0),
                )?;
                Ok(avg)
            }
            Statistic::Median => {
                let count: i64 = conn.query_row(
                    &format!(
                        "SELECT COUNT(value) FROM sensor_measurement
                         WHERE time > ?1 AND value IS NOT NULL AND ({matcher})"
                    ),
                    bind_refs.as_slice(),
                    |row| row.get(0),
                )?;
                if count == 0 {
                    return Ok(None);
                }
                let median: Option<f64> = conn
                    .query_row(
                        &format!(
                            "SELECT value FROM sensor_measurement
                             WHERE time > ?1 AND value IS NOT NULL AND ({matcher})
                             ORDER BY value LIMIT 1 OFFSET {}",
                            count / 2
                        ),
                        bind_refs.as_slice(),
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(median)
            }
        }
    }

    /// Median or mean of a trixel's published observation values in the window.
    pub fn get_trixel_statistic(
        &self,
        statistic: Statistic,
        trixel_id: TrixelId,
        measurement_type: MeasurementType,
        window: Duration,
    ) -> Result<Option<f64>, TmsError> {
        let cutoff = fmt_time(Utc::now() - window);
        let conn = self.conn.lock().unwrap();
        match statistic {
            Statistic::Average => {
                let avg: Option<f64> = conn.query_row(
                    "SELECT AVG(value) FROM observation
                     WHERE trixel_id = ?1 AND measurement_type = ?2 AND time > ?3",
                    params![trixel_id as i64, measurement_type.id(), cutoff],
                    |row| row.get(0),
                )?;
                Ok(avg)
            }
            Statistic::Median => {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(value) FROM observation
                     WHERE trixel_id = ?1 AND measurement_type = ?2 AND value IS NOT NULL AND time > ?3",
                    params![trixel_id as i64, measurement_type.id(), cutoff],
                    |row| row.get(0),
                )?;
                if count == 0 {
                    return Ok(None);
                }
                let median: Option<f64> = conn
                    .query_row(
                        &format!(
                            "SELECT value FROM observation
                             WHERE trixel_id = ?1 AND measurement_type = ?2 AND value IS NOT NULL AND time > ?3
                             ORDER BY value LIMIT 1 OFFSET {}",
                            count / 2
                        ),
                        params![trixel_id as i64, measurement_type.id(), cutoff],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(median)
            }
        }
    }

    /// Number of measurement rows for a sensor within the window:
    /// `(total, non-null)`.
    pub fn get_measurement_count(
        &self,
        sensor: UniqueSensorId,
        window: Duration,
    ) -> Result<(u64, u64), TmsError> {
        let cutoff = fmt_time(Utc::now() - window);
        let conn = self.conn.lock().unwrap();
        let counts = conn.query_row(
            "SELECT COUNT(time), COUNT(value) FROM sensor_measurement
             WHERE ms_uuid = ?1 AND sensor_id = ?2 AND time > ?3",
            params![sensor.ms_uuid.to_string(), sensor.sensor_id, cutoff],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
        )?;
        Ok(counts)
    }

    /// Number of observation rows for a trixel within the window:
    /// `(total, non-null)`.
    pub fn get_observation_count(
        &self,
        trixel_id: TrixelId,
        measurement_type: MeasurementType,
        window: Duration,
    ) -> Result<(u64, u64), TmsError> {
        let cutoff = fmt_time(Utc::now() - window);
        let conn = self.conn.lock().unwrap();
        let counts = conn.query_row(
            "SELECT COUNT(time), COUNT(value) FROM observation
             WHERE trixel_id = ?1 AND measurement_type = ?2 AND time > ?3",
            params![trixel_id as i64, measurement_type.id(), cutoff],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
        )?;
        Ok(counts)
    }

    /// Time since the sensor's oldest measurement within `window_cap`, or
    /// `None` if it has none. Capping the lookback keeps long-gone sensors
    /// from reappearing with their full historical age.
    pub fn get_sensor_age(
        &self,
        sensor: UniqueSensorId,
        window_cap: Duration,
    ) -> Result<Option<Duration>, TmsError> {
        let now = Utc::now();
        let cutoff = fmt_time(now - window_cap);
        let conn = self.conn.lock().unwrap();
        let oldest: Option<String> = conn.query_row(
            "SELECT MIN(time) FROM sensor_measurement
             WHERE ms_uuid = ?1 AND sensor_id = ?2 AND time > ?3",
            params![sensor.ms_uuid.to_string(), sensor.sensor_id, cutoff],
            |row| row.get(0),
        )?;
        Ok(oldest.as_deref().and_then(parse_time).map(|t| now - t))
    }

    /// Delete raw measurements older than `cutoff`. Returns the row count.
    pub fn purge_old_sensor_data(&self, cutoff: DateTime<Utc>) -> Result<usize, TmsError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM sensor_measurement WHERE time <= ?1",
            params![fmt_time(cutoff)],
        )?;
        Ok(deleted)
    }
}

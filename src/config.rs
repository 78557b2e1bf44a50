use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Deserialize;

use crate::schema::MeasurementType;

/// Top-level config loaded from `tms.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Deepest trixel level this TMS accepts contributions for (1..=24).
    #[serde(default = "default_max_level")]
    pub max_level: u8,
    /// Seconds between bottom-up aggregation sweeps.
    #[serde(default = "default_update_frequency")]
    pub trixel_update_frequency_secs: u64,
    #[serde(default = "default_keep_interval")]
    pub sensor_data_keep_interval_secs: u64,
    #[serde(default = "default_purge_interval")]
    pub sensor_data_purge_interval_secs: u64,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub privatizer: PrivatizerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_level: default_max_level(),
            trixel_update_frequency_secs: default_update_frequency(),
            sensor_data_keep_interval_secs: default_keep_interval(),
            sensor_data_purge_interval_secs: default_purge_interval(),
            tls: TlsConfig::default(),
            store: StoreConfig::default(),
            privatizer: PrivatizerConfig::default(),
        }
    }
}

fn default_max_level() -> u8 {
    20
}

fn default_update_frequency() -> u64 {
    60
}

fn default_keep_interval() -> u64 {
    14 * 24 * 3600
}

fn default_purge_interval() -> u64 {
    3600
}

impl Config {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=24).contains(&self.max_level) {
            anyhow::bail!("max_level must be within 1..=24, got {}", self.max_level);
        }
        if self.trixel_update_frequency_secs == 0 {
            anyhow::bail!("trixel_update_frequency_secs must be positive");
        }
        Ok(())
    }

    pub fn tick_period(&self) -> StdDuration {
        StdDuration::from_secs(self.trixel_update_frequency_secs)
    }

    pub fn sensor_data_keep_interval(&self) -> Duration {
        Duration::seconds(self.sensor_data_keep_interval_secs as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Host of the trixel lookup service, e.g. `lookup.example.org`.
    #[serde(default = "default_tls_host")]
    pub host: String,
    #[serde(default = "default_true")]
    pub use_ssl: bool,
    /// Id assigned to this TMS by the TLS.
    pub tms_id: Option<u64>,
    /// Bearer token; usually supplied via the TMS_API_TOKEN env variable.
    pub api_token: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            host: default_tls_host(),
            use_ssl: true,
            tms_id: None,
            api_token: None,
        }
    }
}

fn default_tls_host() -> String {
    "localhost:8000".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

fn default_store_path() -> String {
    "./tms.db".to_string()
}

/// Selects the active privatizer policy and carries its parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "privatizer", rename_all = "snake_case")]
pub enum PrivatizerConfig {
    Blank,
    Latest,
    NaiveAverage(NaiveAverageConfig),
    NaiveSmoothingAverage(NaiveSmoothingAverageConfig),
    NaiveKalman(NaiveKalmanConfig),
    Average {
        #[serde(default)]
        correlation: CorrelationConfig,
        #[serde(default)]
        average: NaiveAverageConfig,
    },
    SmoothingAverage {
        #[serde(default)]
        correlation: CorrelationConfig,
        #[serde(default)]
        average: NaiveSmoothingAverageConfig,
    },
    Kalman {
        #[serde(default)]
        correlation: CorrelationConfig,
        #[serde(default)]
        kalman: NaiveKalmanConfig,
    },
}

impl Default for PrivatizerConfig {
    fn default() -> Self {
        PrivatizerConfig::NaiveAverage(NaiveAverageConfig::default())
    }
}

impl PrivatizerConfig {
    pub fn name(&self) -> &'static str {
        match self {
            PrivatizerConfig::Blank => "blank",
            PrivatizerConfig::Latest => "latest",
            PrivatizerConfig::NaiveAverage(_) => "naive_average",
            PrivatizerConfig::NaiveSmoothingAverage(_) => "naive_smoothing_average",
            PrivatizerConfig::NaiveKalman(_) => "naive_kalman",
            PrivatizerConfig::Average { .. } => "average",
            PrivatizerConfig::SmoothingAverage { .. } => "smoothing_average",
            PrivatizerConfig::Kalman { .. } => "kalman",
        }
    }
}

/// Staleness and update-interval smoothing parameters shared by the value
/// aggregating policies.
#[derive(Debug, Clone, Deserialize)]
pub struct NaiveAverageConfig {
    /// Oldest accepted measurement age; also bounds stale sensor detection.
    #[serde(default = "default_max_measurement_age")]
    pub max_measurement_age_secs: u64,
    /// Oldest measurement age still pooled into the output value.
    #[serde(default = "default_max_measurement_age_averaging")]
    pub max_measurement_age_averaging_secs: u64,
    /// Allowed missed updates relative to the sensor's average update interval.
    #[serde(default = "default_missed_update_threshold")]
    pub missed_update_threshold: f64,
    /// Exponential smoothing weight for the per-sensor update interval.
    #[serde(default = "default_update_interval_weight")]
    pub update_interval_weight: f64,
}

impl Default for NaiveAverageConfig {
    fn default() -> Self {
        Self {
            max_measurement_age_secs: default_max_measurement_age(),
            max_measurement_age_averaging_secs: default_max_measurement_age_averaging(),
            missed_update_threshold: default_missed_update_threshold(),
            update_interval_weight: default_update_interval_weight(),
        }
    }
}

impl NaiveAverageConfig {
    pub fn max_measurement_age(&self) -> Duration {
        Duration::seconds(self.max_measurement_age_secs as i64)
    }

    pub fn max_measurement_age_averaging(&self) -> Duration {
        Duration::seconds(self.max_measurement_age_averaging_secs as i64)
    }
}

fn default_max_measurement_age() -> u64 {
    300
}

fn default_max_measurement_age_averaging() -> u64 {
    150
}

fn default_missed_update_threshold() -> f64 {
    2.0
}

fn default_update_interval_weight() -> f64 {
    0.1
}

#[derive(Debug, Clone, Deserialize)]
pub struct NaiveSmoothingAverageConfig {
    #[serde(flatten)]
    pub average: NaiveAverageConfig,
    /// Exponential smoothing factor applied to the aggregate local sum.
    #[serde(default = "default_local_smooth_factor")]
    pub local_smooth_factor: f64,
    /// Exponential smoothing factor applied to the aggregate child sum.
    #[serde(default = "default_child_smooth_factor")]
    pub child_smooth_factor: f64,
}

impl Default for NaiveSmoothingAverageConfig {
    fn default() -> Self {
        Self {
            average: NaiveAverageConfig::default(),
            local_smooth_factor: default_local_smooth_factor(),
            child_smooth_factor: default_child_smooth_factor(),
        }
    }
}

fn default_local_smooth_factor() -> f64 {
    0.5
}

fn default_child_smooth_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct NaiveKalmanConfig {
    #[serde(flatten)]
    pub average: NaiveAverageConfig,
    /// Process uncertainty of the filter over one tick period.
    #[serde(default = "default_process_std")]
    pub process_std_per_step: f64,
    /// Accuracy assumed for sensors that do not report one.
    #[serde(default = "default_sensor_accuracy")]
    pub default_sensor_accuracy: BTreeMap<MeasurementType, f64>,
    /// Accuracy assumed for child trixels without a known average accuracy.
    #[serde(default = "default_child_accuracy")]
    pub default_child_trixel_accuracy: BTreeMap<MeasurementType, f64>,
}

impl Default for NaiveKalmanConfig {
    fn default() -> Self {
        Self {
            average: NaiveAverageConfig::default(),
            process_std_per_step: default_process_std(),
            default_sensor_accuracy: default_sensor_accuracy(),
            default_child_trixel_accuracy: default_child_accuracy(),
        }
    }
}

fn default_process_std() -> f64 {
    1.0
}

fn default_sensor_accuracy() -> BTreeMap<MeasurementType, f64> {
    MeasurementType::ALL.into_iter().map(|t| (t, 1.0)).collect()
}

fn default_child_accuracy() -> BTreeMap<MeasurementType, f64> {
    MeasurementType::ALL.into_iter().map(|t| (t, 0.1)).collect()
}

/// Which statistic the correlation gate compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Median,
    #[default]
    Average,
}

/// One correlation check window with per-type tolerance.
#[derive(Debug, Clone, Deserialize)]
pub struct StatisticWindow {
    pub window_secs: u64,
    pub max_delta: BTreeMap<MeasurementType, f64>,
}

impl StatisticWindow {
    fn uniform(window_secs: u64, delta: f64) -> Self {
        Self {
            window_secs,
            max_delta: MeasurementType::ALL.into_iter().map(|t| (t, delta)).collect(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }

    pub fn max_delta(&self, measurement_type: MeasurementType) -> f64 {
        self.max_delta.get(&measurement_type).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationConfig {
    #[serde(default)]
    pub statistic: Statistic,

    /// A trixel may only sub-divide once it has observation history covering
    /// this much time (measured on the parent trixel), always allowed at root.
    #[serde(default = "default_subdivision_time_requirement")]
    pub subdivision_time_requirement_secs: u64,
    /// Fraction of the expected observation count that must be present.
    #[serde(default = "default_subdivision_time_threshold")]
    pub subdivision_time_threshold: f64,

    #[serde(default = "default_minimum_sensor_age")]
    pub minimum_sensor_age_secs: u64,
    #[serde(default = "default_age_evaluation_interval")]
    pub age_evaluation_interval_secs: u64,

    #[serde(default = "default_uptime_requirement")]
    pub uptime_requirement: f64,
    #[serde(default = "default_max_update_interval")]
    pub max_update_interval_secs: u64,
    #[serde(default = "default_uptime_evaluation_interval")]
    pub uptime_evaluation_interval_secs: u64,
    /// Base window for the bracketing uptime estimate; the extended window is
    /// this times `uptime_long_time_multiplier`.
    #[serde(default = "default_uptime_base_window")]
    pub uptime_base_window_secs: u64,
    #[serde(default = "default_uptime_long_time_multiplier")]
    pub uptime_long_time_multiplier: u32,

    /// Below this level the local check runs, from it upward the trixel check.
    #[serde(default = "default_split_level")]
    pub split_level: u8,
    /// Local check population requirement; below it sensors keep their state.
    #[serde(default = "default_local_check_minimum_sensor_count")]
    pub local_check_minimum_sensor_count: usize,
    #[serde(default = "default_local_windows")]
    pub local_windows: Vec<StatisticWindow>,
    #[serde(default = "default_local_threshold")]
    pub local_correlation_threshold: f64,

    #[serde(default = "default_trixel_windows")]
    pub trixel_windows: Vec<StatisticWindow>,
    #[serde(default = "default_trixel_threshold")]
    pub trixel_correlation_threshold: f64,
    /// How many ancestor generations the trixel check walks (the immediate
    /// parent is always skipped).
    #[serde(default = "default_check_generations")]
    pub check_generations: u32,
    /// Level at which the trixel tolerances apply exactly; shallower levels
    /// scale them up by `level_scale_factor` per level.
    #[serde(default = "default_target_level")]
    pub target_level: u8,
    #[serde(default = "default_level_scale_factor")]
    pub level_scale_factor: f64,

    /// A cached statistic for a window is invalidated after window / factor.
    #[serde(default = "default_cache_invalidation_factor")]
    pub cache_invalidation_factor: u32,

    #[serde(default = "default_ema_smoothing_factor")]
    pub ema_smoothing_factor: f64,
    /// Deviation from the sensor EMA beyond which a measurement is treated as
    /// impulse noise and blanked.
    #[serde(default = "default_impulse_noise_threshold")]
    pub impulse_noise_threshold: BTreeMap<MeasurementType, f64>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            statistic: Statistic::default(),
            subdivision_time_requirement_secs: default_subdivision_time_requirement(),
            subdivision_time_threshold: default_subdivision_time_threshold(),
            minimum_sensor_age_secs: default_minimum_sensor_age(),
            age_evaluation_interval_secs: default_age_evaluation_interval(),
            uptime_requirement: default_uptime_requirement(),
            max_update_interval_secs: default_max_update_interval(),
            uptime_evaluation_interval_secs: default_uptime_evaluation_interval(),
            uptime_base_window_secs: default_uptime_base_window(),
            uptime_long_time_multiplier: default_uptime_long_time_multiplier(),
            split_level: default_split_level(),
            local_check_minimum_sensor_count: default_local_check_minimum_sensor_count(),
            local_windows: default_local_windows(),
            local_correlation_threshold: default_local_threshold(),
            trixel_windows: default_trixel_windows(),
            trixel_correlation_threshold: default_trixel_threshold(),
            check_generations: default_check_generations(),
            target_level: default_target_level(),
            level_scale_factor: default_level_scale_factor(),
            cache_invalidation_factor: default_cache_invalidation_factor(),
            ema_smoothing_factor: default_ema_smoothing_factor(),
            impulse_noise_threshold: default_impulse_noise_threshold(),
        }
    }
}

impl CorrelationConfig {
    pub fn subdivision_time_requirement(&self) -> Duration {
        Duration::seconds(self.subdivision_time_requirement_secs as i64)
    }

    pub fn minimum_sensor_age(&self) -> Duration {
        Duration::seconds(self.minimum_sensor_age_secs as i64)
    }

    pub fn age_evaluation_interval(&self) -> Duration {
        Duration::seconds(self.age_evaluation_interval_secs as i64)
    }

    pub fn max_update_interval(&self) -> Duration {
        Duration::seconds(self.max_update_interval_secs as i64)
    }

    pub fn uptime_evaluation_interval(&self) -> Duration {
        Duration::seconds(self.uptime_evaluation_interval_secs as i64)
    }

    pub fn uptime_base_window(&self) -> Duration {
        Duration::seconds(self.uptime_base_window_secs as i64)
    }

    /// Longest configured trixel correlation window, used as the sensor age cap.
    pub fn max_window(&self) -> Duration {
        let secs = self
            .trixel_windows
            .iter()
            .map(|w| w.window_secs)
            .max()
            .unwrap_or(default_uptime_base_window());
        Duration::seconds(secs as i64)
    }

    /// How long a cached statistic for `window` stays valid.
    pub fn cache_validity(&self, window: Duration) -> Duration {
        window / self.cache_invalidation_factor.max(1) as i32
    }
}

fn default_subdivision_time_requirement() -> u64 {
    2 * 24 * 3600
}

fn default_subdivision_time_threshold() -> f64 {
    0.8
}

fn default_minimum_sensor_age() -> u64 {
    24 * 3600
}

fn default_age_evaluation_interval() -> u64 {
    12 * 3600
}

fn default_uptime_requirement() -> f64 {
    0.95
}

fn default_max_update_interval() -> u64 {
    600
}

fn default_uptime_evaluation_interval() -> u64 {
    12 * 3600
}

fn default_uptime_base_window() -> u64 {
    24 * 3600
}

fn default_uptime_long_time_multiplier() -> u32 {
    7
}

fn default_split_level() -> u8 {
    2
}

fn default_local_check_minimum_sensor_count() -> usize {
    15
}

fn default_local_windows() -> Vec<StatisticWindow> {
    vec![
        StatisticWindow::uniform(24 * 3600, 1.75),
        StatisticWindow::uniform(7 * 24 * 3600, 1.0),
        StatisticWindow::uniform(14 * 24 * 3600, 0.8),
    ]
}

fn default_local_threshold() -> f64 {
    0.6
}

fn default_trixel_windows() -> Vec<StatisticWindow> {
    vec![
        StatisticWindow::uniform(24 * 3600, 2.0),
        StatisticWindow::uniform(7 * 24 * 3600, 1.0),
        StatisticWindow::uniform(14 * 24 * 3600, 0.75),
    ]
}

fn default_trixel_threshold() -> f64 {
    0.3
}

fn default_check_generations() -> u32 {
    2
}

fn default_target_level() -> u8 {
    8
}

fn default_level_scale_factor() -> f64 {
    0.1
}

fn default_cache_invalidation_factor() -> u32 {
    4
}

fn default_ema_smoothing_factor() -> f64 {
    0.2
}

fn default_impulse_noise_threshold() -> BTreeMap<MeasurementType, f64> {
    MeasurementType::ALL.into_iter().map(|t| (t, 7.0)).collect()
}

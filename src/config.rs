use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::TrackerError;
use crate::tracking::{ConditionerConfig, Provider, TripConfig};

const CONFIG_DIR_NAME: &str = "cartracker";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct TrackerConfig {
    pub conditioner: ConditionerConfig,
    pub trip: TripConfig,
    /// The only provider allowed to drive trip logic
    pub designated_provider: Provider,
}

impl TrackerConfig {
    pub fn default_path() -> Option<PathBuf> {
        Some(
            dirs::config_dir()?
                .join(CONFIG_DIR_NAME)
                .join(CONFIG_FILE_NAME),
        )
    }

    /// Loads the config from the application config directory, None when no
    /// config file was saved yet
    pub fn from_local_file() -> Result<Option<Self>, TrackerError> {
        match Self::default_path() {
            Some(config_path) if config_path.exists() => Self::from_path(&config_path).map(Some),
            _ => Ok(None),
        }
    }

    pub fn from_path(config_path: &Path) -> Result<Self, TrackerError> {
        debug!("Loading config from {:?}", config_path);
        let file = std::fs::File::open(config_path)
            .map_err(|e| TrackerError::ConfigIOError { source: e })?;
        let config: Self = serde_json::from_reader(file)
            .map_err(|e| TrackerError::ConfigSerializeError { source: e })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<(), TrackerError> {
        let config_path = Self::default_path().ok_or(TrackerError::NoConfigDir)?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<(), TrackerError> {
        if let Some(parent) = config_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| TrackerError::ConfigIOError { source: e })?;
            }
        }

        let file = std::fs::File::create(config_path)
            .map_err(|e| TrackerError::ConfigIOError { source: e })?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| TrackerError::ConfigSerializeError { source: e })
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        let conditioner = &self.conditioner;
        let trip = &self.trip;

        if !(conditioner.ema_alpha > 0. && conditioner.ema_alpha <= 1.) {
            return invalid("conditioner.ema_alpha", "must be in (0, 1]");
        }
        if conditioner.min_accuracy_m <= 0. {
            return invalid("conditioner.min_accuracy_m", "must be positive");
        }
        if conditioner.max_realistic_speed_kmh <= 0. {
            return invalid("conditioner.max_realistic_speed_kmh", "must be positive");
        }
        if conditioner.max_acceleration_kmh_per_sec <= 0. {
            return invalid("conditioner.max_acceleration_kmh_per_sec", "must be positive");
        }
        if conditioner.min_time_gap_sec < 0.
            || conditioner.min_time_gap_sec >= conditioner.max_time_gap_sec
        {
            return invalid(
                "conditioner.min_time_gap_sec",
                "must be non negative and below max_time_gap_sec",
            );
        }
        if trip.parking_speed_threshold_kmh <= 0. {
            return invalid("trip.parking_speed_threshold_kmh", "must be positive");
        }
        if trip.required_consecutive_moving_readings == 0 {
            return invalid("trip.required_consecutive_moving_readings", "must be at least 1");
        }
        if trip.parking_timeout_ms <= 0 {
            return invalid("trip.parking_timeout_ms", "must be positive");
        }
        if let Some(instant) = trip.instant_start_threshold_kmh {
            if instant < trip.parking_speed_threshold_kmh {
                return invalid(
                    "trip.instant_start_threshold_kmh",
                    "must not be below parking_speed_threshold_kmh",
                );
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> Result<(), TrackerError> {
    Err(TrackerError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    })
}

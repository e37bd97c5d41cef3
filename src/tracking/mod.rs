pub mod conditioner;
pub mod last_known;
pub mod tracker;
pub mod trip_state;

use std::fmt;

use serde::{Deserialize, Serialize};
use uom::si::f32::Velocity;
use uom::si::velocity::{kilometer_per_hour, meter_per_second};

pub use conditioner::{ConditionerConfig, SignalConditioner};
pub use last_known::LastKnownPosition;
pub use tracker::{FixOutcome, TripTracker};
pub use trip_state::{TripConfig, TripSession, TripStateMachine};

/// Identifier handed out by the trip store when a trip is created
pub type TripId = i64;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Class of positioning source a fix came from.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Provider {
    /// High precision satellite fixes
    #[default]
    Primary,
    /// Low precision network / cell tower fixes
    Secondary,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Position {
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Finite and within the WGS84 coordinate ranges
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude.abs() <= 90.
            && self.longitude.abs() <= 180.
    }

    /// Great-circle distance in meters using the haversine formula
    pub fn distance_to(&self, other: &Position) -> f64 {
        let lat1_rad = self.latitude.to_radians();
        let lat2_rad = other.latitude.to_radians();
        let delta_lat = (other.latitude - self.latitude).to_radians();
        let delta_lon = (other.longitude - self.longitude).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_M * c
    }
}

/// A single location reading as delivered by the position source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RawFix {
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
    /// Horizontal accuracy (1 sigma), meters
    pub accuracy_m: f32,
    /// Speed reported by the device, m/s
    #[serde(default)]
    pub speed_mps: Option<f32>,
    /// Bearing in degrees
    #[serde(default)]
    pub bearing_deg: Option<f32>,
    /// Altitude, meters
    #[serde(default)]
    pub altitude_m: f64,
    /// Epoch milliseconds
    pub timestamp_ms: i64,
    #[serde(default)]
    pub provider: Provider,
}

impl Default for RawFix {
    fn default() -> Self {
        Self {
            latitude: 0.,
            longitude: 0.,
            accuracy_m: 5.,
            speed_mps: None,
            bearing_deg: None,
            altitude_m: 0.,
            timestamp_ms: 0,
            provider: Provider::Primary,
        }
    }
}

impl RawFix {
    pub fn position(&self) -> Position {
        Position::new(self.latitude, self.longitude)
    }
}

/// Speed estimate produced for every fix handed to the conditioner.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ConditionedSpeed {
    /// EMA smoothed speed used for trip decisions and display, km/h
    pub speed_kmh: f32,
    /// Validated speed before smoothing, km/h
    pub raw_speed_kmh: f32,
    pub accepted: bool,
}

/// Why a fix was kept out of trip logic. Rejections are part of normal
/// operation and never surface as errors.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub enum Rejection {
    InvalidPosition { latitude: f64, longitude: f64 },
    LowAccuracy { accuracy_m: f32 },
    OutOfOrder { timestamp_ms: i64, last_accepted_ms: i64 },
    UnrealisticSpeed { speed_kmh: f32 },
    AccelerationSpike { speed_kmh: f32, max_allowed_kmh: f32 },
    WrongProvider { provider: Provider },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::InvalidPosition {
                latitude,
                longitude,
            } => write!(f, "invalid position ({latitude}, {longitude})"),
            Rejection::LowAccuracy { accuracy_m } => {
                write!(f, "low accuracy ({accuracy_m:.1}m)")
            }
            Rejection::OutOfOrder {
                timestamp_ms,
                last_accepted_ms,
            } => write!(
                f,
                "out of order timestamp ({timestamp_ms} <= {last_accepted_ms})"
            ),
            Rejection::UnrealisticSpeed { speed_kmh } => {
                write!(f, "unrealistic speed ({speed_kmh:.1} km/h)")
            }
            Rejection::AccelerationSpike {
                speed_kmh,
                max_allowed_kmh,
            } => write!(
                f,
                "acceleration spike ({speed_kmh:.1} km/h, max allowed {max_allowed_kmh:.1} km/h)"
            ),
            Rejection::WrongProvider { provider } => {
                write!(f, "fix from non designated provider {provider:?}")
            }
        }
    }
}

/// A fix recorded as part of a trip. Never mutated once emitted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrackPoint {
    pub trip_id: TripId,
    pub latitude: f64,
    pub longitude: f64,
    /// Speed as reported by the device, m/s (0 when absent)
    pub speed_mps: f32,
    /// Validated raw speed, km/h
    pub speed_kmh: f32,
    /// Smoothed speed at the time the point was recorded, km/h
    pub smoothed_speed_kmh: f32,
    pub altitude_m: f64,
    pub bearing_deg: f32,
    pub accuracy_m: f32,
    /// Epoch milliseconds
    pub timestamp_ms: i64,
}

impl TrackPoint {
    pub(crate) fn from_fix(trip_id: TripId, fix: &RawFix, speed: &ConditionedSpeed) -> Self {
        Self {
            trip_id,
            latitude: fix.latitude,
            longitude: fix.longitude,
            speed_mps: fix.speed_mps.unwrap_or(0.),
            speed_kmh: speed.raw_speed_kmh,
            smoothed_speed_kmh: speed.speed_kmh,
            altitude_m: fix.altitude_m,
            bearing_deg: fix.bearing_deg.unwrap_or(0.),
            accuracy_m: fix.accuracy_m,
            timestamp_ms: fix.timestamp_ms,
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.latitude, self.longitude)
    }
}

/// Trip summary as kept by the trip store.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TripRecord {
    pub id: TripId,
    /// Epoch milliseconds
    pub start_time_ms: i64,
    /// None while the trip is still open
    pub end_time_ms: Option<i64>,
    pub distance_m: f64,
    pub max_speed_kmh: f32,
    /// Average over the points recorded with a non zero speed
    pub avg_speed_kmh: f32,
    pub duration_ms: i64,
    pub is_active: bool,
    pub point_count: usize,
    /// Number of points that contributed to the average speed
    pub moving_point_count: usize,
}

impl TripRecord {
    pub fn new_active(id: TripId, start_time_ms: i64) -> Self {
        Self {
            id,
            start_time_ms,
            end_time_ms: None,
            distance_m: 0.,
            max_speed_kmh: 0.,
            avg_speed_kmh: 0.,
            duration_ms: 0,
            is_active: true,
            point_count: 0,
            moving_point_count: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TripState {
    #[default]
    Parked,
    Driving,
}

/// Intents emitted by the tracker. The caller is responsible for executing
/// them against the trip store and any observer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum TripEvent {
    TripStarted {
        trip_id: TripId,
        start_time_ms: i64,
        start_position: Position,
    },
    TripPointRecorded {
        trip_id: TripId,
        point: TrackPoint,
    },
    TripUpdated {
        record: TripRecord,
    },
    TripEnded {
        trip_id: TripId,
        record: TripRecord,
    },
}

pub(crate) fn mps_to_kmh(speed_mps: f32) -> f32 {
    Velocity::new::<meter_per_second>(speed_mps).get::<kilometer_per_hour>()
}

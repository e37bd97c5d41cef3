// Human readable renderings of trip values, used by the CLI summary

use std::fmt;

use serde::{Deserialize, Serialize};

/// Whole km/h, rounding halves up
pub fn format_speed(speed_kmh: f32) -> String {
    format!("{:.0} km/h", speed_kmh.round())
}

pub fn format_distance(distance_m: f64) -> String {
    if distance_m < 1000. {
        format!("{:.0} m", distance_m.round())
    } else {
        format!("{:.1} km", distance_m / 1000.)
    }
}

pub fn format_duration(duration_ms: i64) -> String {
    let total_s = duration_ms.max(0) / 1000;
    let hours = total_s / 3600;
    let minutes = (total_s % 3600) / 60;
    let seconds = total_s % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SpeedCategory {
    Slow,
    City,
    Urban,
    Suburban,
    Highway,
    FastHighway,
    VeryFast,
}

impl SpeedCategory {
    pub fn from_speed(speed_kmh: f32) -> Self {
        match speed_kmh {
            s if s < 30. => SpeedCategory::Slow,
            s if s < 50. => SpeedCategory::City,
            s if s < 70. => SpeedCategory::Urban,
            s if s < 90. => SpeedCategory::Suburban,
            s if s < 110. => SpeedCategory::Highway,
            s if s < 130. => SpeedCategory::FastHighway,
            _ => SpeedCategory::VeryFast,
        }
    }
}

impl fmt::Display for SpeedCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SpeedCategory::Slow => "City (slow)",
            SpeedCategory::City => "City",
            SpeedCategory::Urban => "Urban",
            SpeedCategory::Suburban => "Suburban",
            SpeedCategory::Highway => "Highway",
            SpeedCategory::FastHighway => "Fast Highway",
            SpeedCategory::VeryFast => "Very Fast",
        };
        f.write_str(label)
    }
}

pub fn speed_category(speed_kmh: f32) -> SpeedCategory {
    SpeedCategory::from_speed(speed_kmh)
}

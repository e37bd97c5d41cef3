use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{ConditionedSpeed, Position, RawFix, Rejection, TrackPoint, mps_to_kmh};

/// Tuning knobs for the signal conditioner.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConditionerConfig {
    /// Fixes with a worse accuracy are ignored, this is what keeps network
    /// and cell tower fixes out of the speed calculation
    pub min_accuracy_m: f32,
    /// Minimum displacement between fixes to trust a distance derived speed
    pub min_distance_for_speed_m: f64,
    /// Anything faster is a GPS glitch
    pub max_realistic_speed_kmh: f32,
    pub max_acceleration_kmh_per_sec: f32,
    /// Below this speed the acceleration limiter never rejects
    pub acceleration_floor_kmh: f32,
    /// Weight of the newest sample in the moving average
    pub ema_alpha: f32,
    /// Smoothed speeds below this value snap to zero on a stationary reading
    pub stationary_snap_kmh: f32,
    pub min_time_gap_sec: f64,
    pub max_time_gap_sec: f64,
}

impl Default for ConditionerConfig {
    fn default() -> Self {
        Self {
            min_accuracy_m: 30.,
            min_distance_for_speed_m: 10.,
            max_realistic_speed_kmh: 200.,
            max_acceleration_kmh_per_sec: 20.,
            acceleration_floor_kmh: 30.,
            ema_alpha: 0.4,
            stationary_snap_kmh: 2.,
            min_time_gap_sec: 0.5,
            max_time_gap_sec: 30.,
        }
    }
}

#[derive(Clone, Debug)]
struct AcceptedFix {
    position: Position,
    timestamp_ms: i64,
    raw_speed_kmh: f32,
}

/// Turns raw fixes into a trusted speed. Keeps only the history it needs:
/// the last accepted fix and the last smoothed value.
#[derive(Clone, Debug)]
pub struct SignalConditioner {
    config: ConditionerConfig,
    last_accepted: Option<AcceptedFix>,
    smoothed_kmh: f32,
}

impl SignalConditioner {
    pub fn new(config: ConditionerConfig) -> Self {
        Self {
            config,
            last_accepted: None,
            smoothed_kmh: 0.,
        }
    }

    /// Latest smoothed speed, unchanged by rejected fixes
    pub fn smoothed_speed_kmh(&self) -> f32 {
        self.smoothed_kmh
    }

    pub fn last_accepted_timestamp_ms(&self) -> Option<i64> {
        self.last_accepted.as_ref().map(|last| last.timestamp_ms)
    }

    /// Restores the history from the last point recorded before a restart.
    pub fn seed(&mut self, point: &TrackPoint) {
        self.last_accepted = Some(AcceptedFix {
            position: point.position(),
            timestamp_ms: point.timestamp_ms,
            raw_speed_kmh: point.speed_kmh,
        });
        self.smoothed_kmh = point.smoothed_speed_kmh;
    }

    /// Validates a fix and derives its speed. A rejected fix leaves the
    /// history untouched so the next fix is measured against the last good one.
    pub fn condition(&mut self, fix: &RawFix) -> Result<ConditionedSpeed, Rejection> {
        if let Some(last) = &self.last_accepted {
            if fix.timestamp_ms <= last.timestamp_ms {
                debug!(
                    "Ignoring out of order fix: {} <= {}",
                    fix.timestamp_ms, last.timestamp_ms
                );
                return Err(Rejection::OutOfOrder {
                    timestamp_ms: fix.timestamp_ms,
                    last_accepted_ms: last.timestamp_ms,
                });
            }
        }

        if !fix.position().is_valid() {
            warn!(
                "Ignoring fix with invalid position: ({}, {})",
                fix.latitude, fix.longitude
            );
            return Err(Rejection::InvalidPosition {
                latitude: fix.latitude,
                longitude: fix.longitude,
            });
        }

        if !fix.accuracy_m.is_finite() || fix.accuracy_m > self.config.min_accuracy_m {
            debug!(
                "Ignoring inaccurate fix: accuracy={}m (max={}m)",
                fix.accuracy_m, self.config.min_accuracy_m
            );
            return Err(Rejection::LowAccuracy {
                accuracy_m: fix.accuracy_m,
            });
        }

        let raw_speed_kmh = self.raw_speed_kmh(fix);

        if raw_speed_kmh > self.config.max_realistic_speed_kmh {
            warn!(
                "Ignoring unrealistic speed: {:.1} km/h (max: {:.1} km/h)",
                raw_speed_kmh, self.config.max_realistic_speed_kmh
            );
            return Err(Rejection::UnrealisticSpeed {
                speed_kmh: raw_speed_kmh,
            });
        }

        if let Some(last) = &self.last_accepted {
            if raw_speed_kmh > 0. {
                let time_diff_s = (fix.timestamp_ms - last.timestamp_ms) as f32 / 1000.;
                let max_allowed_kmh = last.raw_speed_kmh
                    + self.config.max_acceleration_kmh_per_sec * time_diff_s;
                if raw_speed_kmh > max_allowed_kmh
                    && raw_speed_kmh > self.config.acceleration_floor_kmh
                {
                    warn!(
                        "Acceleration spike rejected: {:.1} km/h (max allowed: {:.1} km/h, prev: {:.1} km/h, dt: {:.1}s)",
                        raw_speed_kmh, max_allowed_kmh, last.raw_speed_kmh, time_diff_s
                    );
                    return Err(Rejection::AccelerationSpike {
                        speed_kmh: raw_speed_kmh,
                        max_allowed_kmh,
                    });
                }
            }
        }

        self.last_accepted = Some(AcceptedFix {
            position: fix.position(),
            timestamp_ms: fix.timestamp_ms,
            raw_speed_kmh,
        });
        self.smoothed_kmh = self.smooth(raw_speed_kmh);

        Ok(ConditionedSpeed {
            speed_kmh: self.smoothed_kmh,
            raw_speed_kmh,
            accepted: true,
        })
    }

    fn raw_speed_kmh(&self, fix: &RawFix) -> f32 {
        if let Some(speed_mps) = fix.speed_mps {
            if speed_mps > 0. {
                return mps_to_kmh(speed_mps);
            }
        }

        // no usable device speed, fall back to the displacement since the last fix
        let Some(last) = &self.last_accepted else {
            debug!("No previous fix for speed calculation");
            return 0.;
        };

        let time_diff_s = (fix.timestamp_ms - last.timestamp_ms) as f64 / 1000.;
        if time_diff_s < self.config.min_time_gap_sec || time_diff_s > self.config.max_time_gap_sec
        {
            debug!("Time gap out of range for speed calc: {:.1}s", time_diff_s);
            return 0.;
        }

        let distance_m = last.position.distance_to(&fix.position());
        // positions bounce around within their own accuracy circle when stationary
        let min_distance_m = self
            .config
            .min_distance_for_speed_m
            .max(fix.accuracy_m as f64);
        if distance_m < min_distance_m {
            debug!(
                "GPS jitter filtered: dist={:.1}m < min={:.1}m",
                distance_m, min_distance_m
            );
            return 0.;
        }

        mps_to_kmh((distance_m / time_diff_s) as f32)
    }

    fn smooth(&self, raw_speed_kmh: f32) -> f32 {
        if self.smoothed_kmh == 0. && raw_speed_kmh > 0. {
            // take off, skip the EMA lag
            raw_speed_kmh
        } else if raw_speed_kmh == 0. && self.smoothed_kmh < self.config.stationary_snap_kmh {
            0.
        } else {
            self.config.ema_alpha * raw_speed_kmh + (1. - self.config.ema_alpha) * self.smoothed_kmh
        }
    }
}

impl Default for SignalConditioner {
    fn default() -> Self {
        Self::new(ConditionerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const METERS_PER_DEGREE: f64 = 111_194.93;
    const ANCHOR_LAT: f64 = 48.8566;
    const ANCHOR_LON: f64 = 2.3522;

    fn fix_at(north_m: f64, timestamp_ms: i64, speed_kmh: Option<f32>) -> RawFix {
        RawFix {
            latitude: ANCHOR_LAT + north_m / METERS_PER_DEGREE,
            longitude: ANCHOR_LON,
            accuracy_m: 5.,
            speed_mps: speed_kmh.map(|s| s / 3.6),
            timestamp_ms,
            ..RawFix::default()
        }
    }

    #[test]
    fn test_device_speed_used_directly() {
        let mut conditioner = SignalConditioner::default();
        let speed = conditioner.condition(&fix_at(0., 1000, Some(36.))).unwrap();
        assert!((speed.raw_speed_kmh - 36.).abs() < 0.01);
        assert!(speed.accepted);
    }

    #[test]
    fn test_first_fix_without_device_speed_is_stationary() {
        let mut conditioner = SignalConditioner::default();
        let speed = conditioner.condition(&fix_at(0., 1000, None)).unwrap();
        assert_eq!(speed.raw_speed_kmh, 0.);
        assert_eq!(speed.speed_kmh, 0.);
    }

    #[test]
    fn test_distance_derived_speed() {
        let mut conditioner = SignalConditioner::default();
        conditioner.condition(&fix_at(0., 0, None)).unwrap();
        // 20m in 2s = 10 m/s = 36 km/h
        let speed = conditioner.condition(&fix_at(20., 2000, None)).unwrap();
        assert!((speed.raw_speed_kmh - 36.).abs() < 0.1, "{speed:?}");
    }

    #[test]
    fn test_zero_device_speed_falls_back_to_distance() {
        let mut conditioner = SignalConditioner::default();
        conditioner.condition(&fix_at(0., 0, None)).unwrap();
        let speed = conditioner.condition(&fix_at(20., 2000, Some(0.))).unwrap();
        assert!((speed.raw_speed_kmh - 36.).abs() < 0.1);
    }

    #[test]
    fn test_low_accuracy_rejected_without_history_update() {
        let mut conditioner = SignalConditioner::default();
        let fix = RawFix {
            accuracy_m: 48.,
            ..fix_at(0., 1000, Some(50.))
        };
        assert_eq!(
            conditioner.condition(&fix),
            Err(Rejection::LowAccuracy { accuracy_m: 48. })
        );
        assert_eq!(conditioner.last_accepted_timestamp_ms(), None);
    }

    #[test]
    fn test_invalid_position_rejected_without_history_update() {
        let mut conditioner = SignalConditioner::default();
        conditioner.condition(&fix_at(0., 0, None)).unwrap();

        let nan_fix = RawFix {
            latitude: f64::NAN,
            ..fix_at(0., 2000, None)
        };
        assert!(matches!(
            conditioner.condition(&nan_fix),
            Err(Rejection::InvalidPosition { .. })
        ));
        let off_globe = RawFix {
            longitude: 181.,
            ..fix_at(0., 3000, Some(20.))
        };
        assert!(matches!(
            conditioner.condition(&off_globe),
            Err(Rejection::InvalidPosition { .. })
        ));
        let infinite = RawFix {
            latitude: f64::INFINITY,
            ..fix_at(0., 3500, None)
        };
        assert!(matches!(
            conditioner.condition(&infinite),
            Err(Rejection::InvalidPosition { .. })
        ));
        assert_eq!(conditioner.last_accepted_timestamp_ms(), Some(0));
        assert_eq!(conditioner.smoothed_speed_kmh(), 0.);

        // stationary fixes that follow still read as stopped
        for i in 1..=3 {
            let speed = conditioner.condition(&fix_at(0., 4000 * i, None)).unwrap();
            assert_eq!(speed.raw_speed_kmh, 0.);
            assert_eq!(speed.speed_kmh, 0.);
        }
    }

    #[test]
    fn test_time_gap_outside_window_yields_zero() {
        let mut conditioner = SignalConditioner::default();
        conditioner.condition(&fix_at(0., 0, None)).unwrap();
        let speed = conditioner.condition(&fix_at(500., 45_000, None)).unwrap();
        assert_eq!(speed.raw_speed_kmh, 0.);

        let speed = conditioner.condition(&fix_at(520., 45_300, None)).unwrap();
        assert_eq!(speed.raw_speed_kmh, 0.);
    }

    #[test]
    fn test_jitter_below_accuracy_radius_is_zero() {
        let mut conditioner = SignalConditioner::default();
        let first = RawFix {
            accuracy_m: 20.,
            ..fix_at(0., 0, None)
        };
        conditioner.condition(&first).unwrap();
        // 15m is above the 10m floor but inside the 20m accuracy circle
        let second = RawFix {
            accuracy_m: 20.,
            ..fix_at(15., 2000, None)
        };
        assert_eq!(conditioner.condition(&second).unwrap().raw_speed_kmh, 0.);
    }

    #[test]
    fn test_out_of_order_fix_rejected() {
        let mut conditioner = SignalConditioner::default();
        conditioner.condition(&fix_at(0., 5000, None)).unwrap();
        assert!(matches!(
            conditioner.condition(&fix_at(10., 5000, None)),
            Err(Rejection::OutOfOrder { .. })
        ));
        assert!(matches!(
            conditioner.condition(&fix_at(10., 4000, None)),
            Err(Rejection::OutOfOrder { .. })
        ));
        assert_eq!(conditioner.last_accepted_timestamp_ms(), Some(5000));
    }

    #[test]
    fn test_glitch_does_not_move_reference_point() {
        let mut conditioner = SignalConditioner::default();
        conditioner.condition(&fix_at(0., 0, Some(36.))).unwrap();

        let glitch = conditioner.condition(&fix_at(1000., 2000, Some(300.)));
        assert!(matches!(glitch, Err(Rejection::UnrealisticSpeed { .. })));

        // 80m from the last good fix over 4s = 72 km/h
        let speed = conditioner.condition(&fix_at(80., 4000, None)).unwrap();
        assert!((speed.raw_speed_kmh - 72.).abs() < 0.5, "{speed:?}");
    }

    #[test]
    fn test_distance_glitch_rejected() {
        let mut conditioner = SignalConditioner::default();
        conditioner.condition(&fix_at(0., 0, None)).unwrap();
        // 500m in 2s = 900 km/h
        assert!(matches!(
            conditioner.condition(&fix_at(500., 2000, None)),
            Err(Rejection::UnrealisticSpeed { .. })
        ));
        assert_eq!(conditioner.last_accepted_timestamp_ms(), Some(0));
    }

    #[test]
    fn test_acceleration_spike_rejected() {
        let mut conditioner = SignalConditioner::default();
        conditioner.condition(&fix_at(0., 0, Some(50.))).unwrap();

        // max allowed after 1s is 70 km/h
        let spike = conditioner.condition(&fix_at(40., 1000, Some(150.)));
        assert!(matches!(
            spike,
            Err(Rejection::AccelerationSpike { max_allowed_kmh, .. }) if (max_allowed_kmh - 70.).abs() < 0.01
        ));

        // measured against the fix at t=0, 2s later max allowed is 90 km/h
        let speed = conditioner.condition(&fix_at(40., 2000, Some(65.))).unwrap();
        assert!((speed.raw_speed_kmh - 65.).abs() < 0.01);
    }

    #[test]
    fn test_acceleration_floor_allows_low_speeds() {
        let mut conditioner = SignalConditioner::default();
        conditioner.condition(&fix_at(0., 0, None)).unwrap();
        // 25 km/h after 1s exceeds 0 + 20 but stays under the 30 km/h floor
        let speed = conditioner.condition(&fix_at(7., 1000, Some(25.))).unwrap();
        assert!((speed.raw_speed_kmh - 25.).abs() < 0.01);
    }

    #[test]
    fn test_smoothing_snaps_on_take_off_and_stop() {
        let mut conditioner = SignalConditioner::default();
        let speed = conditioner.condition(&fix_at(0., 0, Some(60.))).unwrap();
        assert!((speed.speed_kmh - 60.).abs() < 0.01);

        let speed = conditioner.condition(&fix_at(30., 2000, Some(70.))).unwrap();
        // 0.4 * 70 + 0.6 * 60
        assert!((speed.speed_kmh - 64.).abs() < 0.01);

        let mut conditioner = SignalConditioner::default();
        conditioner.condition(&fix_at(0., 0, Some(1.5))).unwrap();
        let speed = conditioner.condition(&fix_at(0., 2000, None)).unwrap();
        assert_eq!(speed.speed_kmh, 0.);
    }

    #[test]
    fn test_smoothing_decays_when_stopping_fast() {
        let mut conditioner = SignalConditioner::default();
        conditioner.condition(&fix_at(0., 0, Some(50.))).unwrap();
        let speed = conditioner.condition(&fix_at(0., 2000, None)).unwrap();
        assert_eq!(speed.raw_speed_kmh, 0.);
        assert!((speed.speed_kmh - 30.).abs() < 0.01);
    }

    #[test]
    fn test_seed_restores_history() {
        let mut conditioner = SignalConditioner::default();
        let point = TrackPoint {
            trip_id: 1,
            latitude: ANCHOR_LAT,
            longitude: ANCHOR_LON,
            speed_mps: 0.,
            speed_kmh: 50.,
            smoothed_speed_kmh: 48.,
            altitude_m: 0.,
            bearing_deg: 0.,
            accuracy_m: 5.,
            timestamp_ms: 10_000,
        };
        conditioner.seed(&point);
        assert_eq!(conditioner.smoothed_speed_kmh(), 48.);
        assert_eq!(conditioner.last_accepted_timestamp_ms(), Some(10_000));

        // measured against the seeded point: 30m in 2s = 54 km/h
        let speed = conditioner.condition(&fix_at(30., 12_000, None)).unwrap();
        assert!((speed.raw_speed_kmh - 54.).abs() < 0.5);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_stationary_jitter_is_zero_speed(
            accuracy in 3.0f32..30.0f32,
            offsets in prop::collection::vec((0.0f64..0.99f64, 0.0f64..std::f64::consts::TAU, 1000i64..5000i64), 2..30),
        ) {
            let mut conditioner = SignalConditioner::default();
            let radius = accuracy as f64 / 2.;
            let mut timestamp_ms = 0;
            for (scale, angle, step_ms) in offsets {
                timestamp_ms += step_ms;
                let north_m = radius * scale * angle.cos();
                let east_m = radius * scale * angle.sin();
                let fix = RawFix {
                    latitude: ANCHOR_LAT + north_m / METERS_PER_DEGREE,
                    longitude: ANCHOR_LON
                        + east_m / (METERS_PER_DEGREE * ANCHOR_LAT.to_radians().cos()),
                    accuracy_m: accuracy,
                    timestamp_ms,
                    ..RawFix::default()
                };
                let speed = conditioner.condition(&fix).unwrap();
                prop_assert_eq!(speed.raw_speed_kmh, 0.);
                prop_assert_eq!(speed.speed_kmh, 0.);
            }
        }

        #[test]
        fn prop_acceleration_limit(
            prev_speed in 0.0f32..150.0f32,
            dt_ms in 500i64..10_000i64,
            excess in 0.5f32..50.0f32,
        ) {
            let mut conditioner = SignalConditioner::default();
            conditioner.condition(&fix_at(0., 0, Some(prev_speed))).unwrap();

            let max_allowed = prev_speed + 20. * dt_ms as f32 / 1000.;
            let spike = max_allowed + excess;
            prop_assume!(spike > 30. && spike <= 200.);

            let result = conditioner.condition(&fix_at(10., dt_ms, Some(spike)));
            let is_spike = matches!(result, Err(Rejection::AccelerationSpike { .. }));
            prop_assert!(is_spike);
            prop_assert_eq!(conditioner.last_accepted_timestamp_ms(), Some(0));
        }
    }
}

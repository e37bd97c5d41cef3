use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::TrackerError;
use crate::store::TripIdAllocator;

use super::{ConditionedSpeed, Position, RawFix, TrackPoint, TripEvent, TripId, TripRecord, TripState};

/// Thresholds driving the parked / driving decisions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TripConfig {
    /// Below this smoothed speed the vehicle is considered stopped. Has to sit
    /// above the speed stationary jitter settles to after smoothing
    pub parking_speed_threshold_kmh: f32,
    /// Consecutive readings above the threshold needed to start a trip
    pub required_consecutive_moving_readings: usize,
    /// Continuous time below the threshold before a trip ends
    pub parking_timeout_ms: i64,
    /// Speeds jitter can't produce, start a trip on the first such reading
    pub instant_start_threshold_kmh: Option<f32>,
    /// Emit a running trip update every this many recorded points, 0 disables
    pub update_interval_points: usize,
}

impl Default for TripConfig {
    fn default() -> Self {
        Self {
            parking_speed_threshold_kmh: 8.,
            required_consecutive_moving_readings: 3,
            parking_timeout_ms: 2 * 60 * 1000,
            instant_start_threshold_kmh: None,
            update_interval_points: 10,
        }
    }
}

/// Accumulators for the trip currently in progress.
#[derive(Clone, Debug, PartialEq)]
pub struct TripSession {
    pub trip_id: TripId,
    pub start_time_ms: i64,
    pub distance_m: f64,
    pub point_count: usize,
    /// Points with a non zero speed, the ones averaged
    pub moving_point_count: usize,
    pub speed_sum_kmh: f64,
    pub max_speed_kmh: f32,
    pub last_position: Option<Position>,
    pub last_timestamp_ms: i64,
    /// None while moving
    pub stationary_since_ms: Option<i64>,
}

impl TripSession {
    fn new(trip_id: TripId, start_time_ms: i64) -> Self {
        Self {
            trip_id,
            start_time_ms,
            distance_m: 0.,
            point_count: 0,
            moving_point_count: 0,
            speed_sum_kmh: 0.,
            max_speed_kmh: 0.,
            last_position: None,
            last_timestamp_ms: start_time_ms,
            stationary_since_ms: None,
        }
    }

    fn from_record(
        record: &TripRecord,
        last_point: Option<&TrackPoint>,
        stationary_since_ms: Option<i64>,
    ) -> Self {
        Self {
            trip_id: record.id,
            start_time_ms: record.start_time_ms,
            distance_m: record.distance_m,
            point_count: record.point_count,
            moving_point_count: record.moving_point_count,
            speed_sum_kmh: record.avg_speed_kmh as f64 * record.moving_point_count as f64,
            max_speed_kmh: record.max_speed_kmh,
            last_position: last_point.map(TrackPoint::position),
            last_timestamp_ms: last_point
                .map(|p| p.timestamp_ms)
                .unwrap_or(record.start_time_ms),
            stationary_since_ms,
        }
    }

    /// Average moving speed: points recorded at zero speed are left out
    pub fn avg_speed_kmh(&self) -> f32 {
        if self.moving_point_count == 0 {
            0.
        } else {
            (self.speed_sum_kmh / self.moving_point_count as f64) as f32
        }
    }

    pub fn to_record(&self, now_ms: i64, is_active: bool) -> TripRecord {
        TripRecord {
            id: self.trip_id,
            start_time_ms: self.start_time_ms,
            end_time_ms: (!is_active).then_some(now_ms),
            distance_m: self.distance_m,
            max_speed_kmh: self.max_speed_kmh,
            avg_speed_kmh: self.avg_speed_kmh(),
            duration_ms: now_ms - self.start_time_ms,
            is_active,
            point_count: self.point_count,
            moving_point_count: self.moving_point_count,
        }
    }

    fn record_point(
        &mut self,
        fix: &RawFix,
        speed: &ConditionedSpeed,
        update_interval_points: usize,
    ) -> Vec<TripEvent> {
        let point = TrackPoint::from_fix(self.trip_id, fix, speed);
        let position = point.position();

        if let Some(last) = &self.last_position {
            self.distance_m += last.distance_to(&position);
        }
        self.last_position = Some(position);
        self.last_timestamp_ms = point.timestamp_ms;
        self.point_count += 1;
        if point.speed_kmh > 0. {
            self.moving_point_count += 1;
            self.speed_sum_kmh += point.speed_kmh as f64;
        }
        self.max_speed_kmh = self.max_speed_kmh.max(point.speed_kmh);

        let mut events = vec![TripEvent::TripPointRecorded {
            trip_id: self.trip_id,
            point,
        }];
        if update_interval_points > 0 && self.point_count % update_interval_points == 0 {
            events.push(TripEvent::TripUpdated {
                record: self.to_record(fix.timestamp_ms, true),
            });
        }
        events
    }
}

/// Decides when trips start and end from the conditioned speed. A session
/// exists exactly while the machine is driving.
#[derive(Clone, Debug)]
pub struct TripStateMachine {
    config: TripConfig,
    consecutive_moving: usize,
    session: Option<TripSession>,
}

impl TripStateMachine {
    pub fn new(config: TripConfig) -> Self {
        Self {
            config,
            consecutive_moving: 0,
            session: None,
        }
    }

    pub fn state(&self) -> TripState {
        if self.session.is_some() {
            TripState::Driving
        } else {
            TripState::Parked
        }
    }

    pub fn session(&self) -> Option<&TripSession> {
        self.session.as_ref()
    }

    pub fn consecutive_moving_readings(&self) -> usize {
        self.consecutive_moving
    }

    /// Feeds an accepted fix. Fails only when a trip should start and no id
    /// can be allocated, in which case the machine stays parked and retries
    /// on the next qualifying fix.
    pub fn process<A: TripIdAllocator + ?Sized>(
        &mut self,
        fix: &RawFix,
        speed: &ConditionedSpeed,
        ids: &mut A,
    ) -> Result<Vec<TripEvent>, TrackerError> {
        if self.session.is_some() {
            Ok(self.process_driving(fix, speed))
        } else {
            self.process_parked(fix, speed, ids)
        }
    }

    fn process_parked<A: TripIdAllocator + ?Sized>(
        &mut self,
        fix: &RawFix,
        speed: &ConditionedSpeed,
        ids: &mut A,
    ) -> Result<Vec<TripEvent>, TrackerError> {
        if speed.speed_kmh < self.config.parking_speed_threshold_kmh {
            if self.consecutive_moving > 0 {
                debug!(
                    "Movement reset: smoothed speed dropped to {:.1} km/h",
                    speed.speed_kmh
                );
            }
            self.consecutive_moving = 0;
            return Ok(Vec::new());
        }

        self.consecutive_moving += 1;
        debug!(
            "Movement detected: smoothed={:.1} km/h raw={:.1} km/h (count: {}/{})",
            speed.speed_kmh,
            speed.raw_speed_kmh,
            self.consecutive_moving,
            self.config.required_consecutive_moving_readings
        );

        let instant_start = self
            .config
            .instant_start_threshold_kmh
            .is_some_and(|threshold| speed.speed_kmh >= threshold);
        if self.consecutive_moving < self.config.required_consecutive_moving_readings
            && !instant_start
        {
            return Ok(Vec::new());
        }

        let trip_id = ids.allocate_trip_id(fix.timestamp_ms).inspect_err(|e| {
            warn!("Could not start trip, tracking degraded: {}", e);
        })?;
        self.consecutive_moving = 0;

        info!(
            "Starting trip #{} at {:.1} km/h",
            trip_id, speed.raw_speed_kmh
        );
        let mut session = TripSession::new(trip_id, fix.timestamp_ms);
        let mut events = vec![TripEvent::TripStarted {
            trip_id,
            start_time_ms: fix.timestamp_ms,
            start_position: fix.position(),
        }];
        events.extend(session.record_point(fix, speed, self.config.update_interval_points));
        self.session = Some(session);
        Ok(events)
    }

    fn process_driving(&mut self, fix: &RawFix, speed: &ConditionedSpeed) -> Vec<TripEvent> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };

        if speed.speed_kmh < self.config.parking_speed_threshold_kmh {
            match session.stationary_since_ms {
                None => {
                    debug!(
                        "Stationary timer started (smoothed={:.1} km/h)",
                        speed.speed_kmh
                    );
                    session.stationary_since_ms = Some(fix.timestamp_ms);
                }
                Some(since_ms) => {
                    let elapsed_ms = fix.timestamp_ms - since_ms;
                    if elapsed_ms >= self.config.parking_timeout_ms {
                        info!("Parking timeout reached ({}ms), ending trip", elapsed_ms);
                        return self.close(fix.timestamp_ms);
                    }
                    debug!(
                        "Stationary for {}s / {}s",
                        elapsed_ms / 1000,
                        self.config.parking_timeout_ms / 1000
                    );
                }
            }
        } else {
            if session.stationary_since_ms.is_some() {
                debug!(
                    "Movement resumed, stationary timer reset (smoothed={:.1} km/h)",
                    speed.speed_kmh
                );
            }
            session.stationary_since_ms = None;
        }

        session.record_point(fix, speed, self.config.update_interval_points)
    }

    /// Finalizes the open trip, if any, at `now_ms`.
    pub fn close(&mut self, now_ms: i64) -> Vec<TripEvent> {
        self.consecutive_moving = 0;
        let Some(session) = self.session.take() else {
            return Vec::new();
        };

        let record = session.to_record(now_ms.max(session.start_time_ms), false);
        info!(
            "Ending trip #{}: {:.0}m, max {:.1} km/h, avg {:.1} km/h, {} points",
            record.id,
            record.distance_m,
            record.max_speed_kmh,
            record.avg_speed_kmh,
            record.point_count
        );
        vec![TripEvent::TripEnded {
            trip_id: record.id,
            record,
        }]
    }

    /// Adopts a trip left open by a previous run and switches to driving.
    ///
    /// `recent_points` are the points already recorded for the trip, oldest
    /// first. The last one restores the position distance is measured from,
    /// and a trailing run below the parking threshold restores the stop in
    /// progress so the parking timeout keeps counting from its first point.
    ///
    /// A record that can't be trusted is closed on the spot with whatever
    /// stats it carries and handed back inside the error so the caller can
    /// persist the closure.
    pub fn resume(
        &mut self,
        record: &TripRecord,
        recent_points: &[TrackPoint],
    ) -> Result<(), TrackerError> {
        if let Some(session) = &self.session {
            return Err(TrackerError::TripAlreadyActive {
                trip_id: session.trip_id,
            });
        }

        let last_point = recent_points.last();
        if let Some(reason) = inconsistency(record, last_point) {
            warn!("Closing orphaned trip #{}: {}", record.id, reason);
            return Err(TrackerError::CorruptActiveTrip {
                reason,
                record: Box::new(close_orphan(record, last_point)),
            });
        }

        if last_point.is_none() && record.point_count > 0 {
            warn!(
                "Resuming trip #{} without its last point, distance restarts from the next fix",
                record.id
            );
        }

        let stationary_since_ms = stationary_since(
            record.id,
            recent_points,
            self.config.parking_speed_threshold_kmh,
        );
        if let Some(since_ms) = stationary_since_ms {
            debug!("Resumed trip #{} stationary since {}", record.id, since_ms);
        }

        info!(
            "Resuming trip #{} ({:.0}m, {} points)",
            record.id, record.distance_m, record.point_count
        );
        self.consecutive_moving = 0;
        self.session = Some(TripSession::from_record(
            record,
            last_point,
            stationary_since_ms,
        ));
        Ok(())
    }
}

impl Default for TripStateMachine {
    fn default() -> Self {
        Self::new(TripConfig::default())
    }
}

/// Timestamp of the first point of the trailing run recorded below the
/// threshold. While driving the stationary timer starts on exactly that point.
fn stationary_since(trip_id: TripId, points: &[TrackPoint], threshold_kmh: f32) -> Option<i64> {
    points
        .iter()
        .rev()
        .take_while(|p| p.trip_id == trip_id && p.smoothed_speed_kmh < threshold_kmh)
        .last()
        .map(|p| p.timestamp_ms)
}

fn inconsistency(record: &TripRecord, last_point: Option<&TrackPoint>) -> Option<String> {
    if !record.is_active {
        return Some("record is not marked active".to_string());
    }
    if record.start_time_ms <= 0 {
        return Some("missing start time".to_string());
    }
    if !record.distance_m.is_finite() || record.distance_m < 0. {
        return Some(format!("invalid distance {}", record.distance_m));
    }
    if !record.max_speed_kmh.is_finite() || !record.avg_speed_kmh.is_finite() {
        return Some("invalid speed statistics".to_string());
    }
    if record.moving_point_count > record.point_count {
        return Some(format!(
            "{} moving points out of {} points",
            record.moving_point_count, record.point_count
        ));
    }
    if let Some(point) = last_point {
        if point.trip_id != record.id {
            return Some(format!("last point belongs to trip #{}", point.trip_id));
        }
        if point.timestamp_ms < record.start_time_ms {
            return Some("last point precedes the trip start".to_string());
        }
    }
    None
}

fn close_orphan(record: &TripRecord, last_point: Option<&TrackPoint>) -> TripRecord {
    let start_time_ms = record.start_time_ms.max(0);
    let end_time_ms = last_point
        .filter(|p| p.trip_id == record.id)
        .map(|p| p.timestamp_ms)
        .unwrap_or(start_time_ms)
        .max(start_time_ms);
    let finite_or_zero = |value: f32| if value.is_finite() { value } else { 0. };

    TripRecord {
        start_time_ms,
        end_time_ms: Some(record.end_time_ms.unwrap_or(end_time_ms)),
        distance_m: if record.distance_m.is_finite() && record.distance_m >= 0. {
            record.distance_m
        } else {
            0.
        },
        max_speed_kmh: finite_or_zero(record.max_speed_kmh),
        avg_speed_kmh: finite_or_zero(record.avg_speed_kmh),
        duration_ms: if record.start_time_ms > 0 {
            end_time_ms - start_time_ms
        } else {
            0
        },
        is_active: false,
        moving_point_count: record.moving_point_count.min(record.point_count),
        ..record.clone()
    }
}

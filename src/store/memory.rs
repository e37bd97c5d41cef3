use std::collections::BTreeMap;

use itertools::Itertools;
use log::debug;

use crate::errors::TrackerError;
use crate::tracking::{TrackPoint, TripId, TripRecord};

use super::{TripIdAllocator, TripStore};

/// Data retention: 30 days in milliseconds
pub const DATA_RETENTION_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Trip store kept in memory, used for replays and tests
#[derive(Debug, Default)]
pub struct InMemoryTripStore {
    trips: BTreeMap<TripId, TripRecord>,
    points: Vec<TrackPoint>,
    last_id: TripId,
}

impl InMemoryTripStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self, trip_id: TripId) -> Option<&TripRecord> {
        self.trips.get(&trip_id)
    }

    /// All trips, most recent first
    pub fn trips(&self) -> Vec<&TripRecord> {
        self.trips
            .values()
            .sorted_by(|a, b| b.start_time_ms.cmp(&a.start_time_ms))
            .collect()
    }

    /// Trips started at or after `since_ms`, most recent first
    pub fn trips_since(&self, since_ms: i64) -> Vec<&TripRecord> {
        self.trips()
            .into_iter()
            .filter(|trip| trip.start_time_ms >= since_ms)
            .collect()
    }

    pub fn trip_count_since(&self, since_ms: i64) -> usize {
        self.trips
            .values()
            .filter(|trip| trip.start_time_ms >= since_ms)
            .count()
    }

    /// Distance over the trips started at or after `since_ms`, open ones included
    pub fn total_distance_since(&self, since_ms: i64) -> f64 {
        self.trips
            .values()
            .filter(|trip| trip.start_time_ms >= since_ms)
            .map(|trip| trip.distance_m)
            .sum()
    }

    fn sorted_points(&self, trip_id: TripId) -> impl Iterator<Item = &TrackPoint> {
        self.points
            .iter()
            .filter(move |p| p.trip_id == trip_id)
            .sorted_by_key(|p| p.timestamp_ms)
    }

    pub fn point_count_for_trip(&self, trip_id: TripId) -> usize {
        self.points.iter().filter(|p| p.trip_id == trip_id).count()
    }

    pub fn max_speed_for_trip(&self, trip_id: TripId) -> Option<f32> {
        self.points
            .iter()
            .filter(|p| p.trip_id == trip_id)
            .map(|p| p.speed_kmh)
            .reduce(f32::max)
    }

    /// Average over the points with a non zero speed, None when there are none
    pub fn avg_speed_for_trip(&self, trip_id: TripId) -> Option<f32> {
        let (sum, count) = self
            .points
            .iter()
            .filter(|p| p.trip_id == trip_id && p.speed_kmh > 0.)
            .fold((0f64, 0usize), |(sum, count), p| {
                (sum + p.speed_kmh as f64, count + 1)
            });
        (count > 0).then(|| (sum / count as f64) as f32)
    }

    /// Path length over the stored points of a trip
    pub fn distance_for_trip(&self, trip_id: TripId) -> f64 {
        self.sorted_points(trip_id)
            .tuple_windows()
            .map(|(a, b)| a.position().distance_to(&b.position()))
            .sum()
    }

    /// Drops trips started and points recorded before `before_ms`
    pub fn delete_older_than(&mut self, before_ms: i64) {
        let trips_before = self.trips.len();
        let points_before = self.points.len();
        self.trips.retain(|_, trip| trip.start_time_ms >= before_ms);
        self.points.retain(|point| point.timestamp_ms >= before_ms);
        debug!(
            "Cleaned {} trips and {} points older than {}",
            trips_before - self.trips.len(),
            points_before - self.points.len(),
            before_ms
        );
    }

    /// Applies the default retention window relative to `now_ms`
    pub fn clean_old_data(&mut self, now_ms: i64) {
        self.delete_older_than(now_ms - DATA_RETENTION_MS);
    }
}

impl TripIdAllocator for InMemoryTripStore {
    fn allocate_trip_id(&mut self, start_time_ms: i64) -> Result<TripId, TrackerError> {
        if let Some(active) = self.trips.values().find(|trip| trip.is_active) {
            return Err(TrackerError::TripIdAllocation {
                reason: format!("trip #{} is still active", active.id),
            });
        }
        self.last_id += 1;
        self.trips
            .insert(self.last_id, TripRecord::new_active(self.last_id, start_time_ms));
        Ok(self.last_id)
    }
}

impl TripStore for InMemoryTripStore {
    fn update_trip(&mut self, record: &TripRecord) -> Result<(), TrackerError> {
        match self.trips.get_mut(&record.id) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(TrackerError::TripStoreError {
                reason: format!("unknown trip #{}", record.id),
            }),
        }
    }

    fn insert_point(&mut self, point: &TrackPoint) -> Result<(), TrackerError> {
        if !self.trips.contains_key(&point.trip_id) {
            return Err(TrackerError::TripStoreError {
                reason: format!("point for unknown trip #{}", point.trip_id),
            });
        }
        self.points.push(point.clone());
        Ok(())
    }

    fn active_trip(&self) -> Result<Option<TripRecord>, TrackerError> {
        Ok(self.trips.values().find(|trip| trip.is_active).cloned())
    }

    fn points_for_trip(&self, trip_id: TripId) -> Result<Vec<TrackPoint>, TrackerError> {
        Ok(self.sorted_points(trip_id).cloned().collect())
    }

    fn last_point_for_trip(&self, trip_id: TripId) -> Result<Option<TrackPoint>, TrackerError> {
        Ok(self
            .points
            .iter()
            .filter(|p| p.trip_id == trip_id)
            .max_by_key(|p| p.timestamp_ms)
            .cloned())
    }
}

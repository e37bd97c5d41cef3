// Trip persistence collaborators
// The tracker never writes to a store itself, it emits intents that the
// caller executes with `apply_events`

pub mod memory;

use log::debug;

use crate::errors::TrackerError;
use crate::tracking::{TrackPoint, TripEvent, TripId, TripRecord};

pub use memory::{DATA_RETENTION_MS, InMemoryTripStore};

/// Hands out identifiers for new trips
pub trait TripIdAllocator {
    /// Create an active trip starting at `start_time_ms` and return its id
    fn allocate_trip_id(&mut self, start_time_ms: i64) -> Result<TripId, TrackerError>;
}

/// Trait defining the interface for trip storage operations
pub trait TripStore: TripIdAllocator {
    /// Overwrite the stored record with the same id
    fn update_trip(&mut self, record: &TripRecord) -> Result<(), TrackerError>;

    /// Append a recorded point to its trip
    fn insert_point(&mut self, point: &TrackPoint) -> Result<(), TrackerError>;

    /// The trip still marked active, if any
    fn active_trip(&self) -> Result<Option<TripRecord>, TrackerError>;

    /// Every point recorded for a trip, oldest first
    fn points_for_trip(&self, trip_id: TripId) -> Result<Vec<TrackPoint>, TrackerError>;

    /// Most recent point recorded for a trip
    fn last_point_for_trip(&self, trip_id: TripId) -> Result<Option<TrackPoint>, TrackerError>;
}

/// Executes the intents emitted by the tracker, in order.
pub fn apply_events<S: TripStore + ?Sized>(
    store: &mut S,
    events: &[TripEvent],
) -> Result<(), TrackerError> {
    for event in events {
        match event {
            TripEvent::TripStarted { trip_id, .. } => {
                // the record was created when the id was allocated
                debug!("Trip #{} started", trip_id);
            }
            TripEvent::TripPointRecorded { point, .. } => store.insert_point(point)?,
            TripEvent::TripUpdated { record } => store.update_trip(record)?,
            TripEvent::TripEnded { record, .. } => store.update_trip(record)?,
        }
    }
    Ok(())
}

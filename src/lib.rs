// Library interface for cartracker
// This allows integration tests to access internal modules

pub mod config;
pub mod errors;
pub mod format;
pub mod replay;
pub mod store;
pub mod tracking;

// Re-export commonly used types
pub use config::TrackerConfig;
pub use errors::TrackerError;
pub use store::{InMemoryTripStore, TripIdAllocator, TripStore};
pub use tracking::{
    ConditionedSpeed, FixOutcome, Provider, RawFix, TrackPoint, TripEvent, TripRecord, TripState,
    TripTracker,
};

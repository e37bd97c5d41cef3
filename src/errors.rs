// Error types for cartracker

use crate::tracking::{TripId, TripRecord};
use snafu::Snafu;
use std::io;

#[derive(Debug, Snafu)]
pub enum TrackerError {
    // Trip lifecycle errors
    #[snafu(display("Could not allocate a new trip id: {reason}"))]
    TripIdAllocation { reason: String },
    #[snafu(display("Trip #{trip_id} is already open, cannot resume another trip"))]
    TripAlreadyActive { trip_id: TripId },
    #[snafu(display("Active trip #{} is inconsistent and was closed: {reason}", record.id))]
    CorruptActiveTrip {
        reason: String,
        record: Box<TripRecord>,
    },

    // Trip store errors
    #[snafu(display("Trip store error: {reason}"))]
    TripStoreError { reason: String },

    // Config management errors
    #[snafu(display("Could not find application data directory to save config file"))]
    NoConfigDir,
    #[snafu(display("Error reading or writing config file"))]
    ConfigIOError { source: io::Error },
    #[snafu(display("Error serializing config file"))]
    ConfigSerializeError { source: serde_json::Error },
    #[snafu(display("Invalid configuration: {field} - {reason}"))]
    InvalidConfig { field: String, reason: String },

    // Replay errors
    #[snafu(display("Invalid fixes file: {path}"))]
    InvalidFixesFile { path: String },
    #[snafu(display("Error loading fixes file"))]
    FixLoaderError { source: io::Error },
    #[snafu(display("Error writing trip events file"))]
    EventWriterError { source: io::Error },
}

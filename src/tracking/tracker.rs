use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::TrackerConfig;
use crate::errors::TrackerError;
use crate::store::{TripIdAllocator, TripStore};

use super::{
    ConditionedSpeed, LastKnownPosition, Provider, RawFix, Rejection, SignalConditioner,
    TrackPoint, TripEvent, TripId, TripRecord, TripState, TripStateMachine,
};

/// Everything the caller needs to publish after a fix was processed
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FixOutcome {
    pub speed: ConditionedSpeed,
    /// Set when the fix was kept out of trip logic
    pub rejection: Option<Rejection>,
    pub state: TripState,
    pub events: Vec<TripEvent>,
}

impl FixOutcome {
    pub fn accepted(&self) -> bool {
        self.speed.accepted
    }
}

/// Sequential fix processor: signal conditioning followed by the trip state
/// machine. Not meant to be shared between threads without external
/// serialization, fixes have to be fed in timestamp order.
#[derive(Clone, Debug)]
pub struct TripTracker {
    conditioner: SignalConditioner,
    state_machine: TripStateMachine,
    designated_provider: Provider,
    last_known: LastKnownPosition,
}

impl TripTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            conditioner: SignalConditioner::new(config.conditioner.clone()),
            state_machine: TripStateMachine::new(config.trip.clone()),
            designated_provider: config.designated_provider,
            last_known: LastKnownPosition::new(),
        }
    }

    pub fn state(&self) -> TripState {
        self.state_machine.state()
    }

    pub fn current_trip_id(&self) -> Option<TripId> {
        self.state_machine.session().map(|session| session.trip_id)
    }

    /// Running record of the open trip, as of its last recorded point
    pub fn current_record(&self) -> Option<TripRecord> {
        self.state_machine
            .session()
            .map(|session| session.to_record(session.last_timestamp_ms, true))
    }

    pub fn current_speed_kmh(&self) -> f32 {
        self.conditioner.smoothed_speed_kmh()
    }

    /// Latest position from any provider, for display only
    pub fn last_known_position(&self) -> Option<&RawFix> {
        self.last_known.fix()
    }

    /// Runs a fix through the conditioner and the trip state machine.
    ///
    /// Rejected fixes are reported in the outcome, not as errors. The only
    /// error is a failed trip id allocation, which leaves the tracker parked.
    pub fn process_fix<A: TripIdAllocator + ?Sized>(
        &mut self,
        fix: &RawFix,
        ids: &mut A,
    ) -> Result<FixOutcome, TrackerError> {
        self.last_known.update(fix);

        if fix.provider != self.designated_provider {
            debug!("Fix from {:?} used for display only", fix.provider);
            return Ok(self.rejected(Rejection::WrongProvider {
                provider: fix.provider,
            }));
        }

        let speed = match self.conditioner.condition(fix) {
            Ok(speed) => speed,
            Err(rejection) => return Ok(self.rejected(rejection)),
        };

        let events = self.state_machine.process(fix, &speed, ids)?;
        Ok(FixOutcome {
            speed,
            rejection: None,
            state: self.state_machine.state(),
            events,
        })
    }

    fn rejected(&self, rejection: Rejection) -> FixOutcome {
        FixOutcome {
            speed: ConditionedSpeed {
                speed_kmh: self.conditioner.smoothed_speed_kmh(),
                raw_speed_kmh: 0.,
                accepted: false,
            },
            rejection: Some(rejection),
            state: self.state_machine.state(),
            events: Vec::new(),
        }
    }

    /// Adopts a trip left open by a previous run. When the last recorded
    /// point is known the conditioner picks up from it as well.
    pub fn resume_active_trip(
        &mut self,
        record: TripRecord,
        last_point: Option<TrackPoint>,
    ) -> Result<(), TrackerError> {
        let points: Vec<TrackPoint> = last_point.into_iter().collect();
        self.resume_active_trip_with_points(record, &points)
    }

    /// Like [`Self::resume_active_trip`] with the points recorded so far,
    /// oldest first, so a stop in progress keeps its parking timer.
    pub fn resume_active_trip_with_points(
        &mut self,
        record: TripRecord,
        points: &[TrackPoint],
    ) -> Result<(), TrackerError> {
        self.state_machine.resume(&record, points)?;
        if let Some(point) = points.last() {
            self.conditioner.seed(point);
        }
        Ok(())
    }

    /// Looks up the active trip in the store and resumes it.
    ///
    /// A corrupt record is closed in the store before the error is returned.
    pub fn resume_from_store<S: TripStore + ?Sized>(
        &mut self,
        store: &mut S,
    ) -> Result<Option<TripId>, TrackerError> {
        let Some(record) = store.active_trip()? else {
            return Ok(None);
        };
        let trip_id = record.id;
        let points = store.points_for_trip(trip_id)?;

        match self.resume_active_trip_with_points(record, &points) {
            Ok(()) => Ok(Some(trip_id)),
            Err(TrackerError::CorruptActiveTrip { reason, record }) => {
                store.update_trip(&record)?;
                Err(TrackerError::CorruptActiveTrip { reason, record })
            }
            Err(e) => Err(e),
        }
    }

    /// Forced close of the open trip, for process shutdown.
    pub fn shutdown(&mut self, now_ms: i64) -> Vec<TripEvent> {
        if let Some(trip_id) = self.current_trip_id() {
            info!("Shutting down with trip #{} open", trip_id);
        }
        self.state_machine.close(now_ms)
    }
}

impl Default for TripTracker {
    fn default() -> Self {
        Self::new(&TrackerConfig::default())
    }
}

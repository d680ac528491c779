//! Operator command dispatch: mode changes and manual chiller control.
//!
//! The chiller command is mode-gated and published as a two-step sequence,
//! because the firmware only honors an actuator command after its own local
//! mode is MANUAL. The second publish must never reach the device before
//! the first; sequencing here relies on the transport confirming delivery
//! of each publish before `publish` returns.
use chrono::Local;
use thiserror::Error;

use crate::record::{ChillerState, Mode, StatusRecord, StatusUpdate};
use crate::store::{StatusStore, StoreError};

#[derive(Error, Debug)]
#[error("{0}")]
/// The control transport could not deliver a publish.
pub struct TransportError(pub String);

#[derive(Error, Debug)]
pub enum CommandError {
    /// Manual actuator control attempted while the mode is not `manual`.
    /// Rejected before any store mutation or publish.
    #[error("chiller can only be controlled manually in manual mode")]
    PreconditionFailed,
    /// The status row could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A control publish failed or timed out. Any status mutation already
    /// performed for this command stands; the recorded intent is kept even
    /// when the device was not reachable.
    #[error("control transport unavailable: {0}")]
    TransportUnavailable(#[from] TransportError),
}

/// Publisher for the device-facing control and status topics.
///
/// `publish` must deliver at least once and only return once the transport
/// has confirmed delivery (or its publish timeout elapsed), since the
/// dispatcher orders consecutive publishes by blocking on it.
pub trait ControlPublisher {
    fn publish(&self, topic: &str, payload: &str, retained: bool) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
/// Topics the dispatcher publishes on.
pub struct ControlTopics {
    /// Plain-text command channel the device listens on.
    pub control: String,
    /// Retained JSON status broadcast, `{"mode": "auto"|"manual"}`.
    pub status: String,
}

/// Builds and sequences outbound control traffic.
///
/// Must only be invoked from the single-writer scope owning the status row
/// (the coordinator thread); both operations are read-then-write against it.
pub struct Dispatcher<'a> {
    publisher: &'a dyn ControlPublisher,
    topics: &'a ControlTopics,
}

impl<'a> Dispatcher<'a> {
    pub fn new(publisher: &'a dyn ControlPublisher, topics: &'a ControlTopics) -> Self {
        Dispatcher { publisher, topics }
    }

    /// Stores the new operating mode and broadcasts it to the device.
    ///
    /// The broadcast is best-effort: a transport failure is logged but the
    /// stored mode stands and the call still succeeds.
    pub fn set_mode(
        &self,
        store: &mut dyn StatusStore,
        mode: Mode,
    ) -> Result<StatusRecord, CommandError> {
        let now = Local::now().naive_local();

        let mut update = match store.get_current()? {
            Some(current) => StatusUpdate::from_record(&current),
            None => StatusUpdate::defaults(now.date(), now.time()),
        };
        update.mode = mode;
        update.record_date = now.date();
        update.record_time = now.time();

        let record = store.upsert(&update)?;
        log::info!(target: "hydrod::cmd", "Mode set to \'{}\'", mode);

        if let Err(err) = self.broadcast_mode(mode) {
            log::warn!(target: "hydrod::cmd", "Could not broadcast mode update: \'{}\'", err);
        }
        Ok(record)
    }

    /// Commands the chiller relay while the system is in manual mode.
    ///
    /// Performs, in order: the status row update, a `MODE=MANUAL` assertion
    /// on the control topic, and only after the transport confirmed that
    /// publish the `CHILLER=<ON|OFF>` command itself. When the mode gate
    /// rejects the request nothing is mutated or published.
    pub fn control_actuator(
        &self,
        store: &mut dyn StatusStore,
        action: ChillerState,
    ) -> Result<StatusRecord, CommandError> {
        let current = match store.get_current()? {
            Some(status) if status.mode == Mode::Manual => status,
            _ => return Err(CommandError::PreconditionFailed),
        };

        let now = Local::now().naive_local();
        let mut update = StatusUpdate::from_record(&current);
        update.chiller_status = action;
        update.record_date = now.date();
        update.record_time = now.time();
        let record = store.upsert(&update)?;

        let mode_command = format!("MODE={}", Mode::Manual.as_wire_str());
        self.publisher
            .publish(&self.topics.control, &mode_command, false)?;
        log::debug!(target: "hydrod::cmd", "Sent mode assertion \'{}\'", mode_command);

        let chiller_command = format!("CHILLER={}", action);
        self.publisher
            .publish(&self.topics.control, &chiller_command, false)?;
        log::info!(target: "hydrod::cmd", "Sent chiller command \'{}\'", chiller_command);

        Ok(record)
    }

    /// Publishes the retained mode broadcast consumed by the device on
    /// (re)connect.
    pub fn broadcast_mode(&self, mode: Mode) -> Result<(), TransportError> {
        let payload = serde_json::json!({ "mode": mode.as_db_str() }).to_string();
        self.publisher.publish(&self.topics.status, &payload, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MemoryStatusStore;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use std::cell::RefCell;

    #[derive(Debug, Clone, PartialEq)]
    struct Published {
        topic: String,
        payload: String,
        retained: bool,
    }

    #[derive(Default)]
    struct RecordingPublisher {
        published: RefCell<Vec<Published>>,
        /// Publish index (0-based) at which to start failing.
        fail_from: Option<usize>,
    }

    impl ControlPublisher for RecordingPublisher {
        fn publish(
            &self,
            topic: &str,
            payload: &str,
            retained: bool,
        ) -> Result<(), TransportError> {
            let mut published = self.published.borrow_mut();
            if let Some(fail_from) = self.fail_from {
                if published.len() >= fail_from {
                    return Err(TransportError(String::from("broker unreachable")));
                }
            }
            published.push(Published {
                topic: topic.to_string(),
                payload: payload.to_string(),
                retained,
            });
            Ok(())
        }
    }

    fn topics() -> ControlTopics {
        ControlTopics {
            control: String::from("hydro/control/chiller"),
            status: String::from("hydro/control"),
        }
    }

    fn status_with_mode(mode: Mode) -> StatusRecord {
        StatusRecord {
            id: 1,
            mode,
            record_date: NaiveDate::from_ymd(2026, 1, 10),
            record_time: NaiveTime::from_hms(8, 0, 0),
            chiller_status: ChillerState::Off,
            fsm_state: String::from("S0"),
            created_at: NaiveDateTime::from_timestamp(1_767_000_000, 0),
        }
    }

    #[test]
    fn actuator_control_is_rejected_in_auto_mode() {
        let publisher = RecordingPublisher::default();
        let topics = topics();
        let dispatcher = Dispatcher::new(&publisher, &topics);
        let mut store = MemoryStatusStore::with_current(status_with_mode(Mode::Auto));

        let result = dispatcher.control_actuator(&mut store, ChillerState::On);

        assert!(matches!(result, Err(CommandError::PreconditionFailed)));
        assert_eq!(store.upsert_count, 0);
        assert!(publisher.published.borrow().is_empty());
    }

    #[test]
    fn actuator_control_is_rejected_without_a_status_row() {
        let publisher = RecordingPublisher::default();
        let topics = topics();
        let dispatcher = Dispatcher::new(&publisher, &topics);
        let mut store = MemoryStatusStore::default();

        let result = dispatcher.control_actuator(&mut store, ChillerState::On);

        assert!(matches!(result, Err(CommandError::PreconditionFailed)));
        assert_eq!(store.upsert_count, 0);
    }

    #[test]
    fn mode_assertion_is_published_strictly_before_the_chiller_command() {
        let publisher = RecordingPublisher::default();
        let topics = topics();
        let dispatcher = Dispatcher::new(&publisher, &topics);
        let mut store = MemoryStatusStore::with_current(status_with_mode(Mode::Manual));

        let record = dispatcher
            .control_actuator(&mut store, ChillerState::On)
            .unwrap();

        assert_eq!(record.chiller_status, ChillerState::On);
        let published = publisher.published.borrow();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].topic, "hydro/control/chiller");
        assert_eq!(published[0].payload, "MODE=MANUAL");
        assert_eq!(published[1].topic, "hydro/control/chiller");
        assert_eq!(published[1].payload, "CHILLER=ON");
        assert!(!published[0].retained && !published[1].retained);
    }

    #[test]
    fn transport_failure_keeps_the_stored_intent() {
        let mut publisher = RecordingPublisher::default();
        publisher.fail_from = Some(0);
        let topics = topics();
        let dispatcher = Dispatcher::new(&publisher, &topics);
        let mut store = MemoryStatusStore::with_current(status_with_mode(Mode::Manual));

        let result = dispatcher.control_actuator(&mut store, ChillerState::On);

        assert!(matches!(result, Err(CommandError::TransportUnavailable(_))));
        // The status mutation from step one is not rolled back.
        assert_eq!(store.upsert_count, 1);
        assert_eq!(
            store.current.as_ref().unwrap().chiller_status,
            ChillerState::On
        );
    }

    #[test]
    fn chiller_command_is_withheld_when_the_mode_assertion_fails() {
        let mut publisher = RecordingPublisher::default();
        publisher.fail_from = Some(1);
        let topics = topics();
        let dispatcher = Dispatcher::new(&publisher, &topics);
        let mut store = MemoryStatusStore::with_current(status_with_mode(Mode::Manual));

        let result = dispatcher.control_actuator(&mut store, ChillerState::Off);

        assert!(matches!(result, Err(CommandError::TransportUnavailable(_))));
        let published = publisher.published.borrow();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload, "MODE=MANUAL");
    }

    #[test]
    fn set_mode_updates_the_row_and_broadcasts_retained_json() {
        let publisher = RecordingPublisher::default();
        let topics = topics();
        let dispatcher = Dispatcher::new(&publisher, &topics);
        let mut store = MemoryStatusStore::with_current(status_with_mode(Mode::Auto));

        let record = dispatcher.set_mode(&mut store, Mode::Manual).unwrap();

        assert_eq!(record.mode, Mode::Manual);
        // Fields other than mode and the stamp are kept.
        assert_eq!(record.chiller_status, ChillerState::Off);
        assert_eq!(record.fsm_state, "S0");
        let published = publisher.published.borrow();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "hydro/control");
        assert_eq!(published[0].payload, "{\"mode\":\"manual\"}");
        assert!(published[0].retained);
    }

    #[test]
    fn set_mode_succeeds_even_when_the_broadcast_fails() {
        let mut publisher = RecordingPublisher::default();
        publisher.fail_from = Some(0);
        let topics = topics();
        let dispatcher = Dispatcher::new(&publisher, &topics);
        let mut store = MemoryStatusStore::with_current(status_with_mode(Mode::Auto));

        let record = dispatcher.set_mode(&mut store, Mode::Manual).unwrap();

        assert_eq!(record.mode, Mode::Manual);
        assert_eq!(store.upsert_count, 1);
    }

    #[test]
    fn set_mode_creates_the_row_lazily() {
        let publisher = RecordingPublisher::default();
        let topics = topics();
        let dispatcher = Dispatcher::new(&publisher, &topics);
        let mut store = MemoryStatusStore::default();

        let record = dispatcher.set_mode(&mut store, Mode::Manual).unwrap();

        assert_eq!(record.mode, Mode::Manual);
        assert_eq!(record.chiller_status, ChillerState::Off);
        assert_eq!(record.fsm_state, "S0");
    }
}

//! Merges incoming telemetry into the authoritative status row.
use crate::record::{StatusRecord, StatusUpdate, TelemetryRecord};
use crate::store::{StatusStore, StoreError};

/// Applies a field-level merge-if-present of `record` onto the current
/// status row.
///
/// Fields absent from the telemetry record keep their stored value, so a
/// low-information message can never clobber known state. When the record
/// carries none of {chiller, fsm_state, mode} no write happens at all and
/// `Ok(None)` is returned.
///
/// The caller must hold the single-writer scope for the status row (in this
/// daemon: the coordinator thread); the read-then-write here is not safe
/// against concurrent writers.
pub fn reconcile(
    store: &mut dyn StatusStore,
    record: &TelemetryRecord,
) -> Result<Option<StatusRecord>, StoreError> {
    if !record.is_status_relevant() {
        return Ok(None);
    }

    let mut update = match store.get_current()? {
        Some(current) => StatusUpdate::from_record(&current),
        None => StatusUpdate::defaults(record.record_date, record.record_time),
    };

    if let Some(chiller) = record.chiller {
        update.chiller_status = chiller;
    }
    if let Some(ref fsm_state) = record.fsm_state {
        update.fsm_state = fsm_state.clone();
    }
    if let Some(mode) = record.mode {
        update.mode = mode;
    }
    update.record_date = record.record_date;
    update.record_time = record.record_time;

    store.upsert(&update).map(Some)
}

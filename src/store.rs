//! Store abstractions the coordinator works against.
//!
//! The production implementation lives in [`crate::database`]; the traits
//! exist so the reconcile and command logic can be exercised without a
//! running postgres server.
use thiserror::Error;

use crate::record::{StatusRecord, StatusUpdate, TelemetryRecord};

#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or the statement failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Accessor for the single authoritative status row.
pub trait StatusStore {
    /// Returns the current status row, newest by id, or `None` when no row
    /// exists yet.
    fn get_current(&mut self) -> Result<Option<StatusRecord>, StoreError>;

    /// Writes the full field set to the current row, creating it when the
    /// table is empty. Returns the row as persisted.
    fn upsert(&mut self, update: &StatusUpdate) -> Result<StatusRecord, StoreError>;
}

/// Append-only sink for accepted telemetry records.
pub trait LogStore {
    /// Inserts one immutable log row and returns its server-assigned id.
    fn append(&mut self, record: &TelemetryRecord) -> Result<i64, StoreError>;
}

#[cfg(test)]
pub mod testing {
    //! In-memory fakes shared by the reconcile and command tests.
    use super::*;
    use chrono::NaiveDateTime;

    #[derive(Default)]
    pub struct MemoryStatusStore {
        pub current: Option<StatusRecord>,
        pub upsert_count: usize,
        pub fail: bool,
    }

    impl MemoryStatusStore {
        pub fn with_current(record: StatusRecord) -> Self {
            MemoryStatusStore {
                current: Some(record),
                upsert_count: 0,
                fail: false,
            }
        }
    }

    impl StatusStore for MemoryStatusStore {
        fn get_current(&mut self) -> Result<Option<StatusRecord>, StoreError> {
            if self.fail {
                return Err(StoreError::Unavailable(String::from("test failure")));
            }
            Ok(self.current.clone())
        }

        fn upsert(&mut self, update: &StatusUpdate) -> Result<StatusRecord, StoreError> {
            if self.fail {
                return Err(StoreError::Unavailable(String::from("test failure")));
            }
            self.upsert_count += 1;
            let id = self.current.as_ref().map(|record| record.id).unwrap_or(1);
            let created_at = self
                .current
                .as_ref()
                .map(|record| record.created_at)
                .unwrap_or_else(|| NaiveDateTime::from_timestamp(0, 0));
            let record = StatusRecord {
                id,
                mode: update.mode,
                record_date: update.record_date,
                record_time: update.record_time,
                chiller_status: update.chiller_status,
                fsm_state: update.fsm_state.clone(),
                created_at,
            };
            self.current = Some(record.clone());
            Ok(record)
        }
    }

    #[derive(Default)]
    pub struct MemoryLogStore {
        pub rows: Vec<TelemetryRecord>,
        pub fail: bool,
    }

    impl LogStore for MemoryLogStore {
        fn append(&mut self, record: &TelemetryRecord) -> Result<i64, StoreError> {
            if self.fail {
                return Err(StoreError::Unavailable(String::from("test failure")));
            }
            self.rows.push(record.clone());
            Ok(self.rows.len() as i64)
        }
    }

    /// Both stores behind one value, mirroring how [`crate::database::PostgresStore`]
    /// implements both traits.
    #[derive(Default)]
    pub struct MemoryStore {
        pub status: MemoryStatusStore,
        pub log: MemoryLogStore,
    }

    impl StatusStore for MemoryStore {
        fn get_current(&mut self) -> Result<Option<StatusRecord>, StoreError> {
            self.status.get_current()
        }

        fn upsert(&mut self, update: &StatusUpdate) -> Result<StatusRecord, StoreError> {
            self.status.upsert(update)
        }
    }

    impl LogStore for MemoryStore {
        fn append(&mut self, record: &TelemetryRecord) -> Result<i64, StoreError> {
            self.log.append(record)
        }
    }
}

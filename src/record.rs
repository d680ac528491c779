//! Module that contains all record and status types handled by this application.
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
/// Operating mode of the nethouse controller.
///
/// Stored lower-case in the database, transmitted upper-case on the wire.
pub enum Mode {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "manual")]
    Manual,
}

impl Mode {
    /// The lower-case form used in the status table and the status broadcast.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Manual => "manual",
        }
    }

    /// The upper-case form used by the device protocol.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Mode::Auto => "AUTO",
            Mode::Manual => "MANUAL",
        }
    }
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("auto") {
            Ok(Mode::Auto)
        } else if value.eq_ignore_ascii_case("manual") {
            Ok(Mode::Manual)
        } else {
            Err(())
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
/// Reported or commanded state of the chiller relay.
pub enum ChillerState {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl ChillerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChillerState::On => "ON",
            ChillerState::Off => "OFF",
        }
    }
}

impl FromStr for ChillerState {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("on") {
            Ok(ChillerState::On)
        } else if value.eq_ignore_ascii_case("off") {
            Ok(ChillerState::Off)
        } else {
            Err(())
        }
    }
}

impl fmt::Display for ChillerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// One decoded telemetry message from the device.
///
/// `record_date` and `record_time` are always populated, falling back to the
/// ingestion wall clock when the message carries no valid timestamp. Every
/// other field is `None` when the corresponding token was absent or
/// malformed on the wire.
pub struct TelemetryRecord {
    /// Date the device reported for the reading.
    pub record_date: NaiveDate,
    /// Time of day the device reported for the reading.
    pub record_time: NaiveTime,
    /// Raw light sensor reading.
    pub ldr_value: Option<i32>,
    /// Battery voltage in volts.
    pub battery_voltage: Option<f64>,
    /// Water temperature in celsius.
    pub temperature: Option<f64>,
    /// Reported chiller relay state.
    pub chiller: Option<ChillerState>,
    /// Opaque state token of the firmware state machine, e.g. `S0`.
    pub fsm_state: Option<String>,
    /// Reported operating mode.
    pub mode: Option<Mode>,
}

impl TelemetryRecord {
    /// A record carrying nothing but the fallback timestamp.
    pub fn empty(record_date: NaiveDate, record_time: NaiveTime) -> Self {
        TelemetryRecord {
            record_date,
            record_time,
            ldr_value: None,
            battery_voltage: None,
            temperature: None,
            chiller: None,
            fsm_state: None,
            mode: None,
        }
    }

    /// True when the message carried at least one of the fields the status
    /// record tracks. Messages without any are still logged but never
    /// trigger a status write.
    pub fn is_status_relevant(&self) -> bool {
        self.chiller.is_some() || self.fsm_state.is_some() || self.mode.is_some()
    }
}

/// Default state token used before the device ever reported one.
pub const DEFAULT_FSM_STATE: &str = "S0";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// The authoritative status row. At most one row is current at any time;
/// readers always take the newest by id.
pub struct StatusRecord {
    /// Server-assigned identifier.
    pub id: i64,
    /// Current operating mode.
    pub mode: Mode,
    /// Date of the update that last touched this row.
    pub record_date: NaiveDate,
    /// Time of the update that last touched this row.
    pub record_time: NaiveTime,
    /// Last known chiller relay state.
    pub chiller_status: ChillerState,
    /// Last known firmware state token.
    pub fsm_state: String,
    /// Insertion timestamp of the row.
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
/// The full field set written to the status row by an upsert. The caller
/// computes the merge; the store only persists it.
pub struct StatusUpdate {
    pub mode: Mode,
    pub record_date: NaiveDate,
    pub record_time: NaiveTime,
    pub chiller_status: ChillerState,
    pub fsm_state: String,
}

impl StatusUpdate {
    /// The defaults a lazily created status row starts from.
    pub fn defaults(record_date: NaiveDate, record_time: NaiveTime) -> Self {
        StatusUpdate {
            mode: Mode::Auto,
            record_date,
            record_time,
            chiller_status: ChillerState::Off,
            fsm_state: String::from(DEFAULT_FSM_STATE),
        }
    }

    /// The field set currently persisted in `record`.
    pub fn from_record(record: &StatusRecord) -> Self {
        StatusUpdate {
            mode: record.mode,
            record_date: record.record_date,
            record_time: record.record_time,
            chiller_status: record.chiller_status,
            fsm_state: record.fsm_state.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_case_insensitive() {
        assert_eq!("AUTO".parse::<Mode>(), Ok(Mode::Auto));
        assert_eq!("Manual".parse::<Mode>(), Ok(Mode::Manual));
        assert!("standby".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_serializes_lower_case() {
        assert_eq!(serde_json::to_string(&Mode::Manual).unwrap(), "\"manual\"");
    }

    #[test]
    fn chiller_state_round_trips() {
        assert_eq!("on".parse::<ChillerState>(), Ok(ChillerState::On));
        assert_eq!(ChillerState::Off.as_str(), "OFF");
    }
}

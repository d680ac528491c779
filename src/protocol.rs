//! Decoder for the device line protocol.
//!
//! The firmware emits one whitespace-separated line per report, e.g.
//! `Date:29-12-2025 Time=00:47:09 LDR=1174 VB=56.50 T=30.00 CHILLER=OFF(A) MODE=AUTO STATE=S0`.
//! Tokens may appear in any order and every one of them is optional. Each
//! field is extracted independently, so a malformed token degrades that
//! field alone and never fails the whole line.
use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use serde::Deserialize;

use crate::record::{ChillerState, Mode, TelemetryRecord};

#[derive(Deserialize)]
/// Legacy producers wrap the raw line in a JSON object.
struct Envelope {
    data: String,
}

/// Unwraps the optional JSON envelope around a telemetry payload.
///
/// Anything that does not deserialize as `{"data": "..."}` is treated as the
/// raw protocol line itself.
pub fn decode_envelope(payload: &str) -> String {
    match serde_json::from_str::<Envelope>(payload) {
        Ok(envelope) => envelope.data,
        Err(_) => payload.to_string(),
    }
}

/// Decodes one telemetry line into a [`TelemetryRecord`].
///
/// Never fails: fields that are absent or malformed stay `None`, and the
/// date/time fall back to `received_at` when the message carries no valid
/// timestamp. Unrecognized tokens are ignored.
pub fn parse_line(line: &str, received_at: DateTime<Local>) -> TelemetryRecord {
    let received_at = received_at.naive_local();
    let mut record = TelemetryRecord::empty(received_at.date(), received_at.time());

    for token in line.split_whitespace() {
        if let Some(value) = token.strip_prefix("Date:") {
            if let Some(date) = parse_date(value) {
                record.record_date = date;
            } else {
                log::debug!(target: "hydrod::proto", "Invalid date token \'{}\', using receive date", token);
            }
        } else if let Some(value) = token.strip_prefix("Time=") {
            if let Some(time) = parse_time(value) {
                record.record_time = time;
            } else {
                log::debug!(target: "hydrod::proto", "Invalid time token \'{}\', using receive time", token);
            }
        } else if let Some(value) = token.strip_prefix("LDR=") {
            record.ldr_value = value.parse::<i32>().ok().or(record.ldr_value);
        } else if let Some(value) = token.strip_prefix("VB=") {
            record.battery_voltage = value.parse::<f64>().ok().or(record.battery_voltage);
        } else if let Some(value) = token.strip_prefix("T=") {
            record.temperature = value.parse::<f64>().ok().or(record.temperature);
        } else if let Some(value) = strip_prefix_ci(token, "CHILLER=") {
            record.chiller = parse_chiller(value).or(record.chiller);
        } else if let Some(value) = strip_prefix_ci(token, "STATE=") {
            record.fsm_state = parse_state_token(value).or(record.fsm_state);
        } else if let Some(value) = strip_prefix_ci(token, "MODE=") {
            record.mode = value.parse::<Mode>().ok().or(record.mode);
        }
    }

    record
}

/// Case-insensitive variant of `str::strip_prefix` for the keys the
/// firmware emits with varying case. `prefix` must be ASCII; comparison is
/// done on bytes so a multi-byte character in `token` can never land on a
/// slice boundary.
fn strip_prefix_ci<'a>(token: &'a str, prefix: &str) -> Option<&'a str> {
    if token.len() < prefix.len() {
        return None;
    }
    if !token.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes()) {
        return None;
    }
    token.get(prefix.len()..)
}

/// Parses `DD-MM-YYYY` into a date.
///
/// Components must have exactly the widths of the wire format, be in range
/// (year 2000..=2100, month 1..=12, day 1..=31) and form a real calendar
/// date, otherwise the token is rejected.
fn parse_date(value: &str) -> Option<NaiveDate> {
    let mut components = value.splitn(3, '-');
    let day = parse_fixed_digits(components.next()?, 2)?;
    let month = parse_fixed_digits(components.next()?, 2)?;
    let year = parse_fixed_digits(components.next()?, 4)? as i32;

    if !(2000..=2100).contains(&year) || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Accepts exactly `width` ascii digits.
fn parse_fixed_digits(value: &str, width: usize) -> Option<u32> {
    if value.len() != width || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse::<u32>().ok()
}

/// Parses `H:M:S` with one or two digit components into a time of day.
fn parse_time(value: &str) -> Option<NaiveTime> {
    let mut components = value.splitn(3, ':');
    let hour = components.next()?.parse::<u32>().ok()?;
    let minute = components.next()?.parse::<u32>().ok()?;
    let second = components.next()?.parse::<u32>().ok()?;

    if hour > 23 || minute > 59 || second > 59 {
        return None;
    }
    NaiveTime::from_hms_opt(hour, minute, second)
}

/// Parses the chiller token, tolerating the annunciator suffix some firmware
/// revisions append, e.g. `OFF(A)`.
fn parse_chiller(value: &str) -> Option<ChillerState> {
    let value = match value.find('(') {
        Some(index) => &value[..index],
        None => value,
    };
    value.parse::<ChillerState>().ok()
}

/// Accepts `S<digits>` (any case) and normalizes it to upper case.
fn parse_state_token(value: &str) -> Option<String> {
    let mut chars = value.chars();
    match chars.next() {
        Some('S') | Some('s') => {}
        _ => return None,
    }
    let digits = chars.as_str();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(value.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn received_at() -> DateTime<Local> {
        Local.ymd(2026, 1, 15).and_hms(12, 30, 45)
    }

    #[test]
    fn full_line_round_trip() {
        let line = "Date:05-03-2025 Time=9:7:3 LDR=1200 VB=54.20 T=28.50 CHILLER=OFF MODE=AUTO STATE=S2";
        let record = parse_line(line, received_at());

        assert_eq!(record.record_date, NaiveDate::from_ymd(2025, 3, 5));
        assert_eq!(record.record_time, NaiveTime::from_hms(9, 7, 3));
        assert_eq!(record.record_time.format("%H:%M:%S").to_string(), "09:07:03");
        assert_eq!(record.ldr_value, Some(1200));
        assert_eq!(record.battery_voltage, Some(54.2));
        assert_eq!(record.temperature, Some(28.5));
        assert_eq!(record.chiller, Some(ChillerState::Off));
        assert_eq!(record.mode, Some(Mode::Auto));
        assert_eq!(record.fsm_state, Some(String::from("S2")));
    }

    #[test]
    fn out_of_range_date_falls_back_to_receive_date() {
        let record = parse_line("Date:32-13-2025 Time=10:00:00 LDR=5", received_at());

        assert_eq!(record.record_date, NaiveDate::from_ymd(2026, 1, 15));
        assert_eq!(record.record_time, NaiveTime::from_hms(10, 0, 0));
        assert_eq!(record.ldr_value, Some(5));
        assert_eq!(record.battery_voltage, None);
        assert_eq!(record.temperature, None);
        assert_eq!(record.chiller, None);
        assert_eq!(record.fsm_state, None);
        assert_eq!(record.mode, None);
    }

    #[test]
    fn year_outside_window_is_rejected() {
        let record = parse_line("Date:01-01-1999", received_at());
        assert_eq!(record.record_date, NaiveDate::from_ymd(2026, 1, 15));

        let record = parse_line("Date:01-01-2101", received_at());
        assert_eq!(record.record_date, NaiveDate::from_ymd(2026, 1, 15));
    }

    #[test]
    fn impossible_calendar_date_is_rejected() {
        // Components are in range but the date does not exist.
        let record = parse_line("Date:31-02-2025", received_at());
        assert_eq!(record.record_date, NaiveDate::from_ymd(2026, 1, 15));
    }

    #[test]
    fn out_of_range_time_falls_back_to_receive_time() {
        let record = parse_line("Time=25:00:00", received_at());
        assert_eq!(record.record_time, NaiveTime::from_hms(12, 30, 45));

        let record = parse_line("Time=10:61:00", received_at());
        assert_eq!(record.record_time, NaiveTime::from_hms(12, 30, 45));
    }

    #[test]
    fn fieldless_line_yields_only_receive_timestamp() {
        let record = parse_line("hello world 42", received_at());

        assert_eq!(record, TelemetryRecord::empty(
            NaiveDate::from_ymd(2026, 1, 15),
            NaiveTime::from_hms(12, 30, 45),
        ));
        assert!(!record.is_status_relevant());
    }

    #[test]
    fn chiller_annunciator_suffix_is_stripped() {
        let record = parse_line("CHILLER=OFF(A)", received_at());
        assert_eq!(record.chiller, Some(ChillerState::Off));
    }

    #[test]
    fn keys_and_values_are_case_insensitive_where_the_firmware_varies() {
        let record = parse_line("chiller=on mode=Manual state=s13", received_at());

        assert_eq!(record.chiller, Some(ChillerState::On));
        assert_eq!(record.mode, Some(Mode::Manual));
        assert_eq!(record.fsm_state, Some(String::from("S13")));
    }

    #[test]
    fn malformed_numeric_fields_stay_absent() {
        let record = parse_line("LDR=abc VB=x T=--", received_at());

        assert_eq!(record.ldr_value, None);
        assert_eq!(record.battery_voltage, None);
        assert_eq!(record.temperature, None);
    }

    #[test]
    fn state_token_requires_digits() {
        assert_eq!(parse_line("STATE=SX", received_at()).fsm_state, None);
        assert_eq!(parse_line("STATE=7", received_at()).fsm_state, None);
        assert_eq!(
            parse_line("STATE=S0", received_at()).fsm_state,
            Some(String::from("S0"))
        );
    }

    #[test]
    fn multi_byte_characters_next_to_a_keyword_do_not_break_parsing() {
        // 'É' straddles the byte position where the '=' of a keyword would
        // sit; the token must be ignored, not panic the parser.
        let record = parse_line("CHILLERÉ STATEÉ=S1 MODE=AUTO", received_at());

        assert_eq!(record.chiller, None);
        assert_eq!(record.fsm_state, None);
        assert_eq!(record.mode, Some(Mode::Auto));
    }

    #[test]
    fn fully_multi_byte_garbage_is_ignored() {
        let record = parse_line("ÀÁÂÃÄÅÆÇÈ Tëmp=1 MODE=MANUAL", received_at());
        assert_eq!(record.mode, Some(Mode::Manual));
        assert_eq!(record.temperature, None);
    }

    #[test]
    fn one_digit_date_components_fall_back_to_receive_date() {
        // The wire format is DD-MM-YYYY with fixed component widths.
        let record = parse_line("Date:5-3-2025", received_at());
        assert_eq!(record.record_date, NaiveDate::from_ymd(2026, 1, 15));

        let record = parse_line("Date:05-03-25", received_at());
        assert_eq!(record.record_date, NaiveDate::from_ymd(2026, 1, 15));

        let record = parse_line("Date:+5-03-2025", received_at());
        assert_eq!(record.record_date, NaiveDate::from_ymd(2026, 1, 15));
    }

    #[test]
    fn token_order_is_irrelevant() {
        let a = parse_line("MODE=AUTO CHILLER=ON STATE=S1", received_at());
        let b = parse_line("STATE=S1 CHILLER=ON MODE=AUTO", received_at());
        assert_eq!(a, b);
    }

    #[test]
    fn envelope_unwraps_legacy_json_wrapper() {
        assert_eq!(
            decode_envelope("{\"data\": \"LDR=7 MODE=AUTO\"}"),
            "LDR=7 MODE=AUTO"
        );
    }

    #[test]
    fn envelope_passes_raw_lines_through() {
        assert_eq!(decode_envelope("LDR=7 MODE=AUTO"), "LDR=7 MODE=AUTO");
        // JSON without the expected wrapper field is treated as raw text.
        assert_eq!(decode_envelope("{\"x\": 1}"), "{\"x\": 1}");
    }
}

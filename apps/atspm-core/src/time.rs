use chrono::{DateTime, Datelike, Duration, NaiveDateTime, NaiveTime, Timelike};

pub(crate) fn epoch_seconds(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp()
}

pub(crate) fn from_epoch_seconds(secs: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc())
}

/// Start of the fixed-width bin containing `ts`.
///
/// Bins are aligned to the Unix epoch, so any width that divides a day aligns to midnight.
pub fn floor_to_bin(ts: NaiveDateTime, bin_minutes: u32) -> NaiveDateTime {
    let width = i64::from(bin_minutes.max(1)) * 60;
    let micros = ts.and_utc().timestamp_micros();
    let width_micros = width * 1_000_000;
    let floored = micros.div_euclid(width_micros) * width_micros;
    DateTime::from_timestamp_micros(floored)
        .map(|dt| dt.naive_utc())
        .unwrap_or(ts)
}

/// 1-based index of the bin within its day (00:00 bin is 1).
pub fn day_period(ts: NaiveDateTime, bin_minutes: u32) -> u32 {
    let minutes = ts.hour() * 60 + ts.minute();
    minutes / bin_minutes.max(1) + 1
}

/// ISO weekday, Monday = 1.
pub fn iso_weekday(ts: NaiveDateTime) -> u32 {
    ts.weekday().number_from_monday()
}

pub fn seconds_between(start: NaiveDateTime, end: NaiveDateTime) -> f64 {
    let delta = end - start;
    match delta.num_microseconds() {
        Some(micros) => micros as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

pub fn shift_seconds(ts: NaiveDateTime, seconds: f64) -> NaiveDateTime {
    if !seconds.is_finite() || seconds == 0.0 {
        return ts;
    }
    ts + Duration::microseconds((seconds * 1_000_000.0).round() as i64)
}

/// Length in seconds of the intersection of `[a_start, a_end)` and `[b_start, b_end)`.
pub fn overlap_seconds(
    a_start: NaiveDateTime,
    a_end: NaiveDateTime,
    b_start: NaiveDateTime,
    b_end: NaiveDateTime,
) -> f64 {
    let start = a_start.max(b_start);
    let end = a_end.min(b_end);
    if end <= start {
        return 0.0;
    }
    seconds_between(start, end)
}

/// Half-open `[start, end)` time-of-day check.
pub fn time_of_day_within(ts: NaiveDateTime, start: NaiveTime, end: NaiveTime) -> bool {
    let tod = ts.time();
    tod >= start && tod < end
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn floors_to_fifteen_minute_bins() {
        assert_eq!(floor_to_bin(at(8, 14, 59), 15), at(8, 0, 0));
        assert_eq!(floor_to_bin(at(8, 15, 0), 15), at(8, 15, 0));
        assert_eq!(floor_to_bin(at(23, 59, 59), 60), at(23, 0, 0));
    }

    #[test]
    fn day_period_is_one_based() {
        assert_eq!(day_period(at(0, 0, 0), 15), 1);
        assert_eq!(day_period(at(8, 0, 0), 15), 33);
        assert_eq!(day_period(at(23, 45, 0), 15), 96);
    }

    #[test]
    fn overlap_is_zero_for_disjoint_windows() {
        assert_eq!(
            overlap_seconds(at(0, 0, 0), at(0, 0, 10), at(0, 0, 10), at(0, 0, 20)),
            0.0
        );
        assert_eq!(
            overlap_seconds(at(0, 0, 0), at(0, 0, 15), at(0, 0, 10), at(0, 0, 20)),
            5.0
        );
    }

    #[test]
    fn shift_handles_fractional_seconds() {
        let shifted = shift_seconds(at(0, 0, 0), 1.5);
        assert_eq!(seconds_between(at(0, 0, 0), shifted), 1.5);
        assert_eq!(iso_weekday(at(0, 0, 0)), 2);
    }
}

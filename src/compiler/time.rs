//! Time Window Expander.
//!
//! The engine only matches absolute timestamps, the daily clock and the weekday, so
//! recurring "days of month" windows are unrolled into absolute intervals covering the
//! current month and the eleven that follow it.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Local, Months, NaiveDate, NaiveDateTime, NaiveTime,
    Offset, TimeZone,
};
use log::debug;
use std::collections::BTreeSet;

use crate::compiler::step::{utc_seconds_of, DayTime};
use crate::models::policy::TimeWindow;
use crate::utils::error::{FirewallError, FirewallResult};

/// Number of months a month-day window is unrolled over
pub const MONTHS_AHEAD: u32 = 12;

const TIME_FORMAT: &str = "%H:%M:%S";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Timezone wall-clock strings are interpreted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// The host's local timezone, DST included
    Local,
    Fixed(FixedOffset),
}

impl Zone {
    fn localize(self, naive: NaiveDateTime) -> FirewallResult<DateTime<FixedOffset>> {
        let resolved = match self {
            Zone::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&dt.offset().fix())),
            Zone::Fixed(offset) => offset.from_local_datetime(&naive).single(),
        };
        resolved.ok_or_else(|| {
            FirewallError::parse(format!("{} does not exist in the local timezone", naive))
        })
    }
}

/// Reference date and timezone for expansion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeAnchor {
    pub today: NaiveDate,
    pub zone: Zone,
}

impl TimeAnchor {
    /// Today in the host timezone
    pub fn now() -> Self {
        Self {
            today: Local::now().date_naive(),
            zone: Zone::Local,
        }
    }

    /// A pinned date in a fixed offset
    pub fn fixed(today: NaiveDate, offset: FixedOffset) -> Self {
        Self {
            today,
            zone: Zone::Fixed(offset),
        }
    }

    fn day_time(&self, local: NaiveTime) -> FirewallResult<DayTime> {
        let instant = self.zone.localize(self.today.and_time(local))?;
        Ok(DayTime {
            local,
            utc_seconds: utc_seconds_of(&instant),
        })
    }
}

/// Absolute interval, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Interval {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl Interval {
    /// Both ends must fit the engine's unsigned nanosecond clock
    pub fn new(start: DateTime<FixedOffset>, end: DateTime<FixedOffset>) -> FirewallResult<Self> {
        for instant in [start, end] {
            match instant.timestamp_nanos_opt() {
                Some(nanos) if nanos >= 0 => {}
                _ => {
                    return Err(FirewallError::parse(format!(
                        "{} is outside the matchable time range",
                        instant.format(DATETIME_FORMAT)
                    )))
                }
            }
        }
        Ok(Self { start, end })
    }
}

/// One expanded time restriction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeMatch {
    /// Daily recurring window
    Hour { start: DayTime, end: DayTime },
    /// Weekday indices, 0 = Sunday
    Weekdays(Vec<u8>),
    /// One non-recurring interval
    Absolute(Interval),
    /// Month days unrolled over a rolling year
    Intervals(Vec<Interval>),
}

/// Expand policy time windows into engine-matchable restrictions, in window order
pub fn expand(windows: &[TimeWindow], anchor: &TimeAnchor) -> FirewallResult<Vec<TimeMatch>> {
    let mut matches = Vec::new();

    for window in windows {
        if !window.day.is_empty() {
            if !window.hour.is_empty() || !window.week.is_empty() || !window.month.is_empty() {
                debug!("Time window {:?} has a day interval; other keys ignored", window);
            }
            matches.push(TimeMatch::Absolute(parse_day_interval(&window.day, anchor)?));
            continue;
        }

        if !window.hour.is_empty() && window.month.is_empty() {
            let (start, end) = parse_hour_range(&window.hour)?;
            matches.push(TimeMatch::Hour {
                start: anchor.day_time(start)?,
                end: anchor.day_time(end)?,
            });
        }

        if !window.week.is_empty() {
            matches.push(TimeMatch::Weekdays(parse_weekdays(&window.week)?));
        }

        if !window.month.is_empty() {
            matches.push(TimeMatch::Intervals(expand_month(
                &window.month,
                &window.hour,
                anchor,
            )?));
        }
    }

    Ok(matches)
}

/// Unroll `1,10-15` (with an optional hour range) into absolute intervals
pub fn expand_month(month: &str, hour: &str, anchor: &TimeAnchor) -> FirewallResult<Vec<Interval>> {
    let (start_time, end_time) = if hour.is_empty() {
        (NaiveTime::MIN, end_of_day())
    } else {
        parse_hour_range(hour)?
    };
    if start_time > end_time {
        return Err(FirewallError::parse(format!(
            "hour range '{}' must not wrap midnight when combined with month days",
            hour
        )));
    }

    let first_of_month = anchor.today - Duration::days(i64::from(anchor.today.day0()));
    let mut intervals = BTreeSet::new();

    for day in parse_month_days(month)? {
        for offset in 0..MONTHS_AHEAD {
            let month_start = first_of_month
                .checked_add_months(Months::new(offset))
                .ok_or_else(|| FirewallError::parse("date out of range"))?;
            // Days past the end of a short month roll into the next one
            let date = month_start + Duration::days(i64::from(day - 1));

            intervals.insert(Interval::new(
                anchor.zone.localize(date.and_time(start_time))?,
                anchor.zone.localize(date.and_time(end_time))?,
            )?);
        }
    }

    Ok(intervals.into_iter().collect())
}

/// `HH:MM:SS-HH:MM:SS`
pub fn parse_hour_range(hour: &str) -> FirewallResult<(NaiveTime, NaiveTime)> {
    let parts: Vec<&str> = hour.split('-').map(str::trim).collect();
    if parts.len() != 2 {
        return Err(FirewallError::parse(format!(
            "hour range '{}' is not HH:MM:SS-HH:MM:SS",
            hour
        )));
    }

    let parse = |text: &str| {
        NaiveTime::parse_from_str(text, TIME_FORMAT)
            .map_err(|_| FirewallError::parse(format!("invalid time '{}' in '{}'", text, hour)))
    };
    Ok((parse(parts[0])?, parse(parts[1])?))
}

/// `YYYY-MM-DD HH:MM:SS-YYYY-MM-DD HH:MM:SS`, split at the third hyphen
fn parse_day_interval(day: &str, anchor: &TimeAnchor) -> FirewallResult<Interval> {
    let day = day.trim();
    if day.matches('-').count() != 5 {
        return Err(FirewallError::parse(format!(
            "day interval '{}' is not 'date time-date time'",
            day
        )));
    }

    let split = day
        .match_indices('-')
        .nth(2)
        .map(|(idx, _)| idx)
        .ok_or_else(|| FirewallError::parse(format!("day interval '{}' has no separator", day)))?;

    let parse = |text: &str| {
        NaiveDateTime::parse_from_str(text.trim(), DATETIME_FORMAT)
            .map_err(|_| FirewallError::parse(format!("invalid date time '{}'", text.trim())))
    };
    let start = anchor.zone.localize(parse(&day[..split])?)?;
    let end = anchor.zone.localize(parse(&day[split + 1..])?)?;

    if start > end {
        return Err(FirewallError::parse(format!(
            "day interval '{}' ends before it starts",
            day
        )));
    }
    Interval::new(start, end)
}

/// `0,1,5` or `1-5`, deduplicated and sorted
fn parse_weekdays(week: &str) -> FirewallResult<Vec<u8>> {
    let days = parse_number_list(week, 0, 6, "weekday")?;
    Ok(days.into_iter().map(|d| d as u8).collect())
}

/// Month-day tokens, each a day or an inclusive day range, in input order
fn parse_month_days(month: &str) -> FirewallResult<Vec<u32>> {
    parse_number_list(month, 1, 31, "day of month")
}

fn parse_number_list(list: &str, min: u32, max: u32, what: &str) -> FirewallResult<Vec<u32>> {
    let mut values = BTreeSet::new();

    for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let bounds: Vec<&str> = token.split('-').map(str::trim).collect();
        let (first, last) = match bounds.as_slice() {
            [single] => {
                let value = parse_bounded(single, min, max, what)?;
                (value, value)
            }
            [first, last] => (
                parse_bounded(first, min, max, what)?,
                parse_bounded(last, min, max, what)?,
            ),
            _ => {
                return Err(FirewallError::parse(format!(
                    "{} range '{}' must be N or N-M",
                    what, token
                )));
            }
        };
        if first > last {
            return Err(FirewallError::parse(format!(
                "{} range '{}' ends before it starts",
                what, token
            )));
        }
        values.extend(first..=last);
    }

    if values.is_empty() {
        return Err(FirewallError::parse(format!("no {} in '{}'", what, list)));
    }
    Ok(values.into_iter().collect())
}

fn parse_bounded(text: &str, min: u32, max: u32, what: &str) -> FirewallResult<u32> {
    let value: u32 = text
        .parse()
        .map_err(|_| FirewallError::parse(format!("invalid {} '{}'", what, text)))?;
    if value < min || value > max {
        return Err(FirewallError::parse(format!(
            "{} {} outside {}..={}",
            what, value, min, max
        )));
    }
    Ok(value)
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor() -> TimeAnchor {
        TimeAnchor::fixed(
            NaiveDate::from_ymd_opt(2024, 1, 17).unwrap(),
            FixedOffset::east_opt(8 * 3600).unwrap(),
        )
    }

    fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn single_day_spans_twelve_full_days() {
        let intervals = expand_month("5", "", &anchor()).unwrap();
        assert_eq!(intervals.len(), 12);

        for (i, iv) in intervals.iter().enumerate() {
            let start = iv.start.naive_local();
            assert_eq!(start.date().day(), 5);
            assert_eq!(start.date().month() as usize, i + 1);
            assert_eq!(start.time(), hms(0, 0, 0));
            assert_eq!(iv.end.naive_local().time(), hms(23, 59, 59));
            assert_eq!(iv.end.naive_local().date(), start.date());
        }
    }

    #[test]
    fn month_tokens_with_range_expand_to_72_intervals() {
        let intervals = expand_month("1,10-15", "", &anchor()).unwrap();
        assert_eq!(intervals.len(), 72);
    }

    #[test]
    fn month_hour_bounds_every_interval() {
        let intervals = expand_month("1", "18:00:00-19:00:00", &anchor()).unwrap();
        assert!(intervals
            .iter()
            .all(|iv| iv.start.naive_local().time() == hms(18, 0, 0)
                && iv.end.naive_local().time() == hms(19, 0, 0)));
        // Twelfth month of the window
        assert_eq!(intervals[11].start.naive_local().date(), NaiveDate::from_ymd_opt(2024, 12, 1).unwrap());
    }

    #[test]
    fn day_31_rolls_into_next_month_in_short_months() {
        let intervals = expand_month("31", "", &anchor()).unwrap();
        assert_eq!(intervals.len(), 12);
        // February 2024 has 29 days
        assert_eq!(
            intervals[1].start.naive_local().date(),
            NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()
        );
    }

    #[test]
    fn overlapping_tokens_are_deduplicated() {
        assert_eq!(expand_month("1,1-2", "", &anchor()).unwrap().len(), 24);
    }

    #[test]
    fn malformed_month_tokens_fail() {
        assert!(matches!(expand_month("1-2-3", "", &anchor()), Err(FirewallError::ParseError(_))));
        assert!(matches!(expand_month("0", "", &anchor()), Err(FirewallError::ParseError(_))));
        assert!(matches!(expand_month("32", "", &anchor()), Err(FirewallError::ParseError(_))));
        assert!(matches!(expand_month("x", "", &anchor()), Err(FirewallError::ParseError(_))));
    }

    #[test]
    fn malformed_hour_is_a_hard_error() {
        assert!(matches!(expand_month("1", "18:00", &anchor()), Err(FirewallError::ParseError(_))));
        assert!(matches!(parse_hour_range("18:00:00"), Err(FirewallError::ParseError(_))));
        assert!(matches!(
            expand_month("1", "19:00:00-18:00:00", &anchor()),
            Err(FirewallError::ParseError(_))
        ));
    }

    #[test]
    fn hour_only_window_is_daily_range_in_utc() {
        let windows = vec![TimeWindow {
            hour: "18:00:00-19:00:00".into(),
            ..Default::default()
        }];
        let matches = expand(&windows, &anchor()).unwrap();
        match &matches[..] {
            [TimeMatch::Hour { start, end }] => {
                assert_eq!(start.local, hms(18, 0, 0));
                assert_eq!(start.utc_seconds, 10 * 3600);
                assert_eq!(end.utc_seconds, 11 * 3600);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn day_takes_precedence() {
        let windows = vec![TimeWindow {
            day: "2022-11-22 18:00:00-2022-11-22 19:00:00".into(),
            hour: "01:00:00-02:00:00".into(),
            week: "1".into(),
            ..Default::default()
        }];
        let matches = expand(&windows, &anchor()).unwrap();
        assert_eq!(matches.len(), 1);
        match &matches[0] {
            TimeMatch::Absolute(iv) => {
                assert_eq!(iv.start.naive_local().to_string(), "2022-11-22 18:00:00");
                assert_eq!(iv.end.naive_local().to_string(), "2022-11-22 19:00:00");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn week_and_hour_are_independent_steps() {
        let windows = vec![TimeWindow {
            week: "0,1,2,3,4,5,6".into(),
            hour: "18:00:00-19:00:00".into(),
            ..Default::default()
        }];
        let matches = expand(&windows, &anchor()).unwrap();
        assert!(matches!(matches[0], TimeMatch::Hour { .. }));
        assert_eq!(matches[1], TimeMatch::Weekdays(vec![0, 1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn bad_day_interval_fails() {
        let windows = vec![TimeWindow {
            day: "2022-11-22 18:00:00".into(),
            ..Default::default()
        }];
        assert!(matches!(expand(&windows, &anchor()), Err(FirewallError::ParseError(_))));
    }

    #[test]
    fn instants_before_the_epoch_are_rejected() {
        let windows = vec![TimeWindow {
            day: "1969-12-01 00:00:00-1969-12-31 00:00:00".into(),
            ..Default::default()
        }];
        assert!(matches!(expand(&windows, &anchor()), Err(FirewallError::ParseError(_))));

        let before = TimeAnchor::fixed(
            NaiveDate::from_ymd_opt(1969, 6, 1).unwrap(),
            FixedOffset::east_opt(0).unwrap(),
        );
        assert!(expand_month("1", "", &before).is_err());
    }
}

//! Calendar-interval scheduling: compute the next absolute firing time
//! for a cron-style five-field specification.
//!
//! Pure functions over a caller-supplied reference time, so every edge
//! (month carry, short months, weekday-vs-day-of-month races) is testable
//! without a clock.
//!
//! The search starts one minute past the reference time with seconds
//! zeroed, then descends month → day-of-month → hour → minute, advancing
//! the higher field and resetting the lower ones whenever a field cannot
//! match. A weekday constraint is solved as a second candidate; when both
//! weekday and day-of-month are given, the earlier candidate wins.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::manifest::keys;
use crate::wire::Value;

/// Five optional fields; `None` is a wildcard. Month is 0-11, day 1-31,
/// weekday 0-6 with Sunday as 0 (7 accepted as an alias), hour 0-23,
/// minute 0-59.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalendarSpec {
    pub minute: Option<u32>,
    pub hour: Option<u32>,
    pub day: Option<u32>,
    pub weekday: Option<u32>,
    pub month: Option<u32>,
}

impl CalendarSpec {
    /// Read a spec out of a manifest's calendar-interval mapping.
    /// Missing keys and explicit -1 both mean wildcard.
    pub fn from_value(v: &Value) -> CalendarSpec {
        fn field(v: &Value, key: &str) -> Option<u32> {
            match v.get(key).and_then(Value::as_integer) {
                Some(n) if n >= 0 => Some(n as u32),
                _ => None,
            }
        }
        CalendarSpec {
            minute: field(v, keys::CAL_MINUTE),
            hour: field(v, keys::CAL_HOUR),
            day: field(v, keys::CAL_DAY),
            weekday: field(v, keys::CAL_WEEKDAY),
            month: field(v, keys::CAL_MONTH),
        }
    }
}

/// Working broken-down time. Fields may be left out of range between
/// steps; [`Work::normalize`] carries them, the way `mktime` does.
#[derive(Debug, Clone, Copy)]
struct Work {
    year: i32,
    /// 0-11.
    mon: u32,
    day: u32,
    hour: u32,
    min: u32,
}

fn days_in_month(year: i32, mon: u32) -> u32 {
    match mon {
        0 | 2 | 4 | 6 | 7 | 9 | 11 => 31,
        3 | 5 | 8 | 10 => 30,
        _ => {
            let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
            if leap {
                29
            } else {
                28
            }
        }
    }
}

impl Work {
    fn from_datetime(t: NaiveDateTime) -> Work {
        Work {
            year: t.year(),
            mon: t.month0(),
            day: t.day(),
            hour: t.hour(),
            min: t.minute(),
        }
    }

    /// Carry overflowed fields upward.
    fn normalize(&mut self) {
        self.hour += self.min / 60;
        self.min %= 60;
        self.day += self.hour / 24;
        self.hour %= 24;
        self.year += (self.mon / 12) as i32;
        self.mon %= 12;
        while self.day > days_in_month(self.year, self.mon) {
            self.day -= days_in_month(self.year, self.mon);
            self.mon += 1;
            if self.mon == 12 {
                self.mon = 0;
                self.year += 1;
            }
        }
    }

    fn to_datetime(mut self) -> NaiveDateTime {
        self.normalize();
        NaiveDate::from_ymd_opt(self.year, self.mon + 1, self.day)
            .and_then(|d| d.and_hms_opt(self.hour, self.min, 0))
            .unwrap_or(NaiveDateTime::MAX)
    }

    /// Days since Sunday, the classic `tm_wday` convention.
    fn weekday(&self) -> u32 {
        let mut w = *self;
        w.normalize();
        NaiveDate::from_ymd_opt(w.year, w.mon + 1, w.day)
            .map(|d| d.weekday().num_days_from_sunday())
            .unwrap_or(0)
    }
}

/// Next firing time strictly after `reference`, at minute granularity.
///
/// The returned time satisfies every non-wildcard field of the spec and
/// is at least one minute past the reference.
pub fn next_fire(spec: &CalendarSpec, reference: NaiveDateTime) -> NaiveDateTime {
    let mut base = None;

    // The month/day/hour/minute descent, retried once from January 1 of
    // the following year when the current year has no match left.
    let mut w = Work::from_datetime(reference);
    w.min += 1;
    w.normalize();
    for _ in 0..2 {
        let mut t = w;
        if emu_month(&mut t, spec) {
            base = Some(t.to_datetime());
            break;
        }
        w = Work {
            year: w.year + 1,
            mon: 0,
            day: 1,
            hour: 0,
            min: 0,
        };
    }
    let base = base.unwrap_or(NaiveDateTime::MAX);

    match spec.weekday {
        None => base,
        Some(wday) => {
            let by_weekday = next_fire_weekday(wday, spec, reference);
            if spec.day.is_some() {
                base.min(by_weekday)
            } else {
                by_weekday
            }
        }
    }
}

/// The weekday candidate: whole days forward until the weekday matches
/// and the hour/minute descent succeeds.
fn next_fire_weekday(wday: u32, spec: &CalendarSpec, reference: NaiveDateTime) -> NaiveDateTime {
    let wday = if wday == 7 { 0 } else { wday };

    let mut w = Work::from_datetime(reference);
    w.min += 1;
    w.normalize();

    // 366 day-steps cover every weekday/hour combination; the bound only
    // guards against an out-of-range spec.
    for _ in 0..=366 {
        if w.weekday() == wday && emu_hour(&mut w, spec) {
            return w.to_datetime();
        }
        w.day += 1;
        w.hour = 0;
        w.min = 0;
        emu_hour(&mut w, spec);
        w.normalize();
    }
    NaiveDateTime::MAX
}

fn emu_month(w: &mut Work, spec: &CalendarSpec) -> bool {
    match spec.month {
        None => {
            let mut t = *w;
            while !emu_day(&mut t, spec) {
                t.mon += 1;
                t.day = 1;
                t.hour = 0;
                t.min = 0;
                if t.mon > 11 {
                    // Carried into the next year; the caller advances.
                    return false;
                }
            }
            *w = t;
            true
        }
        Some(mon) => {
            if mon < w.mon {
                return false;
            }
            if mon > w.mon {
                w.mon = mon;
                w.day = 1;
                w.hour = 0;
                w.min = 0;
            }
            emu_day(w, spec)
        }
    }
}

fn emu_day(w: &mut Work, spec: &CalendarSpec) -> bool {
    match spec.day {
        None => {
            let mut t = *w;
            while !emu_hour(&mut t, spec) {
                t.day += 1;
                t.hour = 0;
                t.min = 0;
                if t.day > days_in_month(t.year, t.mon) {
                    return false;
                }
            }
            *w = t;
            true
        }
        Some(day) => {
            if day < w.day {
                return false;
            }
            if day > w.day {
                w.day = day;
                w.hour = 0;
                w.min = 0;
            }
            emu_hour(w, spec)
        }
    }
}

fn emu_hour(w: &mut Work, spec: &CalendarSpec) -> bool {
    match spec.hour {
        None => {
            let mut t = *w;
            while !emu_min(&mut t, spec) {
                t.hour += 1;
                t.min = 0;
                if t.hour > 23 {
                    return false;
                }
            }
            *w = t;
            true
        }
        Some(hour) => {
            if hour < w.hour {
                return false;
            }
            if hour > w.hour {
                w.hour = hour;
                w.min = 0;
            }
            emu_min(w, spec)
        }
    }
}

fn emu_min(w: &mut Work, spec: &CalendarSpec) -> bool {
    match spec.minute {
        None => true,
        Some(min) => {
            if min < w.min {
                return false;
            }
            if min > w.min {
                w.min = min;
            }
            true
        }
    }
}

use chrono::{Datelike, Duration, NaiveDate};

use cadence_core::{RecurrenceKind, RecurrenceRule};

/// Months probed before giving up on a monthly_weekday rule. Far beyond any
/// gap between months that actually contain the requested ordinal weekday.
const MAX_MONTH_PROBES: i64 = 1200;

pub fn weekday_ordinal(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Compute the smallest occurrence of `rule` strictly after `after`.
///
/// `anchor` is the rule's original reference date (first due date or task
/// creation). All arithmetic is calendar-based; timezone conversion is the
/// caller's concern. Returns `None` once `end_date` is exceeded or for
/// `kind=none`.
pub fn next_occurrence(
    rule: &RecurrenceRule,
    anchor: NaiveDate,
    after: NaiveDate,
) -> Option<NaiveDate> {
    let interval = rule.interval.max(1) as i64;
    let candidate = match rule.kind {
        RecurrenceKind::None => return None,
        RecurrenceKind::Daily => next_by_days(anchor, after, interval),
        RecurrenceKind::Weekly => {
            if rule.weekdays.is_empty() {
                next_by_days(anchor, after, interval * 7)
            } else {
                next_weekly_on(rule, anchor, after, interval)?
            }
        }
        RecurrenceKind::Monthly => {
            let day = rule.month_day.unwrap_or_else(|| anchor.day());
            next_monthly_day(anchor, after, interval, day)
        }
        RecurrenceKind::MonthlyWeekday => {
            let weekday = rule.weekday?;
            let week = rule.week_of_month.unwrap_or(1);
            next_monthly_weekday(anchor, after, interval, weekday, week)?
        }
        RecurrenceKind::MonthlyLastDay => next_monthly_last_day(anchor, after, interval),
        RecurrenceKind::Yearly => next_yearly(anchor, after, interval),
    };
    match rule.end_date {
        Some(end) if candidate > end => None,
        _ => Some(candidate),
    }
}

/// All occurrences in `from..=to`, oldest first.
///
/// This is the single sequence primitive shared by instance spawning and
/// streak recomputation; both walk the same schedule.
pub fn occurrences_between(
    rule: &RecurrenceRule,
    anchor: NaiveDate,
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let Some(mut cursor) = from.pred_opt() else {
        return out;
    };
    while let Some(next) = next_occurrence(rule, anchor, cursor) {
        if next > to {
            break;
        }
        out.push(next);
        cursor = next;
    }
    out
}

/// Whether `date` is one of the dates the schedule produces.
pub fn is_occurrence(rule: &RecurrenceRule, anchor: NaiveDate, date: NaiveDate) -> bool {
    date.pred_opt()
        .and_then(|prev| next_occurrence(rule, anchor, prev))
        .is_some_and(|next| next == date)
}

fn next_by_days(anchor: NaiveDate, after: NaiveDate, step: i64) -> NaiveDate {
    if after < anchor {
        return anchor;
    }
    let elapsed = (after - anchor).num_days();
    anchor + Duration::days((elapsed / step + 1) * step)
}

fn next_weekly_on(
    rule: &RecurrenceRule,
    anchor: NaiveDate,
    after: NaiveDate,
    interval: i64,
) -> Option<NaiveDate> {
    let anchor_week = week_start(anchor);
    let mut day = std::cmp::max(after.succ_opt()?, anchor);
    // The pattern repeats every `interval` weeks, so one period plus a week
    // of slack always contains the next match.
    for _ in 0..=(interval * 7 + 7) {
        let week_offset = (week_start(day) - anchor_week).num_days() / 7;
        if week_offset % interval == 0 && rule.weekdays.contains(&weekday_ordinal(day)) {
            return Some(day);
        }
        day = day.succ_opt()?;
    }
    None
}

fn next_monthly_day(anchor: NaiveDate, after: NaiveDate, interval: i64, day: u32) -> NaiveDate {
    let mut k = (months_between(anchor, after).max(0) / interval - 1).max(0);
    loop {
        let (year, month) = shift_month(anchor, k * interval);
        let candidate = clamped_date(year, month, day, anchor);
        if candidate > after {
            return candidate;
        }
        k += 1;
    }
}

fn next_monthly_weekday(
    anchor: NaiveDate,
    after: NaiveDate,
    interval: i64,
    weekday: u8,
    week_of_month: i8,
) -> Option<NaiveDate> {
    let mut k = (months_between(anchor, after).max(0) / interval - 1).max(0);
    for _ in 0..MAX_MONTH_PROBES {
        let (year, month) = shift_month(anchor, k * interval);
        if let Some(candidate) = nth_weekday_in_month(year, month, weekday, week_of_month) {
            if candidate > after {
                return Some(candidate);
            }
        }
        k += 1;
    }
    None
}

fn next_monthly_last_day(anchor: NaiveDate, after: NaiveDate, interval: i64) -> NaiveDate {
    let mut k = (months_between(anchor, after).max(0) / interval - 1).max(0);
    loop {
        let (year, month) = shift_month(anchor, k * interval);
        let candidate = clamped_date(year, month, 31, anchor);
        if candidate > after {
            return candidate;
        }
        k += 1;
    }
}

fn next_yearly(anchor: NaiveDate, after: NaiveDate, interval: i64) -> NaiveDate {
    let year_gap = (after.year() as i64 - anchor.year() as i64).max(0);
    let mut k = (year_gap / interval - 1).max(0);
    loop {
        let year = anchor.year() as i64 + k * interval;
        // Feb-29 anchors clamp to Feb-28 in non-leap years.
        let candidate = clamped_date(year as i32, anchor.month(), anchor.day(), anchor);
        if candidate > after {
            return candidate;
        }
        k += 1;
    }
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(weekday_ordinal(date) as i64)
}

fn months_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to.year() as i64 - from.year() as i64) * 12 + (to.month() as i64 - from.month() as i64)
}

fn shift_month(anchor: NaiveDate, months: i64) -> (i32, u32) {
    let total = anchor.year() as i64 * 12 + anchor.month0() as i64 + months;
    (total.div_euclid(12) as i32, total.rem_euclid(12) as u32 + 1)
}

fn clamped_date(year: i32, month: u32, day: u32, fallback: NaiveDate) -> NaiveDate {
    let day = day.min(days_in_month(year, month)).max(1);
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(fallback)
}

pub(crate) fn days_in_month(year: i32, month: u32) -> u32 {
    for day in (28..=31).rev() {
        if NaiveDate::from_ymd_opt(year, month, day).is_some() {
            return day;
        }
    }
    28
}

fn nth_weekday_in_month(year: i32, month: u32, weekday: u8, week_of_month: i8) -> Option<NaiveDate> {
    let length = days_in_month(year, month);
    if week_of_month == -1 {
        let last = NaiveDate::from_ymd_opt(year, month, length)?;
        let back = (weekday_ordinal(last) as i64 - weekday as i64).rem_euclid(7);
        return Some(last - Duration::days(back));
    }
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let forward = (weekday as i64 - weekday_ordinal(first) as i64).rem_euclid(7);
    let day = 1 + forward as u32 + (week_of_month.max(1) as u32 - 1) * 7;
    if day > length {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

//! One-way projection of tasks and recurrence rules into RFC 5545 form.
//!
//! Generation only: the constrained RRULE subset written here is never
//! parsed back. Everything in this module is pure and safe to call
//! concurrently for many tasks.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use cadence_core::{RecurrenceKind, RecurrenceRule, Task, TaskStatus};

const WEEKDAY_CODES: [&str; 7] = ["SU", "MO", "TU", "WE", "TH", "FR", "SA"];

/// RFC 5545 text escaping: backslash, semicolon, comma; newlines become a
/// literal `\n`, carriage returns are dropped.
pub fn escape_text(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\r', "")
        .replace('\n', "\\n")
        .replace(';', "\\;")
        .replace(',', "\\,")
}

pub fn format_datetime_utc(value: DateTime<Utc>) -> String {
    value.format("%Y%m%dT%H%M%SZ").to_string()
}

fn format_date(value: NaiveDate) -> String {
    value.format("%Y%m%d").to_string()
}

fn weekday_code(ordinal: u8) -> &'static str {
    WEEKDAY_CODES[usize::from(ordinal % 7)]
}

/// Render the rule as an RRULE property value. `None` for non-recurring
/// rules; a plain task never carries an RRULE line.
pub fn to_rrule(rule: &RecurrenceRule) -> Option<String> {
    let freq = match rule.kind {
        RecurrenceKind::None => return None,
        RecurrenceKind::Daily => "DAILY",
        RecurrenceKind::Weekly => "WEEKLY",
        RecurrenceKind::Monthly | RecurrenceKind::MonthlyWeekday | RecurrenceKind::MonthlyLastDay => {
            "MONTHLY"
        }
        RecurrenceKind::Yearly => "YEARLY",
    };

    let mut parts = vec![format!("FREQ={freq}")];
    if rule.interval > 1 {
        parts.push(format!("INTERVAL={}", rule.interval));
    }
    match rule.kind {
        RecurrenceKind::Weekly if !rule.weekdays.is_empty() => {
            let days = rule
                .weekdays
                .iter()
                .map(|ordinal| weekday_code(*ordinal))
                .collect::<Vec<_>>()
                .join(",");
            parts.push(format!("BYDAY={days}"));
        }
        RecurrenceKind::Monthly => {
            if let Some(day) = rule.month_day {
                parts.push(format!("BYMONTHDAY={day}"));
            }
        }
        RecurrenceKind::MonthlyWeekday => {
            if let Some(ordinal) = rule.weekday {
                let week = rule.week_of_month.unwrap_or(1);
                parts.push(format!("BYDAY={}{}", week, weekday_code(ordinal)));
            }
        }
        RecurrenceKind::MonthlyLastDay => parts.push("BYMONTHDAY=-1".into()),
        _ => {}
    }
    if let Some(end) = rule.end_date {
        parts.push(format!("UNTIL={}", format_date(end)));
    }

    Some(parts.join(";"))
}

/// Build a complete all-day VEVENT block for one task, CRLF-terminated.
///
/// The UID is stable for a given `(task id, host)` pair so downstream
/// calendar clients update rather than duplicate. Only top-level recurring
/// templates carry an RRULE; spawned instances are single events.
pub fn to_vevent(task: &Task, host: &str, dtstamp: DateTime<Utc>) -> String {
    let due = task.due_date.unwrap_or_else(|| task.anchor_date());
    let status = match task.status {
        TaskStatus::Done | TaskStatus::Archived => "COMPLETED",
        TaskStatus::NotStarted | TaskStatus::InProgress => "NEEDS-ACTION",
    };

    let mut output = String::new();
    output.push_str("BEGIN:VEVENT\r\n");
    output.push_str(&format!("UID:{}@{}\r\n", task.id, host));
    output.push_str(&format!("DTSTAMP:{}\r\n", format_datetime_utc(dtstamp)));
    output.push_str(&format!("DTSTART;VALUE=DATE:{}\r\n", format_date(due)));
    output.push_str(&format!(
        "DTEND;VALUE=DATE:{}\r\n",
        format_date(due + Duration::days(1))
    ));
    output.push_str(&format!("SUMMARY:{}\r\n", escape_text(&task.name)));
    if let Some(notes) = task.notes.as_deref().filter(|notes| !notes.is_empty()) {
        output.push_str(&format!("DESCRIPTION:{}\r\n", escape_text(notes)));
    }
    if !task.tags.is_empty() {
        let categories = task
            .tags
            .iter()
            .map(|tag| escape_text(tag))
            .collect::<Vec<_>>()
            .join(",");
        output.push_str(&format!("CATEGORIES:{categories}\r\n"));
    }
    output.push_str(&format!("STATUS:{status}\r\n"));
    if task.recurring_parent_id.is_none() {
        if let Some(rrule) = to_rrule(&task.recurrence) {
            output.push_str(&format!("RRULE:{rrule}\r\n"));
        }
    }
    output.push_str("END:VEVENT\r\n");
    output
}

/// Assemble the full `text/calendar` document for the feed endpoint.
pub fn build_feed(tasks: &[Task], host: &str, generated_at: DateTime<Utc>) -> String {
    let mut output = String::new();
    output.push_str("BEGIN:VCALENDAR\r\n");
    output.push_str("VERSION:2.0\r\n");
    output.push_str("PRODID:-//Cadence//Task Feed//EN\r\n");
    output.push_str("CALSCALE:GREGORIAN\r\n");
    output.push_str("METHOD:PUBLISH\r\n");
    for task in tasks {
        output.push_str(&to_vevent(task, host, generated_at));
    }
    output.push_str("END:VCALENDAR\r\n");
    output
}

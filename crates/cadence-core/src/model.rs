use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Recurrence Rule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceKind {
    None,
    Daily,
    Weekly,
    Monthly,
    MonthlyWeekday,
    MonthlyLastDay,
    Yearly,
}

impl RecurrenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::MonthlyWeekday => "monthly_weekday",
            Self::MonthlyLastDay => "monthly_last_day",
            Self::Yearly => "yearly",
        }
    }
}

impl std::str::FromStr for RecurrenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "monthly_weekday" => Ok(Self::MonthlyWeekday),
            "monthly_last_day" => Ok(Self::MonthlyLastDay),
            "yearly" => Ok(Self::Yearly),
            _ => Err(format!("unknown recurrence kind: {s}")),
        }
    }
}

impl std::fmt::Display for RecurrenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative schedule attached to a task.
///
/// Weekday ordinals run 0=Sunday..6=Saturday throughout, matching the
/// persisted field set. Raw storage shapes are normalized into this value
/// object on load via [`RecurrenceRule::from_parts`]; nothing downstream
/// ever sees the raw columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    #[serde(default = "RecurrenceRule::default_kind")]
    pub kind: RecurrenceKind,
    /// Every N periods. Clamped to 1..=365 at the normalization boundary.
    #[serde(default = "RecurrenceRule::default_interval")]
    pub interval: u32,
    /// Weekday selection for `weekly`; empty = the anchor date's weekday.
    #[serde(default)]
    pub weekdays: BTreeSet<u8>,
    /// Single weekday for `monthly_weekday` (also the legacy input field).
    #[serde(default)]
    pub weekday: Option<u8>,
    /// 1..=5, or -1 for the last week of the month.
    #[serde(default)]
    pub week_of_month: Option<i8>,
    /// Fixed day-of-month for `monthly`, 1..=31.
    #[serde(default)]
    pub month_day: Option<u32>,
    /// Inclusive end of the series.
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl Default for RecurrenceRule {
    fn default() -> Self {
        Self::none()
    }
}

impl RecurrenceRule {
    fn default_kind() -> RecurrenceKind {
        RecurrenceKind::None
    }

    fn default_interval() -> u32 {
        1
    }

    /// The non-recurring rule. Produces no occurrences and no RRULE.
    pub fn none() -> Self {
        Self {
            kind: RecurrenceKind::None,
            interval: 1,
            weekdays: BTreeSet::new(),
            weekday: None,
            week_of_month: None,
            month_day: None,
            end_date: None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.kind != RecurrenceKind::None
    }

    /// Normalize raw persisted fields into a well-typed rule.
    ///
    /// Lenient by design: an unknown kind falls back to `none` so one corrupt
    /// row cannot break a scan over many tasks. The `weekdays` column has
    /// historically been written both as a JSON array and as a JSON-encoded
    /// string containing an array; both shapes are accepted here and nowhere
    /// else.
    pub fn from_parts(
        kind: Option<&str>,
        interval: Option<i64>,
        weekdays: Option<&serde_json::Value>,
        weekday: Option<i64>,
        week_of_month: Option<i64>,
        month_day: Option<i64>,
        end_date: Option<&str>,
    ) -> Self {
        let kind = kind
            .and_then(|raw| raw.trim().parse::<RecurrenceKind>().ok())
            .unwrap_or(RecurrenceKind::None);

        let interval = interval.unwrap_or(1).clamp(1, 365) as u32;

        let weekdays = weekdays.map(normalize_weekday_set).unwrap_or_default();

        let weekday = weekday
            .filter(|value| (0..=6).contains(value))
            .map(|value| value as u8);

        let week_of_month = week_of_month
            .filter(|value| *value == -1 || (1..=5).contains(value))
            .map(|value| value as i8);

        let month_day = month_day
            .filter(|value| (1..=31).contains(value))
            .map(|value| value as u32);

        let end_date = end_date.and_then(|raw| raw.trim().parse::<NaiveDate>().ok());

        Self {
            kind,
            interval,
            weekdays,
            weekday,
            week_of_month,
            month_day,
            end_date,
        }
    }

    /// Reject self-contradictory combinations before they reach the
    /// computation functions.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval == 0 {
            return Err("interval must be at least 1".into());
        }
        if let Some(day) = self.weekdays.iter().find(|day| **day > 6) {
            return Err(format!("weekday ordinal out of range: {day}"));
        }
        if let Some(day) = self.weekday {
            if day > 6 {
                return Err(format!("weekday ordinal out of range: {day}"));
            }
        }
        if let Some(week) = self.week_of_month {
            if week != -1 && !(1..=5).contains(&week) {
                return Err(format!("week_of_month must be 1..=5 or -1 (got {week})"));
            }
        }
        if let Some(day) = self.month_day {
            if !(1..=31).contains(&day) {
                return Err(format!("month_day must be 1..=31 (got {day})"));
            }
        }
        if self.kind == RecurrenceKind::MonthlyWeekday && self.weekday.is_none() {
            return Err("monthly_weekday requires a weekday".into());
        }
        Ok(())
    }
}

fn normalize_weekday_set(value: &serde_json::Value) -> BTreeSet<u8> {
    match value {
        serde_json::Value::Array(entries) => entries
            .iter()
            .filter_map(|entry| entry.as_u64())
            .filter(|ordinal| *ordinal <= 6)
            .map(|ordinal| ordinal as u8)
            .collect(),
        // Legacy rows carry the array JSON-encoded inside a string.
        serde_json::Value::String(raw) => serde_json::from_str::<serde_json::Value>(raw)
            .map(|inner| normalize_weekday_set(&inner))
            .unwrap_or_default(),
        _ => BTreeSet::new(),
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    InProgress,
    Done,
    Archived,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Archived => "archived",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("unknown task status: {s}")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task: a recurring template, a spawned instance, or a plain one-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub notes: Option<String>,
    pub project: Option<String>,
    pub tags: Vec<String>,
    pub priority: i32,
    pub due_date: Option<NaiveDate>,
    pub habit_mode: bool,
    pub recurrence: RecurrenceRule,
    /// Set on spawned instances; the referenced template itself never has
    /// a parent (no chained recursion).
    pub recurring_parent_id: Option<Uuid>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(owner_id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            owner_id,
            name: name.into(),
            notes: None,
            project: None,
            tags: Vec::new(),
            priority: 0,
            due_date: None,
            habit_mode: false,
            recurrence: RecurrenceRule::none(),
            recurring_parent_id: None,
            status: TaskStatus::NotStarted,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_due_date(mut self, due: NaiveDate) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn with_habit_mode(mut self, habit_mode: bool) -> Self {
        self.habit_mode = habit_mode;
        self
    }

    pub fn with_recurrence(mut self, rule: RecurrenceRule) -> Self {
        self.recurrence = rule;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// A template is any top-level task with an active recurrence rule.
    pub fn is_template(&self) -> bool {
        self.recurring_parent_id.is_none() && self.recurrence.is_recurring()
    }

    pub fn is_instance(&self) -> bool {
        self.recurring_parent_id.is_some()
    }

    /// The reference date all occurrence math is anchored on: the first due
    /// date when one was set, else the calendar date the task was created.
    pub fn anchor_date(&self) -> NaiveDate {
        self.due_date.unwrap_or_else(|| self.created_at.date_naive())
    }
}

// ---------------------------------------------------------------------------
// Recurring Completion
// ---------------------------------------------------------------------------

/// One completion or explicit skip of a single occurrence date.
///
/// At most one record exists per `(task_id, occurrence_date)`; re-recording
/// replaces. Absence of a record for a past due date means "missed", which
/// is distinct from an explicit skip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringCompletion {
    pub id: Uuid,
    pub task_id: Uuid,
    pub occurrence_date: NaiveDate,
    pub completed_at: Option<DateTime<Utc>>,
    pub skipped: bool,
}

impl RecurringCompletion {
    pub fn completed(task_id: Uuid, occurrence_date: NaiveDate, when: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_id,
            occurrence_date,
            completed_at: Some(when),
            skipped: false,
        }
    }

    pub fn skip(task_id: Uuid, occurrence_date: NaiveDate) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_id,
            occurrence_date,
            completed_at: None,
            skipped: true,
        }
    }

    pub fn is_completed(&self) -> bool {
        !self.skipped && self.completed_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Habit Stats
// ---------------------------------------------------------------------------

/// Derived streak statistics. Recomputed from the full completion history;
/// never stored as an accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HabitStats {
    pub current_streak: u32,
    pub best_streak: u32,
    pub total_completions: u32,
    pub completion_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recurrence_kind_round_trips_through_strings() {
        for kind in [
            RecurrenceKind::None,
            RecurrenceKind::Daily,
            RecurrenceKind::Weekly,
            RecurrenceKind::Monthly,
            RecurrenceKind::MonthlyWeekday,
            RecurrenceKind::MonthlyLastDay,
            RecurrenceKind::Yearly,
        ] {
            assert_eq!(kind.as_str().parse::<RecurrenceKind>(), Ok(kind));
        }
        assert!("fortnightly".parse::<RecurrenceKind>().is_err());
    }

    #[test]
    fn from_parts_accepts_weekdays_as_array_and_as_json_string() {
        let as_array = serde_json::json!([1, 3, 9]);
        let rule = RecurrenceRule::from_parts(
            Some("weekly"),
            Some(2),
            Some(&as_array),
            None,
            None,
            None,
            None,
        );
        assert_eq!(rule.kind, RecurrenceKind::Weekly);
        assert_eq!(rule.interval, 2);
        assert_eq!(rule.weekdays, BTreeSet::from([1, 3]));

        let as_string = serde_json::Value::String("[1,3]".to_string());
        let rule = RecurrenceRule::from_parts(
            Some("weekly"),
            Some(2),
            Some(&as_string),
            None,
            None,
            None,
            None,
        );
        assert_eq!(rule.weekdays, BTreeSet::from([1, 3]));
    }

    #[test]
    fn from_parts_falls_back_to_none_on_corrupt_kind() {
        let rule = RecurrenceRule::from_parts(Some("every-blue-moon"), None, None, None, None, None, None);
        assert_eq!(rule.kind, RecurrenceKind::None);
        assert!(!rule.is_recurring());

        let rule = RecurrenceRule::from_parts(None, Some(0), None, None, None, None, Some("not-a-date"));
        assert_eq!(rule.kind, RecurrenceKind::None);
        assert_eq!(rule.interval, 1);
        assert_eq!(rule.end_date, None);
    }

    #[test]
    fn validate_rejects_monthly_weekday_without_weekday() {
        let rule = RecurrenceRule {
            kind: RecurrenceKind::MonthlyWeekday,
            week_of_month: Some(2),
            ..RecurrenceRule::none()
        };
        assert!(rule.validate().is_err());

        let rule = RecurrenceRule {
            weekday: Some(2),
            ..rule
        };
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_fields() {
        let mut rule = RecurrenceRule {
            kind: RecurrenceKind::Monthly,
            month_day: Some(32),
            ..RecurrenceRule::none()
        };
        assert!(rule.validate().is_err());

        rule.month_day = Some(31);
        assert!(rule.validate().is_ok());

        rule.week_of_month = Some(0);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn anchor_date_prefers_due_date() {
        let owner = Uuid::now_v7();
        let due = NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date");
        let task = Task::new(owner, "water plants").with_due_date(due);
        assert_eq!(task.anchor_date(), due);

        let task = Task::new(owner, "water plants");
        assert_eq!(task.anchor_date(), task.created_at.date_naive());
    }

    #[test]
    fn template_and_instance_predicates() {
        let owner = Uuid::now_v7();
        let template = Task::new(owner, "weekly review").with_recurrence(RecurrenceRule {
            kind: RecurrenceKind::Weekly,
            ..RecurrenceRule::none()
        });
        assert!(template.is_template());
        assert!(!template.is_instance());

        let mut instance = Task::new(owner, "weekly review");
        instance.recurring_parent_id = Some(template.id);
        assert!(!instance.is_template());
        assert!(instance.is_instance());

        // A task with kind=none is a plain task, not a recurrence source.
        assert!(!Task::new(owner, "one-off").is_template());
    }
}

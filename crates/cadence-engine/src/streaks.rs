use std::collections::HashMap;

use chrono::NaiveDate;

use cadence_core::{HabitStats, RecurringCompletion, Task};

use crate::recurrence::occurrences_between;

/// Recompute streak statistics from the full completion history.
///
/// Pure: no side effects and no hidden accumulation, so running it twice
/// with the same inputs yields the same result. Cost is O(expected occurrences
/// between the task's anchor and `range_end`).
///
/// Walk semantics: an occurrence with any record (completion or explicit
/// skip) continues a streak; a missing record for an occurrence strictly
/// before `range_end` is a true miss and breaks it. A missing record on
/// `range_end` itself is merely pending and neither counts nor breaks.
pub fn recalculate(
    task: &Task,
    completions: &[RecurringCompletion],
    range_end: NaiveDate,
) -> HabitStats {
    let expected = expected_occurrences(task, range_end);
    if expected.is_empty() {
        return HabitStats::default();
    }

    let by_date: HashMap<NaiveDate, &RecurringCompletion> = completions
        .iter()
        .map(|record| (record.occurrence_date, record))
        .collect();

    let mut current_streak = 0u32;
    for occurrence in expected.iter().rev() {
        match by_date.get(occurrence) {
            Some(_) => current_streak += 1,
            None if *occurrence >= range_end => continue,
            None => break,
        }
    }

    let mut best_streak = 0u32;
    let mut run = 0u32;
    let mut total_completions = 0u32;
    let mut skips = 0u32;
    for occurrence in &expected {
        match by_date.get(occurrence) {
            Some(record) => {
                run += 1;
                best_streak = best_streak.max(run);
                if record.is_completed() {
                    total_completions += 1;
                } else if record.skipped {
                    skips += 1;
                }
            }
            None if *occurrence >= range_end => {}
            None => run = 0,
        }
    }

    // Skips were intentional, so they drop out of the denominator.
    let denominator = expected.len() as u32 - skips;
    let completion_rate = if denominator == 0 {
        0.0
    } else {
        f64::from(total_completions) / f64::from(denominator)
    };

    HabitStats {
        current_streak,
        best_streak,
        total_completions,
        completion_rate,
    }
}

/// The dates the schedule expects between the anchor and `range_end`.
///
/// For a recurring task the series starts strictly after the anchor: the
/// anchor occurrence is the template's own due date, tracked through the
/// template's status rather than the completion history. A plain habit-mode
/// task expects every calendar day from its anchor onward.
pub fn expected_occurrences(task: &Task, range_end: NaiveDate) -> Vec<NaiveDate> {
    let anchor = task.anchor_date();
    if task.recurrence.is_recurring() {
        let Some(start) = anchor.succ_opt() else {
            return Vec::new();
        };
        occurrences_between(&task.recurrence, anchor, start, range_end)
    } else if task.habit_mode {
        let mut days = Vec::new();
        let mut day = anchor;
        while day <= range_end {
            days.push(day);
            let Some(next) = day.succ_opt() else { break };
            day = next;
        }
        days
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{RecurrenceKind, RecurrenceRule};
    use chrono::{Datelike, TimeZone, Utc};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
    }

    fn daily_task(anchor: NaiveDate) -> Task {
        Task::new(Uuid::now_v7(), "stretch")
            .with_due_date(anchor)
            .with_habit_mode(true)
            .with_recurrence(RecurrenceRule {
                kind: RecurrenceKind::Daily,
                ..RecurrenceRule::none()
            })
    }

    fn completed_on(task: &Task, day: NaiveDate) -> RecurringCompletion {
        let when = Utc
            .with_ymd_and_hms(day.year(), day.month(), day.day(), 20, 0, 0)
            .single()
            .expect("valid datetime");
        RecurringCompletion::completed(task.id, day, when)
    }

    #[test]
    fn skip_pauses_without_breaking_and_absence_breaks() {
        // Anchor Jan 1; expected occurrences Jan 2..=Jan 5.
        let task = daily_task(date(2024, 1, 1));
        let completions = vec![
            completed_on(&task, date(2024, 1, 2)),
            completed_on(&task, date(2024, 1, 3)),
            RecurringCompletion::skip(task.id, date(2024, 1, 4)),
            completed_on(&task, date(2024, 1, 5)),
        ];

        let stats = recalculate(&task, &completions, date(2024, 1, 5));
        assert_eq!(stats.current_streak, 4);
        assert_eq!(stats.best_streak, 4);
        assert_eq!(stats.total_completions, 3);
        // Three completions over four expected occurrences minus one skip.
        assert!((stats.completion_rate - 1.0).abs() < f64::EPSILON);

        // Deleting the skip turns Jan 4 into a true miss.
        let without_skip: Vec<_> = completions
            .iter()
            .filter(|record| !record.skipped)
            .cloned()
            .collect();
        let stats = recalculate(&task, &without_skip, date(2024, 1, 5));
        assert_eq!(stats.current_streak, 1);
        assert_eq!(stats.best_streak, 2);
        assert_eq!(stats.total_completions, 3);
        assert!((stats.completion_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn pending_today_neither_counts_nor_breaks() {
        let task = daily_task(date(2024, 1, 1));
        let completions = vec![
            completed_on(&task, date(2024, 1, 2)),
            completed_on(&task, date(2024, 1, 3)),
        ];
        // Jan 4 is range_end and has no record yet.
        let stats = recalculate(&task, &completions, date(2024, 1, 4));
        assert_eq!(stats.current_streak, 2);
        assert_eq!(stats.best_streak, 2);
    }

    #[test]
    fn weekly_first_instance_completion_scores_perfectly() {
        let task = Task::new(Uuid::now_v7(), "weekly review")
            .with_due_date(date(2024, 1, 1))
            .with_habit_mode(true)
            .with_recurrence(RecurrenceRule {
                kind: RecurrenceKind::Weekly,
                weekdays: BTreeSet::from([1]),
                ..RecurrenceRule::none()
            });
        let completions = vec![completed_on(&task, date(2024, 1, 8))];

        let stats = recalculate(&task, &completions, date(2024, 1, 8));
        assert_eq!(stats.current_streak, 1);
        assert_eq!(stats.best_streak, 1);
        assert_eq!(stats.total_completions, 1);
        assert!((stats.completion_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn plain_habit_expects_every_day_from_anchor() {
        let mut task = daily_task(date(2024, 1, 1));
        task.recurrence = RecurrenceRule::none();

        let expected = expected_occurrences(&task, date(2024, 1, 4));
        assert_eq!(
            expected,
            vec![date(2024, 1, 1), date(2024, 1, 2), date(2024, 1, 3), date(2024, 1, 4)]
        );

        let completions = vec![
            completed_on(&task, date(2024, 1, 1)),
            completed_on(&task, date(2024, 1, 2)),
        ];
        let stats = recalculate(&task, &completions, date(2024, 1, 4));
        // Jan 3 is a miss; Jan 4 is pending.
        assert_eq!(stats.current_streak, 0);
        assert_eq!(stats.best_streak, 2);
    }

    #[test]
    fn non_recurring_non_habit_task_has_no_stats() {
        let mut task = daily_task(date(2024, 1, 1));
        task.recurrence = RecurrenceRule::none();
        task.habit_mode = false;

        let stats = recalculate(&task, &[], date(2024, 6, 1));
        assert_eq!(stats, HabitStats::default());
    }

    #[test]
    fn recalculation_is_idempotent() {
        let task = daily_task(date(2024, 1, 1));
        let completions = vec![
            completed_on(&task, date(2024, 1, 2)),
            RecurringCompletion::skip(task.id, date(2024, 1, 3)),
        ];
        let first = recalculate(&task, &completions, date(2024, 1, 3));
        let second = recalculate(&task, &completions, date(2024, 1, 3));
        assert_eq!(first, second);
    }
}

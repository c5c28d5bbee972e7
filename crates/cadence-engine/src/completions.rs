use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use cadence_core::{
    CadResult, CadenceError, CompletionStore, RecurringCompletion, Task, TaskStore,
};

use crate::recurrence::is_occurrence;

/// Records completions and explicit skips against a task's schedule.
///
/// Writes are upserts keyed by `(task_id, occurrence_date)`: re-recording a
/// date replaces the previous record, so switching a skip to a completion
/// (or back) is a plain second call.
pub struct CompletionTracker {
    tasks: Arc<dyn TaskStore>,
    completions: Arc<dyn CompletionStore>,
}

impl CompletionTracker {
    pub fn new(tasks: Arc<dyn TaskStore>, completions: Arc<dyn CompletionStore>) -> Self {
        Self { tasks, completions }
    }

    pub async fn record_completion(
        &self,
        task_id: Uuid,
        occurrence_date: NaiveDate,
        when: DateTime<Utc>,
    ) -> CadResult<RecurringCompletion> {
        let task = self.require_task(task_id).await?;
        validate_occurrence(&task, occurrence_date)?;
        self.completions
            .upsert_completion(&RecurringCompletion::completed(task_id, occurrence_date, when))
            .await
    }

    pub async fn record_skip(
        &self,
        task_id: Uuid,
        occurrence_date: NaiveDate,
    ) -> CadResult<RecurringCompletion> {
        let task = self.require_task(task_id).await?;
        validate_occurrence(&task, occurrence_date)?;
        self.completions
            .upsert_completion(&RecurringCompletion::skip(task_id, occurrence_date))
            .await
    }

    /// Remove a record. Does not recompute streaks; the caller decides
    /// when to run the (heavier) recalculation.
    pub async fn delete(&self, task_id: Uuid, occurrence_date: NaiveDate) -> CadResult<bool> {
        self.completions.delete_completion(task_id, occurrence_date).await
    }

    pub async fn list_range(
        &self,
        task_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> CadResult<Vec<RecurringCompletion>> {
        self.completions.list_completions_range(task_id, from, to).await
    }

    async fn require_task(&self, task_id: Uuid) -> CadResult<Task> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or(CadenceError::TaskNotFound(task_id))
    }
}

/// Reject dates the schedule never asked for.
///
/// A plain (non-recurring) habit-mode task accepts any date; a recurring
/// task only accepts dates its rule produces; anything else has no
/// completion history at all.
pub fn validate_occurrence(task: &Task, occurrence_date: NaiveDate) -> CadResult<()> {
    let valid = if task.recurrence.is_recurring() {
        is_occurrence(&task.recurrence, task.anchor_date(), occurrence_date)
    } else {
        task.habit_mode
    };
    if valid {
        Ok(())
    } else {
        Err(CadenceError::InvalidOccurrence {
            task_id: task.id,
            date: occurrence_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{RecurrenceKind, RecurrenceRule};
    use std::collections::BTreeSet;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
    }

    #[test]
    fn recurring_task_accepts_only_schedule_dates() {
        let task = Task::new(Uuid::now_v7(), "gym")
            .with_due_date(date(2024, 1, 1))
            .with_recurrence(RecurrenceRule {
                kind: RecurrenceKind::Weekly,
                weekdays: BTreeSet::from([1]), // Mondays
                ..RecurrenceRule::none()
            });

        assert!(validate_occurrence(&task, date(2024, 1, 8)).is_ok());
        let err = validate_occurrence(&task, date(2024, 1, 9)).unwrap_err();
        assert!(matches!(err, CadenceError::InvalidOccurrence { .. }));
    }

    #[test]
    fn plain_habit_accepts_any_date() {
        let task = Task::new(Uuid::now_v7(), "read").with_habit_mode(true);
        assert!(validate_occurrence(&task, date(2019, 7, 14)).is_ok());
    }

    #[test]
    fn plain_non_habit_task_accepts_nothing() {
        let task = Task::new(Uuid::now_v7(), "one-off");
        assert!(validate_occurrence(&task, date(2024, 1, 1)).is_err());
    }
}

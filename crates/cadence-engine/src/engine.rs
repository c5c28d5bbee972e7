use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use cadence_core::{
    CadResult, CadenceError, CompletionStore, HabitStats, RecurringCompletion, Task, TaskStore,
};

use crate::calendar;
use crate::completions::CompletionTracker;
use crate::config::EngineConfig;
use crate::spawner::{InstanceSpawner, SpawnOutcome, SpawnStats};
use crate::streaks;

/// The Cadence engine — wires the recurrence components to the stores.
///
/// Every method is a short, bounded computation over its inputs plus store
/// reads/writes; there is no in-process shared mutable state, so the engine
/// is freely shared behind an `Arc` between the HTTP layer and the
/// scheduler loop.
pub struct CadenceEngine {
    pub tasks: Arc<dyn TaskStore>,
    pub completions: Arc<dyn CompletionStore>,
    pub spawner: InstanceSpawner,
    pub tracker: CompletionTracker,
    pub config: EngineConfig,
}

impl CadenceEngine {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        completions: Arc<dyn CompletionStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            spawner: InstanceSpawner::new(tasks.clone(), config.recurrence.clone()),
            tracker: CompletionTracker::new(tasks.clone(), completions.clone()),
            tasks,
            completions,
            config,
        }
    }

    // ── Tasks ──────────────────────────────────────────────────────────

    /// Create a task, rejecting contradictory recurrence rules up front.
    pub async fn create_task(&self, task: Task) -> CadResult<Task> {
        self.validate_task(&task).await?;
        self.tasks.insert(&task).await?;
        tracing::debug!(task_id = %task.id, kind = %task.recurrence.kind, "task created");
        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> CadResult<Option<Task>> {
        self.tasks.get(id).await
    }

    pub async fn update_task(&self, mut task: Task) -> CadResult<Task> {
        self.validate_task(&task).await?;
        task.updated_at = Utc::now();
        self.tasks.update(&task).await?;
        Ok(task)
    }

    pub async fn delete_task(&self, id: Uuid) -> CadResult<bool> {
        self.tasks.delete(id).await
    }

    async fn validate_task(&self, task: &Task) -> CadResult<()> {
        task.recurrence
            .validate()
            .map_err(CadenceError::InvalidRecurrenceRule)?;
        if let Some(parent_id) = task.recurring_parent_id {
            let parent = self
                .tasks
                .get(parent_id)
                .await?
                .ok_or(CadenceError::TaskNotFound(parent_id))?;
            if parent.recurring_parent_id.is_some() {
                return Err(CadenceError::InvalidInput(
                    "recurring_parent_id must reference a top-level template".into(),
                ));
            }
        }
        Ok(())
    }

    // ── Recurrence ─────────────────────────────────────────────────────

    /// Spawn the next due instance of one template. Idempotent.
    pub async fn ensure_instance(
        &self,
        template: &Task,
        now: DateTime<Utc>,
    ) -> CadResult<SpawnOutcome> {
        self.spawner.ensure_instance(template, now).await
    }

    /// Sweep all active templates, generating whatever instances are due.
    /// Invoked by the scheduler on a fixed interval and safe to call from
    /// anywhere else at any time.
    pub async fn rollforward_recurring_tasks(&self, now: DateTime<Utc>) -> CadResult<SpawnStats> {
        if !self.config.recurrence.enabled {
            return Ok(SpawnStats::default());
        }
        self.spawner.rollforward(now).await
    }

    // ── Completions & stats ────────────────────────────────────────────

    pub async fn record_completion(
        &self,
        task_id: Uuid,
        occurrence_date: NaiveDate,
        when: DateTime<Utc>,
    ) -> CadResult<RecurringCompletion> {
        self.tracker
            .record_completion(task_id, occurrence_date, when)
            .await
    }

    pub async fn record_skip(
        &self,
        task_id: Uuid,
        occurrence_date: NaiveDate,
    ) -> CadResult<RecurringCompletion> {
        self.tracker.record_skip(task_id, occurrence_date).await
    }

    pub async fn delete_completion(
        &self,
        task_id: Uuid,
        occurrence_date: NaiveDate,
    ) -> CadResult<bool> {
        self.tracker.delete(task_id, occurrence_date).await
    }

    pub async fn completions_in_range(
        &self,
        task_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> CadResult<Vec<RecurringCompletion>> {
        self.tracker.list_range(task_id, from, to).await
    }

    /// Recompute streak statistics from the full completion history.
    pub async fn habit_stats(&self, task_id: Uuid, range_end: NaiveDate) -> CadResult<HabitStats> {
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or(CadenceError::TaskNotFound(task_id))?;
        let history = self.completions.list_completions(task_id).await?;
        Ok(streaks::recalculate(&task, &history, range_end))
    }

    // ── Calendar ───────────────────────────────────────────────────────

    /// Render the qualifying task set as a `text/calendar` document.
    pub async fn calendar_feed(
        &self,
        include_completed: bool,
        project: Option<&str>,
        generated_at: DateTime<Utc>,
    ) -> CadResult<String> {
        let tasks = self.tasks.list_feed_tasks(include_completed, project).await?;
        Ok(calendar::build_feed(
            &tasks,
            &self.config.calendar.host,
            generated_at,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{RecurrenceKind, RecurrenceRule, TaskStatus};
    use cadence_storage::SqliteStore;
    use chrono::TimeZone;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
    }

    fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
            .single()
            .expect("valid datetime")
    }

    fn create_test_engine() -> (CadenceEngine, TempDir) {
        let tmp = TempDir::new().expect("tempdir");
        let store =
            Arc::new(SqliteStore::open(&tmp.path().join("cadence.db")).expect("open store"));
        let engine = CadenceEngine::new(store.clone(), store, EngineConfig::default());
        (engine, tmp)
    }

    fn weekly_monday_template(owner: Uuid) -> Task {
        Task::new(owner, "weekly review")
            .with_due_date(date(2024, 1, 1))
            .with_habit_mode(true)
            .with_recurrence(RecurrenceRule {
                kind: RecurrenceKind::Weekly,
                weekdays: BTreeSet::from([1]),
                ..RecurrenceRule::none()
            })
    }

    #[tokio::test]
    async fn create_task_rejects_contradictory_rules() {
        let (engine, _tmp) = create_test_engine();
        let task = Task::new(Uuid::now_v7(), "broken").with_recurrence(RecurrenceRule {
            kind: RecurrenceKind::MonthlyWeekday,
            week_of_month: Some(2),
            ..RecurrenceRule::none()
        });
        let err = engine.create_task(task).await.unwrap_err();
        assert!(matches!(err, CadenceError::InvalidRecurrenceRule(_)));
    }

    #[tokio::test]
    async fn create_task_rejects_chained_instances() {
        let (engine, _tmp) = create_test_engine();
        let owner = Uuid::now_v7();
        let template = engine
            .create_task(weekly_monday_template(owner))
            .await
            .unwrap();

        let now = at(2024, 1, 8, 9);
        let SpawnOutcome::Created(instance) =
            engine.ensure_instance(&template, now).await.unwrap()
        else {
            panic!("expected instance to spawn");
        };

        let mut chained = Task::new(owner, "chained");
        chained.recurring_parent_id = Some(instance.id);
        let err = engine.create_task(chained).await.unwrap_err();
        assert!(matches!(err, CadenceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn ensure_instance_spawns_once_per_due_date() {
        let (engine, _tmp) = create_test_engine();
        let template = engine
            .create_task(weekly_monday_template(Uuid::now_v7()))
            .await
            .unwrap();

        // 2024-01-08 is the first Monday after the anchor.
        let now = at(2024, 1, 8, 9);
        let outcome = engine.ensure_instance(&template, now).await.unwrap();
        let SpawnOutcome::Created(instance) = outcome else {
            panic!("expected Created, got {outcome:?}");
        };
        assert_eq!(instance.due_date, Some(date(2024, 1, 8)));
        assert_eq!(instance.recurring_parent_id, Some(template.id));
        assert_eq!(instance.status, TaskStatus::NotStarted);

        // Second tick the same day: the next occurrence (Jan 15) is beyond
        // the lookahead window and the Jan 8 instance already exists.
        let outcome = engine.ensure_instance(&template, now).await.unwrap();
        assert!(matches!(outcome, SpawnOutcome::NotDue), "got {outcome:?}");
    }

    #[tokio::test]
    async fn rollforward_is_idempotent_for_same_instant() {
        let (engine, _tmp) = create_test_engine();
        engine
            .create_task(weekly_monday_template(Uuid::now_v7()))
            .await
            .unwrap();

        let now = at(2024, 1, 8, 9);
        let first = engine.rollforward_recurring_tasks(now).await.unwrap();
        let second = engine.rollforward_recurring_tasks(now).await.unwrap();

        assert_eq!(first.scanned_templates, 1);
        assert_eq!(first.spawned_instances, 1);
        assert_eq!(second.spawned_instances, 0);
    }

    #[tokio::test]
    async fn rollforward_catches_up_over_missed_occurrences() {
        let (engine, _tmp) = create_test_engine();
        let owner = Uuid::now_v7();
        engine
            .create_task(
                Task::new(owner, "daily standup notes")
                    .with_due_date(date(2024, 1, 1))
                    .with_recurrence(RecurrenceRule {
                        kind: RecurrenceKind::Daily,
                        ..RecurrenceRule::none()
                    }),
            )
            .await
            .unwrap();

        // Three days offline: Jan 2, 3, 4 are all due (config caps catch-up
        // at 4 per sweep).
        let stats = engine
            .rollforward_recurring_tasks(at(2024, 1, 4, 12))
            .await
            .unwrap();
        assert_eq!(stats.spawned_instances, 4); // Jan 2..=4 plus Jan 5 lookahead
    }

    #[tokio::test]
    async fn exhausted_templates_stop_spawning() {
        let (engine, _tmp) = create_test_engine();
        engine
            .create_task(
                Task::new(Uuid::now_v7(), "short series")
                    .with_due_date(date(2024, 1, 1))
                    .with_recurrence(RecurrenceRule {
                        kind: RecurrenceKind::Daily,
                        end_date: Some(date(2024, 1, 2)),
                        ..RecurrenceRule::none()
                    }),
            )
            .await
            .unwrap();

        let first = engine.rollforward_recurring_tasks(at(2024, 1, 10, 9)).await.unwrap();
        assert_eq!(first.spawned_instances, 1); // only Jan 2 before the end date
        assert_eq!(first.exhausted_templates, 1);

        let second = engine.rollforward_recurring_tasks(at(2024, 1, 11, 9)).await.unwrap();
        assert_eq!(second.spawned_instances, 0);
        assert_eq!(second.exhausted_templates, 1);
    }

    #[tokio::test]
    async fn completion_and_stats_end_to_end() {
        let (engine, _tmp) = create_test_engine();
        let template = engine
            .create_task(weekly_monday_template(Uuid::now_v7()))
            .await
            .unwrap();

        let now = at(2024, 1, 8, 9);
        let outcome = engine.ensure_instance(&template, now).await.unwrap();
        assert!(matches!(outcome, SpawnOutcome::Created(_)));

        engine
            .record_completion(template.id, date(2024, 1, 8), now)
            .await
            .unwrap();

        let stats = engine.habit_stats(template.id, date(2024, 1, 8)).await.unwrap();
        assert_eq!(stats.current_streak, 1);
        assert_eq!(stats.best_streak, 1);
        assert_eq!(stats.total_completions, 1);
        assert!((stats.completion_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn off_schedule_completion_is_rejected() {
        let (engine, _tmp) = create_test_engine();
        let template = engine
            .create_task(weekly_monday_template(Uuid::now_v7()))
            .await
            .unwrap();

        // Jan 9 is a Tuesday; the rule only produces Mondays.
        let err = engine
            .record_completion(template.id, date(2024, 1, 9), at(2024, 1, 9, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, CadenceError::InvalidOccurrence { .. }));
    }

    #[tokio::test]
    async fn skip_flips_to_completion_on_rerecord() {
        let (engine, _tmp) = create_test_engine();
        let template = engine
            .create_task(weekly_monday_template(Uuid::now_v7()))
            .await
            .unwrap();

        let day = date(2024, 1, 8);
        let skip = engine.record_skip(template.id, day).await.unwrap();
        assert!(skip.skipped);

        let done = engine
            .record_completion(template.id, day, at(2024, 1, 8, 20))
            .await
            .unwrap();
        assert!(done.is_completed());

        let history = engine
            .completions_in_range(template.id, day, day)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_completed());
    }

    #[tokio::test]
    async fn deleting_a_skip_turns_it_into_a_miss() {
        let (engine, _tmp) = create_test_engine();
        let template = engine
            .create_task(weekly_monday_template(Uuid::now_v7()))
            .await
            .unwrap();

        engine
            .record_completion(template.id, date(2024, 1, 8), at(2024, 1, 8, 20))
            .await
            .unwrap();
        engine.record_skip(template.id, date(2024, 1, 15)).await.unwrap();
        engine
            .record_completion(template.id, date(2024, 1, 22), at(2024, 1, 22, 20))
            .await
            .unwrap();

        let stats = engine.habit_stats(template.id, date(2024, 1, 22)).await.unwrap();
        assert_eq!(stats.current_streak, 3);

        assert!(engine
            .delete_completion(template.id, date(2024, 1, 15))
            .await
            .unwrap());
        let stats = engine.habit_stats(template.id, date(2024, 1, 22)).await.unwrap();
        assert_eq!(stats.current_streak, 1);
        assert_eq!(stats.best_streak, 1);
    }

    #[tokio::test]
    async fn calendar_feed_marks_templates_with_rrule() {
        let (engine, _tmp) = create_test_engine();
        let owner = Uuid::now_v7();
        let template = engine
            .create_task(weekly_monday_template(owner))
            .await
            .unwrap();
        engine
            .create_task(Task::new(owner, "one-off errand").with_due_date(date(2024, 1, 3)))
            .await
            .unwrap();
        let outcome = engine
            .ensure_instance(&template, at(2024, 1, 8, 9))
            .await
            .unwrap();
        assert!(matches!(outcome, SpawnOutcome::Created(_)));

        let feed = engine
            .calendar_feed(false, None, at(2024, 1, 8, 10))
            .await
            .unwrap();

        // Two top-level events; the spawned instance is excluded.
        assert_eq!(feed.matches("BEGIN:VEVENT").count(), 2);
        assert_eq!(feed.matches("RRULE:FREQ=WEEKLY;BYDAY=MO").count(), 1);
        assert!(feed.starts_with("BEGIN:VCALENDAR\r\n"));
    }
}

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use uuid::Uuid;

use cadence_core::{CadResult, InstanceInsert, RecurrenceRule, Task, TaskStatus, TaskStore};

use crate::config::RecurrenceConfig;
use crate::recurrence::next_occurrence;

/// Result of one `ensure_instance` call. Everything except `Created` is a
/// no-op; none of them are errors.
#[derive(Debug, Clone)]
pub enum SpawnOutcome {
    Created(Task),
    /// An instance for the computed due date already exists, either found
    /// up front or surfaced by the storage uniqueness constraint when a
    /// concurrent caller won the race.
    AlreadyExists,
    /// The next occurrence lies beyond the lookahead window.
    NotDue,
    /// The rule's end date has passed; nothing left to spawn.
    Exhausted,
    /// Not a template: `kind=none` or the task is itself a spawned instance.
    NotRecurring,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SpawnStats {
    pub scanned_templates: usize,
    pub spawned_instances: usize,
    pub exhausted_templates: usize,
    pub errors: usize,
}

/// Materializes concrete task instances from recurring templates.
pub struct InstanceSpawner {
    tasks: Arc<dyn TaskStore>,
    config: RecurrenceConfig,
}

impl InstanceSpawner {
    pub fn new(tasks: Arc<dyn TaskStore>, config: RecurrenceConfig) -> Self {
        Self { tasks, config }
    }

    /// Ensure the next due instance of `template` exists, creating it at
    /// most once.
    ///
    /// Idempotent and safe to race: the `(recurring_parent_id, due_date)`
    /// uniqueness constraint in storage is the source of truth for "already
    /// exists", so a concurrent duplicate insert degrades to
    /// `AlreadyExists` rather than a second instance.
    pub async fn ensure_instance(
        &self,
        template: &Task,
        now: DateTime<Utc>,
    ) -> CadResult<SpawnOutcome> {
        if !template.is_template() {
            return Ok(SpawnOutcome::NotRecurring);
        }

        let anchor = template.anchor_date();
        let after = self
            .tasks
            .latest_instance_due(template.id)
            .await?
            .unwrap_or(anchor);
        let Some(due) = next_occurrence(&template.recurrence, anchor, after) else {
            return Ok(SpawnOutcome::Exhausted);
        };

        let horizon = now.date_naive() + Duration::days(self.config.lookahead_days);
        if due > horizon {
            return Ok(SpawnOutcome::NotDue);
        }

        if self.tasks.find_instance(template.id, due).await?.is_some() {
            return Ok(SpawnOutcome::AlreadyExists);
        }

        let instance = instance_from_template(template, due, now);
        match self.tasks.insert_instance(&instance).await? {
            InstanceInsert::Created => {
                tracing::debug!(
                    template_id = %template.id,
                    instance_id = %instance.id,
                    due = %due,
                    "cadence_recurrence_instance_created"
                );
                Ok(SpawnOutcome::Created(instance))
            }
            InstanceInsert::DuplicateDate => Ok(SpawnOutcome::AlreadyExists),
        }
    }

    /// Sweep every active template once, spawning whatever is due.
    ///
    /// One malformed template cannot block the rest: rule and storage
    /// failures are counted, logged, and skipped.
    pub async fn rollforward(&self, now: DateTime<Utc>) -> CadResult<SpawnStats> {
        let mut stats = SpawnStats::default();
        let page_size = self.config.page_size.max(1);
        let mut offset = 0usize;

        loop {
            let page = self.tasks.list_templates(page_size, offset).await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();

            for template in page {
                stats.scanned_templates += 1;

                if let Err(reason) = template.recurrence.validate() {
                    stats.errors += 1;
                    tracing::warn!(
                        task_id = %template.id,
                        error = %reason,
                        "cadence_recurrence_rule_invalid"
                    );
                    continue;
                }

                // Catch-up is bounded per sweep; a long-offline deployment
                // converges over successive ticks.
                for _ in 0..self.config.max_instances_per_tick.max(1) {
                    match self.ensure_instance(&template, now).await {
                        Ok(SpawnOutcome::Created(_)) => stats.spawned_instances += 1,
                        Ok(SpawnOutcome::AlreadyExists) => {}
                        Ok(SpawnOutcome::Exhausted) => {
                            stats.exhausted_templates += 1;
                            break;
                        }
                        Ok(SpawnOutcome::NotDue) | Ok(SpawnOutcome::NotRecurring) => break,
                        Err(err) => {
                            stats.errors += 1;
                            tracing::warn!(
                                task_id = %template.id,
                                error = %err,
                                "cadence_recurrence_spawn_failed"
                            );
                            break;
                        }
                    }
                }
            }

            if page_len < page_size {
                break;
            }
            offset = offset.saturating_add(page_size);
        }

        Ok(stats)
    }
}

/// Snapshot copy: later edits to the template do not retroactively change
/// already-spawned instances.
fn instance_from_template(template: &Task, due: NaiveDate, now: DateTime<Utc>) -> Task {
    Task {
        id: Uuid::now_v7(),
        owner_id: template.owner_id,
        name: template.name.clone(),
        notes: template.notes.clone(),
        project: template.project.clone(),
        tags: template.tags.clone(),
        priority: template.priority,
        due_date: Some(due),
        habit_mode: false,
        recurrence: RecurrenceRule::none(),
        recurring_parent_id: Some(template.id),
        status: TaskStatus::NotStarted,
        created_at: now,
        updated_at: now,
    }
}

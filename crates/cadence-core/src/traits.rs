use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::CadResult;
use crate::model::*;

/// Outcome of inserting a spawned instance under the storage-level
/// `(recurring_parent_id, due_date)` uniqueness constraint. A constraint
/// violation is the benign "already exists" signal, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceInsert {
    Created,
    DuplicateDate,
}

/// Storage backend for tasks (templates, instances, plain tasks).
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &Task) -> CadResult<()>;
    async fn get(&self, id: Uuid) -> CadResult<Option<Task>>;
    async fn update(&self, task: &Task) -> CadResult<()>;
    async fn delete(&self, id: Uuid) -> CadResult<bool>;

    /// Top-level tasks with an active recurrence rule, excluding archived.
    async fn list_templates(&self, limit: usize, offset: usize) -> CadResult<Vec<Task>>;

    async fn find_instance(&self, template_id: Uuid, due: NaiveDate) -> CadResult<Option<Task>>;

    /// The due date of the most recently spawned instance, if any.
    async fn latest_instance_due(&self, template_id: Uuid) -> CadResult<Option<NaiveDate>>;

    /// Insert a spawned instance, racing against the uniqueness constraint.
    async fn insert_instance(&self, task: &Task) -> CadResult<InstanceInsert>;

    /// Due-dated, non-child tasks for the calendar feed.
    async fn list_feed_tasks(
        &self,
        include_completed: bool,
        project: Option<&str>,
    ) -> CadResult<Vec<Task>>;
}

/// Storage backend for completion/skip records, keyed by
/// `(task_id, occurrence_date)`.
#[async_trait]
pub trait CompletionStore: Send + Sync {
    /// Insert or replace the record for this task and occurrence date.
    async fn upsert_completion(
        &self,
        completion: &RecurringCompletion,
    ) -> CadResult<RecurringCompletion>;
    async fn get_completion(
        &self,
        task_id: Uuid,
        date: NaiveDate,
    ) -> CadResult<Option<RecurringCompletion>>;
    async fn delete_completion(&self, task_id: Uuid, date: NaiveDate) -> CadResult<bool>;
    async fn list_completions_range(
        &self,
        task_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> CadResult<Vec<RecurringCompletion>>;
    async fn list_completions(&self, task_id: Uuid) -> CadResult<Vec<RecurringCompletion>>;
}

fn _assert_task_store_object_safe(_: &dyn TaskStore) {}
fn _assert_completion_store_object_safe(_: &dyn CompletionStore) {}

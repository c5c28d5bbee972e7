use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("invalid recurrence rule: {0}")]
    InvalidRecurrenceRule(String),

    #[error("invalid occurrence date {date} for task {task_id}")]
    InvalidOccurrence { task_id: Uuid, date: NaiveDate },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type CadResult<T> = Result<T, CadenceError>;

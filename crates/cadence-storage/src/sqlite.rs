use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use cadence_core::*;

/// Number of connections in the pool. SQLite WAL mode supports one writer
/// plus concurrent readers, so a small pool removes head-of-line blocking
/// for read queries.
const DEFAULT_POOL_SIZE: usize = 4;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    name TEXT NOT NULL,
    notes TEXT,
    project TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    priority INTEGER NOT NULL DEFAULT 0,
    due_date TEXT,
    habit_mode INTEGER NOT NULL DEFAULT 0,
    recurrence_type TEXT NOT NULL DEFAULT 'none',
    recurrence_interval INTEGER NOT NULL DEFAULT 1,
    recurrence_weekdays TEXT,
    recurrence_weekday INTEGER,
    recurrence_week_of_month INTEGER,
    recurrence_month_day INTEGER,
    recurrence_end_date TEXT,
    recurring_parent_id TEXT,
    status TEXT NOT NULL DEFAULT 'not_started',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_parent_due
    ON tasks(recurring_parent_id, due_date)
    WHERE recurring_parent_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_tasks_due_date ON tasks(due_date);

CREATE TABLE IF NOT EXISTS recurring_completions (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    occurrence_date TEXT NOT NULL,
    completed_at TEXT,
    skipped INTEGER NOT NULL DEFAULT 0,
    UNIQUE(task_id, occurrence_date),
    FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_completions_task_date
    ON recurring_completions(task_id, occurrence_date);
";

const TASK_COLUMNS: &str = "id, owner_id, name, notes, project, tags, priority, due_date, \
     habit_mode, recurrence_type, recurrence_interval, recurrence_weekdays, recurrence_weekday, \
     recurrence_week_of_month, recurrence_month_day, recurrence_end_date, recurring_parent_id, \
     status, created_at, updated_at";

/// SQLite-backed implementation of [`TaskStore`] and [`CompletionStore`].
pub struct SqliteStore {
    /// Connection pool, round-robin across `DEFAULT_POOL_SIZE` connections.
    /// Each connection sits behind its own Mutex so synchronous rusqlite
    /// calls never hold a lock across an await point.
    pool: Vec<Mutex<Connection>>,
    next_slot: AtomicUsize,
}

impl SqliteStore {
    pub fn open(path: &Path) -> CadResult<Self> {
        let mut pool = Vec::with_capacity(DEFAULT_POOL_SIZE);
        for i in 0..DEFAULT_POOL_SIZE {
            let conn = Self::open_connection(path)?;
            if i == 0 {
                conn.execute_batch(SCHEMA)
                    .map_err(|e| CadenceError::Storage(format!("failed to init schema: {e}")))?;
            }
            pool.push(Mutex::new(conn));
        }
        Ok(Self {
            pool,
            next_slot: AtomicUsize::new(0),
        })
    }

    fn open_connection(path: &Path) -> CadResult<Connection> {
        let conn = Connection::open(path)
            .map_err(|e| CadenceError::Storage(format!("failed to open sqlite: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| CadenceError::Storage(format!("failed to set pragmas: {e}")))?;
        Ok(conn)
    }

    /// Run a synchronous closure against a pooled connection. The closure is
    /// `FnOnce`, so the guard always drops before the enclosing future
    /// yields, keeping it `Send`.
    fn with_conn<F, T>(&self, f: F) -> CadResult<T>
    where
        F: FnOnce(&Connection) -> CadResult<T>,
    {
        let idx = self.next_slot.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        let conn = self.pool[idx]
            .lock()
            .map_err(|e| CadenceError::Storage(e.to_string()))?;
        f(&conn)
    }
}

fn storage_err(e: rusqlite::Error) -> CadenceError {
    CadenceError::Storage(e.to_string())
}

fn parse_uuid(raw: &str) -> CadResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| CadenceError::Storage(format!("bad uuid {raw:?}: {e}")))
}

fn parse_datetime(raw: &str) -> CadResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CadenceError::Storage(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_date(raw: &str) -> CadResult<NaiveDate> {
    raw.parse()
        .map_err(|e| CadenceError::Storage(format!("bad date {raw:?}: {e}")))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<CadResult<Task>> {
    let id: String = row.get(0)?;
    let owner_id: String = row.get(1)?;
    let name: String = row.get(2)?;
    let notes: Option<String> = row.get(3)?;
    let project: Option<String> = row.get(4)?;
    let tags_raw: String = row.get(5)?;
    let priority: i32 = row.get(6)?;
    let due_date: Option<String> = row.get(7)?;
    let habit_mode: bool = row.get(8)?;
    let recurrence_type: Option<String> = row.get(9)?;
    let recurrence_interval: Option<i64> = row.get(10)?;
    let recurrence_weekdays: Option<String> = row.get(11)?;
    let recurrence_weekday: Option<i64> = row.get(12)?;
    let recurrence_week_of_month: Option<i64> = row.get(13)?;
    let recurrence_month_day: Option<i64> = row.get(14)?;
    let recurrence_end_date: Option<String> = row.get(15)?;
    let recurring_parent_id: Option<String> = row.get(16)?;
    let status: String = row.get(17)?;
    let created_at: String = row.get(18)?;
    let updated_at: String = row.get(19)?;

    Ok(build_task(
        id,
        owner_id,
        name,
        notes,
        project,
        tags_raw,
        priority,
        due_date,
        habit_mode,
        recurrence_type,
        recurrence_interval,
        recurrence_weekdays,
        recurrence_weekday,
        recurrence_week_of_month,
        recurrence_month_day,
        recurrence_end_date,
        recurring_parent_id,
        status,
        created_at,
        updated_at,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_task(
    id: String,
    owner_id: String,
    name: String,
    notes: Option<String>,
    project: Option<String>,
    tags_raw: String,
    priority: i32,
    due_date: Option<String>,
    habit_mode: bool,
    recurrence_type: Option<String>,
    recurrence_interval: Option<i64>,
    recurrence_weekdays: Option<String>,
    recurrence_weekday: Option<i64>,
    recurrence_week_of_month: Option<i64>,
    recurrence_month_day: Option<i64>,
    recurrence_end_date: Option<String>,
    recurring_parent_id: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
) -> CadResult<Task> {
    // The weekdays column has been written both as a JSON array and as a
    // JSON-encoded string over time; hand whatever is there to the rule
    // normalizer rather than interpreting it here.
    let weekdays_value = recurrence_weekdays.map(|raw| {
        serde_json::from_str::<serde_json::Value>(&raw)
            .unwrap_or(serde_json::Value::String(raw))
    });
    let recurrence = RecurrenceRule::from_parts(
        recurrence_type.as_deref(),
        recurrence_interval,
        weekdays_value.as_ref(),
        recurrence_weekday,
        recurrence_week_of_month,
        recurrence_month_day,
        recurrence_end_date.as_deref(),
    );

    Ok(Task {
        id: parse_uuid(&id)?,
        owner_id: parse_uuid(&owner_id)?,
        name,
        notes,
        project,
        tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
        priority,
        due_date: due_date.as_deref().map(parse_date).transpose()?,
        habit_mode,
        recurrence,
        recurring_parent_id: recurring_parent_id.as_deref().map(parse_uuid).transpose()?,
        status: status
            .parse()
            .map_err(|e: String| CadenceError::Storage(e))?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

/// Bind a task's 20 columns (?1 = id) and run `sql` against `conn`. Shared
/// by insert, update, and the constraint-guarded instance insert.
fn exec_task_sql(conn: &Connection, sql: &str, task: &Task) -> CadResult<rusqlite::Result<usize>> {
    let rule = &task.recurrence;
    let tags_json = serde_json::to_string(&task.tags)?;
    let weekdays_json = serde_json::to_string(&rule.weekdays)?;
    Ok(conn.execute(
        sql,
        params![
            task.id.to_string(),
            task.owner_id.to_string(),
            task.name,
            task.notes,
            task.project,
            tags_json,
            task.priority,
            task.due_date.map(|d| d.to_string()),
            task.habit_mode,
            rule.kind.as_str(),
            rule.interval as i64,
            weekdays_json,
            rule.weekday.map(i64::from),
            rule.week_of_month.map(i64::from),
            rule.month_day.map(i64::from),
            rule.end_date.map(|d| d.to_string()),
            task.recurring_parent_id.map(|id| id.to_string()),
            task.status.as_str(),
            task.created_at.to_rfc3339(),
            task.updated_at.to_rfc3339(),
        ],
    ))
}

const INSERT_TASK_SQL: &str = "INSERT INTO tasks (id, owner_id, name, notes, project, tags, \
     priority, due_date, habit_mode, recurrence_type, recurrence_interval, recurrence_weekdays, \
     recurrence_weekday, recurrence_week_of_month, recurrence_month_day, recurrence_end_date, \
     recurring_parent_id, status, created_at, updated_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)";

fn completion_from_row(row: &Row<'_>) -> rusqlite::Result<CadResult<RecurringCompletion>> {
    let id: String = row.get(0)?;
    let task_id: String = row.get(1)?;
    let occurrence_date: String = row.get(2)?;
    let completed_at: Option<String> = row.get(3)?;
    let skipped: bool = row.get(4)?;

    Ok((|| {
        Ok(RecurringCompletion {
            id: parse_uuid(&id)?,
            task_id: parse_uuid(&task_id)?,
            occurrence_date: parse_date(&occurrence_date)?,
            completed_at: completed_at.as_deref().map(parse_datetime).transpose()?,
            skipped,
        })
    })())
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert(&self, task: &Task) -> CadResult<()> {
        self.with_conn(|conn| {
            exec_task_sql(conn, INSERT_TASK_SQL, task)?.map_err(storage_err)?;
            Ok(())
        })
    }

    async fn get(&self, id: Uuid) -> CadResult<Option<Task>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
                task_from_row,
            )
            .optional()
            .map_err(storage_err)?
            .transpose()
        })
    }

    async fn update(&self, task: &Task) -> CadResult<()> {
        self.with_conn(|conn| {
            let changed = exec_task_sql(
                conn,
                "UPDATE tasks SET owner_id = ?2, name = ?3, notes = ?4, project = ?5, \
                 tags = ?6, priority = ?7, due_date = ?8, habit_mode = ?9, \
                 recurrence_type = ?10, recurrence_interval = ?11, recurrence_weekdays = ?12, \
                 recurrence_weekday = ?13, recurrence_week_of_month = ?14, \
                 recurrence_month_day = ?15, recurrence_end_date = ?16, \
                 recurring_parent_id = ?17, status = ?18, created_at = ?19, updated_at = ?20 \
                 WHERE id = ?1",
                task,
            )?
            .map_err(storage_err)?;
            if changed == 0 {
                return Err(CadenceError::TaskNotFound(task.id));
            }
            Ok(())
        })
    }

    async fn delete(&self, id: Uuid) -> CadResult<bool> {
        self.with_conn(|conn| {
            let changed = conn
                .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
                .map_err(storage_err)?;
            Ok(changed > 0)
        })
    }

    async fn list_templates(&self, limit: usize, offset: usize) -> CadResult<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE recurring_parent_id IS NULL \
                       AND recurrence_type != 'none' \
                       AND status != 'archived' \
                     ORDER BY id LIMIT ?1 OFFSET ?2"
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![limit as i64, offset as i64], task_from_row)
                .map_err(storage_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err)?
                .into_iter()
                .collect()
        })
    }

    async fn find_instance(&self, template_id: Uuid, due: NaiveDate) -> CadResult<Option<Task>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE recurring_parent_id = ?1 AND due_date = ?2"
                ),
                params![template_id.to_string(), due.to_string()],
                task_from_row,
            )
            .optional()
            .map_err(storage_err)?
            .transpose()
        })
    }

    async fn latest_instance_due(&self, template_id: Uuid) -> CadResult<Option<NaiveDate>> {
        self.with_conn(|conn| {
            // ISO dates sort lexicographically, so MAX works on the text column.
            let latest: Option<String> = conn
                .query_row(
                    "SELECT MAX(due_date) FROM tasks WHERE recurring_parent_id = ?1",
                    params![template_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            latest.as_deref().map(parse_date).transpose()
        })
    }

    async fn insert_instance(&self, task: &Task) -> CadResult<InstanceInsert> {
        self.with_conn(|conn| {
            match exec_task_sql(conn, INSERT_TASK_SQL, task)? {
                Ok(_) => Ok(InstanceInsert::Created),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Ok(InstanceInsert::DuplicateDate)
                }
                Err(e) => Err(storage_err(e)),
            }
        })
    }

    async fn list_feed_tasks(
        &self,
        include_completed: bool,
        project: Option<&str>,
    ) -> CadResult<Vec<Task>> {
        let tasks: Vec<Task> = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE recurring_parent_id IS NULL AND due_date IS NOT NULL \
                     ORDER BY due_date, id"
                ))
                .map_err(storage_err)?;
            let rows = stmt.query_map([], task_from_row).map_err(storage_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err)?
                .into_iter()
                .collect()
        })?;

        Ok(tasks
            .into_iter()
            .filter(|task| {
                include_completed
                    || !matches!(task.status, TaskStatus::Done | TaskStatus::Archived)
            })
            .filter(|task| match project {
                Some(wanted) => task.project.as_deref() == Some(wanted),
                None => true,
            })
            .collect())
    }
}

#[async_trait]
impl CompletionStore for SqliteStore {
    async fn upsert_completion(
        &self,
        completion: &RecurringCompletion,
    ) -> CadResult<RecurringCompletion> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO recurring_completions (id, task_id, occurrence_date, completed_at, skipped) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(task_id, occurrence_date) \
                 DO UPDATE SET completed_at = excluded.completed_at, skipped = excluded.skipped",
                params![
                    completion.id.to_string(),
                    completion.task_id.to_string(),
                    completion.occurrence_date.to_string(),
                    completion.completed_at.map(|at| at.to_rfc3339()),
                    completion.skipped,
                ],
            )
            .map_err(storage_err)?;

            // Re-read so the caller sees the stored row (the original id
            // survives an upsert over an existing record).
            conn.query_row(
                "SELECT id, task_id, occurrence_date, completed_at, skipped \
                 FROM recurring_completions WHERE task_id = ?1 AND occurrence_date = ?2",
                params![
                    completion.task_id.to_string(),
                    completion.occurrence_date.to_string()
                ],
                completion_from_row,
            )
            .map_err(storage_err)?
        })
    }

    async fn get_completion(
        &self,
        task_id: Uuid,
        date: NaiveDate,
    ) -> CadResult<Option<RecurringCompletion>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, task_id, occurrence_date, completed_at, skipped \
                 FROM recurring_completions WHERE task_id = ?1 AND occurrence_date = ?2",
                params![task_id.to_string(), date.to_string()],
                completion_from_row,
            )
            .optional()
            .map_err(storage_err)?
            .transpose()
        })
    }

    async fn delete_completion(&self, task_id: Uuid, date: NaiveDate) -> CadResult<bool> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "DELETE FROM recurring_completions \
                     WHERE task_id = ?1 AND occurrence_date = ?2",
                    params![task_id.to_string(), date.to_string()],
                )
                .map_err(storage_err)?;
            Ok(changed > 0)
        })
    }

    async fn list_completions_range(
        &self,
        task_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> CadResult<Vec<RecurringCompletion>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, task_id, occurrence_date, completed_at, skipped \
                     FROM recurring_completions \
                     WHERE task_id = ?1 AND occurrence_date >= ?2 AND occurrence_date <= ?3 \
                     ORDER BY occurrence_date",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(
                    params![task_id.to_string(), from.to_string(), to.to_string()],
                    completion_from_row,
                )
                .map_err(storage_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err)?
                .into_iter()
                .collect()
        })
    }

    async fn list_completions(&self, task_id: Uuid) -> CadResult<Vec<RecurringCompletion>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, task_id, occurrence_date, completed_at, skipped \
                     FROM recurring_completions WHERE task_id = ?1 ORDER BY occurrence_date",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![task_id.to_string()], completion_from_row)
                .map_err(storage_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_err)?
                .into_iter()
                .collect()
        })
    }
}

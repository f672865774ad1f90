use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use cadence_core::{ExecutionId, ScheduleId};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, instrument, warn};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::store::ScheduleStore;
use crate::types::{Execution, ExecutionOutcome, Schedule, ScheduleData, Task};

const EXECUTION_COLUMNS: &str =
    "id, schedule_id, start_time, end_time, duration_secs, success, result_code, output";

const SCHEDULE_SELECT: &str = "SELECT s.id, s.name, s.active, s.parallel, s.policy, s.notification_targets,
            t.id, t.command, t.sanitized_command, t.is_internal
     FROM schedules s JOIN tasks t ON t.id = s.task_id";

/// SQLite-backed [`ScheduleStore`] plus the admin operations the CLI needs.
///
/// Thread-safe: the connection lives behind a `Mutex`; every call holds it
/// for one statement or one transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::new(conn)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SchedulerError::LockPoisoned(e.to_string()))
    }

    /// Insert a task, or update its command if the id already exists.
    #[instrument(level = "debug", skip(self, task), fields(task_id = %task.id))]
    pub fn add_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn()?;
        upsert_task(&conn, task)?;
        Ok(())
    }

    /// Persist a schedule together with its task.
    #[instrument(level = "debug", skip(self, schedule), fields(schedule_id = %schedule.id))]
    pub fn add_schedule(&self, schedule: &Schedule) -> Result<()> {
        let policy = serde_json::to_string(&schedule.policy)?;
        let targets = serde_json::to_string(&schedule.notification_targets)?;
        let now = timestamp(Utc::now());

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        upsert_task(&tx, &schedule.task)?;
        tx.execute(
            "INSERT INTO schedules
             (id, name, task_id, active, parallel, policy, notification_targets, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                schedule.id.as_str(),
                schedule.name,
                schedule.task.id.as_str(),
                schedule.active,
                schedule.parallel,
                policy,
                targets,
                now,
            ],
        )?;
        tx.commit()?;

        info!(schedule_id = %schedule.id, kind = schedule.policy.kind(), "schedule added");
        Ok(())
    }

    pub fn set_schedule_active(&self, id: &ScheduleId, active: bool) -> Result<()> {
        let n = self.conn()?.execute(
            "UPDATE schedules SET active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active, timestamp(Utc::now()), id.as_str()],
        )?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: id.to_string() });
        }
        info!(schedule_id = %id, active, "schedule activation changed");
        Ok(())
    }

    /// Delete a schedule and its execution history. The task row is kept.
    pub fn remove_schedule(&self, id: &ScheduleId) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM executions WHERE schedule_id = ?1", [id.as_str()])?;
        let n = tx.execute("DELETE FROM schedules WHERE id = ?1", [id.as_str()])?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: id.to_string() });
        }
        tx.commit()?;
        info!(schedule_id = %id, "schedule removed");
        Ok(())
    }

    /// Most recent executions of one schedule, newest first.
    #[instrument(level = "debug", skip(self))]
    pub fn list_executions(&self, schedule_id: &ScheduleId, limit: usize) -> Result<Vec<Execution>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE schedule_id = ?1
             ORDER BY start_time DESC, rowid DESC
             LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![schedule_id.as_str(), limit], row_to_execution)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn query_latest(&self, sql: &str, schedule_id: &ScheduleId) -> Result<Option<Execution>> {
        let conn = self.conn()?;
        let run = conn
            .query_row(sql, [schedule_id.as_str()], row_to_execution)
            .optional()?;
        Ok(run)
    }
}

impl ScheduleStore for SqliteStore {
    #[instrument(level = "debug", skip(self))]
    fn load_schedules(&self, active_only: bool) -> Result<Vec<Schedule>> {
        let conn = self.conn()?;
        let sql = if active_only {
            format!("{SCHEDULE_SELECT} WHERE s.active = 1 ORDER BY s.id")
        } else {
            format!("{SCHEDULE_SELECT} ORDER BY s.id")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_schedule_parts)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        // A row with an unreadable policy must not hide every other schedule.
        let schedules = rows
            .into_iter()
            .filter_map(|parts| match parts.into_schedule() {
                Ok(schedule) => Some(schedule),
                Err((id, e)) => {
                    warn!(schedule_id = %id, "skipping schedule with unreadable policy: {e}");
                    None
                }
            })
            .collect();
        Ok(schedules)
    }

    #[instrument(level = "debug", skip(self))]
    fn load_schedule(&self, id: &ScheduleId) -> Result<Option<Schedule>> {
        let conn = self.conn()?;
        let parts = conn
            .query_row(
                &format!("{SCHEDULE_SELECT} WHERE s.id = ?1"),
                [id.as_str()],
                row_to_schedule_parts,
            )
            .optional()?;
        match parts {
            None => Ok(None),
            Some(parts) => parts
                .into_schedule()
                .map(Some)
                .map_err(|(id, e)| SchedulerError::InvalidSchedule {
                    id,
                    reason: e.to_string(),
                }),
        }
    }

    #[instrument(level = "debug", skip(self))]
    fn latest_execution(&self, schedule_id: &ScheduleId) -> Result<Option<Execution>> {
        self.query_latest(
            &format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions
                 WHERE schedule_id = ?1
                 ORDER BY start_time DESC, rowid DESC LIMIT 1"
            ),
            schedule_id,
        )
    }

    #[instrument(level = "debug", skip(self))]
    fn latest_finished_execution(
        &self,
        schedule_id: &ScheduleId,
        success_only: bool,
    ) -> Result<Option<Execution>> {
        let success_filter = if success_only { "AND success = 1" } else { "" };
        self.query_latest(
            &format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions
                 WHERE schedule_id = ?1 AND end_time IS NOT NULL {success_filter}
                 ORDER BY start_time DESC, rowid DESC LIMIT 1"
            ),
            schedule_id,
        )
    }

    #[instrument(level = "debug", skip(self, execution), fields(execution_id = %execution.id))]
    fn insert_execution(&self, execution: &Execution) -> Result<()> {
        self.conn()?.execute(
            &format!("INSERT INTO executions ({EXECUTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                execution.id.as_str(),
                execution.schedule_id.as_str(),
                timestamp(execution.start_time),
                execution.end_time.map(timestamp),
                execution.duration_secs,
                execution.success,
                execution.result_code,
                execution.output,
            ],
        )?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, outcome))]
    fn finish_execution(&self, id: &ExecutionId, outcome: &ExecutionOutcome) -> Result<()> {
        let n = self.conn()?.execute(
            "UPDATE executions
             SET end_time = ?1, duration_secs = ?2, success = ?3, result_code = ?4, output = ?5
             WHERE id = ?6 AND end_time IS NULL",
            params![
                timestamp(outcome.end_time),
                outcome.duration_secs,
                outcome.success,
                outcome.result_code,
                outcome.output,
                id.as_str(),
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::ExecutionNotFound { id: id.to_string() });
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    fn unfinished_executions(&self) -> Result<Vec<Execution>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE end_time IS NULL
             ORDER BY start_time, rowid"
        ))?;
        let rows = stmt
            .query_map([], row_to_execution)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

/// Whole-second RFC 3339 in UTC; sorts lexically in time order.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn upsert_task(conn: &Connection, task: &Task) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO tasks (id, command, sanitized_command, is_internal)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            command = excluded.command,
            sanitized_command = excluded.sanitized_command,
            is_internal = excluded.is_internal",
        params![task.id.as_str(), task.command, task.sanitized_command, task.is_internal],
    )
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
    let start: String = row.get(2)?;
    let end: Option<String> = row.get(3)?;
    Ok(Execution {
        id: ExecutionId::from(row.get::<_, String>(0)?),
        schedule_id: ScheduleId::from(row.get::<_, String>(1)?),
        start_time: parse_timestamp(2, &start)?,
        end_time: end.as_deref().map(|raw| parse_timestamp(3, raw)).transpose()?,
        duration_secs: row.get(4)?,
        success: row.get(5)?,
        result_code: row.get(6)?,
        output: row.get(7)?,
    })
}

/// Raw schedule row; JSON columns are decoded separately so one bad row can
/// be skipped without failing the whole query.
struct ScheduleRow {
    id: String,
    name: String,
    active: bool,
    parallel: bool,
    policy: String,
    targets: String,
    task: Task,
}

impl ScheduleRow {
    fn into_schedule(self) -> std::result::Result<Schedule, (String, serde_json::Error)> {
        let policy: ScheduleData = match serde_json::from_str(&self.policy) {
            Ok(policy) => policy,
            Err(e) => return Err((self.id, e)),
        };
        let notification_targets: Vec<String> = match serde_json::from_str(&self.targets) {
            Ok(targets) => targets,
            Err(e) => return Err((self.id, e)),
        };
        Ok(Schedule {
            id: ScheduleId::from(self.id),
            name: self.name,
            task: self.task,
            active: self.active,
            parallel: self.parallel,
            policy,
            notification_targets,
        })
    }
}

fn row_to_schedule_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleRow> {
    Ok(ScheduleRow {
        id: row.get(0)?,
        name: row.get(1)?,
        active: row.get(2)?,
        parallel: row.get(3)?,
        policy: row.get(4)?,
        targets: row.get(5)?,
        task: Task {
            id: row.get::<_, String>(6)?.into(),
            command: row.get(7)?,
            sanitized_command: row.get(8)?,
            is_internal: row.get(9)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IntervalUnit;
    use chrono::{Duration, TimeZone};

    fn store() -> SqliteStore {
        SqliteStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 8, minute, 0).unwrap()
    }

    fn backup(id: &str) -> Schedule {
        Schedule::new(
            "nightly backup",
            Task::new("backup", "PGPASSWORD=x pg_dump prod"),
            ScheduleData::Interval {
                start: at(0),
                end: None,
                unit: IntervalUnit::Day,
                value: 1,
            },
        )
        .with_id(id)
        .notify("ops@example.com")
    }

    #[test]
    fn schedules_round_trip_through_sql() {
        let store = store();
        let schedule = backup("nightly");
        store.add_schedule(&schedule).unwrap();

        let loaded = store.load_schedule(&"nightly".into()).unwrap().unwrap();
        assert_eq!(loaded, schedule);
        assert_eq!(loaded.task.sanitized_command, "PGPASSWORD=*** pg_dump prod");

        store.set_schedule_active(&"nightly".into(), false).unwrap();
        assert!(store.load_schedules(true).unwrap().is_empty());
        assert_eq!(store.load_schedules(false).unwrap().len(), 1);
    }

    #[test]
    fn unreadable_policy_is_skipped_in_listing() {
        let store = store();
        store.add_schedule(&backup("good")).unwrap();
        store.add_schedule(&backup("bad")).unwrap();
        store
            .conn()
            .unwrap()
            .execute("UPDATE schedules SET policy = '{\"kind\":\"cron\"}' WHERE id = 'bad'", [])
            .unwrap();

        let all = store.load_schedules(false).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id.as_str(), "good");
        assert!(matches!(
            store.load_schedule(&"bad".into()),
            Err(SchedulerError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn execution_lifecycle() {
        let store = store();
        store.add_schedule(&backup("nightly")).unwrap();
        let id = ScheduleId::from("nightly");

        let first = Execution::started(id.clone(), at(1));
        store.insert_execution(&first).unwrap();
        store
            .finish_execution(&first.id, &ExecutionOutcome::new(at(1), at(2), 0, "done".into()))
            .unwrap();

        let second = Execution::started(id.clone(), at(10));
        store.insert_execution(&second).unwrap();
        store
            .finish_execution(&second.id, &ExecutionOutcome::new(at(10), at(12), 4, "disk full".into()))
            .unwrap();

        let third = Execution::started(id.clone(), at(20));
        store.insert_execution(&third).unwrap();

        assert_eq!(store.latest_execution(&id).unwrap().unwrap().id, third.id);
        let finished = store.latest_finished_execution(&id, false).unwrap().unwrap();
        assert_eq!(finished.id, second.id);
        assert_eq!(finished.duration_secs, Some(120));
        assert_eq!(finished.success, Some(false));
        assert_eq!(
            store.latest_finished_execution(&id, true).unwrap().unwrap().id,
            first.id
        );

        let unfinished = store.unfinished_executions().unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, third.id);

        let history = store.list_executions(&id, 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, third.id);
        assert_eq!(history[1].id, second.id);
    }

    #[test]
    fn second_unfinished_run_is_refused() {
        let store = store();
        store.add_schedule(&backup("nightly")).unwrap();
        let first = Execution::started("nightly".into(), at(1));
        store.insert_execution(&first).unwrap();

        let second = Execution::started("nightly".into(), at(2));
        assert!(matches!(
            store.insert_execution(&second),
            Err(SchedulerError::Database(_))
        ));

        store
            .finish_execution(&first.id, &ExecutionOutcome::new(at(1), at(2), 0, String::new()))
            .unwrap();
        store.insert_execution(&second).unwrap();
    }

    #[test]
    fn finishing_twice_is_rejected() {
        let store = store();
        store.add_schedule(&backup("nightly")).unwrap();
        let run = Execution::started("nightly".into(), at(1));
        store.insert_execution(&run).unwrap();

        let outcome = ExecutionOutcome::new(at(1), at(1) + Duration::seconds(3), 0, String::new());
        store.finish_execution(&run.id, &outcome).unwrap();
        assert!(matches!(
            store.finish_execution(&run.id, &outcome),
            Err(SchedulerError::ExecutionNotFound { .. })
        ));
    }

    #[test]
    fn remove_schedule_drops_history() {
        let store = store();
        store.add_schedule(&backup("nightly")).unwrap();
        store
            .insert_execution(&Execution::started("nightly".into(), at(1)))
            .unwrap();

        store.remove_schedule(&"nightly".into()).unwrap();
        assert!(store.load_schedule(&"nightly".into()).unwrap().is_none());
        assert!(store.unfinished_executions().unwrap().is_empty());
        assert!(matches!(
            store.remove_schedule(&"nightly".into()),
            Err(SchedulerError::ScheduleNotFound { .. })
        ));
    }
}

use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Safe to call on every startup (idempotent). Timestamps are RFC 3339 UTC
/// strings with whole seconds, so lexical order equals chronological order.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id                TEXT    NOT NULL PRIMARY KEY,
            command           TEXT    NOT NULL,
            sanitized_command TEXT    NOT NULL,
            is_internal       INTEGER NOT NULL DEFAULT 0
        ) STRICT;

        CREATE TABLE IF NOT EXISTS schedules (
            id                   TEXT    NOT NULL PRIMARY KEY,
            name                 TEXT    NOT NULL,
            task_id              TEXT    NOT NULL REFERENCES tasks (id),
            active               INTEGER NOT NULL DEFAULT 1,
            parallel             INTEGER NOT NULL DEFAULT 0,
            policy               TEXT    NOT NULL,   -- JSON-encoded ScheduleData
            notification_targets TEXT    NOT NULL DEFAULT '[]',
            created_at           TEXT    NOT NULL,
            updated_at           TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS executions (
            id            TEXT    NOT NULL PRIMARY KEY,
            schedule_id   TEXT    NOT NULL REFERENCES schedules (id),
            start_time    TEXT    NOT NULL,
            end_time      TEXT,               -- NULL while running
            duration_secs INTEGER,
            success       INTEGER,
            result_code   INTEGER,
            output        TEXT
        ) STRICT;

        -- Latest-run lookups: WHERE schedule_id = ? ORDER BY start_time DESC LIMIT 1
        CREATE INDEX IF NOT EXISTS idx_executions_schedule_start
            ON executions (schedule_id, start_time DESC);

        -- At most one unfinished run per schedule, across processes sharing
        -- the file. Also serves the startup scan for rows that never finished.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_one_running
            ON executions (schedule_id) WHERE end_time IS NULL;
        ",
    )?;
    Ok(())
}

use std::collections::BTreeSet;

use cadence_core::{ExecutionId, ScheduleId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Environment-style keys whose values never reach the logs.
const SECRET_MARKERS: &[&str] = &["PASSWORD", "PASSWD", "SECRET", "TOKEN", "API_KEY"];

/// An immutable unit of work. The engine never interprets `command`; it only
/// hands the task to a [`crate::runner::TaskRunner`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub command: String,
    /// `command` with secret-looking assignments masked; safe to log.
    pub sanitized_command: String,
    /// Internal tasks are maintenance jobs owned by the host, not by users.
    #[serde(default)]
    pub is_internal: bool,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            id: id.into(),
            sanitized_command: sanitize_command(&command),
            command,
            is_internal: false,
        }
    }

    pub fn internal(mut self) -> Self {
        self.is_internal = true;
        self
    }
}

/// Mask the value of every `KEY=value` word whose key looks like a credential.
pub fn sanitize_command(command: &str) -> String {
    command
        .split(' ')
        .map(|word| match word.split_once('=') {
            Some((key, _)) if is_secret_key(key) => format!("{key}=***"),
            _ => word.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_secret_key(key: &str) -> bool {
    let upper = key.trim_start_matches('-').to_ascii_uppercase();
    SECRET_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// Calendar unit of an interval schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl std::fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IntervalUnit::Minute => "minute",
            IntervalUnit::Hour => "hour",
            IntervalUnit::Day => "day",
            IntervalUnit::Week => "week",
            IntervalUnit::Month => "month",
        };
        write!(f, "{s}")
    }
}

/// Defines when a schedule becomes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleData {
    /// Run exactly once, at or after `start`.
    Once { start: DateTime<Utc> },

    /// Never due on its own; only runs through an explicit execute-now request.
    Manual,

    /// Repeat every `value` `unit`s inside the `[start, end]` window.
    Interval {
        start: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end: Option<DateTime<Utc>>,
        unit: IntervalUnit,
        value: u32,
    },

    /// Run after any of `triggers` finishes a run newer than our own last run.
    FollowUp {
        triggers: BTreeSet<ScheduleId>,
        #[serde(default)]
        only_after_success: bool,
    },
}

impl ScheduleData {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleData::Once { .. } => "once",
            ScheduleData::Manual => "manual",
            ScheduleData::Interval { .. } => "interval",
            ScheduleData::FollowUp { .. } => "follow_up",
        }
    }
}

/// A persisted schedule definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    /// Human-readable label.
    pub name: String,
    pub task: Task,
    pub active: bool,
    /// Parallel schedules never take the engine-wide non-parallel slot.
    pub parallel: bool,
    pub policy: ScheduleData,
    /// Opaque addresses forwarded with completion reports (e-mail, chat ids, …).
    #[serde(default)]
    pub notification_targets: Vec<String>,
}

impl Schedule {
    /// Active, non-parallel schedule with a fresh id.
    pub fn new(name: impl Into<String>, task: Task, policy: ScheduleData) -> Self {
        Self {
            id: ScheduleId::new(),
            name: name.into(),
            task,
            active: true,
            parallel: false,
            policy,
            notification_targets: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<ScheduleId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn notify(mut self, target: impl Into<String>) -> Self {
        self.notification_targets.push(target.into());
        self
    }
}

/// One physical run of a schedule. `end_time == None` means still running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub schedule_id: ScheduleId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub success: Option<bool>,
    pub result_code: Option<i32>,
    pub output: Option<String>,
}

impl Execution {
    /// A freshly admitted, still running execution.
    pub fn started(schedule_id: ScheduleId, start_time: DateTime<Utc>) -> Self {
        Self {
            id: ExecutionId::new(),
            schedule_id,
            start_time,
            end_time: None,
            duration_secs: None,
            success: None,
            result_code: None,
            output: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.success == Some(true)
    }

    /// Apply the single completion transition.
    pub fn finish(&mut self, outcome: &ExecutionOutcome) {
        self.end_time = Some(outcome.end_time);
        self.duration_secs = Some(outcome.duration_secs);
        self.success = Some(outcome.success);
        self.result_code = Some(outcome.result_code);
        self.output = Some(outcome.output.clone());
    }
}

/// Everything recorded when an execution finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub end_time: DateTime<Utc>,
    pub duration_secs: i64,
    pub success: bool,
    pub result_code: i32,
    pub output: String,
}

impl ExecutionOutcome {
    /// Derive duration and success from the run's start and the task's result code.
    pub fn new(
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        result_code: i32,
        output: String,
    ) -> Self {
        Self {
            end_time,
            duration_secs: (end_time - start_time).num_seconds().max(0),
            success: result_code == 0,
            result_code,
            output,
        }
    }
}

/// Sent to the host after every finished run so it can alert on failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution: Execution,
    pub schedule_name: String,
    pub task_id: TaskId,
    pub notification_targets: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sanitize_masks_credentials_only() {
        let s = sanitize_command("PGPASSWORD=hunter2 pg_dump --api_key=abc -f out.sql  db");
        assert_eq!(s, "PGPASSWORD=*** pg_dump --api_key=*** -f out.sql  db");
    }

    #[test]
    fn policy_json_is_tagged() {
        let policy = ScheduleData::Interval {
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: None,
            unit: IntervalUnit::Day,
            value: 2,
        };
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["kind"], "interval");
        assert_eq!(json["unit"], "day");
        assert!(json.get("end").is_none());

        let manual: ScheduleData = serde_json::from_str(r#"{"kind":"manual"}"#).unwrap();
        assert_eq!(manual, ScheduleData::Manual);
    }

    #[test]
    fn follow_up_defaults_to_any_outcome() {
        let policy: ScheduleData =
            serde_json::from_str(r#"{"kind":"follow_up","triggers":["a","b"]}"#).unwrap();
        match policy {
            ScheduleData::FollowUp {
                triggers,
                only_after_success,
            } => {
                assert_eq!(triggers.len(), 2);
                assert!(!only_after_success);
            }
            other => panic!("unexpected policy {other:?}"),
        }
    }

    #[test]
    fn outcome_success_follows_result_code() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 30).unwrap();

        let ok = ExecutionOutcome::new(start, end, 0, String::new());
        assert!(ok.success);
        assert_eq!(ok.duration_secs, 90);

        let failed = ExecutionOutcome::new(start, end, 2, "boom".into());
        assert!(!failed.success);

        let mut execution = Execution::started("s".into(), start);
        assert!(execution.is_running());
        execution.finish(&failed);
        assert!(execution.is_finished());
        assert!(!execution.succeeded());
        assert_eq!(execution.result_code, Some(2));
    }
}

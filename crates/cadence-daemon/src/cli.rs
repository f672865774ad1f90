use clap::{Parser, Subcommand};

/// cadenced: run scheduled shell tasks from a SQLite schedule table.
#[derive(Parser, Debug)]
#[command(name = "cadenced", version, about)]
pub struct Cli {
    /// Path to cadence.toml (falls back to $CADENCE_CONFIG, then ~/.cadence/cadence.toml).
    #[arg(long, short)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler loop until interrupted (default).
    Run,

    /// Print the schedules that are due right now.
    Due {
        /// Include inactive schedules.
        #[arg(long)]
        all: bool,
    },

    /// Run one schedule immediately and wait for it to finish.
    Exec { schedule_id: String },

    /// List all schedules.
    List,

    /// Show recent executions of a schedule, newest first.
    History {
        schedule_id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Create a task and a schedule for it.
    Add {
        /// Human-readable schedule name.
        #[arg(long)]
        name: String,

        /// Shell command to run.
        #[arg(long)]
        command: String,

        /// Schedule policy as JSON, e.g. '{"kind":"interval","start":"2024-01-01T00:00:00Z","unit":"hour","value":1}'.
        #[arg(long)]
        policy: String,

        /// Schedule id (generated when omitted).
        #[arg(long)]
        id: Option<String>,

        /// Task id (defaults to the schedule id).
        #[arg(long)]
        task_id: Option<String>,

        /// Allow running alongside other schedules.
        #[arg(long)]
        parallel: bool,

        /// Create the schedule deactivated.
        #[arg(long)]
        inactive: bool,

        /// Mark the task as host-owned maintenance rather than a user job.
        #[arg(long)]
        internal: bool,

        /// Notification target forwarded with completion reports; repeatable.
        #[arg(long = "notify")]
        notify: Vec<String>,
    },

    /// Activate a schedule.
    Enable { schedule_id: String },

    /// Deactivate a schedule without deleting it.
    Disable { schedule_id: String },

    /// Delete a schedule and its execution history.
    Remove { schedule_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_is_the_default() {
        let cli = Cli::parse_from(["cadenced"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn add_collects_repeated_notify() {
        let cli = Cli::parse_from([
            "cadenced",
            "add",
            "--name",
            "backup",
            "--command",
            "pg_dump prod",
            "--policy",
            r#"{"kind":"manual"}"#,
            "--notify",
            "ops@example.com",
            "--notify",
            "dba@example.com",
        ]);
        match cli.command {
            Some(Command::Add {
                notify,
                parallel,
                internal,
                ..
            }) => {
                assert_eq!(notify.len(), 2);
                assert!(!parallel);
                assert!(!internal);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}

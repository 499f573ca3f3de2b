//! `vigil job` subcommands: scheduler CRUD over the shared store.

use clap::Subcommand;

use vigil_cron::{CronJob, JobCreate, JobPatch, Schedule};

#[derive(Subcommand)]
pub enum JobCommand {
    /// Add a scheduled job
    Add {
        /// Job name
        #[arg(long)]
        name: String,

        /// One-shot: RFC 3339 timestamp (e.g. "2026-01-01T09:00:00Z")
        #[arg(long)]
        at: Option<String>,

        /// Recurring: compact duration (e.g. "30m", "1h30m")
        #[arg(long)]
        every: Option<String>,

        /// Recurring: 5-field cron expression (e.g. "0 9 * * 1-5")
        #[arg(long)]
        cron: Option<String>,

        /// Prompt text sent to the engine when the job fires
        #[arg(long, default_value = "")]
        payload: String,

        /// Create the job disabled
        #[arg(long)]
        disabled: bool,
    },
    /// List all jobs
    List,
    /// Show one job as JSON
    Get { id: String },
    /// Remove a job
    Remove { id: String },
    /// Fire a job immediately, regardless of its schedule
    RunNow { id: String },
    /// Modify a job
    Update {
        id: String,

        /// New job name
        #[arg(long)]
        name: Option<String>,

        /// Replace the schedule with a one-shot timestamp
        #[arg(long)]
        at: Option<String>,

        /// Replace the schedule with a recurring duration
        #[arg(long)]
        every: Option<String>,

        /// Replace the schedule with a cron expression
        #[arg(long)]
        cron: Option<String>,

        /// New payload text
        #[arg(long)]
        payload: Option<String>,

        /// Enable or disable the job
        #[arg(long)]
        enabled: Option<bool>,
    },
}

pub async fn run_job(command: JobCommand) -> anyhow::Result<()> {
    let config = vigil_config::load_config()?;
    let (scheduler, _events, shutdown) = crate::run::open_scheduler(&config)?;

    let result = dispatch(&scheduler, command).await;
    shutdown.cancel();
    result
}

async fn dispatch(
    scheduler: &vigil_cron::scheduler::CronScheduler,
    command: JobCommand,
) -> anyhow::Result<()> {
    match command {
        JobCommand::Add {
            name,
            at,
            every,
            cron,
            payload,
            disabled,
        } => {
            let schedule = schedule_flags(at, every, cron)?
                .ok_or_else(|| anyhow::anyhow!("one of --at, --every or --cron is required"))?;
            let job = scheduler
                .add(JobCreate {
                    name,
                    schedule,
                    payload,
                    enabled: !disabled,
                })
                .await?;
            println!("Added job {}", job.id);
            print_job_line(&job);
        }
        JobCommand::List => {
            let jobs = scheduler.list().await?;
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for job in &jobs {
                print_job_line(job);
            }
        }
        JobCommand::Get { id } => {
            let job = scheduler.get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobCommand::Remove { id } => {
            scheduler.remove(&id).await?;
            println!("Removed job {id}");
        }
        JobCommand::RunNow { id } => {
            scheduler.run_now(&id).await?;
            println!("Fired job {id}");
        }
        JobCommand::Update {
            id,
            name,
            at,
            every,
            cron,
            payload,
            enabled,
        } => {
            let patch = JobPatch {
                name,
                schedule: schedule_flags(at, every, cron)?,
                payload,
                enabled,
            };
            let job = scheduler.update(&id, patch).await?;
            println!("Updated job {}", job.id);
            print_job_line(&job);
        }
    }
    Ok(())
}

/// Turn the mutually-exclusive schedule flags into a schedule, if any.
fn schedule_flags(
    at: Option<String>,
    every: Option<String>,
    cron: Option<String>,
) -> anyhow::Result<Option<Schedule>> {
    let given = [&at, &every, &cron].iter().filter(|o| o.is_some()).count();
    if given > 1 {
        anyhow::bail!("--at, --every and --cron are mutually exclusive");
    }
    Ok(match (at, every, cron) {
        (Some(at), _, _) => Some(Schedule::At { at }),
        (_, Some(every), _) => Some(Schedule::Every { every }),
        (_, _, Some(expr)) => Some(Schedule::Cron { expr }),
        _ => None,
    })
}

fn print_job_line(job: &CronJob) {
    println!(
        "{}  {:<20} {:<8} next: {}",
        job.id,
        job.name,
        if job.enabled { "enabled" } else { "disabled" },
        format_ms(job.state.next_run_at_ms),
    );
}

/// Unix-millis timestamp as RFC 3339, or "-" when absent.
pub fn format_ms(ms: Option<i64>) -> String {
    ms.and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_flags_picks_the_given_kind() {
        let schedule = schedule_flags(None, Some("30m".into()), None).unwrap();
        assert_eq!(
            schedule,
            Some(Schedule::Every {
                every: "30m".into()
            })
        );
        assert_eq!(schedule_flags(None, None, None).unwrap(), None);
    }

    #[test]
    fn test_schedule_flags_rejects_multiple_kinds() {
        let result = schedule_flags(Some("2026-01-01T00:00:00Z".into()), Some("1h".into()), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_format_ms() {
        assert_eq!(format_ms(None), "-");
        assert_eq!(format_ms(Some(1_748_772_000_000)), "2025-06-01T10:00:00Z");
    }
}

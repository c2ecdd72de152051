//! Schedule subcommand handlers for TaskForge.

use chrono::{DateTime, Utc};

use taskforge_config::Config;
use taskforge_queue::{JobPriority, ScheduledJob};
use taskforge_scheduler::{NewSchedule, ScheduleManager};

use crate::cli::ScheduleAction;
use crate::cmd_job::parse_payload;
use crate::server::open_queue;

/// Handle schedule subcommands.
pub(crate) async fn handle_schedule_command(
    action: ScheduleAction,
    config: &Config,
) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let manager = ScheduleManager::new(queue, config.scheduler.clone());

    match action {
        ScheduleAction::Create {
            name,
            cron,
            job_type,
            payload,
            priority,
            max_retries,
            disabled,
        } => {
            let priority: JobPriority = priority.parse()?;
            let mut new = NewSchedule::new(name, cron, job_type, parse_payload(&payload)?)
                .priority(priority)
                .enabled(!disabled);
            if let Some(max) = max_retries {
                new = new.max_retries(max);
            }
            let id = manager.create(new).await?;
            println!("{}", id);
        }
        ScheduleAction::List => print_schedules(&manager.get_all().await?),
        ScheduleAction::Delete { id } => {
            manager.delete(&id).await?;
            println!("Scheduled job {} deleted", id);
        }
        ScheduleAction::Enable { id } => {
            let schedule = manager.enable(&id).await?;
            println!(
                "Scheduled job '{}' enabled, next run {}",
                schedule.name,
                fmt_time(schedule.next_run)
            );
        }
        ScheduleAction::Disable { id } => {
            let schedule = manager.disable(&id).await?;
            println!("Scheduled job '{}' disabled", schedule.name);
        }
        ScheduleAction::Upcoming { limit } => print_schedules(&manager.get_upcoming(limit).await?),
    }

    Ok(())
}

fn print_schedules(schedules: &[ScheduledJob]) {
    if schedules.is_empty() {
        println!("No scheduled jobs found.");
        return;
    }

    println!(
        "{:<36}  {:<20} {:<16} {:<16} {:<8} {:<20} {}",
        "ID", "NAME", "CRON", "TYPE", "ENABLED", "NEXT RUN", "LAST RUN"
    );
    println!("{}", "-".repeat(140));
    for schedule in schedules {
        println!(
            "{:<36}  {:<20} {:<16} {:<16} {:<8} {:<20} {}",
            schedule.id,
            schedule.name,
            schedule.cron_expression,
            schedule.job_type,
            schedule.enabled,
            fmt_time(schedule.next_run),
            fmt_time(schedule.last_run)
        );
    }
}

fn fmt_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

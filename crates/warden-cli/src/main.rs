use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;

use warden_config::{LoggingConfig, WardenConfig};
use warden_cron::{Field, RateSpec, Schedule, command};
use warden_host::{Host, init_logging};

#[derive(Parser)]
#[command(name = "warden", about = "Game server automation host")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host until Ctrl-C
    Run {
        /// Config file (defaults to ~/.warden/config.json5)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// List registered event types
    Events {
        /// Config file (defaults to ~/.warden/config.json5)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Resolve a schedule and print the values each field matches
    CheckSchedule {
        #[arg(long, default_value = "0")]
        second: String,
        #[arg(long, default_value = "*")]
        minute: String,
        #[arg(long, default_value = "*")]
        hour: String,
        #[arg(long, default_value = "*")]
        day: String,
        #[arg(long, default_value = "*")]
        month: String,
        /// Day of week, 0 = Sunday
        #[arg(long, default_value = "*")]
        dow: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = load(config.as_deref())?;
            init_logging(&config.logging)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run(config))?;
        }
        Commands::Events { config } => {
            init_logging(&LoggingConfig::default())?;
            let host = Host::new(load(config.as_deref())?)?;
            for event in host.registry().list() {
                println!("{:>4}  {:<32} {}", event.id.0, event.key, event.label);
            }
        }
        Commands::CheckSchedule {
            second,
            minute,
            hour,
            day,
            month,
            dow,
        } => {
            let schedule = Schedule::new(minute, hour, day, month, dow)?.with_second(second)?;
            println!("schedule: {schedule}");
            for (field, spec) in [
                (Field::Second, &schedule.second),
                (Field::Minute, &schedule.minute),
                (Field::Hour, &schedule.hour),
                (Field::Day, &schedule.day),
                (Field::Month, &schedule.month),
                (Field::DayOfWeek, &schedule.dow),
            ] {
                println!("  {:<12} {}", field.name(), describe(field, spec));
            }
        }
    }

    Ok(())
}

fn load(path: Option<&Path>) -> anyhow::Result<WardenConfig> {
    Ok(match path {
        Some(path) => warden_config::load_config_from(path)?,
        None => warden_config::load_config()?,
    })
}

fn describe(field: Field, spec: &RateSpec) -> String {
    match spec {
        RateSpec::Any => format!("any ({}-{})", field.min(), field.max()),
        spec => {
            let values: Vec<String> = spec.values(field).iter().map(u32::to_string).collect();
            values.join(", ")
        }
    }
}

/// Schedule matching every `minutes` minutes.
///
/// Cron steps restart at each hour or day boundary, so only intervals that
/// divide an hour, or whole hours that divide a day, fire evenly. Others are
/// rejected.
fn stats_dump_schedule(minutes: u32) -> anyhow::Result<Schedule> {
    let minutes = minutes.max(1);
    let schedule = if minutes <= 60 {
        if 60 % minutes != 0 {
            anyhow::bail!("stats_dump_minutes = {minutes} does not divide an hour evenly");
        }
        Schedule::new(format!("*/{minutes}"), "*", "*", "*", "*")?
    } else {
        let hours = minutes / 60;
        if minutes % 60 != 0 || 24 % hours != 0 {
            anyhow::bail!("stats_dump_minutes = {minutes} is not a whole number of hours dividing a day");
        }
        Schedule::new(0, format!("*/{hours}"), "*", "*", "*")?
    };
    Ok(schedule)
}

async fn run(config: WardenConfig) -> anyhow::Result<()> {
    let host = Host::new(config)?;

    let dispatcher = host.dispatcher().clone();
    let schedule = stats_dump_schedule(host.config().events.stats_dump_minutes)?;
    host.schedule_recurring(
        None,
        "event-handling-stats",
        schedule,
        command(move || {
            dispatcher.dump_stats();
            Ok(())
        }),
    );

    host.start();
    info!(
        event_types = host.registry().len(),
        schedules = host.list_schedules().len(),
        "warden running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    host.shutdown().await;
    host.dump_event_handling_stats();
    Ok(())
}

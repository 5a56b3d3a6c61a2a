use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{Days, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

mod aggregate;
mod config;
mod db;
mod models;
mod report;
mod service;
mod store;
mod telemetry;
mod watch;

use crate::config::AppConfig;
use crate::db::PgAgitStore;
use crate::service::Settlement;
use crate::store::AgitStore;

#[derive(Parser)]
#[command(name = "class-agit")]
#[command(about = "Classroom clubhouse temperature and honor roll", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: AppConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo class with students and today's activity
    Seed,
    /// Import posts, comments and reactions from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Show or change a class's clubhouse settings
    Settings {
        #[command(subcommand)]
        action: SettingsCommand,
    },
    /// Recompute today's temperature and record new achievers
    Status {
        #[arg(long = "class")]
        class_id: Uuid,
    },
    /// Keep recomputing as activity arrives
    Watch {
        #[arg(long = "class")]
        class_id: Uuid,
    },
    /// Fold a finished day into the class temperature
    Settle {
        #[arg(long = "class")]
        class_id: Uuid,
        /// Day to settle; defaults to yesterday
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Archive the current season and start a new one
    Reset {
        #[arg(long = "class")]
        class_id: Uuid,
        #[arg(long)]
        yes: bool,
    },
    /// List archived seasons
    History {
        #[arg(long = "class")]
        class_id: Uuid,
    },
    /// Generate a markdown report
    Report {
        #[arg(long = "class")]
        class_id: Uuid,
        #[arg(long, default_value = "Clubhouse")]
        label: String,
        #[arg(long, default_value = "agit-report.md")]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum SettingsCommand {
    Show {
        #[arg(long = "class")]
        class_id: Uuid,
    },
    Set {
        #[arg(long = "class")]
        class_id: Uuid,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        target: Option<i32>,
        #[arg(long)]
        temperature: Option<i32>,
        #[arg(long)]
        posts: Option<u32>,
        #[arg(long)]
        comments: Option<u32>,
        #[arg(long)]
        reactions: Option<u32>,
        #[arg(long)]
        gift: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init_tracing(cli.config.log_json);
    let config = cli.config;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PgAgitStore::new(pool.clone());

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let class_id = db::seed(&pool).await?;
            println!("Seed data inserted for class {class_id}.");
        }
        Commands::Import { csv } => {
            let stats = db::import_csv(&pool, &csv).await?;
            println!(
                "Inserted {} activities from {} ({} duplicates, {} unknown students).",
                stats.inserted,
                csv.display(),
                stats.duplicates,
                stats.unknown_students
            );
        }
        Commands::Settings { action } => match action {
            SettingsCommand::Show { class_id } => {
                let settings = service::load_settings(&store, class_id).await;
                if !settings.is_configured() {
                    println!("No settings saved; showing defaults.");
                }
                println!("{}", serde_json::to_string_pretty(&settings.resolve())?);
            }
            SettingsCommand::Set {
                class_id,
                enabled,
                target,
                temperature,
                posts,
                comments,
                reactions,
                gift,
            } => {
                let mut settings = store
                    .load_settings(class_id)
                    .await
                    .context("failed to load clubhouse settings")?
                    .unwrap_or_default();
                if let Some(value) = enabled {
                    settings.is_enabled = value;
                }
                if let Some(value) = target {
                    settings.target_score = value;
                }
                if let Some(value) = temperature {
                    settings.current_temperature = value;
                }
                if let Some(value) = posts {
                    settings.activity_goals.post = value;
                }
                if let Some(value) = comments {
                    settings.activity_goals.comment = value;
                }
                if let Some(value) = reactions {
                    settings.activity_goals.reaction = value;
                }
                if let Some(value) = gift {
                    settings.surprise_gift = value;
                }
                service::update_settings(&store, class_id, &settings)
                    .await
                    .context("failed to save clubhouse settings")?;
                println!("Settings saved.");
            }
        },
        Commands::Status { class_id } => {
            let refresh = service::refresh(&store, class_id, config.local_now()).await;
            println!("{}", watch::status_line(&refresh.summary));
            for message in &refresh.summary.board_messages {
                println!("- {message}");
            }
        }
        Commands::Watch { class_id } => {
            watch::run(&pool, &store, class_id, config.utc_offset, config.tick()).await?;
        }
        Commands::Settle { class_id, date } => {
            let today = config.local_now().date_naive();
            let date = match date {
                Some(date) => date,
                None => today
                    .checked_sub_days(Days::new(1))
                    .context("no day before today")?,
            };
            match service::settle_day(&store, class_id, date, today).await? {
                Settlement::Settled {
                    mission_count,
                    temperature,
                    ..
                } => {
                    println!("Settled {date}: +{mission_count}, temperature is now {temperature}.")
                }
                Settlement::AlreadySettled(_) => println!("{date} was already settled."),
                Settlement::NotConfigured => {
                    println!("Class has no clubhouse settings; nothing to settle.")
                }
            }
        }
        Commands::Reset { class_id, yes } => {
            if !yes {
                bail!(
                    "reset archives the season and zeroes the temperature; pass --yes to confirm"
                );
            }
            let snapshot = service::reset_season(&store, class_id, Utc::now()).await?;
            println!(
                "Archived season at {} degrees as {}. New season started.",
                snapshot.settings.current_temperature, snapshot.id
            );
        }
        Commands::History { class_id } => {
            let history = store.season_history(class_id).await?;
            if history.is_empty() {
                println!("No archived seasons.");
                return Ok(());
            }
            for season in history {
                println!(
                    "- {} archived {}: {} / {} degrees, {} students ranked",
                    season.id,
                    season.archived_at.format("%Y-%m-%d %H:%M"),
                    season.settings.current_temperature,
                    season.settings.target_score,
                    season.ranking.len()
                );
            }
        }
        Commands::Report {
            class_id,
            label,
            out,
        } => {
            let refresh = service::refresh(&store, class_id, config.local_now()).await;
            let since = refresh.settings.resolve().last_reset_at;
            let ranking = store.season_ranking(class_id, since).await?;
            let history = store.season_history(class_id).await?;
            let report = report::build_report(
                &label,
                &refresh.settings,
                &refresh.summary,
                &ranking,
                &history,
            );
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

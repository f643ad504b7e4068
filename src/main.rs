use std::collections::HashMap;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dining_scraper::{db, run_pipeline, Settings};

#[derive(Parser)]
#[command(name = "dining_scraper", about = "Campus dining-location scraper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the feed and merge it into the database (one run)
    Run {
        /// Abort on the first page failure
        #[arg(long)]
        fail_fast: bool,
        /// Max pages to request
        #[arg(long)]
        max_pages: Option<u32>,
        /// Max page requests in flight
        #[arg(short = 'c', long)]
        concurrency: Option<usize>,
        /// Show a progress spinner while fetching
        #[arg(long)]
        progress: bool,
    },
    /// Create the database schema
    Init,
    /// Show location counts and recent runs
    Stats {
        /// Number of runs to list
        #[arg(short = 'n', long, default_value = "5")]
        runs: usize,
    },
    /// List persisted locations
    Locations {
        /// Only this identifier
        #[arg(long)]
        id: Option<String>,
        /// Include soft-deleted locations
        #[arg(short, long)]
        all: bool,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so the run report on stdout stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,dining_scraper=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut vars: HashMap<String, String> = std::env::vars().collect();

    match cli.command {
        Commands::Run {
            fail_fast,
            max_pages,
            concurrency,
            progress,
        } => {
            if fail_fast {
                vars.insert("SCRAPER_FAIL_FAST".into(), "true".into());
            }
            if let Some(n) = max_pages {
                vars.insert("SCRAPER_MAX_PAGES".into(), n.to_string());
            }
            if let Some(n) = concurrency {
                vars.insert("SCRAPER_CONCURRENCY".into(), n.to_string());
            }
            let settings = Settings::from_vars(vars)?;
            // Fail on a missing source before touching the database.
            settings.source()?;

            let report = run_pipeline(&settings, progress).await?;
            let s = report.summary;
            println!(
                "Run {} committed in {}: {} documents -> {} inserted, {} updated, {} deactivated, {} rejected.",
                report.run_id,
                run_duration(report.finished_at - report.started_at),
                report.documents,
                s.inserted,
                s.updated,
                s.deactivated,
                s.rejected
            );
            if !report.fetch_failures.is_empty() {
                println!("{} pages failed:", report.fetch_failures.len());
                for f in &report.fetch_failures {
                    println!("  page {}: {}", f.page, f.error);
                }
            }
            if report.deactivation_skipped {
                println!("Deactivation skipped because some pages failed.");
            }
            for r in report.rejections.iter().take(20) {
                println!("  rejected page {} #{}: {}", r.page, r.position, r.error);
            }
            if report.rejections.len() > 20 {
                println!("  ... {} more rejections", report.rejections.len() - 20);
            }
            Ok(())
        }
        Commands::Init => {
            let settings = Settings::from_vars(vars)?;
            let conn = db::connect(&settings.db_url)?;
            db::init_schema(&conn)?;
            info!("Schema ready at {}", settings.db_url);
            println!("Schema ready.");
            Ok(())
        }
        Commands::Stats { runs } => {
            let settings = Settings::from_vars(vars)?;
            let conn = db::connect(&settings.db_url)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn, runs)?;
            println!("Locations: {}", s.total);
            println!("Active:    {}", s.active);
            println!("Inactive:  {}", s.inactive);
            println!("Runs:      {}", s.runs);
            if !s.recent_runs.is_empty() {
                println!("\n--- Recent runs ---");
                for r in &s.recent_runs {
                    println!(
                        "  {} {:<9} +{} ~{} -{} !{} fetch_errors={}{}",
                        r.started_at,
                        r.status,
                        r.inserted,
                        r.updated,
                        r.deactivated,
                        r.rejected,
                        r.fetch_errors,
                        r.error
                            .as_deref()
                            .map(|e| format!(" ({})", clip(e, 60)))
                            .unwrap_or_default()
                    );
                }
            }
            Ok(())
        }
        Commands::Locations { id, all, limit } => {
            let settings = Settings::from_vars(vars)?;
            let conn = db::connect(&settings.db_url)?;
            db::init_schema(&conn)?;
            let rows = db::fetch_locations(&conn, id.as_deref(), all, Some(limit))
                .context("failed to read locations")?;
            if rows.is_empty() {
                println!("No locations found.");
                return Ok(());
            }

            println!(
                "{:>3} | {:<20} | {:<28} | {:>11} | {:>12} | {:<6} | {:<20}",
                "#", "Id", "Name", "Latitude", "Longitude", "Active", "Last seen"
            );
            println!("{}", "-".repeat(116));
            for (i, r) in rows.iter().enumerate() {
                println!(
                    "{:>3} | {:<20} | {:<28} | {:>11} | {:>12} | {:<6} | {:<20}",
                    i + 1,
                    clip(&r.id, 20),
                    clip(&r.name, 28),
                    r.latitude,
                    r.longitude,
                    if r.active { "yes" } else { "no" },
                    r.last_seen.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!("\n{} locations", rows.len());
            Ok(())
        }
    }
}

/// Fit `s` into `width` columns, marking the cut with an ellipsis.
fn clip(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn run_duration(d: chrono::Duration) -> String {
    let ms = d.num_milliseconds().max(0);
    match ms {
        0..=999 => format!("{}ms", ms),
        1_000..=59_999 => format!("{:.1}s", ms as f64 / 1000.0),
        _ => format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1000),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_keeps_column_width() {
        assert_eq!(clip("North", 20), "North");
        assert_eq!(clip("Maseeh Hall Dining", 10), "Maseeh Ha…");
        assert_eq!(clip("Maseeh Hall Dining", 10).chars().count(), 10);
    }

    #[test]
    fn run_duration_units() {
        assert_eq!(run_duration(chrono::Duration::milliseconds(420)), "420ms");
        assert_eq!(run_duration(chrono::Duration::milliseconds(2_500)), "2.5s");
        assert_eq!(run_duration(chrono::Duration::seconds(125)), "2m 5s");
        assert_eq!(run_duration(chrono::Duration::milliseconds(-5)), "0ms");
    }
}

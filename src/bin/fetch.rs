//! Command-line fetch run.
//!
//! Prints store statistics, fetches the requested sources and regions,
//! optionally recomputes trends, and prints statistics again.
//!
//! **Usage:**
//! ```bash
//! bloomingsongs-fetch [--source all|ebird|inaturalist|inatsounds] [--region US-CA]... [--days 7]
//! bloomingsongs-fetch --stats-only
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::info;

use bloomingsongs::{aggregate, config, logging, pipeline, query, schema, store};
use bloomingsongs::{FetchRequest, SourceFilter, SourceStats};

/// Fetch bird vocalization observations into the local store.
#[derive(Parser, Debug)]
#[command(name = "bloomingsongs-fetch", version)]
struct Args {
    /// Source to fetch: all, ebird, inaturalist or inatsounds
    #[arg(long, default_value = "all")]
    source: SourceFilter,

    /// Region code to fetch (repeatable; defaults to FETCH_REGIONS)
    #[arg(long = "region", value_name = "CODE")]
    regions: Vec<String>,

    /// Lookback window in days (defaults to FETCH_DAYS_BACK)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=i64::from(config::MAX_DAYS)))]
    days: Option<u32>,

    /// Only print database statistics
    #[arg(long)]
    stats_only: bool,

    /// Recompute and store trends for each region after fetching
    #[arg(long)]
    trends: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    logging::init_tracing("info");

    let args = Args::parse();
    let cfg = config::load_from_env()?;

    let pool = store::connect(&cfg.db_url, cfg.db_pool_max)
        .await
        .with_context(|| format!("Failed to connect to database '{}'", cfg.db_url))?;
    schema::create_schema(&pool).await?;

    print_stats("Database statistics", &query::source_stats(&pool).await?);
    if args.stats_only {
        return Ok(());
    }

    let request = FetchRequest {
        regions: args.regions,
        days: args.days,
        sources: match args.source {
            SourceFilter::All => Vec::new(),
            SourceFilter::Only(source) => vec![source],
        },
    };

    let report = pipeline::run_fetch(&pool, &cfg, &request).await?;
    println!();
    println!(
        "Fetch run: {} inserted, {} already stored, {} malformed, {} failed",
        report.inserted, report.skipped, report.malformed, report.failed
    );
    for outcome in &report.outcomes {
        println!(
            "  {:<10} {:<8} {:<6} +{} ({} skipped, {} malformed){}",
            outcome.source.as_str(),
            outcome.region_code,
            if outcome.error.is_some() { "FAILED" } else { "ok" },
            outcome.inserted,
            outcome.skipped,
            outcome.malformed,
            outcome.error.as_deref().map(|e| format!(": {e}")).unwrap_or_default()
        );
    }

    if args.trends {
        println!();
        for region in &report.regions {
            let trends = aggregate::refresh_trends(
                &pool,
                Some(region.as_str()),
                report.days,
                cfg.trend_threshold_percent,
            )
            .await?;
            let counts = aggregate::direction_counts(&trends);
            println!(
                "Trends {region}: {} species ({} rising, {} falling, {} stable, {} new)",
                trends.len(),
                counts.get("rising").unwrap_or(&0),
                counts.get("falling").unwrap_or(&0),
                counts.get("stable").unwrap_or(&0),
                counts.get("new").unwrap_or(&0),
            );
        }
    }

    print_stats("Database statistics after fetch", &query::source_stats(&pool).await?);
    info!("Done");

    if report.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_stats(title: &str, stats: &SourceStats) {
    // ---
    println!();
    println!("{title}");
    println!("  total observations : {}", stats.total_observations);
    println!("  eBird              : {}", stats.ebird_observations);
    println!("  iNatSounds         : {}", stats.inaturalist_observations);
    println!("  unique species     : {}", stats.unique_species);
    println!("  regions            : {}", stats.regions.join(", "));
    match stats.last_updated {
        Some(ts) => println!("  last updated       : {}", ts.to_rfc3339()),
        None => println!("  last updated       : never"),
    }
}

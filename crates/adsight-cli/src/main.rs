use adsight_core::{DateRange, EntityLevel};
use adsight_storage::SearchFilter;
use adsight_sync::{EtlReconciler, ReconcileRequest};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "adsight")]
#[command(about = "Ads performance sync and semantic index")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the re-embed scheduler when enabled).
    Serve,
    /// Reconcile a date range of performance facts against the provider.
    Backfill {
        #[arg(long)]
        account: Option<String>,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        /// Entity levels, repeatable (campaign, ad_group, ad, keyword, search_term).
        #[arg(long = "level")]
        levels: Vec<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        include_zero_impressions: bool,
    },
    /// Embed entity snapshots that changed since the last run.
    Embed {
        #[arg(long)]
        account: Option<String>,
        #[arg(long = "level")]
        levels: Vec<String>,
        #[arg(long)]
        include_search_terms: bool,
        /// Lookback window for search terms, in days.
        #[arg(long)]
        days: Option<u32>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        force: bool,
    },
    /// Re-embed stored records older than the given age.
    Reembed {
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
        #[arg(long, default_value_t = 200)]
        limit: usize,
        #[arg(long)]
        entity_type: Option<String>,
        #[arg(long)]
        scope: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Nearest-neighbor search over the embedding index.
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        k: usize,
        #[arg(long)]
        entity_type: Option<String>,
        #[arg(long)]
        scope: Option<String>,
    },
    /// Retrieve matches and compose an answer.
    Answer {
        query: String,
        #[arg(long, default_value_t = 5)]
        k: usize,
        #[arg(long)]
        entity_type: Option<String>,
        #[arg(long)]
        scope: Option<String>,
        /// Composer model override for this call.
        #[arg(long)]
        model: Option<String>,
    },
}

fn parse_levels(raw: &[String]) -> Result<Vec<EntityLevel>> {
    if raw.is_empty() {
        return Ok(vec![
            EntityLevel::Campaign,
            EntityLevel::AdGroup,
            EntityLevel::Ad,
            EntityLevel::Keyword,
        ]);
    }
    raw.iter()
        .map(|s| s.parse::<EntityLevel>().map_err(anyhow::Error::from))
        .collect()
}

fn parse_entity_type(raw: Option<&str>) -> Result<Option<EntityLevel>> {
    raw.map(|s| s.parse::<EntityLevel>().map_err(anyhow::Error::from))
        .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => adsight_web::serve_from_env().await?,
        Commands::Backfill {
            account,
            start,
            end,
            levels,
            force,
            include_zero_impressions,
        } => {
            let state = adsight_web::build_state_from_env(EtlReconciler::never_shutdown()).await?;
            let account_id = account.unwrap_or_else(|| state.config.default_account.clone());
            let range = DateRange::new(start, end).context("invalid date range")?;
            for level in parse_levels(&levels)? {
                let summary = state
                    .reconciler
                    .reconcile(&ReconcileRequest {
                        account_id: account_id.clone(),
                        level,
                        range,
                        force,
                        include_zero_impressions,
                    })
                    .await?;
                println!(
                    "{level}: upserted={} fetched={} skipped={} errors={}",
                    summary.rows_upserted,
                    summary.days_fetched,
                    summary.days_skipped,
                    summary.errors.len()
                );
                for failure in &summary.errors {
                    eprintln!("  {}: {}", failure.day, failure.message);
                }
            }
        }
        Commands::Embed {
            account,
            levels,
            include_search_terms,
            days,
            limit,
            force,
        } => {
            let state = adsight_web::build_state_from_env(EtlReconciler::never_shutdown()).await?;
            let scope = account.unwrap_or_else(|| state.config.default_account.clone());
            let report = state
                .pipeline
                .backfill(
                    &scope,
                    &parse_levels(&levels)?,
                    include_search_terms,
                    days,
                    limit,
                    None,
                    force,
                )
                .await?;
            println!(
                "embedded={} skipped={} failed={}",
                report.embedded.len(),
                report.skipped.len(),
                report.failed.len()
            );
        }
        Commands::Reembed {
            max_age_hours,
            limit,
            entity_type,
            scope,
            force,
        } => {
            let state = adsight_web::build_state_from_env(EtlReconciler::never_shutdown()).await?;
            let filter = SearchFilter {
                entity_type: parse_entity_type(entity_type.as_deref())?,
                scope_id: scope,
            };
            let report = state
                .pipeline
                .refresh_stale(
                    Duration::from_secs(max_age_hours * 3600),
                    limit,
                    &filter,
                    force,
                )
                .await?;
            println!(
                "embedded={} skipped={} failed={}",
                report.embedded.len(),
                report.skipped.len(),
                report.failed.len()
            );
        }
        Commands::Search {
            query,
            k,
            entity_type,
            scope,
        } => {
            let state = adsight_web::build_state_from_env(EtlReconciler::never_shutdown()).await?;
            let filter = SearchFilter {
                entity_type: parse_entity_type(entity_type.as_deref())?,
                scope_id: scope,
            };
            let hits = state.retrieval.search(&query, k, &filter).await?;
            for hit in hits {
                println!(
                    "{:.4}  {} {}  {}",
                    hit.score,
                    hit.entity_type,
                    hit.entity_id,
                    hit.title.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Answer {
            query,
            k,
            entity_type,
            scope,
            model,
        } => {
            let state = adsight_web::build_state_from_env(EtlReconciler::never_shutdown()).await?;
            let filter = SearchFilter {
                entity_type: parse_entity_type(entity_type.as_deref())?,
                scope_id: scope,
            };
            let answer = state
                .retrieval
                .answer(&query, k, &filter, model.as_deref())
                .await?;
            if answer.retrieval_empty {
                eprintln!("(no matches retrieved; answer composed without context)");
            }
            println!("{}", answer.answer);
        }
    }

    Ok(())
}

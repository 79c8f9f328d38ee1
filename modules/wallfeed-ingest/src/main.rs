use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use deepl_client::DeeplClient;
use nlp_client::NlpClient;
use wallfeed_common::config::DEFAULT_PAGE_LIMIT;
use wallfeed_common::{validate_domain, Config, Selection};
use wallfeed_ingest::enrichment::{EntityRecognizer, SentimentModel, Translator};
use wallfeed_ingest::{
    EnrichmentPipeline, HttpFetcher, Ingestor, ModelHandle, Orchestrator, PassOptions,
    SourceOrder, VkWallParser,
};
use wallfeed_store::{PgStore, RecordStore};

#[derive(Parser)]
#[command(name = "wallfeed", about = "Crawl community walls into Postgres and enrich the posts")]
struct Cli {
    /// Emit logs as JSON (also enabled by LOG_FORMAT=json)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply database migrations
    Migrate,

    /// Crawl the newest posts of each domain once
    Fetch {
        #[arg(required = true, value_parser = parse_domain)]
        domains: Vec<String>,
        /// Reprocess every page, overwriting stored posts
        #[arg(short, long)]
        force: bool,
        /// Maximum pages per domain
        #[arg(short, long, default_value_t = DEFAULT_PAGE_LIMIT,
              value_parser = clap::value_parser!(u32).range(1..=5000))]
        limit: u32,
        /// Skip this many newest posts
        #[arg(short, long, default_value_t = 0,
              value_parser = clap::value_parser!(u64).range(0..=100))]
        offset: u64,
    },

    /// Continue a domain from the number of posts already stored
    Backfill {
        #[arg(value_parser = parse_domain)]
        domain: String,
        #[arg(short, long)]
        force: bool,
        #[arg(short, long, default_value_t = DEFAULT_PAGE_LIMIT,
              value_parser = clap::value_parser!(u32).range(1..=5000))]
        limit: u32,
        /// Stop once posts this old are reached (YYYY-MM-DD or RFC 3339)
        #[arg(short, long, value_parser = parse_until)]
        until: Option<DateTime<Utc>>,
    },

    /// Crawl the domains in shuffled order, forever, until Ctrl-C
    Listen {
        #[arg(required = true, value_parser = parse_domain)]
        domains: Vec<String>,
        #[arg(short, long, default_value_t = DEFAULT_PAGE_LIMIT,
              value_parser = clap::value_parser!(u32).range(1..=10))]
        limit: u32,
    },

    /// Reprocess logged pages without touching the network
    Rescrape {
        /// Maximum logged pages to replay
        #[arg(short, long)]
        limit: Option<usize>,
        /// Clear posts, metrics and sentiment first
        #[arg(short, long)]
        reset: bool,
    },

    /// Score sentiment for posts that have none
    Sentiment {
        /// Drop all existing scores first
        #[arg(short, long)]
        reset: bool,
    },

    /// Extract named entities from unprocessed posts
    Entities {
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Translate posts (or entity names) to English
    Translate {
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long)]
        entities: bool,
    },

    /// Post counts and date ranges per domain
    Stats,
}

fn parse_domain(raw: &str) -> std::result::Result<String, String> {
    validate_domain(raw)
        .map(str::to_string)
        .map_err(|_| format!("{raw:?} is not a valid domain"))
}

fn parse_until(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.and_time(chrono::NaiveTime::MIN).and_utc())
        .map_err(|_| format!("{raw:?} is not a date (YYYY-MM-DD or RFC 3339)"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("wallfeed=info,deepl_client=info,nlp_client=info"));
    let json = json
        || std::env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// A token cancelled by Ctrl-C. Crawls stop before their next page.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, stopping before the next page");
            ctrl_c.cancel();
        }
    });
    cancel
}

fn build_enrichment(config: &Config, store: Arc<dyn RecordStore>) -> EnrichmentPipeline {
    let nlp = config
        .nlp_service_url
        .as_ref()
        .map(|url| Arc::new(NlpClient::new(url.clone())));
    let deepl = config
        .deepl_auth_key
        .as_ref()
        .map(|key| Arc::new(DeeplClient::new(key.clone())));

    EnrichmentPipeline::builder()
        .store(store)
        .sentiment(ModelHandle::from_option(
            nlp.clone().map(|c| c as Arc<dyn SentimentModel>),
        ))
        .entities(ModelHandle::from_option(
            nlp.map(|c| c as Arc<dyn EntityRecognizer>),
        ))
        .translator(ModelHandle::from_option(
            deepl.map(|c| c as Arc<dyn Translator>),
        ))
        .cooldown(config.error_delay)
        .build()
}

fn build_ingestor(
    config: &Config,
    store: Arc<dyn RecordStore>,
    enrichment: Arc<EnrichmentPipeline>,
) -> Result<Ingestor> {
    let fetcher = HttpFetcher::new().context("Failed to build HTTP client")?;
    Ok(Ingestor::builder()
        .store(store)
        .fetcher(Arc::new(fetcher))
        .parser(Arc::new(VkWallParser::new(config.base_url.clone())))
        .enrichment(enrichment)
        .base_url(config.base_url.clone())
        .page_delay(config.scrape_delay)
        .error_delay(config.error_delay)
        .build())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = Config::from_env()?;
    config.log_redacted();

    let pg = PgStore::connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    pg.migrate().await.context("Failed to run migrations")?;

    if matches!(cli.command, Command::Migrate) {
        tracing::info!("Migrations applied");
        return Ok(());
    }

    let store: Arc<dyn RecordStore> = Arc::new(pg);
    let enrichment = Arc::new(build_enrichment(&config, store.clone()));
    let ingestor = Arc::new(build_ingestor(&config, store.clone(), enrichment.clone())?);

    match cli.command {
        Command::Migrate => {}

        Command::Fetch {
            domains,
            force,
            limit,
            offset,
        } => {
            let orchestrator = Orchestrator::builder()
                .ingestor(ingestor)
                .order(SourceOrder::Fixed)
                .build();
            let options = PassOptions::builder()
                .max_pages(limit)
                .force(force)
                .offset(offset)
                .build();
            orchestrator
                .run_once(&domains, &options, &cancel_on_ctrl_c())
                .await?;
        }

        Command::Backfill {
            domain,
            force,
            limit,
            until,
        } => {
            let cancel = cancel_on_ctrl_c();
            let summary = ingestor
                .backfill(&domain, limit, force, until, &cancel)
                .await?;
            tracing::info!(
                domain = %summary.domain,
                pages = summary.pages_fetched,
                posts_added = summary.posts_added,
                stop = %summary.stop,
                "Backfill complete"
            );
        }

        Command::Listen { domains, limit } => {
            let cancel = cancel_on_ctrl_c();
            let orchestrator = Orchestrator::builder()
                .ingestor(ingestor)
                .order(SourceOrder::Shuffled)
                .loop_delay(config.loop_delay)
                .build();
            let options = PassOptions::builder().max_pages(limit).build();
            orchestrator.run_forever(&domains, &options, &cancel).await?;
        }

        Command::Rescrape { limit, reset } => {
            ingestor.replay(limit, reset).await?;
        }

        Command::Sentiment { reset } => {
            enrichment
                .score_sentiment(&Selection::backlog(None), reset)
                .await?;
        }

        Command::Entities { limit } => {
            enrichment
                .extract_entities(&Selection::backlog(limit))
                .await?;
        }

        Command::Translate { limit, entities } => {
            if entities {
                enrichment.translate_entities(limit).await?;
            } else {
                enrichment
                    .translate_posts(&Selection::backlog(limit))
                    .await?;
            }
        }

        Command::Stats => {
            for stats in store.domain_stats().await? {
                tracing::info!(
                    domain = %stats.domain,
                    posts = stats.nr_posts,
                    first = ?stats.first,
                    last = ?stats.last,
                    "Domain stats"
                );
            }
        }
    }

    Ok(())
}

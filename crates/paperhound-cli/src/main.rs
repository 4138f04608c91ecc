//! paperhound: search literature catalogs and summarize open-access papers.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Datelike;
use clap::{Args, Parser, Subcommand, ValueEnum};
use paperhound_common::config::ResultOrder;
use paperhound_common::{PipelineConfig, SandboxClient};
use paperhound_ingestion::pipeline::{build_sources, PipelineProgress, ABSTRACT_SUMMARY_KEY};
use paperhound_ingestion::{
    process_selection, render_report, search, summarize_abstracts, PaperRecord, PipelineDeps, SearchMode,
    SearchQuery, SectionKind, SourceKind, Summarizer, YearRange,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Find papers across arXiv, bioRxiv, medRxiv and PubMed, fetch the
/// open-access ones and summarize them.
#[derive(Parser)]
#[command(name = "paperhound")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML, or YAML by extension)
    #[arg(short, long, global = true, env = "PAPERHOUND_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search and print the aggregated result list
    Search {
        #[command(flatten)]
        query: QueryArgs,

        /// Add a short model summary of each abstract
        #[arg(long)]
        abstract_summaries: bool,
    },

    /// Search, then download and summarize the selected results
    Run {
        #[command(flatten)]
        query: QueryArgs,

        /// 1-based result numbers, e.g. "1,3,5-7"
        #[arg(long)]
        select: String,

        /// Summarize one section only: introduction, methods, results, discussion, ...
        #[arg(long)]
        section: Option<String>,
    },
}

#[derive(Args)]
struct QueryArgs {
    /// Comma-separated keywords; every keyword must match
    #[arg(long, default_value = "")]
    topic: String,

    #[arg(long)]
    author: Option<String>,

    #[arg(long, value_enum, default_value_t = ModeArg::Topic)]
    mode: ModeArg,

    /// Comma-separated subset of arxiv,biorxiv,medrxiv,pubmed
    #[arg(long)]
    sources: Option<String>,

    /// Results shown after deduplication (defaults to sources.display_size)
    #[arg(long)]
    limit: Option<usize>,

    /// Best topic match first instead of source order
    #[arg(long)]
    rank: bool,

    /// Earliest publication year
    #[arg(long)]
    from: Option<i32>,

    /// Latest publication year
    #[arg(long)]
    to: Option<i32>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Topic,
    Author,
    Both,
}

impl From<ModeArg> for SearchMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Topic => SearchMode::Topic,
            ModeArg::Author => SearchMode::Author,
            ModeArg::Both => SearchMode::Both,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("paperhound=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_path(path)?,
        None => PipelineConfig::load()?,
    };
    config.validate()?;

    let client = SandboxClient::with_timeout(Duration::from_secs(config.download.timeout_secs))?;

    match cli.command {
        Commands::Search { query, abstract_summaries } => {
            let mut records = run_search(&config, &client, &query).await?;
            if abstract_summaries {
                let model = paperhound_llm::build_summarizer(&config.llm, config.summarizer.max_input_tokens)?;
                let summarizer = Summarizer::new(model, config.summarizer.clone());
                let concurrency = config.summarizer.chunk_concurrency;
                summarize_abstracts(&mut records, &summarizer, concurrency, &CancellationToken::new()).await;
            }
            if query.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_records(&records);
            }
        }
        Commands::Run { query, select, section } => {
            let focus = section.as_deref().map(parse_section).transpose()?;
            let records = run_search(&config, &client, &query).await?;
            let picks = parse_selection(&select, records.len())?;
            let selected: Vec<PaperRecord> = picks.iter().map(|i| records[i - 1].clone()).collect();
            info!(selected = selected.len(), "Processing selection");

            let model = paperhound_llm::build_summarizer(&config.llm, config.summarizer.max_input_tokens)?;
            let mut deps = PipelineDeps::from_config(&config, client, model)?;
            deps.focus = focus;

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling run");
                    on_ctrl_c.cancel();
                }
            });

            let (tx, rx) = broadcast::channel(64);
            tokio::spawn(log_progress(rx));

            let report = process_selection(selected, &deps, &cancel, Some(tx)).await;
            if query.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", render_report(&report));
            }
        }
    }
    Ok(())
}

async fn run_search(
    config: &PipelineConfig,
    client: &SandboxClient,
    args: &QueryArgs,
) -> anyhow::Result<Vec<PaperRecord>> {
    let only = args.sources.as_deref().map(parse_sources).transpose()?;
    let sources = build_sources(&config.sources, client, only.as_deref());
    if sources.is_empty() {
        bail!("no sources enabled");
    }

    let query = SearchQuery {
        topic: args.topic.clone(),
        author: args.author.clone(),
        mode: args.mode.into(),
        max_results: config.sources.fetch_size,
        years: year_range(args.from, args.to, chrono::Utc::now().year()),
        offset: 0,
    };
    if query.mode.uses_topic() && query.keywords().is_empty() {
        bail!("--topic is required for mode topic/both");
    }
    if query.mode.uses_author() && query.author.as_deref().map_or(true, |a| a.trim().is_empty()) {
        bail!("--author is required for mode author/both");
    }

    info!(enabled = ?config.enabled_sources(), queried = sources.len(), "Searching");
    let limit = args.limit.unwrap_or(config.sources.display_size);
    let order = if args.rank { ResultOrder::Relevance } else { config.sources.order };
    let outcome = search(&sources, &query, Some(limit), order).await;
    for (kind, e) in &outcome.source_errors {
        eprintln!("warning: {kind} unavailable: {e}");
    }
    Ok(outcome.aggregated.records)
}

async fn log_progress(mut rx: broadcast::Receiver<PipelineProgress>) {
    loop {
        match rx.recv().await {
            Ok(p) => match &p.error {
                Some(e) => warn!(paper = %p.paper, stage = %p.stage, error = %e, "{}", p.message),
                None => info!(paper = %p.paper, stage = %p.stage, "{}", p.message),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "Progress events dropped"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_records(records: &[PaperRecord]) {
    if records.is_empty() {
        println!("No papers found.");
        return;
    }
    for (i, r) in records.iter().enumerate() {
        let year = r.published.map(|d| format!(" ({})", d.year())).unwrap_or_default();
        println!("{:>3}. [{}] {}{}", i + 1, r.source, r.title, year);
        if !r.authors.is_empty() {
            let mut authors = r.authors.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
            if r.authors.len() > 3 {
                authors.push_str(", et al.");
            }
            println!("     {authors}");
        }
        if let Some(url) = &r.url {
            println!("     {url}");
        }
        if let Some(summary) = r.raw_str(ABSTRACT_SUMMARY_KEY) {
            println!("     Summary: {summary}");
        }
    }
}

fn parse_sources(list: &str) -> anyhow::Result<Vec<SourceKind>> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| SourceKind::parse(s).with_context(|| format!("unknown source '{}'", s.trim())))
        .collect()
}

fn parse_section(name: &str) -> anyhow::Result<SectionKind> {
    SectionKind::parse(name).with_context(|| {
        format!("unknown section '{}'; try introduction, methods, results or discussion", name.trim())
    })
}

/// Year bounds from the command line. A lone `--from` runs to this year; a
/// lone `--to` has no lower bound.
fn year_range(from: Option<i32>, to: Option<i32>, this_year: i32) -> Option<YearRange> {
    match (from, to) {
        (None, None) => None,
        (Some(f), None) => Some(YearRange { from: f, to: this_year.max(f) }),
        (None, Some(t)) => Some(YearRange { from: 0, to: t }),
        (Some(f), Some(t)) => Some(YearRange { from: f.min(t), to: f.max(t) }),
    }
}

/// 1-based, comma-separated numbers and ranges. Duplicates are dropped,
/// order is kept.
fn parse_selection(selection: &str, available: usize) -> anyhow::Result<Vec<usize>> {
    let mut picks = Vec::new();
    for part in selection.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (lo, hi) = match part.split_once('-') {
            Some((a, b)) => (a.trim().parse::<usize>()?, b.trim().parse::<usize>()?),
            None => {
                let n = part.parse::<usize>()?;
                (n, n)
            }
        };
        if lo == 0 || hi < lo || hi > available {
            bail!("selection '{part}' is outside 1..={available}");
        }
        for n in lo..=hi {
            if !picks.contains(&n) {
                picks.push(n);
            }
        }
    }
    if picks.is_empty() {
        bail!("empty selection");
    }
    Ok(picks)
}

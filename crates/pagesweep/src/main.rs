use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Args, Parser, Subcommand, ValueEnum};
use pagesweep_core::cache::LocalCache;
use pagesweep_core::config::{DEFAULT_CONFIG_FILE, SweepConfig, load_config};
use pagesweep_core::confluence::{ConfluenceClient, ConfluenceClientConfig};
use pagesweep_core::layout::WidenReport;
use pagesweep_core::listing::{list_all_pages, list_unique_pages_cached, listing_cache_key};
use pagesweep_core::pattern::{PatternCatalog, load_catalog};
use pagesweep_core::pipeline::{
    PatternJob, PatternMode, PipelineOptions, PipelineReport, run_pipeline,
};
use pagesweep_core::query::FindReport;
use pagesweep_core::report::{PageFailure, PageLink, SpaceScope};
use pagesweep_core::review::{LabeledDateLocator, RefreshReport};
use pagesweep_core::store::ContentStore;
use pagesweep_core::transform::UpdateReport;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "pagesweep",
    version,
    about = "Batch maintenance for the pages of Confluence spaces"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(
        long = "space",
        global = true,
        value_name = "KEY",
        help = "Target space key (repeatable; replaces config target_spaces)"
    )]
    spaces: Vec<String>,
    #[arg(long, global = true, conflicts_with = "live", help = "Report changes without writing")]
    dry_run: bool,
    #[arg(long, global = true, help = "Write changes to the wiki")]
    live: bool,
    #[arg(long, global = true, value_name = "N", help = "Maximum body updates per run (0 = unlimited)")]
    limit: Option<usize>,
    #[arg(long, global = true, help = "Ignore cached page listings")]
    no_cache: bool,
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "List the pages of each target space")]
    List(ListArgs),
    #[command(about = "Report pages matching (or, with --negate, missing) a pattern")]
    Find(FindArgs),
    #[command(about = "Apply a pattern catalog to every page body")]
    Rewrite(RewriteArgs),
    #[command(about = "Force the page layout properties to full-width")]
    Widen,
    #[command(about = "Advance stale approval dates")]
    RefreshDates(RefreshArgs),
    #[command(about = "Widen, apply patterns and refresh dates in one pass")]
    Run(RunArgs),
    Cache(CacheArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, help = "Skip the cache and keep duplicate listing entries")]
    raw: bool,
}

#[derive(Debug, Args)]
struct FindArgs {
    #[arg(long, value_name = "FILE", help = "Pattern catalog (defaults to config pattern_file)")]
    patterns: Option<PathBuf>,
    #[arg(long, help = "Report pages matching none of the patterns")]
    negate: bool,
}

#[derive(Debug, Args)]
struct RewriteArgs {
    #[arg(long, value_name = "FILE", help = "Pattern catalog (defaults to config pattern_file)")]
    patterns: Option<PathBuf>,
    #[arg(long, help = "Attach a word diff to each dry-run change")]
    diff: bool,
}

#[derive(Debug, Args)]
struct RefreshArgs {
    #[arg(long, value_name = "TEXT", help = "Label preceding the approval date")]
    label: Option<String>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, value_name = "FILE", help = "Pattern catalog (defaults to config pattern_file)")]
    patterns: Option<PathBuf>,
    #[arg(long, help = "Only report pattern matches instead of rewriting")]
    find: bool,
    #[arg(long, help = "Report pages matching none of the patterns (implies --find)")]
    negate: bool,
    #[arg(long, help = "Attach a word diff to each dry-run change")]
    diff: bool,
    #[arg(long, value_name = "TEXT", help = "Label preceding the approval date")]
    label: Option<String>,
}

#[derive(Debug, Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheSubcommand,
}

#[derive(Debug, Subcommand)]
enum CacheSubcommand {
    #[command(about = "Drop cached listings (only those of --space keys when given)")]
    Clear,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let format = cli.format;
    let explicit_spaces = !cli.spaces.is_empty();

    match cli.command {
        Commands::List(args) => run_list(&config, args, format),
        Commands::Find(args) => {
            let job = PatternJob {
                catalog: resolve_catalog(args.patterns, &config)?,
                mode: PatternMode::Find {
                    negate: args.negate,
                },
            };
            let options = PipelineOptions {
                patterns: Some(job),
                ..pipeline_options(&config)?
            };
            execute(&config, options, None, format)
        }
        Commands::Rewrite(args) => {
            let job = PatternJob {
                catalog: resolve_catalog(args.patterns, &config)?,
                mode: PatternMode::Rewrite {
                    include_diff: args.diff,
                },
            };
            let options = PipelineOptions {
                patterns: Some(job),
                ..pipeline_options(&config)?
            };
            execute(&config, options, None, format)
        }
        Commands::Widen => {
            let options = PipelineOptions {
                widen: true,
                ..pipeline_options(&config)?
            };
            execute(&config, options, None, format)
        }
        Commands::RefreshDates(args) => {
            let options = PipelineOptions {
                refresh_today: Some(Local::now().date_naive()),
                ..pipeline_options(&config)?
            };
            execute(&config, options, args.label.as_deref(), format)
        }
        Commands::Run(args) => run_full(&config, args, format),
        Commands::Cache(CacheArgs {
            command: CacheSubcommand::Clear,
        }) => run_cache_clear(&config, explicit_spaces),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// File settings, then CLI flags on top. Env overrides are applied by the
/// config accessors, so `.env` must be loaded first.
fn resolve_config(cli: &Cli) -> Result<SweepConfig> {
    dotenvy::dotenv().ok();

    let mut config = load_config(&cli.config)?;
    if !cli.spaces.is_empty() {
        config.target_spaces = cli.spaces.clone();
    }
    if cli.dry_run {
        config.dry_run = true;
    }
    if cli.live {
        config.dry_run = false;
    }
    if let Some(limit) = cli.limit {
        config.update_limit = limit;
    }
    if cli.no_cache {
        config.use_cache = false;
    }
    Ok(config)
}

fn pipeline_options(config: &SweepConfig) -> Result<PipelineOptions> {
    config.validate()?;
    let base_url = config
        .base_url()
        .context("confluence_base_url is not set")?;
    Ok(PipelineOptions {
        base_url,
        dry_run: config.dry_run,
        update_limit: config.update_limit,
        use_cache: config.use_cache,
        page_size: config.page_size,
        progress_every: config.progress_every,
        widen: false,
        patterns: None,
        refresh_today: None,
    })
}

fn resolve_catalog(path: Option<PathBuf>, config: &SweepConfig) -> Result<PatternCatalog> {
    let path = path
        .or_else(|| config.pattern_file.clone())
        .context("no pattern catalog given (use --patterns or config `pattern_file`)")?;
    let catalog = load_catalog(&path)?;
    if catalog.is_empty() {
        bail!("pattern catalog {} is empty", path.display());
    }
    if !catalog.has_replacements() {
        warn!(
            catalog = %path.display(),
            "catalog has no replacements; rewrite will only re-save matching pages"
        );
    }
    Ok(catalog)
}

fn open_store(config: &SweepConfig) -> Result<ConfluenceClient> {
    ConfluenceClient::new(ConfluenceClientConfig::from_config(config)?)
}

fn execute(
    config: &SweepConfig,
    options: PipelineOptions,
    label: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let locator = LabeledDateLocator::new(label.unwrap_or(config.approval_label()))?;
    let mut store = open_store(config)?;
    let cache = LocalCache::new(config.cache_dir());
    info!(
        spaces = ?config.target_spaces,
        dry_run = options.dry_run,
        limit = options.update_limit,
        "starting run"
    );
    let report = run_pipeline(&mut store, &cache, &config.target_spaces, &options, &locator)?;
    print_pipeline_report(&report, format)
}

fn run_full(config: &SweepConfig, args: RunArgs, format: OutputFormat) -> Result<()> {
    let patterns = if args.patterns.is_some() || config.pattern_file.is_some() {
        let mode = if args.find || args.negate {
            PatternMode::Find {
                negate: args.negate,
            }
        } else {
            PatternMode::Rewrite {
                include_diff: args.diff,
            }
        };
        Some(PatternJob {
            catalog: resolve_catalog(args.patterns, config)?,
            mode,
        })
    } else {
        if args.find || args.negate {
            bail!("--find/--negate need a pattern catalog (use --patterns or config `pattern_file`)");
        }
        None
    };
    let options = PipelineOptions {
        widen: true,
        patterns,
        refresh_today: Some(Local::now().date_naive()),
        ..pipeline_options(config)?
    };
    execute(config, options, args.label.as_deref(), format)
}

#[derive(Debug, Serialize)]
struct SpaceListing {
    space: String,
    pages: Vec<PageLink>,
}

fn run_list(config: &SweepConfig, args: ListArgs, format: OutputFormat) -> Result<()> {
    let options = pipeline_options(config)?;
    let mut store = open_store(config)?;
    let cache = LocalCache::new(config.cache_dir());

    let mut listings = Vec::new();
    for space in &config.target_spaces {
        let pages = if args.raw {
            list_all_pages(&mut store, space, config.page_size)?
        } else {
            list_unique_pages_cached(
                &cache,
                &mut store,
                &options.base_url,
                space,
                config.page_size,
                config.use_cache,
            )?
        };
        let scope = SpaceScope {
            base_url: options.base_url.clone(),
            space: space.clone(),
            progress_every: options.progress_every,
        };
        listings.push(SpaceListing {
            space: space.clone(),
            pages: pages
                .iter()
                .map(|page| scope.link(&page.id, &page.title))
                .collect(),
        });
    }

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }
    for listing in &listings {
        println!("space: {}", listing.space);
        println!("pages.count: {}", listing.pages.len());
        for page in &listing.pages {
            println!("pages.entry: {} ({})", page.title, page.url);
        }
    }
    println!("requests: {}", store.request_count());
    Ok(())
}

fn run_cache_clear(config: &SweepConfig, explicit_spaces: bool) -> Result<()> {
    let cache = LocalCache::new(config.cache_dir());
    println!("cache clear");
    println!("cache_dir: {}", cache.dir().display());
    if explicit_spaces {
        let site = config
            .base_url()
            .context("confluence_base_url is needed to address cached listings")?;
        for space in &config.target_spaces {
            let removed = cache.invalidate(&listing_cache_key(&site, space))?;
            println!("invalidated.{space}: {}", format_flag(removed));
        }
    } else {
        let removed = cache.clear()?;
        println!("removed_records: {removed}");
    }
    Ok(())
}

fn print_pipeline_report(report: &PipelineReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("mode: {}", mode_label(report.dry_run));
    for space in &report.spaces {
        println!();
        println!("space: {}", space.space);
        println!("pages_found: {}", space.pages_found);
        if let Some(widen) = &space.widen {
            print_widen(widen);
        }
        if let Some(find) = &space.find {
            print_find(find);
        }
        if let Some(rewrite) = &space.rewrite {
            print_rewrite(rewrite);
        }
        if let Some(refresh) = &space.refresh {
            print_refresh(refresh);
        }
    }
    println!();
    println!("requests: {}", report.request_count);
    Ok(())
}

fn print_widen(report: &WidenReport) {
    println!("widen.checked: {}", report.checked);
    if report.dry_run {
        print_links("widen.would_widen", &report.would_widen);
    } else {
        print_links("widen.widened", &report.widened);
    }
    println!("widen.without_properties: {}", report.without_properties);
    print_failures("widen.property_failures", &report.property_failures);
    print_failures("widen.errors", &report.errors);
}

fn print_find(report: &FindReport) {
    println!("find.checked: {}", report.checked);
    let label = if report.negate {
        "find.without_match"
    } else {
        "find.matches"
    };
    print_links(label, &report.pages);
    print_missing("find.missing", &report.missing);
    print_failures("find.errors", &report.errors);
}

fn print_rewrite(report: &UpdateReport) {
    println!("rewrite.checked: {}", report.checked);
    println!("rewrite.matched: {}", report.matched());
    if report.dry_run {
        println!("rewrite.would_update.count: {}", report.would_update.len());
        for change in &report.would_update {
            println!(
                "rewrite.would_update: {} ({})",
                change.page.title, change.page.url
            );
            if let Some(diff) = &change.diff {
                for line in diff.lines() {
                    println!("    {line}");
                }
            }
        }
    } else {
        print_links("rewrite.updated", &report.updated);
        print_links("rewrite.held_back", &report.held_back);
    }
    if report.duplicates_skipped > 0 {
        println!("rewrite.duplicates_skipped: {}", report.duplicates_skipped);
    }
    print_links("rewrite.conflicts", &report.conflicts);
    print_failures("rewrite.unconfirmed", &report.unconfirmed);
    print_missing("rewrite.missing", &report.missing);
    print_failures("rewrite.errors", &report.errors);
}

fn print_refresh(report: &RefreshReport) {
    println!("refresh.checked: {}", report.checked);
    println!("refresh.not_found: {}", report.not_found);
    if !report.unreadable.is_empty() {
        print_links("refresh.unreadable", &report.unreadable);
    }
    println!("refresh.up_to_date: {}", report.up_to_date);
    println!("refresh.stale.count: {}", report.stale.len());
    for entry in &report.stale {
        println!(
            "refresh.stale: {} ({}) approved {} -> {}{}",
            entry.page.title,
            entry.page.url,
            format_date(entry.approved),
            format_date(entry.new_date),
            if entry.written { "" } else { " [not written]" }
        );
    }
    print_links("refresh.conflicts", &report.conflicts);
    print_failures("refresh.errors", &report.errors);
}

fn print_links(label: &str, links: &[PageLink]) {
    println!("{label}.count: {}", links.len());
    for link in links {
        println!("{label}: {} ({})", link.title, link.url);
    }
}

fn print_failures(label: &str, failures: &[PageFailure]) {
    if failures.is_empty() {
        return;
    }
    println!("{label}.count: {}", failures.len());
    for failure in failures {
        println!(
            "{label}: {} ({}): {}",
            failure.page.title, failure.page.url, failure.message
        );
    }
}

fn print_missing(label: &str, ids: &[String]) {
    if ids.is_empty() {
        return;
    }
    println!("{label}: {}", ids.join(", "));
}

fn format_date(date: Option<chrono::NaiveDate>) -> String {
    date.map(|date| date.to_string())
        .unwrap_or_else(|| "<none>".to_string())
}

fn mode_label(dry_run: bool) -> &'static str {
    if dry_run { "dry-run" } else { "live" }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

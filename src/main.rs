use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use comic_harvest::HarvestConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON config file. Flags given on the command line take precedence
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory of the snapshot [default: data]
    #[arg(long, env = "COMIC_HARVEST_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Seconds between two requests [default: 1]
    #[arg(long, env = "COMIC_HARVEST_DELAY", global = true)]
    delay: Option<f64>,

    /// Base url of the source, plain or as a `b64:` token
    #[arg(long, global = true)]
    source: Option<String>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Copy)]
struct ScrapeArgs {
    /// Store a record for every chapter
    #[arg(long)]
    chapters: bool,

    /// Fetch chapter pages for their image urls (implies --chapters)
    #[arg(long)]
    images: bool,

    /// Refetch what is already stored
    #[arg(long)]
    force: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scrape one comic by slug or url
    Comic {
        reference: String,
        #[command(flatten)]
        scrape: ScrapeArgs,
    },
    /// Scrape every comic of a range of listing pages
    Pages {
        /// [default: 1]
        #[arg(long)]
        start_page: Option<u32>,
        /// Walk until the first empty page when omitted
        #[arg(long)]
        end_page: Option<u32>,
        #[command(flatten)]
        scrape: ScrapeArgs,
        /// [default: 1]
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Compare stored chapters with the live source
    Check {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        slug: Option<String>,
        #[arg(long)]
        all: bool,
        /// Re-scrape chapters that gained images or whose image urls changed
        #[arg(long)]
        repair: bool,
    },
}

impl ScrapeArgs {
    fn apply(self, config: &mut HarvestConfig) {
        config.chapters |= self.chapters;
        config.images |= self.images;
        config.force |= self.force;
    }
}

impl Cli {
    fn config(&self) -> anyhow::Result<HarvestConfig> {
        let mut config = match &self.config {
            Some(path) => HarvestConfig::from_json_file(path)?,
            None => HarvestConfig::default(),
        };

        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(delay) = self.delay {
            config.delay_secs = delay;
        }
        if let Some(source) = &self.source {
            config.source_url = source.clone();
        }

        match &self.command {
            Command::Comic { scrape, .. } => scrape.apply(&mut config),
            Command::Pages {
                start_page,
                end_page,
                scrape,
                workers,
            } => {
                scrape.apply(&mut config);
                config.start_page = start_page.unwrap_or(config.start_page);
                config.end_page = end_page.or(config.end_page);
                config.workers = workers.unwrap_or(config.workers);
            }
            Command::Check { .. } => {}
        }

        Ok(config)
    }
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .compact();

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;

            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);

            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_file.as_deref())?;

    let config = cli.config()?;
    config.validate()?;

    let harvester = config.connect().await?;

    match cli.command {
        Command::Comic { reference, .. } => {
            let outcome = harvester
                .scrape_comic(&reference)
                .await
                .with_context(|| format!("failed to scrape {reference}"))?;

            let summary = serde_json::json!({
                "slug": outcome.comic.slug,
                "total_chapters": outcome.comic.total_chapters,
                "reused": outcome.reused,
                "chapters": outcome.chapters,
            });
            println!("{summary}");

            Ok(ExitCode::SUCCESS)
        }
        Command::Pages { .. } => {
            let report = harvester.scrape_pages().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if report.comics_stored == 0 && !report.failed_comics.is_empty() {
                return Ok(ExitCode::FAILURE);
            }

            Ok(ExitCode::SUCCESS)
        }
        Command::Check { slug, all, repair } => {
            let checker = harvester.checker();

            let discrepancies = match slug {
                Some(slug) if !all => checker
                    .check_comic(&slug)
                    .await
                    .with_context(|| format!("failed to check {slug}"))?,
                _ => checker.check_all().await?,
            };

            for discrepancy in &discrepancies {
                println!("{}", serde_json::to_string(discrepancy)?);
            }

            if repair {
                let repaired = harvester.repair(&discrepancies).await;
                tracing::info!("{repaired} chapters repaired");
            }

            if discrepancies.is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

use crate::brain::OpenAiPlannerFactory;
use crate::capture::HttpFetcher;
use crate::config::{self, Config, Credentials};
use crate::error::ConfigError;
use crate::face;
use crate::hands::ChromeFactory;
use crate::history::History;
use crate::orchestrator::{Orchestrator, RunResult, Settings};
use crate::report::BatchReport;
use crate::store::{DocumentStore, FirebaseStore};
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use dotenvy::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code when configuration or credentials are unusable.
pub const EXIT_CONFIG: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "om-harvester")]
#[command(about = "Download offering memorandums from brokerage sites with an LLM browser agent")]
pub struct Args {
    /// Property page URLs to harvest.
    #[arg(required = true, num_args = 1..)]
    pub urls: Vec<String>,

    /// Path to config TOML. If omitted, uses ./om-harvester.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Serve a live progress page on localhost.
    #[arg(long)]
    pub ui: bool,

    /// Harvest targets even if the history says they were done before.
    #[arg(long)]
    pub force: bool,

    /// Run Chrome headless regardless of the config.
    #[arg(long)]
    pub headless: bool,

    /// Write the JSON batch report here (overrides paths.report_file).
    #[arg(long)]
    pub report: Option<PathBuf>,
}

/// Run the harvester and return the process exit code.
pub async fn dispatch(args: Args) -> Result<i32> {
    dotenv().ok();

    let mut cfg = Config::resolve(args.config.as_deref())?;
    cfg.validate()?;
    if args.headless {
        cfg.browser.headless = true;
    }
    if args.report.is_some() {
        cfg.paths.report_file = args.report.clone();
    }

    let _guard = init_logging(&args, &cfg)?;
    let creds = Credentials::from_env()?;
    config::ensure_writable_dir(&cfg.paths.downloads_dir)?;

    let history_path = cfg.history_path();
    let mut history = History::load(&history_path);
    info!(
        targets = args.urls.len(),
        downloads = %cfg.paths.downloads_dir.display(),
        known = history.artifacts.len(),
        "starting harvest"
    );

    let events = if args.ui {
        let tx = face::channel();
        face::start_server(tx.clone()).await?;
        Some(tx)
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling the remaining work");
            on_signal.cancel();
        }
    });

    let fetcher = HttpFetcher::new(cfg.timing.fetch_timeout()).context("building HTTP client")?;
    let skip_ids: Vec<String> = if args.force {
        Vec::new()
    } else {
        history.artifacts.iter().map(|a| a.id.clone()).collect()
    };
    let orchestrator = Orchestrator::new(
        Arc::new(ChromeFactory::new(cfg.browser.clone())),
        Arc::new(OpenAiPlannerFactory::new(creds.openai_api_key.clone(), cfg.agent.clone())),
        Arc::new(fetcher),
        Settings::from_config(&cfg),
    )
    .with_skip_ids(skip_ids)
    .with_cancel(cancel)
    .with_events(events);

    let results = orchestrator.process_batch(&args.urls).await;

    for r in results.iter().filter(|r| r.success) {
        history.record(&r.work_item.target_url, r.artifact_paths.iter().cloned().collect());
    }
    if let Err(e) = history.save(&history_path) {
        warn!(error = %format!("{e:#}"), "could not save download history");
    }

    let project = creds.firebase_project_id.clone().or(cfg.store.firebase_project_id.clone());
    if let Some(project) = project {
        let store = FirebaseStore::new(&project);
        publish(&store, &cfg.store.collection, &results).await;
    }

    let report = BatchReport::new(results);
    println!("{}", report.render_table());
    if let Some(path) = &cfg.paths.report_file {
        report.write_json(path)?;
        info!(path = %path.display(), "report written");
    }

    Ok(if report.any_succeeded() { 0 } else { 1 })
}

/// Exit code for an error that escaped `dispatch`.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        EXIT_CONFIG
    } else {
        1
    }
}

/// Push every result to `collection`. Failures are logged and skipped.
pub async fn publish(store: &dyn DocumentStore, collection: &str, results: &[RunResult]) -> usize {
    let mut pushed = 0;
    for r in results {
        let record = match serde_json::to_value(r) {
            Ok(v) => v,
            Err(e) => {
                warn!(url = %r.work_item.target_url, error = %e, "could not serialize result");
                continue;
            }
        };
        match store.push(collection, &record).await {
            Ok(key) => {
                pushed += 1;
                info!(url = %r.work_item.target_url, key = %key, "result published");
            }
            Err(e) => warn!(url = %r.work_item.target_url, error = %e, "publishing result failed"),
        }
    }
    pushed
}

fn init_logging(args: &Args, cfg: &Config) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries the summary table; diagnostics go to stderr.
    let console_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = cfg.logging.file.as_deref() {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).with_context(|| format!("create log dir: {}", parent.display()))?;
        let file = std::fs::File::create(path).with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

//! tracksense CLI
//!
//! Runs the detection pipeline against JSON page fixtures.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use tracksense::{
    config::{CategoryConfig, Config},
    core::{
        render_text, Aggregator, AggregatorMessage, Badge, BadgeUpdate, MergeWorker, Scheduler,
        Session, TargetKey, Trigger,
    },
    detectors::{Category, DetectionPolicy},
    diagnostics::create_shared_log,
    platform::{PageFixture, SharedPage},
    DETECTION_NOTICE, VERSION,
};

#[derive(Parser)]
#[command(name = "tracksense")]
#[command(version = VERSION)]
#[command(about = "Runtime tracking and fingerprinting detection", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Default)]
struct Overrides {
    /// Highest detected-signal count still rated MODERATE
    #[arg(long)]
    threshold: Option<usize>,

    /// Detection policy (suspicious-only or any-evidence)
    #[arg(long)]
    policy: Option<String>,

    /// Categories to run (behavior, system, audio, canvas, or all)
    #[arg(long)]
    categories: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a page fixture once and print the consolidated state
    Scan {
        /// Page fixture (JSON)
        fixture: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Run the scheduler against a page fixture and print badge updates
    Watch {
        /// Page fixture (JSON)
        fixture: PathBuf,

        /// Interval between periodic passes in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Stop after this many seconds (runs until Ctrl+C otherwise)
        #[arg(long)]
        duration_secs: Option<u64>,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Show configuration
    Config,

    /// Display the detection notice
    Notice,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tracksense=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Scan { fixture, overrides } => {
            cmd_scan(&fixture, apply_overrides(config, &overrides)?)
        }
        Commands::Watch {
            fixture,
            interval_ms,
            duration_secs,
            overrides,
        } => {
            let mut config = apply_overrides(config, &overrides)?;
            if let Some(ms) = interval_ms {
                config.poll_interval = Duration::from_millis(ms);
            }
            cmd_watch(&fixture, config, duration_secs.map(Duration::from_secs))
        }
        Commands::Config => {
            cmd_config(cli.config.as_deref(), &config);
            Ok(())
        }
        Commands::Notice => {
            println!("{DETECTION_NOTICE}");
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(p) => Config::load_from(p),
        None => Config::load(),
    };
    config.context("failed to load configuration")
}

fn apply_overrides(mut config: Config, overrides: &Overrides) -> Result<Config> {
    if let Some(threshold) = overrides.threshold {
        config.severity.moderate_max = threshold;
    }
    if let Some(ref policy) = overrides.policy {
        config.policy = policy.parse::<DetectionPolicy>().map_err(|e| anyhow!(e))?;
    }
    if let Some(ref categories) = overrides.categories {
        config.categories = CategoryConfig::from_csv(categories);
    }
    if !config.categories.any_enabled() {
        bail!("at least one category must be enabled (behavior, system, audio, canvas)");
    }
    Ok(config)
}

fn load_fixture(path: &Path) -> Result<(PageFixture, SharedPage, TargetKey)> {
    let fixture = PageFixture::load(path)
        .with_context(|| format!("failed to load fixture {}", path.display()))?;
    let page = fixture.build_page();
    let target = TargetKey::new(page.session_id().to_string());
    Ok((fixture, page, target))
}

fn replay(fixture: &PageFixture, page: &SharedPage) {
    for action in &fixture.actions {
        // Page code sees the same errors it would natively; they are not ours.
        if let Err(e) = action.apply(page) {
            tracing::debug!(?action, error = %e, "page action threw");
        }
    }
}

fn print_badge(update: &BadgeUpdate) {
    match &update.badge {
        Badge::Clear => println!("badge: cleared ({})", update.severity),
        Badge::Show { text, color } => println!("badge: {text} {color} ({})", update.severity),
    }
}

fn cmd_scan(path: &Path, config: Config) -> Result<()> {
    let (fixture, page, target) = load_fixture(path)?;
    let log = create_shared_log();
    let aggregator = Aggregator::from_config(&config).with_diagnostics(log.clone());
    let badges = aggregator.subscribe_badges();

    aggregator.identify(&target, &fixture.display_label());
    let mut session = Session::from_config(target.clone(), page.clone(), &config, log.clone())?;

    for message in session.run_pass(Trigger::Load) {
        aggregator.apply(message);
    }
    replay(&fixture, &page);
    for message in session.run_pass(Trigger::Tick) {
        aggregator.apply(message);
    }

    let state = aggregator
        .state(&target)
        .context("no findings were produced")?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    println!();
    print!("{}", render_text(&state));
    if let Some(update) = badges.try_iter().last() {
        print_badge(&update);
    }
    eprintln!("{}", log.summary());
    Ok(())
}

fn cmd_watch(path: &Path, config: Config, duration: Option<Duration>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(watch(path, config, duration))
}

async fn watch(path: &Path, config: Config, duration: Option<Duration>) -> Result<()> {
    let (fixture, page, target) = load_fixture(path)?;
    let log = create_shared_log();
    let aggregator = Arc::new(Aggregator::from_config(&config).with_diagnostics(log.clone()));
    let badges = aggregator.subscribe_badges();
    let diagnostics = aggregator.subscribe_diagnostics();

    let (sink, worker) = MergeWorker::spawn(aggregator.clone());
    sink.send(AggregatorMessage::Identify {
        target: target.clone(),
        label: fixture.display_label(),
    })?;

    let session = Session::from_config(target.clone(), page.clone(), &config, log.clone())?;
    let mut handle = Scheduler::from_config(&config).start(session, sink.clone());

    println!("tracksense v{VERSION}");
    println!("Watching {} every {}ms", fixture.url, config.poll_interval.as_millis());
    println!("Press Ctrl+C to stop");
    println!();

    // Let the load pass land before the page starts doing things.
    let enabled = Category::ALL
        .iter()
        .filter(|c| config.categories.enabled(**c))
        .count() as u64;
    let load_deadline = Instant::now() + Duration::from_secs(2);
    while log.stats().passes_completed < enabled && Instant::now() < load_deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    replay(&fixture, &page);

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone())?;
    let deadline = duration.map(|d| Instant::now() + d);

    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        for update in badges.try_iter() {
            print!("[{}] ", Utc::now().format("%H:%M:%S"));
            print_badge(&update);
        }
        for diagnostic in diagnostics.try_iter() {
            eprintln!(
                "[{}] {} failed: {}",
                diagnostic.at.format("%H:%M:%S"),
                diagnostic.category,
                diagnostic.message
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!();
    println!("Stopping...");
    handle.stop();
    drop(handle);
    drop(sink);
    if tokio::time::timeout(Duration::from_secs(1), worker).await.is_err() {
        tracing::warn!("merge worker did not stop in time");
    }

    if let Some(state) = aggregator.evict(&target) {
        print!("{}", render_text(&state));
    }
    println!();
    println!("{}", log.summary());
    Ok(())
}

fn cmd_config(path: Option<&Path>, config: &Config) {
    println!("Configuration");
    println!("=============");
    println!();
    match path {
        Some(p) => println!("Config file: {:?}", p),
        None => println!("Config file: {:?}", Config::config_path()),
    }
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(config).unwrap_or_else(|_| "Error".to_string())
    );
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("error setting Ctrl+C handler")
}

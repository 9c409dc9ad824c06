use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use mercari_watcher::config::LoggingConfig;
use mercari_watcher::image_filter::{HttpImageLoader, ImageFilter};
use mercari_watcher::listing_fetcher::ListingFetcher;
use mercari_watcher::monitor::MonitorOrchestrator;
use mercari_watcher::notification_dispatcher::NotificationDispatcher;
use mercari_watcher::plugins::notifiers::telegram::TelegramConfig;
use mercari_watcher::plugins::{FixedRateConverter, TelegramNotifier};
use mercari_watcher::product_store::ProductStore;
use mercari_watcher::scheduler::MonitorScheduler;
use mercari_watcher::scraper::WebScraper;
use mercari_watcher::AppConfig;

/// Watches marketplace searches and sends new listings to Telegram
#[derive(Parser)]
#[command(name = "mercari-watcher")]
#[command(version)]
#[command(about = "Watches marketplace searches and sends new listings to Telegram", long_about = None)]
struct Cli {
    /// Run a single monitoring cycle and exit
    #[arg(long)]
    once: bool,

    /// Minutes between cycles (overrides monitor.interval_minutes)
    #[arg(short, long, value_name = "MINUTES")]
    interval: Option<u64>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let _log_guard = init_tracing(&config.logging)?;

    let interval_minutes = cli.interval.unwrap_or(config.monitor.interval_minutes);
    if interval_minutes == 0 {
        anyhow::bail!("--interval must be at least 1 minute");
    }

    info!("Starting Mercari Watcher...");

    let scraper = WebScraper::new(&config)?;
    scraper.start().context("Failed to start browser session")?;
    let fetcher = ListingFetcher::new(Box::new(scraper), &config)?;

    let store = ProductStore::open(&config.storage.path, config.storage.max_products_to_remember);
    info!(path = %store.path().display(), known = store.len(), "Product store loaded");

    let image_filter = ImageFilter::new(&config.filtering, Box::new(HttpImageLoader::new()?));

    let telegram = TelegramNotifier::new(TelegramConfig::from_settings(&config.notifications.telegram)?)?;
    let converter = FixedRateConverter::new(config.notifications.jpy_to_eur_rate);
    let dispatcher = NotificationDispatcher::new(Box::new(telegram), Box::new(converter), &config.notifications);
    if !dispatcher.test_connection().await {
        warn!(channel = dispatcher.channel_name(), "Notification channel did not answer the connection test");
    }

    let mut monitor = MonitorOrchestrator::new(
        fetcher,
        store,
        image_filter,
        dispatcher,
        &config,
        config.monitor.queries.clone(),
    );
    if let Some(path) = &config.monitor.queries_file {
        monitor = monitor.with_queries_file(path);
    }
    let query_count = monitor
        .reload_queries()
        .context("Failed to read search queries file")?;
    if query_count == 0 {
        warn!("No search queries configured; cycles will do nothing");
    }
    info!(count = query_count, "Loaded search queries");

    let mut scheduler = MonitorScheduler::from_minutes(monitor, interval_minutes);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal = shutdown_signal();
    tokio::spawn(async move {
        let received = match signal {
            Ok(signal) => signal.await,
            Err(e) => Err(e),
        };
        match received {
            Ok(()) => {
                info!("Shutdown signal received, finishing current step...");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "Unable to listen for shutdown signal");
                // Keep the sender alive so the scheduler does not read it as a shutdown
                std::future::pending::<()>().await;
            }
        }
    });

    if cli.once {
        let report = scheduler.run_once(&shutdown_rx).await;
        scheduler.monitor().shutdown().await;
        info!(
            new_items = report.new_items(),
            committed = report.committed(),
            "Single run complete"
        );
    } else {
        scheduler.run_forever(shutdown_rx).await;
    }

    info!("Shutting down...");
    Ok(())
}

/// Installs the handlers up front; the returned future resolves on Ctrl-C or SIGTERM.
#[cfg(unix)]
fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = std::io::Result<()>>> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = std::io::Result<()>>> {
    Ok(tokio::signal::ctrl_c())
}

fn init_tracing(logging: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&logging.directory)
        .with_context(|| format!("Failed to create log directory {}", logging.directory.display()))?;
    let file_appender = tracing_appender::rolling::daily(&logging.directory, &logging.file_prefix);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("mercari_watcher=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    Ok(guard)
}

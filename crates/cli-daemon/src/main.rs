use anyhow::{Context, Result};
use clap::Parser;
use convert_core::{
    commands, intake, snapshot,
    config::{config_path_or_default, ServiceConfig},
    JobId, ServiceContext,
};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use log::{info, warn, error, debug};
use tokio::sync::watch;

/// Media conversion daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger - use RUST_LOG env var or default to info level
    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.format_timestamp_secs().init();

    // Load configuration
    let config_path = config_path_or_default(args.config.as_deref());
    let cfg = ServiceConfig::load_config(config_path.as_deref())
        .context("Failed to load configuration")?;

    info!("Conversion daemon starting");
    match &config_path {
        Some(path) => info!("Config file: {}", path.display()),
        None => info!("No config file, using built-in defaults"),
    }
    info!("Configuration loaded:");
    info!("  Free tier: {} bytes, quota {:?} per {}s",
          cfg.tiers.free.max_upload_bytes, cfg.tiers.free.quota_per_window, cfg.quota_window_secs);
    info!("  Premium tier: {} bytes, quota {:?}",
          cfg.tiers.premium.max_upload_bytes, cfg.tiers.premium.quota_per_window);
    info!("  Encoder: {} ({} concurrent, {}s timeout)",
          cfg.encoder.ffmpeg_bin.display(), cfg.encoder.max_concurrent_jobs, cfg.encoder.timeout_secs);
    info!("  Transient dir: {}", cfg.storage.transient_dir.display());
    info!("  Spool dir: {}", cfg.storage.spool_dir.display());
    info!("  Retention: {}s, sweep every {}s", cfg.retention_secs, cfg.sweep_interval_secs);

    for dir in [&cfg.storage.spool_dir, &cfg.storage.outbox_dir, &cfg.storage.command_dir, &cfg.storage.state_dir] {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let ctx = ServiceContext::new(cfg.clone());

    // Recovery on startup: nothing in memory can reference files a previous
    // run left behind
    info!("🔄 Starting recovery checks...");
    match ctx.engine().encoder().detect_version().await {
        Ok(version) => info!("Encoder version: {}.{}.{}", version.major, version.minor, version.patch),
        Err(e) => warn!("⚠️  Encoder probe failed, jobs will fail until it is fixed: {:#}", e),
    }
    let cleaned_count = ctx.prepare_storage()
        .context("Failed to prepare transient storage on startup")?;
    info!("✅ Startup recovery complete: {} transient file(s) cleaned", cleaned_count);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(ctx.sweeper().run(shutdown_rx));

    let poll_interval = Duration::from_secs(cfg.poll_interval_secs.max(1));
    let snapshot_interval = Duration::from_secs(cfg.snapshot_interval_secs);
    let settle = Duration::from_millis(cfg.spool_settle_millis);
    let mut pending: HashSet<JobId> = HashSet::new();
    let mut last_snapshot: Option<Instant> = None;

    // Main daemon loop
    loop {
        match intake::process_spool(&ctx, &cfg.storage.spool_dir, &cfg.storage.outbox_dir, settle).await {
            Ok(submitted) => pending.extend(submitted),
            Err(e) => error!("❌ Spool intake failed: {:#}", e),
        }

        match intake::report_finished(&ctx, &cfg.storage.outbox_dir, &mut pending) {
            Ok(0) => {}
            Ok(n) => debug!("Reported {} finished job(s)", n),
            Err(e) => error!("❌ Failed to report finished jobs: {:#}", e),
        }

        // Process command files from collaborators (premium changes, deliveries)
        if let Err(e) = commands::process_command_files(&cfg.storage.command_dir, &ctx) {
            error!("❌ Failed to process command files: {:#}", e);
        }

        if last_snapshot.map_or(true, |t| t.elapsed() >= snapshot_interval) {
            match snapshot::write_snapshot(&cfg.storage.state_dir, &ctx) {
                Ok(snap) => debug!(
                    "Snapshot: {} active job(s), {} conversions, {} users",
                    snap.stats.active_jobs, snap.stats.total_conversions, snap.stats.total_users
                ),
                Err(e) => warn!("Failed to write stats snapshot: {:#}", e),
            }
            last_snapshot = Some(Instant::now());
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    info!("Shutting down...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        warn!("Sweeper task ended abnormally: {}", e);
    }
    if let Err(e) = snapshot::write_snapshot(&cfg.storage.state_dir, &ctx) {
        warn!("Failed to write final stats snapshot: {:#}", e);
    }
    if !pending.is_empty() {
        warn!("{} job(s) still in flight at shutdown; their encoders are killed", pending.len());
    }
    Ok(())
}

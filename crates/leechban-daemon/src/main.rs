mod api;
mod config;

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use clap::Parser;
use tokio::{sync::Notify, time::MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use leechban_core::{
    build_rules, summary, BanManager, DatWriter, Detector, QbitClient, TorrentClient, Whitelist,
};

use crate::config::DaemonConfig;

#[derive(Debug, Parser)]
#[command(name = "leechban", version, about = "Bans leeching peers on qBittorrent servers")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "leechban.json")]
    config: PathBuf,

    /// Run a single detection cycle and exit.
    #[arg(long)]
    once: bool,

    /// Evaluate rules without writing the block list or ban state.
    #[arg(long)]
    dry_run: bool,
}

struct Daemon {
    detectors: Vec<Detector>,
    writer: DatWriter,
    bans: Arc<BanManager>,
    dry_run: bool,
}

impl Daemon {
    fn new(config: &DaemonConfig, bans: Arc<BanManager>, dry_run: bool) -> anyhow::Result<Self> {
        let rules = build_rules(&config.rules).context("Invalid rule configuration")?;
        if rules.is_empty() {
            warn!("no enabled rules; peers will be scanned but never banned");
        } else {
            info!("loaded {} rules", rules.len());
        }

        let whitelist = Whitelist::new(&config.whitelist.ips);
        let mut detectors = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            let client: Arc<dyn TorrentClient> = Arc::new(QbitClient::new(server)?);
            detectors.push(Detector::new(
                client,
                rules.clone(),
                whitelist.clone(),
                bans.clone(),
            ));
            info!("monitoring server {} at {}", server.name, server.url);
        }

        Ok(Self {
            detectors,
            writer: DatWriter::new(&config.output.dat_file, config.output.format),
            bans,
            dry_run,
        })
    }

    /// One pass over every server. Returns the number of newly banned IPs.
    async fn run_cycle(&self) -> usize {
        let started = Instant::now();
        let mut total = 0;

        for detector in &self.detectors {
            match detector.detect().await {
                Ok(result) => {
                    info!("{}", summary(&result));
                    total += result.total_banned;
                    if let Err(e) = self.writer.write(&result, &self.bans, self.dry_run) {
                        error!("failed to write block list for {}: {e}", detector.name());
                    }
                }
                Err(e) => warn!("detection failed for {}: {e}", detector.name()),
            }
        }

        let cleaned = self.bans.cleanup_expired();
        if cleaned > 0 {
            info!("removed {} expired bans", cleaned);
        }

        if !self.dry_run {
            let bans = self.bans.clone();
            match tokio::task::spawn_blocking(move || bans.save()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("failed to save ban state: {e}"),
                Err(e) => error!("ban state save task failed: {e}"),
            }
        }

        info!(
            "cycle finished in {:?}: {} IPs banned across {} servers, {} bans tracked",
            started.elapsed(),
            total,
            self.detectors.len(),
            self.bans.len()
        );
        total
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        error!("PANIC: Application panicked");
        if let Some(location) = panic_info.location() {
            error!("Location: {}:{}:{}", location.file(), location.line(), location.column());
        }
        if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            error!("Message: {}", s);
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            error!("Message: {}", s);
        }
    }));
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(&cli.config).await?;

    setup_panic_handler();
    init_tracing(&config.app.log_level);

    let dry_run = cli.dry_run || config.app.dry_run;
    if dry_run {
        info!("dry-run mode: no block list or ban state will be written");
    }

    let bans = Arc::new(BanManager::open(&config.app.state_file));
    let daemon = Daemon::new(&config, bans.clone(), dry_run)?;

    if cli.once {
        daemon.run_cycle().await;
        return Ok(());
    }

    let shutdown = Arc::new(Notify::new());
    if let Some(api_cfg) = config.api.clone() {
        let ctx = api::AppCtx {
            bans: bans.clone(),
            admin_token: api_cfg.admin_token.clone(),
            shutdown: shutdown.clone(),
            persist: !dry_run,
            started: Instant::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = api::serve(&api_cfg, ctx).await {
                error!("admin API stopped: {e}");
            }
        });
    }

    forward_ctrl_c(shutdown.clone()).await;

    let interval = config.app.interval();
    info!("scanning every {:?}", interval);
    let cycles = run_loop(&daemon, interval, &shutdown).await;
    info!("shutting down after {} cycles", cycles);

    Ok(())
}

/// Turns ctrl-c into a shutdown request so a running cycle is never interrupted.
///
/// The signal handler is installed before this returns.
async fn forward_ctrl_c(shutdown: Arc<Notify>) {
    let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());
    tokio::select! {
        biased;
        _ = &mut ctrl_c => {
            info!("ctrl-c received; shutting down");
            shutdown.notify_one();
            return;
        }
        _ = std::future::ready(()) => {}
    }
    tokio::spawn(async move {
        if ctrl_c.await.is_ok() {
            info!("ctrl-c received; shutting down after the current cycle");
            shutdown.notify_one();
        }
    });
}

/// Runs cycles on every tick until shutdown is requested. Returns the number of cycles run.
async fn run_loop(daemon: &Daemon, interval: Duration, shutdown: &Notify) -> usize {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut cycles = 0;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            _ = ticker.tick() => {
                daemon.run_cycle().await;
                cycles += 1;
            }
        }
    }
    cycles
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["leechban"]);
        assert_eq!(cli.config, PathBuf::from("leechban.json"));
        assert!(!cli.once);
        assert!(!cli.dry_run);

        let cli = Cli::parse_from(["leechban", "-c", "/etc/leechban.json", "--once", "--dry-run"]);
        assert_eq!(cli.config, PathBuf::from("/etc/leechban.json"));
        assert!(cli.once && cli.dry_run);
    }

    #[tokio::test]
    async fn daemon_rejects_bad_rules() {
        let config: DaemonConfig = serde_json::from_str(
            r#"{
                "servers": [{"name": "a", "url": "http://127.0.0.1:1"}],
                "rules": [{"name": "r", "filters": [{"field": "speed", "operator": "<", "value": "1"}]}]
            }"#,
        )
        .unwrap();
        let bans = Arc::new(BanManager::in_memory());
        assert!(Daemon::new(&config, bans, true).is_err());
    }

    #[tokio::test]
    async fn shutdown_request_ends_the_loop_after_the_running_cycle() {
        let config: DaemonConfig = serde_json::from_value(serde_json::json!({
            "servers": [{"name": "down", "url": "http://127.0.0.1:1"}]
        }))
        .unwrap();
        let daemon = Daemon::new(&config, Arc::new(BanManager::in_memory()), true).unwrap();
        let shutdown = Arc::new(Notify::new());

        let requester = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                shutdown.notify_one();
            })
        };
        let cycles = tokio::time::timeout(
            Duration::from_secs(30),
            run_loop(&daemon, Duration::from_secs(3600), &shutdown),
        )
        .await
        .unwrap();
        requester.await.unwrap();
        assert_eq!(cycles, 1);
    }

    #[tokio::test]
    async fn pending_shutdown_stops_before_the_next_cycle() {
        let config: DaemonConfig = serde_json::from_value(serde_json::json!({
            "servers": [{"name": "down", "url": "http://127.0.0.1:1"}]
        }))
        .unwrap();
        let daemon = Daemon::new(&config, Arc::new(BanManager::in_memory()), true).unwrap();
        let shutdown = Notify::new();
        shutdown.notify_one();
        assert_eq!(run_loop(&daemon, Duration::from_millis(1), &shutdown).await, 0);
    }

    #[tokio::test]
    async fn unreachable_server_does_not_abort_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let dat = dir.path().join("ipfilter.dat");
        let config: DaemonConfig = serde_json::from_value(serde_json::json!({
            "servers": [{"name": "down", "url": "http://127.0.0.1:1"}],
            "output": {"dat_file": dat},
            "rules": [{"name": "r", "filters": [{"field": "progress", "operator": "<", "value": "1%"}]}]
        }))
        .unwrap();
        let bans = Arc::new(BanManager::in_memory());
        let daemon = Daemon::new(&config, bans, false).unwrap();
        assert_eq!(daemon.run_cycle().await, 0);
        assert!(!dat.exists());
    }
}

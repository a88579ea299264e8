use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sysinfo::System;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use audio_player::backend::FfmpegBackend;
use audio_player::cache::{ContentCache, HttpFetcher, RetryPolicy};
use audio_player::config::{self, DeviceConfig, Paths, DEFAULT_DATA_DIR};
use audio_player::error::AgentError;
use audio_player::model::Manifest;
use audio_player::remote::RemoteChannel;
use audio_player::scheduler::{Scheduler, SchedulerExit};
use audio_player::store;
use audio_player::{display, selftest, status_api};

/// Grace period between the final report and the reboot command.
const REBOOT_DELAY: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "audio-player", version, about = "Headless audio playback agent")]
struct Cli {
    /// Directory holding config, secrets, state and the content cache.
    #[arg(long, env = "AUDIO_PLAYER_DATA_DIR", default_value = DEFAULT_DATA_DIR, global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the playback agent (default).
    Run,
    /// Check cache, content and audio output, then exit.
    SelfTest,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing() {
        eprintln!("failed to initialise logging: {e}");
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();
    let paths = Paths::new(cli.data_dir);

    let result = match cli.command.unwrap_or(Cmd::Run) {
        Cmd::Run => run(paths).await,
        Cmd::SelfTest => self_test(paths).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<AgentError>() {
                Some(agent) if agent.is_fatal() => error!("startup aborted: {agent}"),
                _ => error!("fatal: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();
    Ok(())
}

/// Local config.json, or the server's manifest on a device's first boot.
async fn load_or_fetch_config(
    paths: &Paths,
    remote: &mut RemoteChannel,
) -> Result<(DeviceConfig, Option<Manifest>), AgentError> {
    if let Some(cfg) = DeviceConfig::load(&paths.config_file())? {
        info!("loaded configuration from {}", paths.config_file().display());
        return Ok((cfg, None));
    }

    info!("no local configuration, fetching manifest from server");
    let manifest = remote.fetch_manifest().await.map_err(|e| {
        AgentError::configuration(format!(
            "{} missing and manifest fetch failed: {e}",
            paths.config_file().display()
        ))
    })?;
    let cfg = DeviceConfig::from_manifest(&manifest);
    if let Err(e) = cfg.save(&paths.config_file()) {
        warn!("could not save fetched configuration: {e}");
    }
    Ok((cfg, Some(manifest)))
}

async fn open_cache(paths: &Paths, cfg: &DeviceConfig) -> anyhow::Result<Arc<ContentCache>> {
    let fetcher = Arc::new(HttpFetcher::new(cfg.load_timeout())?);
    ContentCache::open(
        paths.cache_dir(),
        paths.state_db(),
        fetcher,
        RetryPolicy::new(cfg.fetch_retries, cfg.fetch_backoff_ms),
    )
    .await
}

async fn run(paths: Paths) -> anyhow::Result<ExitCode> {
    let version = env!("CARGO_PKG_VERSION");
    info!("audio-player {version} starting, data dir {}", paths.data_dir.display());

    paths.ensure()?;
    let secrets = config::load_secrets(&paths.secret_file())?;
    let device_id = config::load_device_id(&paths).await;

    let mut remote = RemoteChannel::new(&secrets, &device_id, DeviceConfig::default().poll_interval())?;
    let (cfg, fetched) = load_or_fetch_config(&paths, &mut remote).await?;
    cfg.validate()?;
    let remote = remote
        .with_poll_interval(cfg.poll_interval())
        .with_known_manifest(fetched);

    let cache = open_cache(&paths, &cfg).await?;
    let backend = Box::new(FfmpegBackend::from_env());

    let (scheduler, handles) = Scheduler::new(&device_id, cfg.clone(), backend, cache);
    let mut scheduler = scheduler.with_persistence(paths.state_db(), paths.config_file());
    scheduler
        .restore(store::load_checkpoint(paths.state_db()).await)
        .await;

    let shutdown = CancellationToken::new();

    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));
    let remote_task = tokio::spawn(remote.run(
        handles.inbound.clone(),
        handles.snapshots.clone(),
        handles.outcomes,
        Arc::clone(&handles.refresh),
        shutdown.clone(),
    ));
    let display_task = tokio::spawn(display::run(
        cfg.display.clone(),
        handles.snapshots.clone(),
        shutdown.clone(),
    ));

    match status_api::bind_addr_from_env() {
        Ok(Some(addr)) => {
            let state = status_api::AppState {
                version: version.to_string(),
                sys: Arc::new(tokio::sync::Mutex::new(System::new_all())),
                snapshots: handles.snapshots.clone(),
            };
            tokio::spawn(status_api::serve(addr, state, shutdown.clone()));
        }
        Ok(None) => info!("status API disabled"),
        Err(e) => warn!("invalid AUDIO_PLAYER_BIND, status API disabled: {e}"),
    }

    // Pick up playlist changes made while we were offline.
    handles.refresh.notify_one();

    {
        let token = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            token.cancel();
        });
    }

    let exit = match scheduler_task.await {
        Ok(exit) => exit,
        Err(e) => {
            error!("scheduler task failed: {e}");
            SchedulerExit::Shutdown
        }
    };
    shutdown.cancel();

    let mut remote = remote_task.await?;
    if let Err(e) = display_task.await {
        warn!("display task failed: {e}");
    }

    match exit {
        SchedulerExit::Shutdown => {
            if let Err(e) = remote.send_heartbeat("shutdown").await {
                warn!("final status report failed: {e}");
            }
            info!("stopped");
        }
        SchedulerExit::Reboot => {
            info!("rebooting in {}s", REBOOT_DELAY.as_secs());
            tokio::time::sleep(REBOOT_DELAY).await;
            reboot().await;
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn reboot() {
    let cmd = std::env::var("AUDIO_PLAYER_REBOOT_CMD").unwrap_or_else(|_| "reboot".to_string());
    let mut parts = cmd.split_whitespace();
    let Some(program) = parts.next() else {
        warn!("AUDIO_PLAYER_REBOOT_CMD is empty, not rebooting");
        return;
    };
    match tokio::process::Command::new(program).args(parts).status().await {
        Ok(status) if status.success() => {}
        Ok(status) => error!("reboot command `{cmd}` exited with {status}"),
        Err(e) => error!("reboot command `{cmd}` failed to start: {e}"),
    }
}

async fn self_test(paths: Paths) -> anyhow::Result<ExitCode> {
    paths.ensure()?;
    let cfg = match DeviceConfig::load(&paths.config_file())? {
        Some(cfg) => cfg,
        None => {
            warn!("no {} yet, testing with defaults", paths.config_file().display());
            DeviceConfig::default()
        }
    };

    let cache = open_cache(&paths, &cfg).await?;
    let mut backend = FfmpegBackend::from_env();
    let report = selftest::run(&cfg, cache, &mut backend).await;
    report.log();

    Ok(if report.passed() {
        info!("self-test passed");
        ExitCode::SUCCESS
    } else {
        error!("self-test failed");
        ExitCode::FAILURE
    })
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}

use std::sync::Arc;
use std::time::Duration;

use assetsync_engine::{
    Bootstrapper, ExternalWakeTimer, InitReason, OnProgress, PollingWakeTimer, ProgressEvent,
    ProxyConfig, SyncConfig, WakeTimer,
};
use clap::Parser;
use indicatif::MultiProgress;
use tokio::io::AsyncWriteExt;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod cli;
mod error;
mod utils;

use cli::{CliArgs, Command, GlobalArgs};
use error::AppError;
use utils::format_bytes;
use utils::progress::ProgressManager;

const LOG_FILE: &str = "assetsync.log";

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();
    let global = &args.global;

    std::fs::create_dir_all(&global.data_dir)?;

    // Logs go to stderr so `status` and `get` can use stdout
    let log_level = if global.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let appender = tracing_appender::rolling::never(&global.data_dir, LOG_FILE);
    let (file_writer, _log_guard) = tracing_appender::non_blocking(appender);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(MakeWriterExt::and(std::io::stderr, file_writer))
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    let config = build_config(global)?;
    info!(
        version = %config.target_version,
        manifest_url = %config.manifest_url,
        data_dir = %global.data_dir.display(),
        "Asset sync configuration"
    );
    info!(
        "HTTP timeout configuration: overall={}s, connect={}s, read={}s",
        global.timeout, global.connect_timeout, global.read_timeout
    );

    let multi = MultiProgress::new();
    let progress_manager = if global.show_progress {
        ProgressManager::new(multi.clone())
    } else {
        ProgressManager::new_disabled(multi.clone())
    };
    let progress: OnProgress =
        Arc::new(move |event: ProgressEvent| progress_manager.handle_event(event));

    match args.command {
        Command::Init { reason } => {
            let engine = Bootstrapper::open(config, &global.data_dir, Arc::new(ExternalWakeTimer))?;
            engine.initialize(reason).await?;
            report_status(&engine).await?;
        }
        Command::Sync => {
            let engine = Bootstrapper::open(config, &global.data_dir, Arc::new(ExternalWakeTimer))?;
            engine.ensure_ready_with_progress(Some(progress)).await?;
            info!("Assets ready");
        }
        Command::Status => {
            let engine = Bootstrapper::open(config, &global.data_dir, Arc::new(ExternalWakeTimer))?;
            let info = engine.debug_info().await?;
            let json = serde_json::to_string_pretty(&info)
                .map_err(|e| AppError::InvalidInput(e.to_string()))?;
            println!("{json}");
        }
        Command::Get { path, output } => {
            let engine = Bootstrapper::open(config, &global.data_dir, Arc::new(ExternalWakeTimer))?;
            let bytes = engine.get_asset_handle(&path).await?;
            match output {
                Some(output) => {
                    tokio::fs::write(&output, &bytes).await?;
                    info!(
                        path = %path,
                        output = %output.display(),
                        size = %format_bytes(bytes.len() as u64),
                        "Asset written"
                    );
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
            }
        }
        Command::Reset => {
            let engine = Bootstrapper::open(config, &global.data_dir, Arc::new(ExternalWakeTimer))?;
            engine.reset().await?;
            info!("Asset store reset");
        }
        Command::Watch { interval } => {
            watch(config, global, Duration::from_secs(interval.max(1))).await?;
        }
    }

    Ok(())
}

fn build_config(global: &GlobalArgs) -> Result<SyncConfig, AppError> {
    let manifest_url = global
        .manifest_url
        .clone()
        .ok_or_else(|| AppError::InvalidInput("--manifest-url is required".to_string()))?;
    let version = global
        .version_tag
        .clone()
        .ok_or_else(|| AppError::InvalidInput("--version-tag is required".to_string()))?;

    let mut builder = SyncConfig::builder(version, manifest_url)
        .with_download_concurrency(global.concurrency)
        .with_timeout(Duration::from_secs(global.timeout))
        .with_connect_timeout(Duration::from_secs(global.connect_timeout))
        .with_read_timeout(Duration::from_secs(global.read_timeout))
        .with_headers(utils::parse_headers(&global.headers)?)
        .with_max_attempts(global.max_attempts)
        .with_retry_base_delay(Duration::from_secs(global.retry_delay))
        .with_fallback_max_age(
            (global.fallback_max_age > 0)
                .then(|| Duration::from_secs(global.fallback_max_age * 60 * 60)),
        );

    if global.no_proxy {
        info!("All proxy settings disabled (--no-proxy flag)");
        builder = builder.with_system_proxy(false);
    } else if let Some(proxy_url) = global.proxy.as_ref() {
        let mut proxy = ProxyConfig::new(proxy_url.clone(), global.proxy_type);
        if let (Some(username), Some(password)) = (&global.proxy_user, &global.proxy_pass) {
            proxy = proxy.with_auth(username.clone(), password.clone());
        }

        info!(
            proxy_url = %proxy_url,
            proxy_type = ?global.proxy_type,
            has_auth = proxy.auth.is_some(),
            "Using explicit proxy configuration for downloads"
        );
        builder = builder.with_proxy(proxy);
    } else {
        builder = builder.with_system_proxy(global.use_system_proxy);
    }

    Ok(builder.build())
}

async fn report_status(engine: &Bootstrapper) -> Result<(), AppError> {
    let info = engine.debug_info().await?;
    match &info.state.error {
        Some(err) => warn!(
            phase = %info.state.phase,
            code = %err.code,
            next_retry_at = ?info.state.next_retry_at,
            "Assets not ready"
        ),
        None => info!(
            phase = %info.state.phase,
            version = ?info.state.version,
            ready = info.state.ready,
            "Asset status"
        ),
    }
    Ok(())
}

/// Long-running host: the in-process timer fires due retries, and the
/// persisted schedule is polled in case the clock jumped.
async fn watch(config: SyncConfig, global: &GlobalArgs, interval: Duration) -> Result<(), AppError> {
    let timer = Arc::new(PollingWakeTimer::new());
    let timer_task = timer.clone().spawn();
    let engine = Bootstrapper::open(config, &global.data_dir, timer as Arc<dyn WakeTimer>)?;

    if let Err(e) = engine.initialize(InitReason::Startup).await {
        warn!(error = %e, "Startup bootstrap failed");
    }

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.resume_pending_retry().await {
                    Ok(true) => info!("Scheduled retry completed"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Scheduled retry failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping watch");
                break;
            }
        }
    }

    timer_task.abort();
    report_status(&engine).await
}

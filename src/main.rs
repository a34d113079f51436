use clap::Parser;
use studio_bootstrap::utils::error::BootstrapError;
use studio_bootstrap::utils::logger;
use studio_bootstrap::{BootstrapConfig, BootstrapEngine, CliConfig};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let cli = CliConfig::parse();

    // 初始化日誌
    logger::init_logger(cli.verbose, cli.log_format);

    tracing::info!("🚀 Starting studio-bootstrap");
    tracing::info!("📁 Loading configuration from: {}", cli.config);
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    let exit_code = match run(&cli).await {
        Ok(()) => 0,
        Err(e) => {
            // 記錄詳細錯誤信息
            tracing::error!(
                "❌ Bootstrap failed: {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );
            tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());
            e.exit_code()
        }
    };

    std::process::exit(exit_code);
}

async fn run(cli: &CliConfig) -> Result<(), BootstrapError> {
    let config = BootstrapConfig::from_file(&cli.config)?;
    let engine = BootstrapEngine::new(config, cli.launch_mode.as_deref())?.with_monitoring(cli.monitor);

    if cli.monitor {
        tracing::info!("🔍 System monitoring enabled");
    }

    if cli.dry_run {
        tracing::info!("🔍 DRY RUN MODE - nothing will be linked, fetched or launched");
        let summary = engine.validate_only().await?;
        println!("📋 Profile: {}", summary.profile);
        println!("  Manifest entries: {}", summary.entries);
        match (summary.missing, summary.missing_bytes) {
            (Some(missing), Some(bytes)) => {
                println!("  Missing: {} ({:.1} MB)", missing, bytes as f64 / 1024.0 / 1024.0)
            }
            _ => println!("  Missing: model root not created yet"),
        }
        for (index, layer) in summary.service_layers.iter().enumerate() {
            println!("  Layer {}: {}", index, layer.join(", "));
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    engine.run(&shutdown).await
}

/// SIGTERM 或 Ctrl-C 時取消 token
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<(), BootstrapError> {
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => tracing::info!("📨 Received SIGTERM"),
            _ = tokio::signal::ctrl_c() => tracing::info!("📨 Received SIGINT"),
        }
        shutdown.cancel();
    });

    Ok(())
}

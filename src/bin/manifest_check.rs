use anyhow::Context;
use clap::Parser;
use studio_bootstrap::utils::logger;
use studio_bootstrap::{BootstrapConfig, BootstrapEngine};

#[derive(Parser)]
#[command(name = "manifest-check")]
#[command(about = "Validates the bootstrap configuration, model manifest and service graph")]
struct Args {
    /// Path to the bootstrap TOML configuration
    #[arg(short, long, env = "BOOTSTRAP_CONFIG", default_value = "/etc/studio/bootstrap.toml")]
    config: String,

    /// Named startup profile to check
    #[arg(long, env = "LAUNCH_MODE")]
    launch_mode: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init_cli_logger(args.verbose);

    let config = BootstrapConfig::from_file(&args.config)
        .with_context(|| format!("failed to load config file '{}'", args.config))?;

    let profiles: Vec<String> = match &args.launch_mode {
        Some(profile) => vec![profile.clone()],
        None if config.profiles.is_empty() => vec![config.resolve_profile(None)?],
        None => config.profiles.keys().cloned().collect(),
    };

    for profile in profiles {
        let engine = BootstrapEngine::new(config.clone(), Some(&profile))
            .with_context(|| format!("invalid configuration for profile '{}'", profile))?;
        let summary = engine
            .validate_only()
            .await
            .with_context(|| format!("validation failed for profile '{}'", profile))?;

        println!(
            "✅ {}: {} entries, {} service layers",
            summary.profile,
            summary.entries,
            summary.service_layers.len()
        );
    }

    Ok(())
}

pub mod toml_config;

#[cfg(feature = "cli")]
use crate::utils::logger::LogFormat;
#[cfg(feature = "cli")]
use clap::Parser;

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Parser)]
#[command(name = "studio-bootstrap")]
#[command(about = "Links the model volume, provisions model assets and supervises the studio services")]
pub struct CliConfig {
    /// Path to the bootstrap TOML configuration
    #[arg(short, long, env = "BOOTSTRAP_CONFIG", default_value = "/etc/studio/bootstrap.toml")]
    pub config: String,

    /// Named startup profile (e.g. "recommended" or "minimal")
    #[arg(long, env = "LAUNCH_MODE")]
    pub launch_mode: Option<String>,

    /// Validate configuration and manifest without linking, fetching or launching
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long, help = "Log process and volume statistics between startup phases")]
    pub monitor: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,
}

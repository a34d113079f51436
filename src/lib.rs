pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;

pub use config::toml_config::BootstrapConfig;
pub use core::{
    engine::{BootstrapEngine, ValidationSummary},
    fetcher::HttpFetcher,
    manifest::{Manifest, Resolver},
    provisioning::{ProvisioningCoordinator, ProvisioningReport},
    storage_link::{LinkOutcome, StorageLink},
    supervisor::{ServiceSupervisor, SupervisorEvent, SupervisorHandle},
};
pub use utils::error::{BootstrapError, Result};

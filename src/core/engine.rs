use crate::config::toml_config::BootstrapConfig;
use crate::core::fetcher::HttpFetcher;
use crate::core::manifest::Manifest;
use crate::core::provisioning::ProvisioningCoordinator;
use crate::core::storage_link::StorageLink;
use crate::core::supervisor::{ServiceSupervisor, SupervisorEvent};
use crate::domain::model::SourceDescriptor;
use crate::domain::ports::AssetFetch;
use crate::utils::error::Result;
use crate::utils::monitor::SystemMonitor;
use crate::utils::validation::{self, Validate};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// `validate_only` 的結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationSummary {
    pub profile: String,
    pub entries: usize,
    /// 模型目錄不存在時為 `None`
    pub missing: Option<usize>,
    pub missing_bytes: Option<u64>,
    pub service_layers: Vec<Vec<String>>,
}

/// 容器入口：連結 volume、準備模型、啟動並監管服務
pub struct BootstrapEngine {
    config: BootstrapConfig,
    profile: String,
    fetcher: Arc<dyn AssetFetch>,
    monitor: Option<SystemMonitor>,
    events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
}

impl BootstrapEngine {
    pub fn new(config: BootstrapConfig, launch_mode: Option<&str>) -> Result<Self> {
        config.validate()?;
        let profile = config.resolve_profile(launch_mode)?;
        let fetcher = Arc::new(HttpFetcher::new(config.provisioning_settings())?);

        Ok(Self {
            config,
            profile,
            fetcher,
            monitor: None,
            events: None,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn AssetFetch>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// 啟用或禁用系統監控
    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitor = enabled.then(|| SystemMonitor::new(true).with_volume(self.config.volume_root()));
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    fn load_manifest(&self) -> Result<Manifest> {
        let path = self.config.manifest_path();
        tracing::info!("📁 Loading manifest from: {:?}", path);

        let manifest = Manifest::from_file(&path)?;
        let settings = self.config.provisioning_settings();
        if manifest
            .entries
            .iter()
            .any(|entry| matches!(entry.source, SourceDescriptor::ObjectStorage { .. }))
        {
            validation::validate_required_field(
                "provisioning.object_storage_endpoint",
                &settings.object_storage_endpoint,
            )?;
        }
        manifest.validate(&settings)?;
        tracing::info!("✅ Manifest valid: {} entries", manifest.entries.len());
        Ok(manifest)
    }

    fn build_supervisor(&self) -> Result<ServiceSupervisor> {
        let services = self.config.services_for_profile(&self.profile)?;
        let supervisor = ServiceSupervisor::new(services, self.config.supervisor_settings())?;

        Ok(match &self.events {
            Some(events) => supervisor.with_events(events.clone()),
            None => supervisor,
        })
    }

    fn log_phase(&self, phase: &str) {
        if let Some(monitor) = &self.monitor {
            monitor.log_stats(phase);
        }
    }

    /// 只做驗證，不建立連結、不下載、不啟動任何服務
    pub async fn validate_only(&self) -> Result<ValidationSummary> {
        let manifest = self.load_manifest()?;
        let supervisor = self.build_supervisor()?;
        let root = self.config.model_root();

        let plan = if root.exists() {
            let coordinator =
                ProvisioningCoordinator::new(Arc::clone(&self.fetcher), self.config.provisioning_settings());
            Some(coordinator.plan(&manifest, root, &self.profile).await?)
        } else {
            tracing::info!("ℹ️ Model root {:?} does not exist yet, skipping resolution", root);
            None
        };

        Ok(ValidationSummary {
            profile: self.profile.clone(),
            entries: manifest.entries_for_profile(&self.profile).count(),
            missing: plan.as_ref().map(|p| p.missing.len()),
            missing_bytes: plan.as_ref().map(|p| p.missing_bytes()),
            service_layers: supervisor.layers().to_vec(),
        })
    }

    /// 執行到收到關機訊號或發生致命錯誤為止
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<()> {
        tracing::info!("🚀 Bootstrapping profile '{}'", self.profile);
        self.log_phase("Startup");

        // 任何副作用之前先驗證 manifest 與服務圖
        let manifest = self.load_manifest()?;
        let supervisor = self.build_supervisor()?;

        let link = StorageLink::new(self.config.model_root(), self.config.volume_root());
        let outcome = link.establish()?;
        tracing::info!(
            "🔗 Storage link {:?} → {:?}: {:?}",
            link.logical(),
            link.physical(),
            outcome
        );

        let coordinator =
            ProvisioningCoordinator::new(Arc::clone(&self.fetcher), self.config.provisioning_settings());
        let report = coordinator
            .provision(&manifest, link.logical(), &self.profile, shutdown)
            .await?;
        tracing::info!(
            "📦 {} assets fetched, {} already present",
            report.fetched(),
            report.already_present.len()
        );
        self.log_phase("Provisioning completed");

        let mut handle = supervisor.launch(shutdown).await?;
        self.log_phase("Services ready");

        let result = handle.monitor().await;
        handle.shutdown().await;
        self.log_phase("Shutdown");

        match result {
            Ok(()) => {
                tracing::info!("👋 Clean shutdown");
                Ok(())
            }
            Err(e) => {
                tracing::error!("❌ Mandatory service '{}' failed: {}", e.service(), e);
                Err(e.into())
            }
        }
    }
}

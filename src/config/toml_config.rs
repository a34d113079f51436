use crate::domain::model::ServiceSpec;
use crate::utils::backoff::Backoff;
use crate::utils::error::{BootstrapError, Result};
use crate::utils::validation::{self, Validate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 未指定任何設定檔時使用的名稱 (啟動全部服務)
pub const FALLBACK_PROFILE: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub paths: PathsConfig,
    pub provisioning: Option<ProvisioningConfig>,
    pub supervisor: Option<SupervisorConfig>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
    pub default_profile: Option<String>,
    /// 設定檔所在目錄，用來解析相對路徑
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// 服務與 fetcher 看到的邏輯模型目錄
    pub model_root: String,
    /// 持久化 volume 上的實體目錄
    pub volume_root: String,
    pub manifest: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    pub max_concurrent: Option<usize>,
    pub retry_attempts: Option<u32>,
    pub retry_initial_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub progress_interval_ms: Option<u64>,
    pub connect_timeout_seconds: Option<u64>,
    pub stall_timeout_seconds: Option<u64>,
    pub repository_endpoint: Option<String>,
    pub repository_token: Option<String>,
    pub object_storage_endpoint: Option<String>,
    pub retry_failed_passes: Option<u32>,
    pub write_report: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub shutdown_grace_seconds: Option<u64>,
    pub restart_initial_delay_ms: Option<u64>,
    pub restart_max_delay_ms: Option<u64>,
    pub restart_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub description: Option<String>,
    pub services: Vec<String>,
}

/// Fetcher 與 coordinator 實際使用的設定值
#[derive(Debug, Clone)]
pub struct ProvisioningSettings {
    pub max_concurrent: usize,
    pub retry_attempts: u32,
    pub backoff: Backoff,
    pub progress_interval: Duration,
    pub connect_timeout: Duration,
    pub stall_timeout: Duration,
    pub repository_endpoint: String,
    pub repository_token: Option<String>,
    pub object_storage_endpoint: Option<String>,
    pub retry_failed_passes: u32,
    pub write_report: bool,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        ProvisioningConfig::default().settings()
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub shutdown_grace: Duration,
    pub restart_backoff: Backoff,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorConfig::default().settings()
    }
}

impl ProvisioningConfig {
    pub fn settings(&self) -> ProvisioningSettings {
        ProvisioningSettings {
            max_concurrent: self.max_concurrent.unwrap_or(3),
            retry_attempts: self.retry_attempts.unwrap_or(5),
            backoff: Backoff::new(
                Duration::from_millis(self.retry_initial_delay_ms.unwrap_or(1000)),
                Duration::from_millis(self.retry_max_delay_ms.unwrap_or(30_000)),
                2.0,
            ),
            progress_interval: Duration::from_millis(self.progress_interval_ms.unwrap_or(2000)),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds.unwrap_or(30)),
            stall_timeout: Duration::from_secs(self.stall_timeout_seconds.unwrap_or(120)),
            repository_endpoint: self
                .repository_endpoint
                .clone()
                .unwrap_or_else(|| "https://huggingface.co".to_string()),
            repository_token: self
                .repository_token
                .clone()
                .filter(|token| !token.is_empty() && !is_unresolved_placeholder(token)),
            object_storage_endpoint: self.object_storage_endpoint.clone(),
            retry_failed_passes: self.retry_failed_passes.unwrap_or(0),
            write_report: self.write_report.unwrap_or(true),
        }
    }
}

impl SupervisorConfig {
    pub fn settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            shutdown_grace: Duration::from_secs(self.shutdown_grace_seconds.unwrap_or(10)),
            restart_backoff: Backoff::new(
                Duration::from_millis(self.restart_initial_delay_ms.unwrap_or(1000)),
                Duration::from_millis(self.restart_max_delay_ms.unwrap_or(60_000)),
                self.restart_multiplier.unwrap_or(2.0),
            ),
        }
    }
}

/// 環境變數未設定時會保留 `${VAR}` 原樣
fn is_unresolved_placeholder(value: &str) -> bool {
    value.starts_with("${") && value.ends_with('}')
}

impl BootstrapConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(BootstrapError::IoError)?;
        let mut config = Self::from_toml_str(&content)?;
        config.base_dir = path.as_ref().parent().map(Path::to_path_buf);
        Ok(config)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| BootstrapError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${HF_TOKEN})
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| BootstrapError::config("env_substitution", e.to_string()))?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        validation::validate_path("paths.model_root", &self.paths.model_root)?;
        validation::validate_path("paths.volume_root", &self.paths.volume_root)?;
        validation::validate_path("paths.manifest", &self.paths.manifest)?;

        if Path::new(&self.paths.model_root) == Path::new(&self.paths.volume_root) {
            return Err(BootstrapError::InvalidConfigValueError {
                field: "paths.volume_root".to_string(),
                value: self.paths.volume_root.clone(),
                reason: "Volume root must differ from the model root".to_string(),
            });
        }

        let provisioning = self.provisioning_settings();
        validation::validate_positive_number(
            "provisioning.max_concurrent",
            provisioning.max_concurrent,
            1,
        )?;
        validation::validate_url(
            "provisioning.repository_endpoint",
            &provisioning.repository_endpoint,
        )?;
        if let Some(endpoint) = &provisioning.object_storage_endpoint {
            validation::validate_url("provisioning.object_storage_endpoint", endpoint)?;
        }

        let supervisor = self.supervisor_settings();
        validation::validate_range(
            "supervisor.restart_multiplier",
            supervisor.restart_backoff.multiplier,
            1.0,
            10.0,
        )?;

        let mut names = HashSet::new();
        for service in &self.services {
            validation::validate_non_empty_string("services.name", &service.name)?;
            validation::validate_non_empty_string(
                &format!("services.{}.command", service.name),
                &service.command,
            )?;
            if !names.insert(service.name.as_str()) {
                return Err(BootstrapError::config(
                    "services",
                    format!("Service '{}' is declared more than once", service.name),
                ));
            }
        }

        for (profile, definition) in &self.profiles {
            for service in &definition.services {
                if !names.contains(service.as_str()) {
                    return Err(BootstrapError::config(
                        format!("profiles.{}.services", profile),
                        format!("Unknown service '{}'", service),
                    ));
                }
            }
        }

        if let Some(default_profile) = &self.default_profile {
            if !self.profiles.contains_key(default_profile) {
                return Err(BootstrapError::config(
                    "default_profile",
                    format!("Profile '{}' is not defined", default_profile),
                ));
            }
        }

        Ok(())
    }

    pub fn model_root(&self) -> &Path {
        Path::new(&self.paths.model_root)
    }

    pub fn volume_root(&self) -> &Path {
        Path::new(&self.paths.volume_root)
    }

    /// Manifest 路徑，相對路徑以設定檔目錄為基準
    pub fn manifest_path(&self) -> PathBuf {
        let manifest = Path::new(&self.paths.manifest);
        match &self.base_dir {
            Some(base) if manifest.is_relative() => base.join(manifest),
            _ => manifest.to_path_buf(),
        }
    }

    pub fn provisioning_settings(&self) -> ProvisioningSettings {
        self.provisioning.clone().unwrap_or_default().settings()
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        self.supervisor.clone().unwrap_or_default().settings()
    }

    /// 決定實際使用的設定檔：命令列 > default_profile > 全部服務
    pub fn resolve_profile(&self, requested: Option<&str>) -> Result<String> {
        match requested {
            Some(name) if self.profiles.contains_key(name) => Ok(name.to_string()),
            Some(name) if self.profiles.is_empty() && name == FALLBACK_PROFILE => {
                Ok(name.to_string())
            }
            Some(name) => Err(BootstrapError::InvalidConfigValueError {
                field: "launch_mode".to_string(),
                value: name.to_string(),
                reason: format!(
                    "Unknown launch profile. Available: {}",
                    self.profiles.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
            }),
            None => Ok(self
                .default_profile
                .clone()
                .or_else(|| self.profiles.keys().next().cloned())
                .unwrap_or_else(|| FALLBACK_PROFILE.to_string())),
        }
    }

    /// 取得設定檔啟用的服務；被選服務的相依服務也必須在同一設定檔內
    pub fn services_for_profile(&self, profile: &str) -> Result<Vec<ServiceSpec>> {
        let selected: Vec<ServiceSpec> = match self.profiles.get(profile) {
            Some(definition) => self
                .services
                .iter()
                .filter(|service| definition.services.contains(&service.name))
                .cloned()
                .collect(),
            None if self.profiles.is_empty() => self.services.clone(),
            None => {
                return Err(BootstrapError::config(
                    "launch_mode",
                    format!("Profile '{}' is not defined", profile),
                ))
            }
        };

        let names: HashSet<&str> = selected.iter().map(|s| s.name.as_str()).collect();
        for service in &selected {
            for dependency in &service.depends_on {
                if !names.contains(dependency.as_str()) {
                    return Err(BootstrapError::config(
                        format!("profiles.{}.services", profile),
                        format!(
                            "Service '{}' depends on '{}', which the profile does not enable",
                            service.name, dependency
                        ),
                    ));
                }
            }
        }

        Ok(selected)
    }
}

impl Validate for BootstrapConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

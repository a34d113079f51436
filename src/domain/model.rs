use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// 模型檔案的來源 (來源種類 + 定位資訊)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceDescriptor {
    /// 直接的 HTTP(S) 下載網址
    Url { url: String },
    /// 物件儲存 (以 path-style 對應到 `object_storage_endpoint`)
    ObjectStorage { bucket: String, key: String },
    /// 版本化模型倉庫，例如 `owner/model` 的某個 revision
    Repository {
        repo: String,
        file: String,
        #[serde(default = "default_revision")]
        revision: String,
    },
    /// 映像檔內已存在的本機檔案
    File { path: PathBuf },
}

fn default_revision() -> String {
    "main".to_string()
}

impl SourceDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceDescriptor::Url { .. } => "url",
            SourceDescriptor::ObjectStorage { .. } => "object_storage",
            SourceDescriptor::Repository { .. } => "repository",
            SourceDescriptor::File { .. } => "file",
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    /// 相對於模型根目錄的目的地路徑
    pub path: String,
    pub source: SourceDescriptor,
    /// 預期大小 (bytes)
    pub size: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    /// 只在這些啟動設定檔下需要；未指定代表所有設定檔
    #[serde(default)]
    pub profiles: Option<Vec<String>>,
}

impl ManifestEntry {
    pub fn destination(&self, root: &Path) -> PathBuf {
        root.join(self.normalized_path())
    }

    /// 下載中的暫存檔，與目的地位於同一個檔案系統
    pub fn temp_path(&self, root: &Path) -> PathBuf {
        let mut destination = self.destination(root).into_os_string();
        destination.push(".part");
        PathBuf::from(destination)
    }

    /// 去除 `.` 與多餘分隔符後的路徑，用來偵測重複的目的地
    pub fn normalized_path(&self) -> String {
        Path::new(&self.path)
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn applies_to(&self, profile: &str) -> bool {
        self.profiles
            .as_ref()
            .map(|profiles| profiles.iter().any(|p| p == profile))
            .unwrap_or(true)
    }
}

/// 單一 manifest 項目在一次 provisioning 中的狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    Pending,
    Downloading,
    Verifying,
    Present,
    Failed,
}

impl ProvisioningState {
    fn rank(self) -> u8 {
        match self {
            ProvisioningState::Pending => 0,
            ProvisioningState::Downloading => 1,
            ProvisioningState::Verifying => 2,
            ProvisioningState::Present | ProvisioningState::Failed => 3,
        }
    }

    /// 只允許向前推進；唯一例外是明確重試時的 `failed → pending`
    pub fn can_transition_to(self, next: ProvisioningState) -> bool {
        match (self, next) {
            (ProvisioningState::Failed, ProvisioningState::Pending) => true,
            (ProvisioningState::Present, _) | (ProvisioningState::Failed, _) => false,
            (_, ProvisioningState::Failed) => true,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisioningState::Pending => "pending",
            ProvisioningState::Downloading => "downloading",
            ProvisioningState::Verifying => "verifying",
            ProvisioningState::Present => "present",
            ProvisioningState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    #[default]
    OnFailure,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeCheck {
    /// 行程啟動即視為就緒
    #[default]
    None,
    Tcp {
        #[serde(default = "default_probe_host")]
        host: String,
        port: u16,
    },
    /// 回傳 2xx 即就緒
    Http { url: String },
    /// 檔案出現即就緒
    File { path: PathBuf },
}

fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}

fn default_probe_interval_ms() -> u64 {
    1000
}

fn default_probe_timeout_seconds() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessProbe {
    #[serde(flatten)]
    pub check: ProbeCheck,
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            check: ProbeCheck::None,
            interval_ms: default_probe_interval_ms(),
            timeout_seconds: default_probe_timeout_seconds(),
        }
    }
}

impl ReadinessProbe {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_max_restarts() -> u32 {
    5
}

/// 一個受監管的長駐服務
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub readiness: ReadinessProbe,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// 失敗時是否中止整個容器
    #[serde(default)]
    pub mandatory: bool,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            depends_on: Vec::new(),
            readiness: ReadinessProbe::default(),
            restart: RestartPolicy::default(),
            max_restarts: default_max_restarts(),
            mandatory: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    NotStarted,
    Starting,
    Ready,
    Degraded,
    Exited,
    Crashed,
}

impl ServiceState {
    /// 沒有行程在執行中
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            ServiceState::NotStarted | ServiceState::Exited | ServiceState::Crashed
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::NotStarted => "not_started",
            ServiceState::Starting => "starting",
            ServiceState::Ready => "ready",
            ServiceState::Degraded => "degraded",
            ServiceState::Exited => "exited",
            ServiceState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

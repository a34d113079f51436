use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// 頂層錯誤：只有入口程式 (main) 決定如何結束行程
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Configuration error in '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Storage link error: {0}")]
    Link(#[from] LinkError),

    #[error("Provisioning failed: {} required entries could not be fetched", .failures.len())]
    ProvisioningFailed { failures: Vec<EntryFailure> },

    #[error("Service error: {0}")]
    Service(#[from] ServiceStartError),

    #[error("Startup interrupted by termination signal")]
    Interrupted,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Manifest 解析與驗證錯誤，必定在任何傳輸開始前被發現
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("failed to parse manifest: {message}")]
    Parse { message: String },

    #[error("entries '{first}' and '{second}' both write to '{path}'")]
    DuplicatePath {
        path: String,
        first: String,
        second: String,
    },

    #[error("entry id '{id}' is declared more than once")]
    DuplicateId { id: String },

    #[error("entry '{id}' is invalid: {reason}")]
    InvalidEntry { id: String, reason: String },
}

/// 單次傳輸失敗
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("transient transfer failure: {message}")]
    Transient { message: String },

    #[error("transfer rejected: {message}")]
    Permanent { message: String },
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transient { .. })
    }

    /// 依 reqwest 錯誤種類判斷是否值得重試
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            TransferError::Transient {
                message: err.to_string(),
            }
        } else {
            TransferError::Permanent {
                message: err.to_string(),
            }
        }
    }

    pub fn from_status(status: reqwest::StatusCode, url: &str) -> Self {
        let message = format!("{} returned HTTP {}", url, status);
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            TransferError::Transient { message }
        } else {
            TransferError::Permanent { message }
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Transient {
            message: err.to_string(),
        }
    }
}

/// 傳輸完成後的完整性驗證失敗
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("source cannot be resolved: {reason}")]
    Source { reason: String },

    #[error("cancelled")]
    Cancelled,
}

/// 儲存連結無法建立：後續所有步驟都無法進行
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("cannot create volume directory {path:?}: {source}")]
    CreateVolume {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("volume directory {path:?} is not writable: {source}")]
    NotWritable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{logical:?} already links to {found:?}, expected {expected:?}")]
    Conflict {
        logical: PathBuf,
        expected: PathBuf,
        found: PathBuf,
    },

    #[error("{logical:?} exists and is not an empty directory or link")]
    Occupied { logical: PathBuf },

    #[error("cannot create link {logical:?}: {source}")]
    CreateLink {
        logical: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceStartError {
    #[error("service '{service}' failed to spawn: {message}")]
    Spawn { service: String, message: String },

    #[error("service '{service}' was not ready within {timeout:?}")]
    ReadinessTimeout { service: String, timeout: Duration },

    #[error("service '{service}' crashed {restarts} time(s) and exhausted its restart budget")]
    CrashLoop { service: String, restarts: u32 },

    #[error("service '{service}' stopped before it became ready")]
    EndedBeforeReady { service: String },
}

impl ServiceStartError {
    pub fn service(&self) -> &str {
        match self {
            ServiceStartError::Spawn { service, .. }
            | ServiceStartError::ReadinessTimeout { service, .. }
            | ServiceStartError::CrashLoop { service, .. }
            | ServiceStartError::EndedBeforeReady { service } => service,
        }
    }
}

/// 某個 manifest 項目最終失敗的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub id: String,
    pub path: String,
    pub error: FetchError,
}

impl fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.id, self.path, self.error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Storage,
    Provisioning,
    Service,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl BootstrapError {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        BootstrapError::ConfigValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            BootstrapError::ConfigValidationError { .. }
            | BootstrapError::InvalidConfigValueError { .. }
            | BootstrapError::MissingConfigError { .. }
            | BootstrapError::Manifest(_) => ErrorCategory::Configuration,
            BootstrapError::Link(_) => ErrorCategory::Storage,
            BootstrapError::ProvisioningFailed { .. } | BootstrapError::HttpError(_) => {
                ErrorCategory::Provisioning
            }
            BootstrapError::Service(_) => ErrorCategory::Service,
            BootstrapError::Interrupted
            | BootstrapError::IoError(_)
            | BootstrapError::SerializationError(_) => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            BootstrapError::Interrupted => ErrorSeverity::Low,
            BootstrapError::Service(_) | BootstrapError::ProvisioningFailed { .. } => {
                ErrorSeverity::High
            }
            BootstrapError::Link(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Medium,
        }
    }

    /// 行程結束代碼：區分 provisioning 失敗與服務失敗
    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::ProvisioningFailed { .. } | BootstrapError::HttpError(_) => 2,
            BootstrapError::Service(_) => 3,
            BootstrapError::Interrupted => 130,
            _ => 1,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Configuration => {
                "Check the bootstrap configuration and manifest files, then restart the container"
            }
            ErrorCategory::Storage => {
                "Verify the persistent volume is mounted and writable and that the model root is not already in use"
            }
            ErrorCategory::Provisioning => {
                "Check network access and source credentials; partial downloads resume on the next start"
            }
            ErrorCategory::Service => {
                "Inspect the service logs above; the failing service is marked mandatory"
            }
            ErrorCategory::System => "Retry the operation; if it persists check host resources",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            BootstrapError::ProvisioningFailed { failures } => {
                let mut message = format!("{}:", self);
                for failure in failures {
                    message.push_str(&format!("\n  - {}", failure));
                }
                message
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BootstrapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinguish_failure_kinds() {
        let provisioning = BootstrapError::ProvisioningFailed { failures: vec![] };
        let service = BootstrapError::Service(ServiceStartError::CrashLoop {
            service: "backend".to_string(),
            restarts: 3,
        });
        let config = BootstrapError::config("paths.model_root", "empty");

        assert_eq!(provisioning.exit_code(), 2);
        assert_eq!(service.exit_code(), 3);
        assert_eq!(config.exit_code(), 1);
        assert_eq!(BootstrapError::Interrupted.exit_code(), 130);
    }

    #[test]
    fn test_status_classification() {
        assert!(TransferError::from_status(reqwest::StatusCode::BAD_GATEWAY, "u").is_transient());
        assert!(TransferError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "u").is_transient());
        assert!(!TransferError::from_status(reqwest::StatusCode::NOT_FOUND, "u").is_transient());
        assert!(!TransferError::from_status(reqwest::StatusCode::UNAUTHORIZED, "u").is_transient());
    }

    #[test]
    fn test_user_friendly_message_lists_failed_entries() {
        let err = BootstrapError::ProvisioningFailed {
            failures: vec![EntryFailure {
                id: "sdxl".to_string(),
                path: "checkpoints/sdxl.safetensors".to_string(),
                error: FetchError::Integrity(IntegrityError::SizeMismatch {
                    expected: 10,
                    actual: 4,
                }),
            }],
        };

        let message = err.user_friendly_message();
        assert!(message.contains("1 required entries could not be fetched"));
        assert!(message.contains("sdxl (checkpoints/sdxl.safetensors)"));
        assert!(message.contains("expected 10 bytes, got 4"));
    }
}

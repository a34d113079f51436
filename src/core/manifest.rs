use crate::config::toml_config::ProvisioningSettings;
use crate::domain::model::{ManifestEntry, SourceDescriptor};
use crate::utils::error::{BootstrapError, ManifestError, Result};
use crate::utils::validation;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;

/// 宣告需要的模型檔案清單
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    /// 依副檔名載入 TOML 或 JSON manifest
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let manifest = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }?;
        Ok(manifest)
    }

    pub fn from_toml_str(content: &str) -> std::result::Result<Self, ManifestError> {
        toml::from_str(content).map_err(|e| ManifestError::Parse {
            message: e.to_string(),
        })
    }

    pub fn from_json_str(content: &str) -> std::result::Result<Self, ManifestError> {
        serde_json::from_str(content).map_err(|e| ManifestError::Parse {
            message: e.to_string(),
        })
    }

    /// 在任何網路動作之前檢查整份 manifest
    pub fn validate(&self, settings: &ProvisioningSettings) -> std::result::Result<(), ManifestError> {
        check_unique(&self.entries)?;

        for entry in &self.entries {
            validate_entry(entry, settings)?;
        }

        Ok(())
    }

    pub fn entries_for_profile<'a>(&'a self, profile: &'a str) -> impl Iterator<Item = &'a ManifestEntry> + 'a {
        self.entries.iter().filter(move |entry| entry.applies_to(profile))
    }
}

/// 重複的 id 或目的地路徑都是 manifest 錯誤
fn check_unique(entries: &[ManifestEntry]) -> std::result::Result<(), ManifestError> {
    let mut ids: HashSet<&str> = HashSet::new();
    let mut paths: HashMap<String, &str> = HashMap::new();

    for entry in entries {
        if !ids.insert(entry.id.as_str()) {
            return Err(ManifestError::DuplicateId {
                id: entry.id.clone(),
            });
        }

        let normalized = entry.normalized_path();
        if let Some(first) = paths.insert(normalized.clone(), entry.id.as_str()) {
            return Err(ManifestError::DuplicatePath {
                path: normalized,
                first: first.to_string(),
                second: entry.id.clone(),
            });
        }
    }

    Ok(())
}

fn validate_entry(
    entry: &ManifestEntry,
    settings: &ProvisioningSettings,
) -> std::result::Result<(), ManifestError> {
    let invalid = |reason: String| ManifestError::InvalidEntry {
        id: entry.id.clone(),
        reason,
    };
    let field_error = |err: BootstrapError| invalid(err.to_string());

    validation::validate_non_empty_string("id", &entry.id).map_err(field_error)?;
    validation::validate_relative_path("path", &entry.path).map_err(field_error)?;

    if entry.normalized_path().is_empty() {
        return Err(invalid("path does not name a file".to_string()));
    }
    if entry.path.ends_with(".part") {
        return Err(invalid("'.part' is reserved for in-progress downloads".to_string()));
    }
    if entry.size == 0 {
        return Err(invalid("size must be greater than zero".to_string()));
    }
    if let Some(digest) = &entry.sha256 {
        validation::validate_sha256("sha256", digest).map_err(field_error)?;
    }

    match &entry.source {
        SourceDescriptor::Url { url } => {
            validation::validate_url("source.url", url).map_err(field_error)?;
        }
        SourceDescriptor::ObjectStorage { bucket, key } => {
            validation::validate_non_empty_string("source.bucket", bucket).map_err(field_error)?;
            validation::validate_non_empty_string("source.key", key).map_err(field_error)?;
            if settings.object_storage_endpoint.is_none() {
                return Err(invalid(
                    "object storage source requires provisioning.object_storage_endpoint".to_string(),
                ));
            }
        }
        SourceDescriptor::Repository {
            repo,
            file,
            revision,
        } => {
            if !repo.contains('/') || repo.starts_with('/') || repo.ends_with('/') {
                return Err(invalid(format!(
                    "repository '{}' must look like 'owner/name'",
                    repo
                )));
            }
            validation::validate_relative_path("source.file", file).map_err(field_error)?;
            validation::validate_non_empty_string("source.revision", revision)
                .map_err(field_error)?;
        }
        SourceDescriptor::File { path } => {
            if !path.is_absolute() {
                return Err(invalid(format!(
                    "local source {:?} must be an absolute path",
                    path
                )));
            }
        }
    }

    Ok(())
}

/// 某個項目為何需要下載
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingReason {
    Absent,
    SizeMismatch { actual: u64 },
    ChecksumMismatch,
    NotAFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub entry: ManifestEntry,
    pub reason: MissingReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverReport {
    pub missing: Vec<Resolution>,
    pub present: Vec<String>,
}

impl ResolverReport {
    pub fn missing_bytes(&self) -> u64 {
        self.missing.iter().map(|r| r.entry.size).sum()
    }
}

/// 比對 manifest 與目的地目錄，只讀取、不修改任何檔案
pub struct Resolver;

impl Resolver {
    pub fn resolve(manifest: &Manifest, root: &Path, profile: &str) -> Result<ResolverReport> {
        check_unique(&manifest.entries)?;

        let mut report = ResolverReport::default();
        for entry in manifest.entries_for_profile(profile) {
            match Self::probe(entry, root)? {
                Some(reason) => {
                    tracing::debug!("🔎 {} needs fetching: {:?}", entry.id, reason);
                    report.missing.push(Resolution {
                        entry: entry.clone(),
                        reason,
                    });
                }
                None => report.present.push(entry.id.clone()),
            }
        }

        Ok(report)
    }

    pub fn missing(manifest: &Manifest, root: &Path, profile: &str) -> Result<Vec<Resolution>> {
        Ok(Self::resolve(manifest, root, profile)?.missing)
    }

    /// `None` 代表檔案已就位
    fn probe(entry: &ManifestEntry, root: &Path) -> Result<Option<MissingReason>> {
        let destination = entry.destination(root);

        let metadata = match std::fs::metadata(&destination) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Some(MissingReason::Absent))
            }
            Err(e) => return Err(BootstrapError::IoError(e)),
        };

        if !metadata.is_file() {
            return Ok(Some(MissingReason::NotAFile));
        }
        if metadata.len() != entry.size {
            return Ok(Some(MissingReason::SizeMismatch {
                actual: metadata.len(),
            }));
        }

        // checksum 驗證只在項目有宣告時才做
        if let Some(expected) = &entry.sha256 {
            let actual = sha256_file(&destination)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Ok(Some(MissingReason::ChecksumMismatch));
            }
        }

        Ok(None)
    }
}

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

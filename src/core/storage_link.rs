use crate::utils::error::LinkError;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const PROBE_FILE_NAME: &str = ".studio-bootstrap-write-probe";

/// `establish` 的結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Created,
    AlreadyLinked,
    /// 原本是空目錄，已被連結取代
    Replaced,
}

/// 邏輯模型目錄 → 持久化 volume 上的實體目錄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLink {
    logical: PathBuf,
    physical: PathBuf,
}

impl StorageLink {
    pub fn new(logical: impl Into<PathBuf>, physical: impl Into<PathBuf>) -> Self {
        Self {
            logical: logical.into(),
            physical: physical.into(),
        }
    }

    pub fn logical(&self) -> &Path {
        &self.logical
    }

    pub fn physical(&self) -> &Path {
        &self.physical
    }

    /// 建立實體目錄並把邏輯路徑指向它；已存在且正確時不做任何事
    pub fn establish(&self) -> Result<LinkOutcome, LinkError> {
        self.prepare_volume()?;

        let metadata = match fs::symlink_metadata(&self.logical) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.create_link()?;
                tracing::info!("🔗 Linked {:?} → {:?}", self.logical, self.physical);
                return Ok(LinkOutcome::Created);
            }
            Err(source) => {
                return Err(LinkError::CreateLink {
                    logical: self.logical.clone(),
                    source,
                })
            }
        };

        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&self.logical).map_err(|source| LinkError::CreateLink {
                logical: self.logical.clone(),
                source,
            })?;

            if self.points_to_volume(&target) {
                tracing::debug!("🔗 {:?} already linked", self.logical);
                return Ok(LinkOutcome::AlreadyLinked);
            }
            return Err(LinkError::Conflict {
                logical: self.logical.clone(),
                expected: self.physical.clone(),
                found: target,
            });
        }

        if metadata.is_dir() && is_empty_dir(&self.logical) {
            tracing::warn!(
                "⚠️ Replacing empty directory {:?} with a link to {:?}",
                self.logical,
                self.physical
            );
            fs::remove_dir(&self.logical).map_err(|source| LinkError::CreateLink {
                logical: self.logical.clone(),
                source,
            })?;
            self.create_link()?;
            return Ok(LinkOutcome::Replaced);
        }

        Err(LinkError::Occupied {
            logical: self.logical.clone(),
        })
    }

    fn prepare_volume(&self) -> Result<(), LinkError> {
        fs::create_dir_all(&self.physical).map_err(|source| LinkError::CreateVolume {
            path: self.physical.clone(),
            source,
        })?;

        let probe = self.physical.join(PROBE_FILE_NAME);
        fs::write(&probe, b"ok")
            .and_then(|_| fs::remove_file(&probe))
            .map_err(|source| LinkError::NotWritable {
                path: self.physical.clone(),
                source,
            })
    }

    fn create_link(&self) -> Result<(), LinkError> {
        let to_link_error = |source: std::io::Error| LinkError::CreateLink {
            logical: self.logical.clone(),
            source,
        };

        if let Some(parent) = self.logical.parent() {
            fs::create_dir_all(parent).map_err(to_link_error)?;
        }
        std::os::unix::fs::symlink(&self.physical, &self.logical).map_err(to_link_error)
    }

    fn points_to_volume(&self, target: &Path) -> bool {
        if target == self.physical {
            return true;
        }
        // 相對連結或路徑寫法不同時，比較正規化後的結果
        match (fs::canonicalize(&self.logical), fs::canonicalize(&self.physical)) {
            (Ok(resolved), Ok(physical)) => resolved == physical,
            _ => false,
        }
    }
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

use anyhow::Result;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use studio_bootstrap::core::provisioning::REPORT_FILE_NAME;
use studio_bootstrap::domain::model::{ManifestEntry, ServiceState};
use studio_bootstrap::domain::ports::{AssetFetch, FetchOutcome, ProgressReporter};
use studio_bootstrap::utils::error::{FetchError, TransferError};
use studio_bootstrap::{BootstrapConfig, BootstrapEngine, BootstrapError, SupervisorEvent};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const WEIGHTS: &[u8] = b"baked-checkpoint-weights";

/// 建立一份使用本機來源與單一服務的設定
fn write_fixture(root: &Path) -> Result<BootstrapConfig> {
    let baked = root.join("image/checkpoint.safetensors");
    std::fs::create_dir_all(baked.parent().unwrap())?;
    std::fs::write(&baked, WEIGHTS)?;

    let manifest = serde_json::json!({
        "entries": [{
            "id": "checkpoint",
            "path": "checkpoints/base.safetensors",
            "size": WEIGHTS.len(),
            "source": { "kind": "file", "path": baked },
        }]
    });
    std::fs::write(root.join("manifest.json"), serde_json::to_string_pretty(&manifest)?)?;

    let marker = root.join("backend.ready");
    let config = format!(
        r#"
[paths]
model_root = "{root}/app/models"
volume_root = "{root}/workspace/models"
manifest = "manifest.json"

[supervisor]
shutdown_grace_seconds = 2

[[services]]
name = "backend"
command = "sh"
args = ["-c", "test -f {root}/app/models/checkpoints/base.safetensors && touch {marker} && exec sleep 30"]
mandatory = true
restart = "never"

[services.readiness]
kind = "file"
path = "{marker}"
interval_ms = 50
timeout_seconds = 10
"#,
        root = root.display(),
        marker = marker.display()
    );
    let path = root.join("bootstrap.toml");
    std::fs::write(&path, config)?;
    Ok(BootstrapConfig::from_file(&path)?)
}

/// 執行引擎，backend 就緒一小段時間後送出關機訊號
async fn run_until_ready(config: BootstrapConfig) -> Result<std::result::Result<(), BootstrapError>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = BootstrapEngine::new(config, None)?.with_events(tx);
    let shutdown = CancellationToken::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let SupervisorEvent::StateChanged {
                service,
                to: ServiceState::Ready,
                ..
            } = event
            {
                if service == "backend" {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    trigger.cancel();
                }
            }
        }
    });

    Ok(tokio::time::timeout(Duration::from_secs(30), engine.run(&shutdown)).await?)
}

#[tokio::test]
async fn test_full_bootstrap_links_provisions_and_launches() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = write_fixture(temp_dir.path())?;

    let result = run_until_ready(config.clone()).await?;
    tokio_test::assert_ok!(result);

    let logical = temp_dir.path().join("app/models");
    let physical = temp_dir.path().join("workspace/models");
    assert_eq!(std::fs::read_link(&logical)?, physical);
    assert_eq!(
        std::fs::read(physical.join("checkpoints/base.safetensors"))?,
        WEIGHTS
    );

    // 第二次啟動：連結已存在、沒有任何傳輸
    let result = run_until_ready(config).await?;
    tokio_test::assert_ok!(result);

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(physical.join(REPORT_FILE_NAME))?)?;
    assert_eq!(report["already_present"], serde_json::json!(["checkpoint"]));
    assert_eq!(report["entries"], serde_json::json!([]));
    Ok(())
}

#[tokio::test]
async fn test_conflicting_link_aborts_before_provisioning() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = write_fixture(temp_dir.path())?;

    let elsewhere = temp_dir.path().join("elsewhere");
    std::fs::create_dir_all(&elsewhere)?;
    std::fs::create_dir_all(temp_dir.path().join("app"))?;
    std::os::unix::fs::symlink(&elsewhere, temp_dir.path().join("app/models"))?;

    let engine = BootstrapEngine::new(config, None)?;
    let err = engine.run(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, BootstrapError::Link(_)));
    assert_eq!(err.exit_code(), 1);
    assert!(!elsewhere.join("checkpoints").exists());
    assert!(!temp_dir
        .path()
        .join("workspace/models/checkpoints")
        .exists());
    Ok(())
}

#[tokio::test]
async fn test_interrupt_during_provisioning_exits_with_interrupted() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = write_fixture(temp_dir.path())?;

    let engine = BootstrapEngine::new(config, None)?;
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let err = engine.run(&shutdown).await.unwrap_err();
    assert!(matches!(err, BootstrapError::Interrupted));
    assert_eq!(err.exit_code(), 130);
    Ok(())
}

/// 一律回報永久失敗的來源
#[derive(Default)]
struct UnreachableSource {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl AssetFetch for UnreachableSource {
    async fn fetch(
        &self,
        entry: &ManifestEntry,
        _root: &Path,
        _progress: &mut ProgressReporter,
        _cancel: &CancellationToken,
    ) -> std::result::Result<FetchOutcome, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TransferError::Permanent {
            message: format!("{} is unreachable", entry.id),
        }
        .into())
    }
}

#[tokio::test]
async fn test_provisioning_failure_prevents_service_launch() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = write_fixture(temp_dir.path())?;
    let fetcher = Arc::new(UnreachableSource::default());

    let engine = BootstrapEngine::new(config, None)?.with_fetcher(fetcher.clone());
    let err = engine.run(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, BootstrapError::ProvisioningFailed { .. }));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert!(temp_dir.path().join("app/models").is_symlink());
    assert!(!temp_dir.path().join("backend.ready").exists());
    Ok(())
}

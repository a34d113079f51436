use crate::config::toml_config::ProvisioningSettings;
use crate::core::manifest::{Manifest, Resolver, ResolverReport};
use crate::domain::model::{ManifestEntry, ProvisioningState};
use crate::domain::ports::{AssetFetch, FetchEvent, FetchOutcome, FetchUpdate, ProgressReporter};
use crate::utils::error::{BootstrapError, EntryFailure, FetchError, Result};
use crate::utils::monitor::available_space;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const REPORT_FILE_NAME: &str = ".provisioning-report.json";

const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    pub id: String,
    pub path: String,
    pub required: bool,
    pub size: u64,
    pub state: ProvisioningState,
    pub bytes_transferred: u64,
    pub resumed_from: u64,
    pub error: Option<String>,
}

/// 一次 provisioning 的結果，會序列化成 `.provisioning-report.json`
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningReport {
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub already_present: Vec<String>,
    pub passes: u32,
    pub entries: Vec<EntryReport>,
}

impl ProvisioningReport {
    /// 實際完成下載的項目數
    pub fn fetched(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == ProvisioningState::Present)
            .count()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.entries.iter().map(|e| e.bytes_transferred).sum()
    }

    pub fn failed(&self) -> impl Iterator<Item = &EntryReport> {
        self.entries
            .iter()
            .filter(|e| e.state == ProvisioningState::Failed)
    }

    pub fn write_to(&self, root: &Path) -> Result<PathBuf> {
        let path = root.join(REPORT_FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

/// 單一項目在執行期間的追蹤資料
struct Tracked {
    entry: ManifestEntry,
    state: ProvisioningState,
    outcome: FetchOutcome,
    error: Option<FetchError>,
}

impl Tracked {
    fn advance(&mut self, next: ProvisioningState) {
        if self.state.can_transition_to(next) {
            tracing::debug!("🔄 {}: {} → {}", self.entry.id, self.state, next);
            self.state = next;
        }
    }
}

/// 協調 Resolver 與多個並行的 fetcher
pub struct ProvisioningCoordinator {
    fetcher: Arc<dyn AssetFetch>,
    settings: ProvisioningSettings,
}

impl ProvisioningCoordinator {
    pub fn new(fetcher: Arc<dyn AssetFetch>, settings: ProvisioningSettings) -> Self {
        Self { fetcher, settings }
    }

    /// 只讀取目的地，回傳還缺哪些檔案
    pub async fn plan(&self, manifest: &Manifest, root: &Path, profile: &str) -> Result<ResolverReport> {
        let manifest = manifest.clone();
        let root = root.to_path_buf();
        let profile = profile.to_string();

        tokio::task::spawn_blocking(move || Resolver::resolve(&manifest, &root, &profile))
            .await
            .map_err(|e| BootstrapError::config("provisioning", format!("resolver task failed: {}", e)))?
    }

    pub async fn provision(
        &self,
        manifest: &Manifest,
        root: &Path,
        profile: &str,
        cancel: &CancellationToken,
    ) -> Result<ProvisioningReport> {
        let started_at = Utc::now();
        tokio::fs::create_dir_all(root).await?;

        let plan = self.plan(manifest, root, profile).await?;
        tracing::info!(
            "📋 Profile '{}': {} present, {} to fetch ({:.1} MB)",
            profile,
            plan.present.len(),
            plan.missing.len(),
            plan.missing_bytes() as f64 / MB
        );

        let mut report = ProvisioningReport {
            profile: profile.to_string(),
            started_at,
            finished_at: started_at,
            already_present: plan.present.clone(),
            passes: 0,
            entries: Vec::new(),
        };

        if plan.missing.is_empty() {
            tracing::info!("✅ All model assets already present");
            report.finished_at = Utc::now();
            self.write_report(&report, root);
            return Ok(report);
        }

        self.check_disk_space(root, plan.missing_bytes());

        let mut queue: Vec<ManifestEntry> = plan.missing.into_iter().map(|r| r.entry).collect();
        queue.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.id.cmp(&b.id)));

        let order: Vec<String> = queue.iter().map(|e| e.id.clone()).collect();
        let mut tracked: HashMap<String, Tracked> = queue
            .iter()
            .map(|entry| {
                (
                    entry.id.clone(),
                    Tracked {
                        entry: entry.clone(),
                        state: ProvisioningState::Pending,
                        outcome: FetchOutcome::default(),
                        error: None,
                    },
                )
            })
            .collect();

        let mut pending = queue;
        let mut required_failed = false;

        while !pending.is_empty() {
            report.passes += 1;
            if report.passes > 1 {
                tracing::info!(
                    "🔁 Retry pass {} for {} failed entries",
                    report.passes - 1,
                    pending.len()
                );
                for entry in &pending {
                    if let Some(t) = tracked.get_mut(&entry.id) {
                        t.advance(ProvisioningState::Pending);
                        t.error = None;
                    }
                }
            }

            required_failed = self.run_pass(pending, root, &mut tracked, cancel).await;

            if cancel.is_cancelled() || required_failed {
                break;
            }

            pending = order
                .iter()
                .filter_map(|id| tracked.get(id))
                .filter(|t| t.state == ProvisioningState::Failed)
                .map(|t| t.entry.clone())
                .collect();

            if report.passes > self.settings.retry_failed_passes {
                break;
            }
        }

        report.entries = order
            .iter()
            .filter_map(|id| tracked.get(id))
            .map(|t| EntryReport {
                id: t.entry.id.clone(),
                path: t.entry.path.clone(),
                required: t.entry.required,
                size: t.entry.size,
                state: t.state,
                bytes_transferred: t.outcome.bytes_transferred,
                resumed_from: t.outcome.resumed_from,
                error: t.error.as_ref().map(|e| e.to_string()),
            })
            .collect();
        report.finished_at = Utc::now();
        self.write_report(&report, root);

        if cancel.is_cancelled() {
            tracing::warn!("🛑 Provisioning interrupted");
            return Err(BootstrapError::Interrupted);
        }

        if required_failed {
            let failures: Vec<EntryFailure> = order
                .iter()
                .filter_map(|id| tracked.get(id))
                .filter(|t| t.entry.required)
                .filter_map(|t| match &t.error {
                    Some(FetchError::Cancelled) | None => None,
                    Some(error) => Some(EntryFailure {
                        id: t.entry.id.clone(),
                        path: t.entry.path.clone(),
                        error: error.clone(),
                    }),
                })
                .collect();
            return Err(BootstrapError::ProvisioningFailed { failures });
        }

        for failed in report.failed() {
            tracing::warn!(
                "⚠️ Optional entry {} skipped: {}",
                failed.id,
                failed.error.as_deref().unwrap_or("unknown error")
            );
        }

        tracing::info!(
            "✅ Provisioning finished: {} fetched, {:.1} MB transferred",
            report.fetched(),
            report.bytes_transferred() as f64 / MB
        );

        Ok(report)
    }

    /// 執行一輪下載，回傳是否有必要項目失敗
    async fn run_pass(
        &self,
        entries: Vec<ManifestEntry>,
        root: &Path,
        tracked: &mut HashMap<String, Tracked>,
        cancel: &CancellationToken,
    ) -> bool {
        let pass_cancel = cancel.child_token();
        let worker_count = self.settings.max_concurrent.max(1).min(entries.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(entries)));

        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<FetchUpdate>();
        let (done_tx, mut done_rx) =
            mpsc::unbounded_channel::<(String, std::result::Result<FetchOutcome, FetchError>)>();

        let mut workers = JoinSet::new();
        for worker in 0..worker_count {
            let queue = Arc::clone(&queue);
            let fetcher = Arc::clone(&self.fetcher);
            let root = root.to_path_buf();
            let pass_cancel = pass_cancel.clone();
            let update_tx = update_tx.clone();
            let done_tx = done_tx.clone();
            let interval = self.settings.progress_interval;

            workers.spawn(async move {
                loop {
                    if pass_cancel.is_cancelled() {
                        break;
                    }
                    let Some(entry) = queue.lock().await.pop_front() else {
                        break;
                    };

                    tracing::debug!("👷 Worker {} picked {}", worker, entry.id);
                    let mut reporter = ProgressReporter::new(entry.id.clone(), update_tx.clone(), interval);
                    let result = fetcher.fetch(&entry, &root, &mut reporter, &pass_cancel).await;

                    if done_tx.send((entry.id, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(update_tx);
        drop(done_tx);

        let mut required_failed = false;
        loop {
            tokio::select! {
                Some(update) = update_rx.recv() => apply_update(tracked, update),
                done = done_rx.recv() => {
                    let Some((id, result)) = done else { break };
                    let Some(t) = tracked.get_mut(&id) else { continue };

                    match result {
                        Ok(outcome) => {
                            t.outcome = outcome;
                            t.advance(ProvisioningState::Present);
                            tracing::info!("✅ {} ready ({})", t.entry.id, t.entry.path);
                        }
                        Err(error) => {
                            t.advance(ProvisioningState::Failed);
                            if error != FetchError::Cancelled {
                                tracing::error!("❌ {} failed: {}", t.entry.id, error);
                                if t.entry.required && !required_failed {
                                    required_failed = true;
                                    tracing::error!("🛑 Required entry failed, cancelling in-flight fetches");
                                    pass_cancel.cancel();
                                }
                            }
                            t.error = Some(error);
                        }
                    }
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("❌ Fetch worker panicked: {}", e);
            }
        }

        required_failed
    }

    fn check_disk_space(&self, root: &Path, needed: u64) {
        match available_space(root) {
            Some(available) if available < needed => tracing::warn!(
                "⚠️ Volume has {:.1} MB free but {:.1} MB still need fetching",
                available as f64 / MB,
                needed as f64 / MB
            ),
            Some(available) => tracing::debug!("💾 {:.1} MB free on volume", available as f64 / MB),
            None => tracing::debug!("💾 Free space on {:?} unknown", root),
        }
    }

    fn write_report(&self, report: &ProvisioningReport, root: &Path) {
        if !self.settings.write_report {
            return;
        }
        match report.write_to(root) {
            Ok(path) => tracing::debug!("📝 Provisioning report written to {:?}", path),
            Err(e) => tracing::warn!("⚠️ Failed to write provisioning report: {}", e),
        }
    }
}

fn apply_update(tracked: &mut HashMap<String, Tracked>, update: FetchUpdate) {
    let Some(t) = tracked.get_mut(&update.id) else {
        return;
    };

    match update.event {
        FetchEvent::Downloading => t.advance(ProvisioningState::Downloading),
        FetchEvent::Verifying => t.advance(ProvisioningState::Verifying),
        FetchEvent::Progress { transferred, total } => {
            if t.state == ProvisioningState::Downloading && total > 0 {
                tracing::info!(
                    "📥 {} {:.1}% ({:.1}/{:.1} MB)",
                    t.entry.id,
                    transferred as f64 * 100.0 / total as f64,
                    transferred as f64 / MB,
                    total as f64 / MB
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::SourceDescriptor;
    use crate::utils::error::TransferError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// 依 id 決定成功或失敗的假 fetcher
    #[derive(Default)]
    struct FakeFetcher {
        failing: HashSet<String>,
        calls: AtomicUsize,
        order: StdMutex<Vec<String>>,
        delay: Duration,
    }

    #[async_trait]
    impl AssetFetch for FakeFetcher {
        async fn fetch(
            &self,
            entry: &ManifestEntry,
            root: &Path,
            progress: &mut ProgressReporter,
            cancel: &CancellationToken,
        ) -> std::result::Result<FetchOutcome, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(entry.id.clone());
            progress.event(FetchEvent::Downloading);

            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }

            if self.failing.contains(&entry.id) {
                return Err(TransferError::Permanent {
                    message: "HTTP 404".to_string(),
                }
                .into());
            }

            let destination = entry.destination(root);
            std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
            std::fs::write(&destination, vec![0u8; entry.size as usize]).unwrap();
            Ok(FetchOutcome {
                bytes_transferred: entry.size,
                resumed_from: 0,
            })
        }
    }

    fn entry(id: &str, size: u64, required: bool) -> ManifestEntry {
        ManifestEntry {
            id: id.to_string(),
            path: format!("models/{}.bin", id),
            source: SourceDescriptor::Url {
                url: format!("https://example.com/{}.bin", id),
            },
            size,
            sha256: None,
            required,
            profiles: None,
        }
    }

    fn settings(max_concurrent: usize) -> ProvisioningSettings {
        ProvisioningSettings {
            max_concurrent,
            ..ProvisioningSettings::default()
        }
    }

    #[tokio::test]
    async fn test_second_run_performs_zero_transfers() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = Manifest::new(vec![entry("a", 4, true), entry("b", 8, true)]);
        let fetcher = Arc::new(FakeFetcher::default());
        let coordinator = ProvisioningCoordinator::new(fetcher.clone(), settings(2));
        let cancel = CancellationToken::new();

        let first = coordinator
            .provision(&manifest, temp_dir.path(), "default", &cancel)
            .await
            .unwrap();
        assert_eq!(first.fetched(), 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        let second = coordinator
            .provision(&manifest, temp_dir.path(), "default", &cancel)
            .await
            .unwrap();
        assert_eq!(second.fetched(), 0);
        assert_eq!(second.already_present.len(), 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert!(temp_dir.path().join(REPORT_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_largest_entries_are_fetched_first() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = Manifest::new(vec![
            entry("small", 1, true),
            entry("large", 30, true),
            entry("medium", 10, true),
        ]);
        let fetcher = Arc::new(FakeFetcher::default());
        let coordinator = ProvisioningCoordinator::new(fetcher.clone(), settings(1));

        coordinator
            .provision(&manifest, temp_dir.path(), "default", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*fetcher.order.lock().unwrap(), vec!["large", "medium", "small"]);
    }

    #[tokio::test]
    async fn test_required_failure_cancels_and_lists_failures() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = Manifest::new(vec![entry("broken", 50, true), entry("slow", 10, true)]);
        let fetcher = Arc::new(FakeFetcher {
            failing: HashSet::from(["broken".to_string()]),
            delay: Duration::from_millis(50),
            ..FakeFetcher::default()
        });
        let coordinator = ProvisioningCoordinator::new(fetcher, settings(1));

        let err = coordinator
            .provision(&manifest, temp_dir.path(), "default", &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            BootstrapError::ProvisioningFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].id, "broken");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!temp_dir.path().join("models/slow.bin").exists());
    }

    #[tokio::test]
    async fn test_optional_failure_is_skipped_and_retried() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = Manifest::new(vec![entry("extra", 5, false), entry("base", 10, true)]);
        let fetcher = Arc::new(FakeFetcher {
            failing: HashSet::from(["extra".to_string()]),
            ..FakeFetcher::default()
        });
        let coordinator = ProvisioningCoordinator::new(
            fetcher.clone(),
            ProvisioningSettings {
                retry_failed_passes: 1,
                ..settings(2)
            },
        );

        let report = coordinator
            .provision(&manifest, temp_dir.path(), "default", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.passes, 2);
        assert_eq!(report.fetched(), 1);
        assert_eq!(report.failed().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["extra"]);
        // base 一次 + extra 兩次
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_returns_interrupted() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = Manifest::new(vec![entry("a", 4, true)]);
        let fetcher = Arc::new(FakeFetcher {
            delay: Duration::from_secs(30),
            ..FakeFetcher::default()
        });
        let coordinator = ProvisioningCoordinator::new(fetcher, settings(1));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = coordinator
            .provision(&manifest, temp_dir.path(), "default", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Interrupted));
    }

    #[tokio::test]
    async fn test_report_is_written_as_json() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = Manifest::new(vec![entry("a", 4, true)]);
        let coordinator = ProvisioningCoordinator::new(Arc::new(FakeFetcher::default()), settings(1));

        coordinator
            .provision(&manifest, temp_dir.path(), "minimal", &CancellationToken::new())
            .await
            .unwrap();

        let json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(temp_dir.path().join(REPORT_FILE_NAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(json["profile"], "minimal");
        assert_eq!(json["entries"][0]["state"], "present");
        assert_eq!(json["entries"][0]["bytes_transferred"], 4);
    }
}

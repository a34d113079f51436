use crate::domain::model::ManifestEntry;
use crate::utils::error::FetchError;
use async_trait::async_trait;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Fetcher 回報給 coordinator 的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    Downloading,
    Progress { transferred: u64, total: u64 },
    Verifying,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchUpdate {
    pub id: String,
    pub event: FetchEvent,
}

/// 一次成功的下載
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchOutcome {
    /// 本次實際傳輸的位元組 (不含續傳前已存在的部分)
    pub bytes_transferred: u64,
    pub resumed_from: u64,
}

/// 以固定最小間隔送出進度，不會每個 chunk 都送
pub struct ProgressReporter {
    id: String,
    sender: Option<mpsc::UnboundedSender<FetchUpdate>>,
    min_interval: Duration,
    last_sent: Option<Instant>,
}

impl ProgressReporter {
    pub fn new(
        id: impl Into<String>,
        sender: mpsc::UnboundedSender<FetchUpdate>,
        min_interval: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            sender: Some(sender),
            min_interval,
            last_sent: None,
        }
    }

    /// 不回報任何事件 (測試與 dry run 使用)
    pub fn silent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sender: None,
            min_interval: Duration::MAX,
            last_sent: None,
        }
    }

    pub fn event(&mut self, event: FetchEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(FetchUpdate {
                id: self.id.clone(),
                event,
            });
        }
    }

    pub fn progress(&mut self, transferred: u64, total: u64) {
        let due = self
            .last_sent
            .map(|last| last.elapsed() >= self.min_interval)
            .unwrap_or(true);

        if due || transferred >= total {
            self.last_sent = Some(Instant::now());
            self.event(FetchEvent::Progress { transferred, total });
        }
    }
}

/// 把單一 manifest 項目原子地放到模型根目錄下
#[async_trait]
pub trait AssetFetch: Send + Sync {
    async fn fetch(
        &self,
        entry: &ManifestEntry,
        root: &Path,
        progress: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_rate_limited() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = ProgressReporter::new("model", tx, Duration::from_secs(3600));

        reporter.progress(10, 100);
        reporter.progress(20, 100);
        reporter.progress(30, 100);
        reporter.progress(100, 100);

        let mut received = Vec::new();
        while let Ok(update) = rx.try_recv() {
            received.push(update.event);
        }

        assert_eq!(
            received,
            vec![
                FetchEvent::Progress {
                    transferred: 10,
                    total: 100
                },
                FetchEvent::Progress {
                    transferred: 100,
                    total: 100
                },
            ]
        );
    }
}

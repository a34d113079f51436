use crate::config::toml_config::ProvisioningSettings;
use crate::core::manifest::sha256_file;
use crate::domain::model::{ManifestEntry, SourceDescriptor};
use crate::domain::ports::{AssetFetch, FetchEvent, FetchOutcome, ProgressReporter};
use crate::utils::error::{FetchError, IntegrityError, Result, TransferError};
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// 解析後的實際傳輸來源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    Http { url: String, token: Option<String> },
    Local(PathBuf),
}

/// 透過 HTTP(S) 或本機複製下載單一項目
///
/// 資料一律先寫進 `<dest>.part`，驗證大小與 checksum 之後才 rename 到最終路徑，
/// 因此最終路徑上不會出現寫到一半的檔案。
pub struct HttpFetcher {
    client: Client,
    settings: ProvisioningSettings,
}

impl HttpFetcher {
    pub fn new(settings: ProvisioningSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .user_agent(concat!("studio-bootstrap/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, settings })
    }

    pub fn resolve_source(&self, source: &SourceDescriptor) -> std::result::Result<ResolvedSource, FetchError> {
        match source {
            SourceDescriptor::Url { url } => Ok(ResolvedSource::Http {
                url: url.clone(),
                token: None,
            }),
            SourceDescriptor::ObjectStorage { bucket, key } => {
                let endpoint = self.settings.object_storage_endpoint.as_deref().ok_or_else(|| {
                    FetchError::Source {
                        reason: "no object storage endpoint configured".to_string(),
                    }
                })?;
                Ok(ResolvedSource::Http {
                    url: format!(
                        "{}/{}/{}",
                        endpoint.trim_end_matches('/'),
                        bucket,
                        key.trim_start_matches('/')
                    ),
                    token: None,
                })
            }
            SourceDescriptor::Repository {
                repo,
                file,
                revision,
            } => Ok(ResolvedSource::Http {
                url: format!(
                    "{}/{}/resolve/{}/{}",
                    self.settings.repository_endpoint.trim_end_matches('/'),
                    repo,
                    revision,
                    file
                ),
                token: self.settings.repository_token.clone(),
            }),
            SourceDescriptor::File { path } => Ok(ResolvedSource::Local(path.clone())),
        }
    }

    /// 單次嘗試：續傳或重新下載、驗證、rename
    async fn attempt(
        &self,
        entry: &ManifestEntry,
        root: &Path,
        progress: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> std::result::Result<FetchOutcome, FetchError> {
        let destination = entry.destination(root);
        let temp_path = entry.temp_path(root);
        let source = self.resolve_source(&entry.source)?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await.map_err(TransferError::from)?;
        }

        let mut existing = fs::metadata(&temp_path).await.map(|m| m.len()).unwrap_or(0);
        if existing > entry.size {
            tracing::debug!("🧹 {}: discarding oversized partial file", entry.id);
            remove_if_exists(&temp_path).await;
            existing = 0;
        }

        progress.event(FetchEvent::Downloading);

        let outcome = if existing == entry.size {
            FetchOutcome {
                bytes_transferred: 0,
                resumed_from: existing,
            }
        } else {
            if existing > 0 {
                tracing::info!("⏯️ {}: resuming from byte {}", entry.id, existing);
            }
            match &source {
                ResolvedSource::Http { url, token } => {
                    self.download_http(url, token.as_deref(), &temp_path, existing, entry.size, progress, cancel)
                        .await?
                }
                ResolvedSource::Local(path) => {
                    copy_local(path, &temp_path, existing, entry.size, progress, cancel).await?
                }
            }
        };

        progress.event(FetchEvent::Verifying);
        if let Err(e) = verify(&temp_path, entry).await {
            remove_if_exists(&temp_path).await;
            return Err(e);
        }

        fs::rename(&temp_path, &destination)
            .await
            .map_err(TransferError::from)?;

        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_http(
        &self,
        url: &str,
        token: Option<&str>,
        temp_path: &Path,
        offset: u64,
        expected_size: u64,
        progress: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> std::result::Result<FetchOutcome, FetchError> {
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = request.send() => response.map_err(|e| TransferError::from_reqwest(&e))?,
        };

        let status = response.status();
        let (mut file, start) = if status == StatusCode::PARTIAL_CONTENT && offset > 0 {
            let range_start = content_range_start(response.headers());
            if range_start != Some(offset) {
                remove_if_exists(temp_path).await;
                return Err(TransferError::Transient {
                    message: format!(
                        "{} answered range {:?} for resume offset {}",
                        url, range_start, offset
                    ),
                }
                .into());
            }
            let file = OpenOptions::new()
                .append(true)
                .open(temp_path)
                .await
                .map_err(TransferError::from)?;
            (file, offset)
        } else if status.is_success() {
            if offset > 0 {
                tracing::debug!("↩️ {} ignored the range request, restarting from zero", url);
            }
            (File::create(temp_path).await.map_err(TransferError::from)?, 0)
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE {
            remove_if_exists(temp_path).await;
            return Err(TransferError::Transient {
                message: format!("{} rejected the resume offset {}", url, offset),
            }
            .into());
        } else {
            return Err(TransferError::from_status(status, url).into());
        };

        let mut stream = response.bytes_stream();
        let mut written = start;

        let result = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break Err(FetchError::Cancelled),
                next = tokio::time::timeout(self.settings.stall_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    break Err(TransferError::Transient {
                        message: format!(
                            "no data from {} for {:?}",
                            url, self.settings.stall_timeout
                        ),
                    }
                    .into())
                }
                Ok(None) => break Ok(()),
                Ok(Some(Err(e))) => break Err(TransferError::from_reqwest(&e).into()),
                Ok(Some(Ok(chunk))) => chunk,
            };

            if let Err(e) = file.write_all(&chunk).await {
                break Err(TransferError::from(e).into());
            }
            written += chunk.len() as u64;

            if written > expected_size {
                break Err(IntegrityError::SizeMismatch {
                    expected: expected_size,
                    actual: written,
                }
                .into());
            }
            progress.progress(written, expected_size);
        };

        // 失敗時也要 flush，已寫入的部分留給下次續傳
        file.flush().await.map_err(TransferError::from)?;
        result?;
        file.sync_all().await.map_err(TransferError::from)?;

        Ok(FetchOutcome {
            bytes_transferred: written - start,
            resumed_from: start,
        })
    }
}

async fn copy_local(
    source: &Path,
    temp_path: &Path,
    offset: u64,
    expected_size: u64,
    progress: &mut ProgressReporter,
    cancel: &CancellationToken,
) -> std::result::Result<FetchOutcome, FetchError> {
    let mut input = File::open(source).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            TransferError::Permanent {
                message: format!("local source {:?} does not exist", source),
            }
        } else {
            TransferError::from(e)
        }
    })?;
    input
        .seek(SeekFrom::Start(offset))
        .await
        .map_err(TransferError::from)?;

    let mut output = if offset > 0 {
        OpenOptions::new().append(true).open(temp_path).await
    } else {
        File::create(temp_path).await
    }
    .map_err(TransferError::from)?;

    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = offset;

    let result = loop {
        if cancel.is_cancelled() {
            break Err(FetchError::Cancelled);
        }

        let read = match input.read(&mut buffer).await {
            Ok(0) => break Ok(()),
            Ok(read) => read,
            Err(e) => break Err(TransferError::from(e).into()),
        };

        if let Err(e) = output.write_all(&buffer[..read]).await {
            break Err(TransferError::from(e).into());
        }
        written += read as u64;

        if written > expected_size {
            break Err(IntegrityError::SizeMismatch {
                expected: expected_size,
                actual: written,
            }
            .into());
        }
        progress.progress(written, expected_size);
    };

    output.flush().await.map_err(TransferError::from)?;
    result?;
    output.sync_all().await.map_err(TransferError::from)?;

    Ok(FetchOutcome {
        bytes_transferred: written - offset,
        resumed_from: offset,
    })
}

async fn verify(temp_path: &Path, entry: &ManifestEntry) -> std::result::Result<(), FetchError> {
    let actual = fs::metadata(temp_path)
        .await
        .map_err(TransferError::from)?
        .len();
    if actual != entry.size {
        return Err(IntegrityError::SizeMismatch {
            expected: entry.size,
            actual,
        }
        .into());
    }

    if let Some(expected) = &entry.sha256 {
        let path = temp_path.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| TransferError::Transient {
                message: format!("checksum task failed: {}", e),
            })?
            .map_err(TransferError::from)?;

        if !digest.eq_ignore_ascii_case(expected) {
            return Err(IntegrityError::ChecksumMismatch {
                expected: expected.to_lowercase(),
                actual: digest,
            }
            .into());
        }
    }

    Ok(())
}

/// `Content-Range: bytes <start>-<end>/<total>` 的起點
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes ")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("⚠️ Failed to remove {:?}: {}", path, e);
        }
    }
}

#[async_trait::async_trait]
impl AssetFetch for HttpFetcher {
    async fn fetch(
        &self,
        entry: &ManifestEntry,
        root: &Path,
        progress: &mut ProgressReporter,
        cancel: &CancellationToken,
    ) -> std::result::Result<FetchOutcome, FetchError> {
        let mut transient_failures = 0u32;
        let mut integrity_retried = false;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            match self.attempt(entry, root, progress, cancel).await {
                Ok(outcome) => return Ok(outcome),
                Err(FetchError::Transfer(e))
                    if e.is_transient() && transient_failures < self.settings.retry_attempts =>
                {
                    let delay = self.settings.backoff.delay(transient_failures);
                    transient_failures += 1;
                    tracing::warn!(
                        "🔁 {}: {} (retry {}/{} in {:?})",
                        entry.id,
                        e,
                        transient_failures,
                        self.settings.retry_attempts,
                        delay
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                // 完整性錯誤不是暫時性的，只從零重試一次
                Err(FetchError::Integrity(e)) if !integrity_retried => {
                    integrity_retried = true;
                    tracing::warn!("🔁 {}: {} (retrying once from zero)", entry.id, e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::backoff::Backoff;
    use httpmock::prelude::*;
    use std::time::Duration;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn test_settings() -> ProvisioningSettings {
        ProvisioningSettings {
            retry_attempts: 2,
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 2.0),
            stall_timeout: Duration::from_secs(5),
            ..ProvisioningSettings::default()
        }
    }

    fn url_entry(url: String, size: u64, sha256: Option<&str>) -> ManifestEntry {
        ManifestEntry {
            id: "model".to_string(),
            path: "checkpoints/model.bin".to_string(),
            source: SourceDescriptor::Url { url },
            size,
            sha256: sha256.map(str::to_string),
            required: true,
            profiles: None,
        }
    }

    async fn fetch(
        fetcher: &HttpFetcher,
        entry: &ManifestEntry,
        root: &Path,
    ) -> std::result::Result<FetchOutcome, FetchError> {
        let mut progress = ProgressReporter::silent(entry.id.clone());
        fetcher
            .fetch(entry, root, &mut progress, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_full_download_with_checksum() {
        let server = MockServer::start();
        let download = server.mock(|when, then| {
            when.method(GET).path("/model.bin").header_missing("range");
            then.status(200).body("hello world");
        });

        let temp_dir = TempDir::new().unwrap();
        let fetcher = HttpFetcher::new(test_settings()).unwrap();
        let entry = url_entry(server.url("/model.bin"), 11, Some(HELLO_SHA256));

        let outcome = fetch(&fetcher, &entry, temp_dir.path()).await.unwrap();

        download.assert();
        assert_eq!(outcome.bytes_transferred, 11);
        assert_eq!(outcome.resumed_from, 0);
        assert_eq!(
            std::fs::read(entry.destination(temp_dir.path())).unwrap(),
            b"hello world"
        );
        assert!(!entry.temp_path(temp_dir.path()).exists());
    }

    #[tokio::test]
    async fn test_resume_partial_download_with_range() {
        let server = MockServer::start();
        let ranged = server.mock(|when, then| {
            when.method(GET).path("/model.bin").header("range", "bytes=5-");
            then.status(206)
                .header("content-range", "bytes 5-10/11")
                .body(" world");
        });
        let full = server.mock(|when, then| {
            when.method(GET).path("/model.bin").header_missing("range");
            then.status(200).body("hello world");
        });

        let temp_dir = TempDir::new().unwrap();
        let entry = url_entry(server.url("/model.bin"), 11, Some(HELLO_SHA256));
        let temp_path = entry.temp_path(temp_dir.path());
        std::fs::create_dir_all(temp_path.parent().unwrap()).unwrap();
        std::fs::write(&temp_path, b"hello").unwrap();

        let fetcher = HttpFetcher::new(test_settings()).unwrap();
        let outcome = fetch(&fetcher, &entry, temp_dir.path()).await.unwrap();

        ranged.assert();
        full.assert_hits(0);
        assert_eq!(outcome.resumed_from, 5);
        assert_eq!(outcome.bytes_transferred, 6);
        assert_eq!(
            std::fs::read(entry.destination(temp_dir.path())).unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn test_misaligned_partial_content_restarts_from_zero() {
        let server = MockServer::start();
        let misaligned = server.mock(|when, then| {
            when.method(GET).path("/model.bin").header("range", "bytes=5-");
            then.status(206)
                .header("content-range", "bytes 0-5/11")
                .body("hello ");
        });
        let full = server.mock(|when, then| {
            when.method(GET).path("/model.bin").header_missing("range");
            then.status(200).body("hello world");
        });

        let temp_dir = TempDir::new().unwrap();
        // 沒有 sha256，只能靠 Content-Range 發現錯位
        let entry = url_entry(server.url("/model.bin"), 11, None);
        let temp_path = entry.temp_path(temp_dir.path());
        std::fs::create_dir_all(temp_path.parent().unwrap()).unwrap();
        std::fs::write(&temp_path, b"hello").unwrap();

        let fetcher = HttpFetcher::new(test_settings()).unwrap();
        let outcome = fetch(&fetcher, &entry, temp_dir.path()).await.unwrap();

        misaligned.assert_hits(1);
        full.assert_hits(1);
        assert_eq!(outcome.resumed_from, 0);
        assert_eq!(
            std::fs::read(entry.destination(temp_dir.path())).unwrap(),
            b"hello world"
        );
    }

    #[test]
    fn test_content_range_start() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_range_start(&headers), None);

        headers.insert(CONTENT_RANGE, "bytes 5-10/11".parse().unwrap());
        assert_eq!(content_range_start(&headers), Some(5));

        headers.insert(CONTENT_RANGE, "bytes */11".parse().unwrap());
        assert_eq!(content_range_start(&headers), None);
    }

    #[tokio::test]
    async fn test_server_without_range_support_restarts_from_zero() {
        let server = MockServer::start();
        let download = server.mock(|when, then| {
            when.method(GET).path("/model.bin");
            then.status(200).body("hello world");
        });

        let temp_dir = TempDir::new().unwrap();
        let entry = url_entry(server.url("/model.bin"), 11, None);
        let temp_path = entry.temp_path(temp_dir.path());
        std::fs::create_dir_all(temp_path.parent().unwrap()).unwrap();
        std::fs::write(&temp_path, b"hel").unwrap();

        let fetcher = HttpFetcher::new(test_settings()).unwrap();
        let outcome = fetch(&fetcher, &entry, temp_dir.path()).await.unwrap();

        download.assert();
        assert_eq!(outcome.resumed_from, 0);
        assert_eq!(
            std::fs::read(entry.destination(temp_dir.path())).unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_then_reported() {
        let server = MockServer::start();
        let unavailable = server.mock(|when, then| {
            when.method(GET).path("/model.bin");
            then.status(503);
        });

        let temp_dir = TempDir::new().unwrap();
        let entry = url_entry(server.url("/model.bin"), 11, None);
        let fetcher = HttpFetcher::new(test_settings()).unwrap();

        let err = fetch(&fetcher, &entry, temp_dir.path()).await.unwrap_err();

        // 第一次 + retry_attempts 次重試
        unavailable.assert_hits(3);
        assert!(matches!(err, FetchError::Transfer(TransferError::Transient { .. })));
        assert!(!entry.destination(temp_dir.path()).exists());
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let server = MockServer::start();
        let not_found = server.mock(|when, then| {
            when.method(GET).path("/model.bin");
            then.status(404);
        });

        let temp_dir = TempDir::new().unwrap();
        let entry = url_entry(server.url("/model.bin"), 11, None);
        let fetcher = HttpFetcher::new(test_settings()).unwrap();

        let err = fetch(&fetcher, &entry, temp_dir.path()).await.unwrap_err();

        not_found.assert_hits(1);
        assert!(matches!(err, FetchError::Transfer(TransferError::Permanent { .. })));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_retried_once() {
        let server = MockServer::start();
        let corrupted = server.mock(|when, then| {
            when.method(GET).path("/model.bin");
            then.status(200).body("hello worle");
        });

        let temp_dir = TempDir::new().unwrap();
        let entry = url_entry(server.url("/model.bin"), 11, Some(HELLO_SHA256));
        let fetcher = HttpFetcher::new(test_settings()).unwrap();

        let err = fetch(&fetcher, &entry, temp_dir.path()).await.unwrap_err();

        corrupted.assert_hits(2);
        assert!(matches!(
            err,
            FetchError::Integrity(IntegrityError::ChecksumMismatch { .. })
        ));
        assert!(!entry.destination(temp_dir.path()).exists());
        assert!(!entry.temp_path(temp_dir.path()).exists());
    }

    #[tokio::test]
    async fn test_oversized_response_is_an_integrity_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/model.bin");
            then.status(200).body("hello world, and then some");
        });

        let temp_dir = TempDir::new().unwrap();
        let entry = url_entry(server.url("/model.bin"), 11, None);
        let fetcher = HttpFetcher::new(test_settings()).unwrap();

        let err = fetch(&fetcher, &entry, temp_dir.path()).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Integrity(IntegrityError::SizeMismatch { expected: 11, .. })
        ));
        assert!(!entry.destination(temp_dir.path()).exists());
    }

    #[tokio::test]
    async fn test_cancelled_fetch_leaves_no_final_file() {
        let temp_dir = TempDir::new().unwrap();
        let entry = url_entry("http://127.0.0.1:9/model.bin".to_string(), 11, None);
        let fetcher = HttpFetcher::new(test_settings()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut progress = ProgressReporter::silent("model");
        let err = fetcher
            .fetch(&entry, temp_dir.path(), &mut progress, &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, FetchError::Cancelled);
        assert!(!entry.destination(temp_dir.path()).exists());
    }

    #[tokio::test]
    async fn test_repository_source_sends_token() {
        let server = MockServer::start();
        let download = server.mock(|when, then| {
            when.method(GET)
                .path("/org/model/resolve/v1.0/unet/model.bin")
                .header("authorization", "Bearer hf_token");
            then.status(200).body("hello world");
        });

        let settings = ProvisioningSettings {
            repository_endpoint: server.base_url(),
            repository_token: Some("hf_token".to_string()),
            ..test_settings()
        };
        let fetcher = HttpFetcher::new(settings).unwrap();
        let mut entry = url_entry(String::new(), 11, None);
        entry.source = SourceDescriptor::Repository {
            repo: "org/model".to_string(),
            file: "unet/model.bin".to_string(),
            revision: "v1.0".to_string(),
        };

        let temp_dir = TempDir::new().unwrap();
        fetch(&fetcher, &entry, temp_dir.path()).await.unwrap();
        download.assert();
    }

    #[tokio::test]
    async fn test_object_storage_source_resolution() {
        let settings = ProvisioningSettings {
            object_storage_endpoint: Some("https://storage.example.com/".to_string()),
            ..test_settings()
        };
        let fetcher = HttpFetcher::new(settings).unwrap();

        let resolved = fetcher
            .resolve_source(&SourceDescriptor::ObjectStorage {
                bucket: "models".to_string(),
                key: "/loras/style.safetensors".to_string(),
            })
            .unwrap();

        assert_eq!(
            resolved,
            ResolvedSource::Http {
                url: "https://storage.example.com/models/loras/style.safetensors".to_string(),
                token: None,
            }
        );
    }

    #[tokio::test]
    async fn test_local_source_copy_resumes_from_offset() {
        let temp_dir = TempDir::new().unwrap();
        let source_path = temp_dir.path().join("baked.bin");
        std::fs::write(&source_path, b"hello world").unwrap();

        let root = temp_dir.path().join("models");
        let mut entry = url_entry(String::new(), 11, Some(HELLO_SHA256));
        entry.source = SourceDescriptor::File {
            path: source_path.clone(),
        };
        let temp_path = entry.temp_path(&root);
        std::fs::create_dir_all(temp_path.parent().unwrap()).unwrap();
        std::fs::write(&temp_path, b"hello ").unwrap();

        let fetcher = HttpFetcher::new(test_settings()).unwrap();
        let outcome = fetch(&fetcher, &entry, &root).await.unwrap();

        assert_eq!(outcome.resumed_from, 6);
        assert_eq!(outcome.bytes_transferred, 5);
        assert_eq!(std::fs::read(entry.destination(&root)).unwrap(), b"hello world");
    }
}

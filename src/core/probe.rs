use crate::domain::model::ProbeCheck;
use std::time::Duration;
use tokio::net::TcpStream;

/// 單次探測的逾時
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// 執行服務的就緒/存活探測
#[derive(Clone)]
pub struct Prober {
    client: reqwest::Client,
}

impl Prober {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub async fn check(&self, probe: &ProbeCheck) -> bool {
        match probe {
            ProbeCheck::None => true,
            ProbeCheck::Tcp { host, port } => {
                let address = format!("{}:{}", host, port);
                matches!(
                    tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect(&address)).await,
                    Ok(Ok(_))
                )
            }
            ProbeCheck::Http { url } => match self.client.get(url).send().await {
                Ok(response) => response.status().is_success(),
                Err(e) => {
                    tracing::trace!("probe {} failed: {}", url, e);
                    false
                }
            },
            ProbeCheck::File { path } => tokio::fs::try_exists(path).await.unwrap_or(false),
        }
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

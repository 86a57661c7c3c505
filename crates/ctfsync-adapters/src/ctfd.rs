//! CTFd REST client over the shared `HttpFetcher`.

use async_trait::async_trait;
use ctfsync_storage::{HttpClientConfig, HttpFetcher};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    unwrap_envelope, ChallengeDetail, ChallengeSummary, MalformedResponse, PlatformClient,
    RawResponse, RemoteError, SubmissionRequest,
};

#[derive(Debug, Clone)]
pub struct CtfdClient {
    base_url: String,
    api_url: String,
    http: HttpFetcher,
}

impl CtfdClient {
    pub fn new(base_url: &str, config: HttpClientConfig) -> anyhow::Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let api_url = format!("{base_url}/api/v1");
        Ok(Self {
            base_url,
            api_url,
            http: HttpFetcher::new(config)?,
        })
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let url = self.api_url(path);
        let response = self.http.get_bytes(&url).await?;
        let value: JsonValue = serde_json::from_slice(&response.body)
            .map_err(|err| MalformedResponse(format!("{url}: {err}")))?;
        let data = unwrap_envelope(value)?;
        serde_json::from_value(data)
            .map_err(|err| RemoteError::from(MalformedResponse(format!("{url}: {err}"))))
    }
}

#[async_trait]
impl PlatformClient for CtfdClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn list_challenges(&self) -> Result<Vec<ChallengeSummary>, RemoteError> {
        let summaries: Vec<ChallengeSummary> = self.get_json("/challenges").await?;
        debug!(count = summaries.len(), "listed challenges");
        Ok(summaries)
    }

    async fn get_challenge_detail(&self, id: u64) -> Result<ChallengeDetail, RemoteError> {
        self.get_json(&format!("/challenges/{id}")).await
    }

    async fn download_file(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        Ok(self.http.get_bytes(url).await?.body)
    }

    async fn post_submission(&self, request: &SubmissionRequest) -> Result<RawResponse, RemoteError> {
        let url = self.api_url(&request.path);
        debug!(variant = request.variant, %url, "posting submission");
        let response = self.http.post_json(&url, &request.payload).await?;
        Ok(RawResponse {
            status: response.status.as_u16(),
            body: response.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::default_strategies;
    use ctfsync_storage::RetryPolicy;
    use std::time::Duration;

    #[test]
    fn api_paths_join_under_v1() {
        let client = CtfdClient::new("https://ctf.example.org/", HttpClientConfig::default())
            .expect("client");
        assert_eq!(client.base_url(), "https://ctf.example.org");
        assert_eq!(
            client.api_url("/challenges/attempt"),
            "https://ctf.example.org/api/v1/challenges/attempt"
        );
        assert_eq!(
            client.api_url("challenges/3"),
            "https://ctf.example.org/api/v1/challenges/3"
        );
    }

    #[tokio::test]
    async fn silent_server_is_a_timeout_not_a_hang() {
        // Accepts connections through the backlog but never answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let config = HttpClientConfig {
            timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                max_retries: 0,
                ..RetryPolicy::default()
            },
            ..HttpClientConfig::default()
        };
        let client = CtfdClient::new(&format!("http://{addr}"), config).expect("client");

        let listed = client.list_challenges().await.unwrap_err();
        assert!(matches!(listed, RemoteError::Timeout(_)), "{listed:?}");

        let request = default_strategies()[0].request(1, "flag{x}");
        let posted = client.post_submission(&request).await.unwrap_err();
        assert!(matches!(posted, RemoteError::Timeout(_)), "{posted:?}");
        drop(listener);
    }
}

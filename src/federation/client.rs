// src/federation/client.rs
//! Dispatching builds to federated peers over HTTP

use super::protocol::{
    Advertisement, BUILDS_PATH, BuildRequest, BuildResponse, CANCEL_PATH, CancelRequest,
    STATUS_PATH, TOKEN_HEADER, source_files,
};
use crate::build::{BuildResult, JobSpec, ResultKind, Submission};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Where and how to reach one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub id: String,
    pub url: Url,
    pub token: Option<String>,
}

impl PeerEndpoint {
    fn join(&self, path: &str) -> Result<Url> {
        self.url
            .join(path)
            .map_err(|e| Error::Config(format!("bad peer url {}: {}", self.url, e)))
    }
}

/// Same contract as a local builder, over the network
///
/// Network and authentication problems come back as
/// [`ResultKind::NetworkError`], a full peer as [`ResultKind::NoCapacity`],
/// and any other refusal as [`ResultKind::Refused`].
#[async_trait]
pub trait RemoteBuilder: Send + Sync {
    async fn build(
        &self,
        peer: &PeerEndpoint,
        submission: &Submission,
        job: &JobSpec,
        request_id: &str,
    ) -> BuildResult;

    /// Best effort; the peer's own timeout is the backstop
    async fn cancel(&self, peer: &PeerEndpoint, request_id: &str) -> Result<()>;

    async fn advertisement(&self, peer: &PeerEndpoint) -> Result<Advertisement>;
}

pub struct HttpPeerClient {
    client: reqwest::Client,
    identity: String,
    request_timeout: Duration,
    results_dir: PathBuf,
}

impl HttpPeerClient {
    /// `request_timeout` bounds connects and control requests; build requests
    /// run until the coordinator's job timeout drops them.
    pub fn new(identity: &str, request_timeout: Duration, results_dir: PathBuf) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            identity: identity.to_string(),
            request_timeout,
            results_dir,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder, peer: &PeerEndpoint) -> reqwest::RequestBuilder {
        match &peer.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    fn classify_status(status: StatusCode, body: &str) -> BuildResult {
        let detail = format!("peer answered {}: {}", status, body.trim());
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                BuildResult::new(ResultKind::NetworkError, detail)
            }
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::TOO_MANY_REQUESTS => {
                BuildResult::new(ResultKind::NoCapacity, detail)
            }
            _ => BuildResult::new(ResultKind::Refused, detail),
        }
    }
}

#[async_trait]
impl RemoteBuilder for HttpPeerClient {
    async fn build(
        &self,
        peer: &PeerEndpoint,
        submission: &Submission,
        job: &JobSpec,
        request_id: &str,
    ) -> BuildResult {
        let sources = match source_files(submission) {
            Ok(files) => files,
            Err(e) => {
                return BuildResult::new(
                    ResultKind::StartFailure,
                    format!("cannot read sources: {}", e),
                );
            }
        };
        let url = match peer.join(BUILDS_PATH) {
            Ok(url) => url,
            Err(e) => return BuildResult::new(ResultKind::NetworkError, e.to_string()),
        };
        let request = BuildRequest {
            request_id: request_id.to_string(),
            origin: self.identity.clone(),
            submission: submission.clone(),
            job: job.clone(),
            sources,
        };

        info!(
            "[federation] dispatching {} ({}) to {}",
            submission, job.architecture, peer.url
        );
        let response = match self
            .authorize(self.client.post(url), peer)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("[federation] {} unreachable: {}", peer.url, e);
                return BuildResult::new(ResultKind::NetworkError, e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Self::classify_status(status, &body);
        }

        let reply: BuildResponse = match response.json().await {
            Ok(reply) => reply,
            Err(e) => {
                return BuildResult::new(
                    ResultKind::NetworkError,
                    format!("unreadable reply from {}: {}", peer.url, e),
                );
            }
        };

        let target = self
            .results_dir
            .join(submission.key())
            .join(&job.architecture);
        let mut artifacts = Vec::with_capacity(reply.artifacts.len());
        for file in &reply.artifacts {
            match file.write_into(&target) {
                Ok(path) => artifacts.push(path),
                Err(e) => {
                    return BuildResult::new(
                        ResultKind::Failed,
                        format!("bad artifact {} from {}: {}", file.name, peer.url, e),
                    )
                    .with_log(reply.log);
                }
            }
        }
        debug!(
            "[federation] {} ({}) on {}: {}",
            submission, job.architecture, peer.url, reply.kind
        );
        BuildResult::new(reply.kind, reply.detail)
            .with_log(reply.log)
            .with_artifacts(artifacts)
    }

    async fn cancel(&self, peer: &PeerEndpoint, request_id: &str) -> Result<()> {
        let response = self
            .authorize(self.client.post(peer.join(CANCEL_PATH)?), peer)
            .timeout(self.request_timeout)
            .json(&CancelRequest {
                request_id: request_id.to_string(),
            })
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Network(format!(
                "cancel on {} answered {}",
                peer.url,
                response.status()
            )))
        }
    }

    async fn advertisement(&self, peer: &PeerEndpoint) -> Result<Advertisement> {
        let response = self
            .authorize(self.client.get(peer.join(STATUS_PATH)?), peer)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!("{} answered {}", peer.url, status)));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str) -> PeerEndpoint {
        PeerEndpoint {
            id: "p".into(),
            url: Url::parse(url).unwrap(),
            token: None,
        }
    }

    #[test]
    fn test_status_classification() {
        let kind = |s| HttpPeerClient::classify_status(s, "").kind;
        assert_eq!(kind(StatusCode::UNAUTHORIZED), ResultKind::NetworkError);
        assert_eq!(kind(StatusCode::FORBIDDEN), ResultKind::NetworkError);
        assert_eq!(kind(StatusCode::SERVICE_UNAVAILABLE), ResultKind::NoCapacity);
        assert_eq!(kind(StatusCode::TOO_MANY_REQUESTS), ResultKind::NoCapacity);
        assert_eq!(kind(StatusCode::UNPROCESSABLE_ENTITY), ResultKind::Refused);
    }

    #[test]
    fn test_endpoint_join() {
        let peer = endpoint("https://peer.example.org:8066/");
        assert_eq!(
            peer.join(BUILDS_PATH).unwrap().as_str(),
            "https://peer.example.org:8066/v1/builds"
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_network_error() {
        let temp = tempfile::tempdir().unwrap();
        let dsc = temp.path().join("foo_1.0-1.dsc");
        std::fs::write(&dsc, "Source: foo\n").unwrap();
        let submission = Submission::new(
            "foo",
            "1.0-1",
            "sid-test-unstable".parse().unwrap(),
            &["armel"],
            dsc,
        );
        let client =
            HttpPeerClient::new("test", Duration::from_secs(2), temp.path().join("results")).unwrap();

        // port 9 on localhost: nothing listens there
        let peer = endpoint("http://127.0.0.1:9/");
        let result = client
            .build(&peer, &submission, &JobSpec::new("armel"), "req-1")
            .await;
        assert_eq!(result.kind, ResultKind::NetworkError);
        assert!(client.advertisement(&peer).await.is_err());
    }
}

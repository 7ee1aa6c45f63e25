// src/source.rs

//! Package archive sources (apt mirrors) chroots are bootstrapped from

use crate::error::{Error, Result};
use crate::status::{ManagedResource, ResourceKind, fingerprint};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const RELEASE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Archive origin, e.g. `Debian`
    pub origin: String,

    pub codename: String,

    /// Mirror base URLs, tried in order
    pub mirrors: Vec<String>,

    #[serde(default = "default_components")]
    pub components: Vec<String>,
}

fn default_components() -> Vec<String> {
    vec!["main".to_string()]
}

impl SourceConfig {
    pub fn key(&self) -> String {
        format!("{}:{}", self.origin, self.codename)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mirrors.is_empty() {
            return Err(Error::Config(format!("source {}: no mirrors", self.key())));
        }
        for mirror in &self.mirrors {
            let url = Url::parse(mirror).map_err(|e| {
                Error::Config(format!("source {}: bad mirror {}: {}", self.key(), mirror, e))
            })?;
            if !matches!(url.scheme(), "http" | "https" | "file") {
                return Err(Error::Config(format!(
                    "source {}: unsupported mirror scheme {}",
                    self.key(),
                    url.scheme()
                )));
            }
        }
        Ok(())
    }

    /// `<mirror>/dists/<codename>/Release`
    pub fn release_url(&self, mirror: &str) -> Result<Url> {
        let base = Url::parse(&format!("{}/", mirror.trim_end_matches('/')))
            .map_err(|e| Error::Config(format!("bad mirror {}: {}", mirror, e)))?;
        base.join(&format!("dists/{}/Release", self.codename))
            .map_err(|e| Error::Config(format!("bad mirror {}: {}", mirror, e)))
    }

    pub fn primary_mirror(&self) -> Option<&str> {
        self.mirrors.first().map(String::as_str)
    }
}

/// A source as a managed resource: checking it fetches each mirror's Release file
pub struct SourceArchive {
    config: SourceConfig,
    client: reqwest::Client,
}

impl SourceArchive {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(RELEASE_TIMEOUT)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    async fn fetch_release(&self, mirror: &str) -> Result<()> {
        let url = self.config.release_url(mirror)?;
        if url.scheme() == "file" {
            let path = url
                .to_file_path()
                .map_err(|_| Error::Config(format!("bad file mirror {}", mirror)))?;
            return if path.is_file() {
                Ok(())
            } else {
                Err(Error::NotFound(path.display().to_string()))
            };
        }

        debug!("[source] probing {}", url);
        let response = self.client.get(url.clone()).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Network(format!("{}: HTTP {}", url, response.status())))
        }
    }
}

#[async_trait]
impl ManagedResource for SourceArchive {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Source
    }

    fn key(&self) -> String {
        self.config.key()
    }

    fn fingerprint(&self) -> String {
        fingerprint(&self.config)
    }

    async fn prepare(&mut self) -> Result<()> {
        self.config.validate()
    }

    async fn check(&mut self) -> Result<()> {
        let mut last_error = None;
        for mirror in &self.config.mirrors {
            match self.fetch_release(mirror).await {
                Ok(()) => {
                    info!("[source] {} reachable via {}", self.config.key(), mirror);
                    return Ok(());
                }
                Err(e) => {
                    warn!("[source] mirror {} failed: {}", mirror, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::Config(format!("source {}: no mirrors", self.config.key()))))
    }

    async fn remove(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Tracked;

    fn config(mirrors: &[&str]) -> SourceConfig {
        SourceConfig {
            origin: "Debian".into(),
            codename: "sid".into(),
            mirrors: mirrors.iter().map(|m| m.to_string()).collect(),
            components: default_components(),
        }
    }

    #[test]
    fn test_validate() {
        assert!(config(&["http://deb.debian.org/debian"]).validate().is_ok());
        assert!(config(&[]).validate().is_err());
        assert!(config(&["not a url"]).validate().is_err());
        assert!(config(&["ftp://old.example.org/debian"]).validate().is_err());
    }

    #[test]
    fn test_release_url() {
        let source = config(&["http://deb.debian.org/debian"]);
        for mirror in ["http://deb.debian.org/debian", "http://deb.debian.org/debian/"] {
            assert_eq!(
                source.release_url(mirror).unwrap().as_str(),
                "http://deb.debian.org/debian/dists/sid/Release"
            );
        }
    }

    #[tokio::test]
    async fn test_check_with_local_mirror() {
        let temp = tempfile::tempdir().unwrap();
        let dists = temp.path().join("dists").join("sid");
        std::fs::create_dir_all(&dists).unwrap();
        let mirror = Url::from_directory_path(temp.path()).unwrap().to_string();

        let mut tracked = Tracked::new(SourceArchive::new(config(&[&mirror])).unwrap());
        tracked.prepare().await.unwrap();
        assert!(!tracked.check().await.unwrap());

        std::fs::write(dists.join("Release"), "Origin: Debian\n").unwrap();
        tracked.prepare().await.ok();
        assert!(tracked.check().await.unwrap());
    }
}

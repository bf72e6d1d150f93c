// src/core/artifacts.rs

//! The artifact-download port.
//!
//! Fetching jars from upstream vendors is external glue; the coordinator
//! only depends on the [`JarFetcher`] trait. The bundled implementation
//! covers the vendors with stable download APIs and reports the rest as
//! requiring manual installation.

use crate::core::errors::BlockforgeError;
use crate::core::registry::instance::ServerKind;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// Downloads the server jar for a kind/version into a workspace.
#[async_trait]
pub trait JarFetcher: Send + Sync {
    async fn fetch(
        &self,
        kind: ServerKind,
        version: &str,
        workspace: &Path,
    ) -> Result<PathBuf, BlockforgeError>;
}

/// Fetches from the PaperMC build API and the Mojang version manifest.
pub struct HttpJarFetcher {
    client: reqwest::Client,
}

impl HttpJarFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// PaperMC projects (paper, waterfall, velocity) share one build API.
    async fn fetch_papermc(
        &self,
        project: &str,
        version: &str,
        target: &Path,
    ) -> Result<(), BlockforgeError> {
        let builds_url =
            format!("https://api.papermc.io/v2/projects/{project}/versions/{version}/builds");
        let builds: serde_json::Value = self
            .client
            .get(&builds_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let build = builds
            .get("builds")
            .and_then(|b| b.as_array())
            .and_then(|b| b.last())
            .and_then(|b| b.get("build"))
            .and_then(|b| b.as_u64())
            .ok_or_else(|| {
                BlockforgeError::DownloadError(format!(
                    "no builds published for {project} {version}"
                ))
            })?;

        let jar_url = format!(
            "https://api.papermc.io/v2/projects/{project}/versions/{version}/builds/{build}/downloads/{project}-{version}-{build}.jar"
        );
        self.download(&jar_url, target).await
    }

    /// Vanilla resolves through the Mojang version manifest.
    async fn fetch_vanilla(&self, version: &str, target: &Path) -> Result<(), BlockforgeError> {
        let manifest: serde_json::Value = self
            .client
            .get("https://launchermeta.mojang.com/mc/game/version_manifest.json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let version_url = manifest
            .get("versions")
            .and_then(|v| v.as_array())
            .and_then(|versions| {
                versions.iter().find(|v| {
                    v.get("id").and_then(|id| id.as_str()) == Some(version)
                })
            })
            .and_then(|v| v.get("url"))
            .and_then(|u| u.as_str())
            .ok_or_else(|| {
                BlockforgeError::DownloadError(format!("unknown vanilla version '{version}'"))
            })?
            .to_string();

        let detail: serde_json::Value = self
            .client
            .get(&version_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let jar_url = detail
            .get("downloads")
            .and_then(|d| d.get("server"))
            .and_then(|s| s.get("url"))
            .and_then(|u| u.as_str())
            .ok_or_else(|| {
                BlockforgeError::DownloadError(format!(
                    "vanilla {version} publishes no server jar"
                ))
            })?
            .to_string();
        self.download(&jar_url, target).await
    }

    async fn download(&self, url: &str, target: &Path) -> Result<(), BlockforgeError> {
        info!("Downloading {} -> {}", url, target.display());
        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        tokio::fs::write(target, &bytes).await?;
        Ok(())
    }
}

impl Default for HttpJarFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JarFetcher for HttpJarFetcher {
    async fn fetch(
        &self,
        kind: ServerKind,
        version: &str,
        workspace: &Path,
    ) -> Result<PathBuf, BlockforgeError> {
        let target = workspace.join(kind.jar_name());
        match kind {
            ServerKind::Paper => self.fetch_papermc("paper", version, &target).await?,
            ServerKind::Waterfall => self.fetch_papermc("waterfall", version, &target).await?,
            ServerKind::Velocity => self.fetch_papermc("velocity", version, &target).await?,
            ServerKind::Vanilla => self.fetch_vanilla(version, &target).await?,
            other => {
                return Err(BlockforgeError::DownloadError(format!(
                    "{other} has no scripted download; install the jar manually"
                )));
            }
        }
        Ok(target)
    }
}

// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

// GitHub-style release index

mod publish;

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use url::Url;

use super::{
    base_url, check_status, http_client, unreachable, DEFAULT_CHECK_TIMEOUT,
    DEFAULT_DOWNLOAD_TIMEOUT,
};
use crate::descriptor::{ArtifactOrigin, DeviceIdentity, FirmwareDescriptor, UpdateCheckResult};
use crate::error::Error;
use crate::version::Version;

/// Asset name suffixes recognized as firmware, compared case-insensitively.
pub const FIRMWARE_EXTENSIONS: &[&str] = &[".bin", ".hex", ".elf", ".fw"];

const DEFAULT_API_URL: &str = "https://api.github.com/";
const API_MEDIA_TYPE: &str = "application/vnd.github.v3+json";

/// A published release.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Release {
    /// Identifier in the index
    #[serde(default)]
    pub id: u64,
    /// Tag the release was cut from, such as `v1.2.0`
    pub tag_name: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Release notes
    #[serde(default)]
    pub body: Option<String>,
    /// Web page of the release
    #[serde(default)]
    pub html_url: String,
    /// Publication time
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    /// Attached files
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
    /// Asset upload endpoint, as a URI template such as
    /// `https://uploads.github.com/repos/o/r/releases/1/assets{?name,label}`
    #[serde(default)]
    pub upload_url: Option<String>,
}

/// A file attached to a [`Release`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReleaseAsset {
    /// Identifier in the index
    #[serde(default)]
    pub id: u64,
    /// File name
    pub name: String,
    /// Size in bytes
    #[serde(default)]
    pub size: u64,
    /// Public download URL
    pub browser_download_url: String,
    /// Digest published by the index, such as `sha256:<hex>`
    #[serde(default)]
    pub digest: Option<String>,
}

impl ReleaseAsset {
    /// The hex SHA-256 digest, if the index published one.
    pub fn sha256(&self) -> Option<&str> {
        self.digest
            .as_deref()
            .and_then(|d| d.strip_prefix("sha256:"))
            .filter(|d| !d.is_empty())
    }

    /// Whether the name ends with one of [`FIRMWARE_EXTENSIONS`].
    pub fn is_firmware(&self) -> bool {
        let name = self.name.to_ascii_lowercase();
        FIRMWARE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
    }
}

impl Release {
    /// Pick the asset to install.
    ///
    /// The first asset with a firmware extension wins. When no asset has one,
    /// the first asset is picked anyway. That fallback is a heuristic which
    /// can select a non-firmware file, such as a source archive, so it is
    /// reported as [`ArtifactOrigin::ReleaseFallback`].
    pub fn firmware_asset(&self) -> Option<(&ReleaseAsset, ArtifactOrigin)> {
        self.assets
            .iter()
            .find(|a| a.is_firmware())
            .map(|a| (a, ArtifactOrigin::ReleaseAsset))
            .or_else(|| {
                self.assets
                    .first()
                    .map(|a| (a, ArtifactOrigin::ReleaseFallback))
            })
    }
}

/// Feed backed by the releases of a repository.
#[derive(Debug, Clone)]
pub struct ReleaseFeed {
    api_url: Url,
    repo: String,
    token: Option<String>,
    client: reqwest::Client,
    check_timeout: Duration,
    download_timeout: Duration,
}

impl ReleaseFeed {
    /// Create a feed for `repo`, such as `owner/firmware`, on GitHub.
    pub fn new(repo: &str) -> Result<Self, Error> {
        Self::with_api_url(DEFAULT_API_URL, repo)
    }

    /// Create a feed for `repo` on the release index served at `api_url`.
    pub fn with_api_url(api_url: &str, repo: &str) -> Result<Self, Error> {
        Ok(Self {
            api_url: base_url(api_url)?,
            repo: repo.trim_matches('/').to_string(),
            token: None,
            client: http_client()?,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        })
    }

    /// Authenticate with `token`, needed for private repositories.
    pub fn token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Set the timeout of index requests.
    pub fn check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Set the maximum wait for the next bytes of a download.
    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    /// The repository this feed watches.
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// The latest release, or `None` if nothing was published yet.
    pub async fn latest_release(&self) -> Result<Option<Release>, Error> {
        match self.get_release("releases/latest").await {
            Ok(release) => Ok(Some(release)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The release cut from `tag`.
    pub async fn release(&self, tag: &str) -> Result<Release, Error> {
        self.get_release(&format!("releases/tags/{}", tag))
            .await
            .map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(tag.to_string()),
                e => e,
            })
    }

    /// All releases, newest first.
    pub async fn releases(&self) -> Result<Vec<Release>, Error> {
        let resp = self
            .request(self.repo_url("releases")?)
            .send()
            .await
            .map_err(unreachable)?;
        check_status(&resp, Error::SourceUnreachable)?;
        resp.json().await.map_err(unreachable)
    }

    pub(crate) async fn latest(&self, device: &DeviceIdentity) -> Result<UpdateCheckResult, Error> {
        let current = device.current_version.clone();
        let release = match self.latest_release().await? {
            Some(release) => release,
            None => {
                return Ok(UpdateCheckResult::NoUpdate {
                    current,
                    latest: None,
                    reason: "no release published".to_string(),
                })
            }
        };

        let version = Version::from_tag(&release.tag_name)?;
        if !version.is_newer_than(&current) {
            return Ok(UpdateCheckResult::NoUpdate {
                current,
                latest: Some(version),
                reason: "already on the latest version".to_string(),
            });
        }

        let (asset, origin) = match release.firmware_asset() {
            Some(picked) => picked,
            None => {
                return Ok(UpdateCheckResult::NoUpdate {
                    current,
                    latest: Some(version),
                    reason: format!("release {} has no assets", release.tag_name),
                })
            }
        };
        if origin == ArtifactOrigin::ReleaseFallback {
            warn!(
                "release {} has no asset ending with {}, falling back to first asset '{}'",
                release.tag_name,
                FIRMWARE_EXTENSIONS.join("/"),
                asset.name
            );
        } else {
            debug!("release {}: picked asset '{}'", release.tag_name, asset.name);
        }

        let descriptor = FirmwareDescriptor {
            locator: asset.browser_download_url.parse()?,
            file_name: local_file_name(&asset.name, &version),
            size: asset.size,
            digest: asset.sha256().map(str::to_string),
            description: release.body.clone().unwrap_or_default(),
            published_at: release.published_at,
            origin,
            version: version.clone(),
        };

        Ok(UpdateCheckResult::UpdateAvailable {
            latest: version,
            descriptor,
        })
    }

    pub(crate) fn download_request(
        &self,
        descriptor: &FirmwareDescriptor,
    ) -> (RequestBuilder, Duration) {
        let request = self
            .client
            .get(descriptor.locator.clone())
            .header(ACCEPT, "application/octet-stream");
        (self.authenticate(request), self.download_timeout)
    }

    async fn get_release(&self, path: &str) -> Result<Release, Error> {
        let resp = self
            .request(self.repo_url(path)?)
            .send()
            .await
            .map_err(unreachable)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(path.to_string()));
        }
        check_status(&resp, Error::SourceUnreachable)?;
        resp.json().await.map_err(unreachable)
    }

    fn repo_url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.api_url.join(&format!("repos/{}/{}", self.repo, path))?)
    }

    fn request(&self, url: Url) -> RequestBuilder {
        let request = self
            .client
            .get(url)
            .header(ACCEPT, API_MEDIA_TYPE)
            .timeout(self.check_timeout);
        self.authenticate(request)
    }

    fn authenticate(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

// Asset names come from a third party; never let them escape the download directory
fn local_file_name(name: &str, version: &Version) -> String {
    match name.rsplit(|c: char| c == '/' || c == '\\').next() {
        Some(base) if !base.is_empty() && base != "." && base != ".." => base.to_string(),
        _ => format!("firmware_{}.bin", version),
    }
}

// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

// Publishing firmware as release assets

use std::path::Path;

use log::info;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use url::Url;

use super::{Release, ReleaseAsset, ReleaseFeed, API_MEDIA_TYPE};
use crate::error::Error;
use crate::source::{check_status, unreachable};
use crate::version::Version;

#[derive(Debug, Serialize)]
struct NewRelease<'a> {
    tag_name: &'a str,
    name: &'a str,
    body: String,
    draft: bool,
    prerelease: bool,
}

impl Release {
    /// Where to upload an asset called `name`.
    pub fn asset_upload_url(&self, name: &str) -> Result<Url, Error> {
        let template = self.upload_url.as_deref().ok_or_else(|| {
            Error::SourceUnreachable(format!("release {} has no upload URL", self.tag_name))
        })?;
        // Drop the `{?name,label}` template suffix
        let base = template.split('{').next().unwrap_or(template);
        let mut url: Url = base.parse()?;
        url.query_pairs_mut().append_pair("name", name);
        Ok(url)
    }
}

impl ReleaseFeed {
    /// Publish the firmware at `path` as an asset of the release cut from
    /// `tag`, creating the release if needed.
    ///
    /// An asset with the same file name is replaced. Requires a
    /// [token](ReleaseFeed::token) allowed to write releases; `tag` must
    /// carry a version devices can parse, such as `v1.2.0`.
    pub async fn publish(
        &self,
        tag: &str,
        path: &Path,
        notes: Option<&str>,
    ) -> Result<ReleaseAsset, Error> {
        if self.token.is_none() {
            return Err(Error::AuthenticationRequired);
        }
        Version::from_tag(tag)?;

        let content = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidUpload(format!("{} is not a file", path.display())))?;
        if content.is_empty() {
            return Err(Error::InvalidUpload(format!("{} is empty", path.display())));
        }

        let release = match self.release(tag).await {
            Ok(release) => {
                for asset in release.assets.iter().filter(|a| a.name == name) {
                    self.delete_asset(asset).await?;
                }
                release
            }
            Err(Error::NotFound(_)) => self.create_release(tag, notes).await?,
            Err(e) => return Err(e),
        };

        let size = content.len();
        let request = self
            .client
            .post(release.asset_upload_url(&name)?)
            .header(ACCEPT, API_MEDIA_TYPE)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(content);
        let resp = self
            .authenticate(request)
            .send()
            .await
            .map_err(unreachable)?;
        check_status(&resp, Error::InvalidUpload)?;
        let asset: ReleaseAsset = resp.json().await.map_err(unreachable)?;
        info!(
            "uploaded {} ({} bytes) to release {} of {}",
            asset.name, size, tag, self.repo
        );

        Ok(asset)
    }

    async fn create_release(&self, tag: &str, notes: Option<&str>) -> Result<Release, Error> {
        let body = NewRelease {
            tag_name: tag,
            name: tag,
            body: notes
                .filter(|n| !n.trim().is_empty())
                .map_or_else(|| format!("Firmware version {}", tag), str::to_string),
            draft: false,
            prerelease: false,
        };
        let request = self
            .client
            .post(self.repo_url("releases")?)
            .header(ACCEPT, API_MEDIA_TYPE)
            .json(&body)
            .timeout(self.check_timeout);
        let resp = self
            .authenticate(request)
            .send()
            .await
            .map_err(unreachable)?;
        check_status(&resp, Error::InvalidUpload)?;
        let release: Release = resp.json().await.map_err(unreachable)?;
        info!("created release {} of {}", release.tag_name, self.repo);

        Ok(release)
    }

    async fn delete_asset(&self, asset: &ReleaseAsset) -> Result<(), Error> {
        let request = self
            .client
            .delete(self.repo_url(&format!("releases/assets/{}", asset.id))?)
            .header(ACCEPT, API_MEDIA_TYPE)
            .timeout(self.check_timeout);
        let resp = self
            .authenticate(request)
            .send()
            .await
            .map_err(unreachable)?;
        check_status(&resp, Error::SourceUnreachable)?;
        info!("removed previous asset {} of {}", asset.name, self.repo);

        Ok(())
    }
}

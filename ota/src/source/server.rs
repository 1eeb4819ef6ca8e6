// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use log::debug;
use reqwest::RequestBuilder;
use url::Url;

use super::{
    base_url, check_status, http_client, unreachable, DEFAULT_CHECK_TIMEOUT,
    DEFAULT_DOWNLOAD_TIMEOUT,
};
use crate::credential::apply_credential;
use crate::descriptor::{ArtifactOrigin, DeviceIdentity, FirmwareDescriptor, UpdateCheckResult};
use crate::error::Error;
use crate::protocol::{CheckRequest, CheckResponse, CHECK_UPDATE_PATH};
use crate::version::Version;

/// Feed backed by a private update server.
#[derive(Debug, Clone)]
pub struct ServerFeed {
    base_url: Url,
    client: reqwest::Client,
    check_timeout: Duration,
    download_timeout: Duration,
}

impl ServerFeed {
    /// Create a new server feed.
    ///
    /// # Arguments
    /// * `url`: the URL of the update server, such as `http://ota.local:8000`
    pub fn new(url: &str) -> Result<Self, Error> {
        Ok(Self {
            base_url: base_url(url)?,
            client: http_client()?,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        })
    }

    /// Set the timeout of update checks.
    pub fn check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Set the maximum wait for the next bytes of a download.
    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    /// URL of the server.
    pub fn url(&self) -> &Url {
        &self.base_url
    }

    pub(crate) async fn latest(&self, device: &DeviceIdentity) -> Result<UpdateCheckResult, Error> {
        let url = self.base_url.join(CHECK_UPDATE_PATH)?;
        let body = CheckRequest {
            current_version: device.current_version.to_string(),
            device_id: device.device_id.clone(),
        };
        let request = self
            .client
            .post(url)
            .json(&body)
            .timeout(self.check_timeout);
        let resp = apply_credential(request, device.credential.as_ref())
            .send()
            .await
            .map_err(unreachable)?;
        check_status(&resp, Error::SourceUnreachable)?;
        let reply: CheckResponse = resp.json().await.map_err(unreachable)?;

        let latest = reply
            .latest_version
            .as_deref()
            .map(str::parse::<Version>)
            .transpose()?;

        if !reply.update_available {
            return Ok(UpdateCheckResult::NoUpdate {
                current: device.current_version.clone(),
                latest,
                reason: reply
                    .message
                    .unwrap_or_else(|| "already on the latest version".to_string()),
            });
        }

        let info = reply.firmware_info.ok_or_else(|| {
            Error::SourceUnreachable("update announced without firmware info".to_string())
        })?;
        let version: Version = info.version.parse()?;

        // Never trust the server on ordering
        if !version.is_newer_than(&device.current_version) {
            debug!(
                "server offered {} to a device running {}, ignoring",
                version, device.current_version
            );
            return Ok(UpdateCheckResult::NoUpdate {
                current: device.current_version.clone(),
                latest: Some(version),
                reason: "offered firmware is not newer".to_string(),
            });
        }

        let descriptor = FirmwareDescriptor {
            locator: self.base_url.join(&info.download_url)?,
            file_name: format!("firmware_{}.bin", version),
            size: info.size,
            digest: info.checksum.filter(|d| !d.trim().is_empty()),
            description: info.description,
            published_at: info.release_date,
            origin: ArtifactOrigin::Registry,
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
        (
            self.client.get(descriptor.locator.clone()),
            self.download_timeout,
        )
    }
}

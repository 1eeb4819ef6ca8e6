// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

mod release;
mod server;

use std::path::Path;
use std::time::Duration;

use futures::TryStreamExt;
use reqwest::{RequestBuilder, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::credential::apply_credential;
use crate::descriptor::{DeviceIdentity, FirmwareDescriptor, UpdateCheckResult};
use crate::download::{receive, DownloadedArtifact, Progress, Transfer};
use crate::error::Error;

pub use release::{Release, ReleaseAsset, ReleaseFeed, FIRMWARE_EXTENSIONS};
pub use server::ServerFeed;

/// Default timeout of update checks.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
/// Default maximum wait for the next bytes of a download.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("ota/", env!("CARGO_PKG_VERSION"));

/// Where a device learns about and fetches new firmware.
///
/// The set of feeds is closed: the orchestrator only ever talks to a private
/// update server or to a public release index.
#[derive(Debug)]
pub enum UpdateSource {
    /// Private update server backed by a firmware registry
    Server(ServerFeed),
    /// Public release index, such as GitHub releases
    Release(ReleaseFeed),
}

impl UpdateSource {
    /// Ask for a firmware strictly newer than the device's current version.
    ///
    /// Transport failures are reported as [`Error::SourceUnreachable`], never
    /// as "no update".
    pub async fn latest(&self, device: &DeviceIdentity) -> Result<UpdateCheckResult, Error> {
        match self {
            UpdateSource::Server(feed) => feed.latest(device).await,
            UpdateSource::Release(feed) => feed.latest(device).await,
        }
    }

    /// Download the artifact of `descriptor` into `dir`.
    ///
    /// `progress` is called at most every [`crate::download::PROGRESS_STEP`]
    /// bytes plus once at the end. The partially written file is removed on
    /// failure or cancellation.
    pub async fn fetch<P>(
        &self,
        descriptor: &FirmwareDescriptor,
        device: &DeviceIdentity,
        dir: &Path,
        progress: &P,
        cancel: &CancellationToken,
    ) -> Result<DownloadedArtifact, Error>
    where
        P: Progress + ?Sized,
    {
        // The device credential is only meaningful to our own server
        let (request, idle_timeout) = match self {
            UpdateSource::Server(feed) => {
                let (request, timeout) = feed.download_request(descriptor);
                (apply_credential(request, device.credential.as_ref()), timeout)
            }
            UpdateSource::Release(feed) => feed.download_request(descriptor),
        };

        download(request, descriptor, dir, idle_timeout, progress, cancel).await
    }
}

impl From<ServerFeed> for UpdateSource {
    fn from(feed: ServerFeed) -> Self {
        UpdateSource::Server(feed)
    }
}

impl From<ReleaseFeed> for UpdateSource {
    fn from(feed: ReleaseFeed) -> Self {
        UpdateSource::Release(feed)
    }
}

async fn download<P>(
    request: RequestBuilder,
    descriptor: &FirmwareDescriptor,
    dir: &Path,
    idle_timeout: Duration,
    progress: &P,
    cancel: &CancellationToken,
) -> Result<DownloadedArtifact, Error>
where
    P: Progress + ?Sized,
{
    let resp = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        resp = tokio::time::timeout(idle_timeout, request.send()) => resp,
    };
    let resp = resp
        .map_err(|_| Error::DownloadFailed(format!("no response for {:?}", idle_timeout)))?
        .map_err(download_failed)?;
    check_status(&resp, Error::DownloadFailed)?;

    let total = resp.content_length().unwrap_or(0);
    let stream = resp.bytes_stream().map_err(download_failed);

    receive(
        stream,
        Transfer {
            dest: dir.join(&descriptor.file_name),
            total,
            expected_size: descriptor.declared_size(),
            idle_timeout,
            progress,
            cancel,
        },
    )
    .await
}

pub(crate) fn http_client() -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(unreachable)
}

// Joining relative paths onto a base without trailing slash would drop its last segment
pub(crate) fn base_url(url: &str) -> Result<Url, Error> {
    let mut url: Url = url.parse()?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

pub(crate) fn unreachable(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::SourceUnreachable(format!("request timed out: {}", e))
    } else {
        Error::SourceUnreachable(e.to_string())
    }
}

pub(crate) fn download_failed(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::DownloadFailed(format!("download timed out: {}", e))
    } else {
        Error::DownloadFailed(e.to_string())
    }
}

/// Map an unsuccessful HTTP status to an error built by `other`.
pub(crate) fn check_status(resp: &Response, other: fn(String) -> Error) -> Result<(), Error> {
    match resp.status() {
        s if s.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::AuthenticationRequired),
        s => Err(other(format!("{} returned HTTP {}", resp.url(), s))),
    }
}

// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client for the publisher side of the update server.

use std::convert::TryInto;
use std::path::Path;

use log::info;
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::credential::API_KEY_HEADER;
use crate::error::Error;
use crate::protocol::{
    download_path, firmware_path, ApiKeyList, ApiKeyResponse, FirmwareList, MessageResponse,
    RegisterRequest, RegisterResponse, UploadResponse, FIRMWARES_PATH, GENERATE_KEY_PATH,
    KEYS_PATH, REGISTER_PATH, UPLOAD_PATH,
};
use crate::source::{base_url, unreachable};
use crate::version::Version;

/// Publishes firmware and manages credentials, authenticated by an API key.
#[derive(Debug, Clone)]
pub struct PublisherClient {
    base_url: Url,
    client: reqwest::Client,
}

impl PublisherClient {
    /// Create a new publisher client.
    ///
    /// # Arguments
    /// * `url`: the URL of the update server, such as `http://ota.local:8000`
    /// * `api_key`: the secret API key of the publisher
    pub fn new(url: &str, api_key: &str) -> Result<Self, Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(API_KEY_HEADER, api_key.try_into()?);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(unreachable)?;
        Ok(Self {
            base_url: base_url(url)?,
            client,
        })
    }

    /// Upload the firmware file at `path` as `version`.
    ///
    /// The server computes size and digest itself; an existing firmware with
    /// the same version is replaced.
    pub async fn upload(
        &self,
        version: &Version,
        path: &Path,
        description: Option<&str>,
    ) -> Result<UploadResponse, Error> {
        let content = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidUpload(format!("{} is not a file", path.display())))?;
        let size = content.len();

        let mut form = Form::new().text("version", version.to_string());
        if let Some(description) = description {
            form = form.text("description", description.to_string());
        }
        let form = form.part("file", Part::bytes(content).file_name(file_name.clone()));

        let resp = self
            .client
            .post(self.base_url.join(UPLOAD_PATH)?)
            .multipart(form)
            .send()
            .await
            .map_err(unreachable)?;
        let reply: UploadResponse = parse(resp, &version.to_string()).await?;
        info!("uploaded {} ({} bytes) as {}", file_name, size, version);

        Ok(reply)
    }

    /// Delete the firmware of `version`.
    pub async fn delete(&self, version: &Version) -> Result<MessageResponse, Error> {
        let url = self.base_url.join(&firmware_path(&version.to_string()))?;
        let resp = self.client.delete(url).send().await.map_err(unreachable)?;
        parse(resp, &version.to_string()).await
    }

    /// All published firmwares.
    pub async fn list(&self) -> Result<FirmwareList, Error> {
        let resp = self
            .client
            .get(self.base_url.join(FIRMWARES_PATH)?)
            .send()
            .await
            .map_err(unreachable)?;
        parse(resp, FIRMWARES_PATH).await
    }

    /// URL a device downloads `version` from.
    pub fn download_url(&self, version: &Version) -> Result<Url, Error> {
        Ok(self.base_url.join(&download_path(&version.to_string()))?)
    }

    /// Register a device and return the token it must present.
    pub async fn register_device(
        &self,
        device_id: &str,
        device_name: Option<&str>,
        device_type: Option<&str>,
    ) -> Result<RegisterResponse, Error> {
        let body = RegisterRequest {
            device_id: device_id.to_string(),
            device_name: device_name.map(str::to_string),
            device_type: device_type.map(str::to_string),
        };
        let resp = self
            .client
            .post(self.base_url.join(REGISTER_PATH)?)
            .json(&body)
            .send()
            .await
            .map_err(unreachable)?;
        parse(resp, REGISTER_PATH).await
    }

    /// Generate a new API key labelled `name`.
    pub async fn generate_api_key(&self, name: &str) -> Result<ApiKeyResponse, Error> {
        let resp = self
            .client
            .post(self.base_url.join(GENERATE_KEY_PATH)?)
            .query(&[("name", name)])
            .send()
            .await
            .map_err(unreachable)?;
        parse(resp, GENERATE_KEY_PATH).await
    }

    /// Names and creation dates of all API keys.
    pub async fn api_keys(&self) -> Result<ApiKeyList, Error> {
        let resp = self
            .client
            .get(self.base_url.join(KEYS_PATH)?)
            .send()
            .await
            .map_err(unreachable)?;
        parse(resp, KEYS_PATH).await
    }
}

async fn parse<T: DeserializeOwned>(resp: Response, what: &str) -> Result<T, Error> {
    match resp.status() {
        s if s.is_success() => resp.json().await.map_err(unreachable),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::AuthenticationRequired),
        StatusCode::NOT_FOUND => Err(Error::NotFound(what.to_string())),
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(Error::InvalidUpload(format!("HTTP {}: {}", status, body)))
        }
        s => Err(Error::SourceUnreachable(format!(
            "{} returned HTTP {}",
            resp.url(),
            s
        ))),
    }
}

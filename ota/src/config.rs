// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client and server configuration, loaded from a JSON file or the environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credential::Credential;
use crate::descriptor::DeviceIdentity;
use crate::error::Error;
use crate::orchestrator::OrchestratorConfig;
use crate::server::REGISTRY_DOCUMENT;
use crate::source::{ReleaseFeed, ServerFeed, UpdateSource};
use crate::version::Version;

/// Device-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// URL of the update server.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Watch the releases of this repository (`owner/name`) instead of the
    /// update server.
    #[serde(default)]
    pub release_repo: Option<String>,

    /// Token for private release repositories.
    #[serde(default)]
    pub release_token: Option<String>,

    /// Device identifier.
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Version running on the device.
    #[serde(default = "default_current_version")]
    pub current_version: Version,

    /// Directory artifacts are downloaded to.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Timeout of update checks, and maximum download stall, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Seconds between two scheduled checks.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Install updates as soon as they are found.
    #[serde(default = "default_true")]
    pub auto_install: bool,

    /// Install firmware published without a digest.
    #[serde(default)]
    pub allow_unverified: bool,

    /// Device token issued at registration.
    #[serde(default)]
    pub device_token: Option<String>,

    /// Publisher API key, used when no device token is set.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_server_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_device_id() -> String {
    "device_001".to_string()
}

fn default_current_version() -> Version {
    Version::new(vec![0, 0, 0])
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_request_timeout() -> u64 {
    30
}

fn default_check_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            release_repo: None,
            release_token: None,
            device_id: default_device_id(),
            current_version: default_current_version(),
            download_dir: default_download_dir(),
            request_timeout: default_request_timeout(),
            check_interval: default_check_interval(),
            auto_install: true,
            allow_unverified: false,
            device_token: None,
            api_key: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from variables provided by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(url) = lookup("OTA_SERVER_URL") {
            config.server_url = url;
        }
        config.release_repo = lookup("OTA_RELEASE_REPO").filter(|r| !r.is_empty());
        config.release_token = lookup("OTA_RELEASE_TOKEN").filter(|t| !t.is_empty());
        if let Some(id) = lookup("DEVICE_ID") {
            config.device_id = id;
        }
        if let Some(version) = lookup("CURRENT_VERSION") {
            config.current_version = version.parse()?;
        }
        if let Some(dir) = lookup("DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Some(timeout) = lookup("REQUEST_TIMEOUT") {
            config.request_timeout = parse_var("REQUEST_TIMEOUT", &timeout)?;
        }
        if let Some(interval) = lookup("AUTO_CHECK_INTERVAL") {
            config.check_interval = parse_var("AUTO_CHECK_INTERVAL", &interval)?;
        }
        if let Some(flag) = lookup("OTA_AUTO_INSTALL") {
            config.auto_install = parse_flag("OTA_AUTO_INSTALL", &flag)?;
        }
        if let Some(flag) = lookup("OTA_ALLOW_UNVERIFIED") {
            config.allow_unverified = parse_flag("OTA_ALLOW_UNVERIFIED", &flag)?;
        }
        config.device_token = lookup("OTA_DEVICE_TOKEN").filter(|t| !t.is_empty());
        config.api_key = lookup("OTA_API_KEY").filter(|k| !k.is_empty());

        Ok(config)
    }

    /// Get request timeout as Duration.
    pub fn request_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Get check interval as Duration.
    pub fn check_interval_duration(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    /// Identity of this device, with the configured credential.
    pub fn device_identity(&self) -> DeviceIdentity {
        let identity = DeviceIdentity::new(&self.device_id, self.current_version.clone());
        match (&self.device_token, &self.api_key) {
            (Some(token), _) => identity.with_credential(Credential::DeviceToken(token.clone())),
            (None, Some(key)) => identity.with_credential(Credential::ApiKey(key.clone())),
            (None, None) => identity,
        }
    }

    /// The configured update source: the release feed if a repository is
    /// set, the update server otherwise.
    pub fn source(&self) -> Result<UpdateSource, Error> {
        let timeout = self.request_timeout_duration();
        match &self.release_repo {
            Some(repo) => {
                let mut feed = ReleaseFeed::new(repo)?
                    .check_timeout(timeout)
                    .download_timeout(timeout);
                if let Some(token) = &self.release_token {
                    feed = feed.token(token);
                }
                Ok(feed.into())
            }
            None => Ok(ServerFeed::new(&self.server_url)?
                .check_timeout(timeout)
                .download_timeout(timeout)
                .into()),
        }
    }

    /// Orchestrator settings.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            download_dir: self.download_dir.clone(),
            auto_install: self.auto_install,
            allow_unverified: self.allow_unverified,
        }
    }
}

/// Update server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory holding the artifacts and the registry document.
    #[serde(default = "default_firmware_dir")]
    pub firmware_dir: PathBuf,

    /// Directory holding the API key and device token documents.
    #[serde(default = "default_auth_dir")]
    pub auth_dir: PathBuf,

    /// Maximum upload size in bytes.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,

    /// Secret signing device tokens. A random secret is generated when
    /// unset, invalidating issued tokens on restart.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Lifetime of device tokens, in days.
    #[serde(default = "default_token_validity")]
    pub token_validity_days: i64,
}

fn default_firmware_dir() -> PathBuf {
    PathBuf::from("firmware")
}

fn default_auth_dir() -> PathBuf {
    PathBuf::from("auth")
}

fn default_max_upload_size() -> u64 {
    50 * 1024 * 1024
}

fn default_token_validity() -> i64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            firmware_dir: default_firmware_dir(),
            auth_dir: default_auth_dir(),
            max_upload_size: default_max_upload_size(),
            jwt_secret: None,
            token_validity_days: default_token_validity(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from variables provided by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(dir) = lookup("FIRMWARE_DIR") {
            config.firmware_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("AUTH_DIR") {
            config.auth_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("MAX_UPLOAD_SIZE_MB") {
            let mb: u64 = parse_var("MAX_UPLOAD_SIZE_MB", &size)?;
            config.max_upload_size = mb * 1024 * 1024;
        }
        config.jwt_secret = lookup("JWT_SECRET").filter(|s| !s.is_empty());
        if let Some(days) = lookup("TOKEN_VALIDITY_DAYS") {
            config.token_validity_days = parse_var("TOKEN_VALIDITY_DAYS", &days)?;
        }

        Ok(config)
    }

    /// Path of the registry document.
    pub fn registry_path(&self) -> PathBuf {
        self.firmware_dir.join(REGISTRY_DOCUMENT)
    }

    /// Path of the API key document.
    pub fn api_keys_path(&self) -> PathBuf {
        self.auth_dir.join("api_keys.json")
    }

    /// Path of the device token document.
    pub fn device_tokens_path(&self) -> PathBuf {
        self.auth_dir.join("device_tokens.json")
    }

    /// Lifetime of device tokens.
    pub fn token_validity(&self) -> chrono::Duration {
        chrono::Duration::days(self.token_validity_days)
    }

    /// The configured secret, or a fresh random one.
    pub fn token_secret(&self) -> Vec<u8> {
        match &self.jwt_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => rand::random::<[u8; 32]>().to_vec(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{}={}", name, value)))
}

fn parse_flag(name: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidConfig(format!("{}={}", name, value))),
    }
}

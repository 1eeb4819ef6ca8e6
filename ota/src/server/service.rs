// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

// Request handlers of the update server

use std::path::PathBuf;

use log::{debug, info};

use super::registry::{Registry, RegistryEntry, RegistryStore, Upload};
use super::JsonStore;
use crate::config::ServerConfig;
use crate::credential::{Class, Gate, Presented, Principal};
use crate::error::Error;
use crate::protocol::{
    ApiKeyList, ApiKeyResponse, ApiKeySummary, CheckRequest, CheckResponse, FirmwareInfo,
    FirmwareList, MessageResponse, RegisterRequest, RegisterResponse, UploadResponse,
};
use crate::version::Version;

/// The update server: a firmware registry behind a credential gate.
#[derive(Debug)]
pub struct UpdateService<S = JsonStore<RegistryEntry>> {
    registry: Registry<S>,
    gate: Gate,
}

impl UpdateService {
    /// Open the registry and credential documents named by `config`.
    pub fn open(config: &ServerConfig) -> Result<Self, Error> {
        let registry = Registry::new(
            JsonStore::open(config.registry_path())?,
            &config.firmware_dir,
        )
        .with_max_upload_size(config.max_upload_size);
        let gate = Gate::new(
            &config.token_secret(),
            JsonStore::open(config.api_keys_path())?,
            JsonStore::open(config.device_tokens_path())?,
            config.token_validity(),
        );
        Ok(Self::new(registry, gate))
    }
}

impl<S: RegistryStore> UpdateService<S> {
    /// Serve `registry`, guarded by `gate`.
    pub fn new(registry: Registry<S>, gate: Gate) -> Self {
        Self { registry, gate }
    }

    /// The firmware registry.
    pub fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    /// The credential gate.
    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    /// Offer the newest firmware if it is strictly newer than the device's.
    ///
    /// A device token may only check for the device it was issued to.
    pub fn check_update(
        &self,
        presented: Presented<'_>,
        request: &CheckRequest,
    ) -> Result<CheckResponse, Error> {
        match self.gate.authorize(presented, Class::Consume)? {
            Principal::Consumer { device_id } if device_id != request.device_id => {
                debug!(
                    "token of '{}' used to check for '{}'",
                    device_id, request.device_id
                );
                return Err(Error::PermissionDenied);
            }
            _ => {}
        }

        let current: Version = request.current_version.parse()?;
        let latest = match self.registry.latest() {
            Some(latest) => latest,
            None => {
                return Ok(CheckResponse {
                    update_available: false,
                    current_version: Some(request.current_version.clone()),
                    message: Some("No firmware published".to_string()),
                    ..Default::default()
                })
            }
        };

        if latest.version.is_newer_than(&current) {
            info!(
                "offering {} to '{}' running {}",
                latest.version, request.device_id, current
            );
            Ok(CheckResponse {
                update_available: true,
                latest_version: Some(latest.version.to_string()),
                current_version: Some(request.current_version.clone()),
                firmware_info: Some(latest.info()),
                message: None,
            })
        } else {
            Ok(CheckResponse {
                update_available: false,
                latest_version: Some(latest.version.to_string()),
                current_version: Some(request.current_version.clone()),
                firmware_info: None,
                message: Some("Already on the latest version".to_string()),
            })
        }
    }

    /// Locate the artifact of `version`.
    pub fn download(
        &self,
        presented: Presented<'_>,
        version: &str,
    ) -> Result<(FirmwareInfo, PathBuf), Error> {
        self.gate.authorize(presented, Class::Consume)?;

        let entry = self.registry.get(&version.parse()?)?;
        let path = self.registry.artifact_path(&entry);
        if !path.is_file() {
            return Err(Error::NotFound(version.to_string()));
        }

        Ok((entry.info(), path))
    }

    /// All published firmwares.
    pub fn list(&self, presented: Presented<'_>) -> Result<FirmwareList, Error> {
        self.gate.authorize(presented, Class::Consume)?;

        let firmwares: Vec<FirmwareInfo> = self.registry.list().iter().map(|e| e.info()).collect();
        Ok(FirmwareList {
            count: firmwares.len(),
            firmwares,
        })
    }

    /// Publish a firmware.
    pub fn upload(&self, presented: Presented<'_>, upload: Upload) -> Result<UploadResponse, Error> {
        let publisher = self.gate.authorize(presented, Class::Publish)?;
        debug!("upload of {} by {:?}", upload.version, publisher);

        let entry = self.registry.publish(upload)?;
        Ok(UploadResponse {
            message: format!("Firmware {} uploaded", entry.version),
            firmware_info: entry.info(),
        })
    }

    /// Delete the firmware of `version`.
    pub fn delete(&self, presented: Presented<'_>, version: &str) -> Result<MessageResponse, Error> {
        self.gate.authorize(presented, Class::Publish)?;

        let entry = self.registry.remove(&version.parse()?)?;
        Ok(MessageResponse {
            message: format!("Firmware version {} deleted", entry.version),
        })
    }

    /// Issue a device token.
    pub fn register_device(
        &self,
        presented: Presented<'_>,
        request: &RegisterRequest,
    ) -> Result<RegisterResponse, Error> {
        let publisher = self.gate.authorize(presented, Class::Publish)?;
        if request.device_id.trim().is_empty() {
            return Err(Error::InvalidUpload("missing device id".to_string()));
        }

        let token = self
            .gate
            .issue_device_token(&publisher, &request.device_id)?;
        Ok(RegisterResponse {
            device_id: request.device_id.clone(),
            token,
        })
    }

    /// Generate an API key labelled `name`.
    ///
    /// Anonymous callers are only served while no key exists.
    pub fn generate_api_key(
        &self,
        presented: Presented<'_>,
        name: &str,
    ) -> Result<ApiKeyResponse, Error> {
        let caller = match self.gate.authenticate(presented) {
            Ok(principal) => Some(principal),
            Err(Error::Unauthenticated) => None,
            Err(e) => return Err(e),
        };

        let api_key = self.gate.generate_api_key(caller.as_ref(), name)?;
        Ok(ApiKeyResponse {
            api_key,
            name: name.to_string(),
        })
    }

    /// Names and creation dates of the API keys.
    pub fn api_keys(&self, presented: Presented<'_>) -> Result<ApiKeyList, Error> {
        let publisher = self.gate.authorize(presented, Class::Publish)?;

        let keys = self
            .gate
            .api_keys(&publisher)?
            .into_iter()
            .map(|info| ApiKeySummary {
                name: info.name,
                created_at: info.created_at,
            })
            .collect();
        Ok(ApiKeyList { keys })
    }

    /// Revoke `key`.
    pub fn revoke_api_key(
        &self,
        presented: Presented<'_>,
        key: &str,
    ) -> Result<MessageResponse, Error> {
        let publisher = self.gate.authorize(presented, Class::Publish)?;

        if self.gate.revoke_api_key(&publisher, key)? {
            Ok(MessageResponse {
                message: "API key revoked".to_string(),
            })
        } else {
            Err(Error::NotFound("API key".to_string()))
        }
    }
}

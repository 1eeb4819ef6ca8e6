// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

// Published firmware and per-check results

use chrono::{DateTime, Utc};
use url::Url;

use crate::credential::Credential;
use crate::version::Version;

/// How the artifact of a descriptor was located.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ArtifactOrigin {
    /// Named by the update server registry
    Registry,
    /// Release asset with a firmware extension
    ReleaseAsset,
    /// First release asset, picked because none had a firmware extension
    ReleaseFallback,
}

/// Metadata of one published firmware artifact.
#[derive(Debug, Clone)]
pub struct FirmwareDescriptor {
    /// Firmware version
    pub version: Version,
    /// Where the artifact is downloaded from
    pub locator: Url,
    /// File name to store the artifact under
    pub file_name: String,
    /// Declared size in bytes, 0 if unknown
    pub size: u64,
    /// Hex SHA-256 digest, if published
    pub digest: Option<String>,
    /// Release notes
    pub description: String,
    /// Publication time, if known
    pub published_at: Option<DateTime<Utc>>,
    /// How the artifact was located
    pub origin: ArtifactOrigin,
}

impl FirmwareDescriptor {
    /// The declared size, if any.
    pub fn declared_size(&self) -> Option<u64> {
        if self.size > 0 {
            Some(self.size)
        } else {
            None
        }
    }
}

/// Answer of an update source for one device.
#[derive(Debug, Clone)]
pub enum UpdateCheckResult {
    /// Nothing strictly newer than the current version.
    NoUpdate {
        /// Version the device runs
        current: Version,
        /// Newest version known to the source, if it told us
        latest: Option<Version>,
        /// Human-readable explanation
        reason: String,
    },
    /// A strictly newer firmware is published.
    UpdateAvailable {
        /// The newer version
        latest: Version,
        /// Where and how to fetch it
        descriptor: FirmwareDescriptor,
    },
}

/// A device as seen by its own update client.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Device identifier
    pub device_id: String,
    /// Running firmware version
    pub current_version: Version,
    /// Credential attached to feed requests
    pub credential: Option<Credential>,
}

impl DeviceIdentity {
    /// Create an identity without credential.
    pub fn new(device_id: &str, current_version: Version) -> Self {
        Self {
            device_id: device_id.to_string(),
            current_version,
            credential: None,
        }
    }

    /// Attach a credential.
    pub fn with_credential(self, credential: Credential) -> Self {
        let mut identity = self;
        identity.credential = Some(credential);
        identity
    }
}

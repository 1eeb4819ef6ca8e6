// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

// JSON bodies exchanged with the update server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Path of the update check endpoint.
pub const CHECK_UPDATE_PATH: &str = "api/check-update";
/// Path of the firmware listing endpoint.
pub const FIRMWARES_PATH: &str = "api/firmwares";
/// Path of the upload endpoint.
pub const UPLOAD_PATH: &str = "api/upload";
/// Path of the device registration endpoint.
pub const REGISTER_PATH: &str = "api/auth/register";
/// Path of the API key generation endpoint.
pub const GENERATE_KEY_PATH: &str = "api/auth/generate-key";
/// Path of the API key listing endpoint.
pub const KEYS_PATH: &str = "api/auth/keys";

/// Path downloading the artifact of `version`.
pub fn download_path(version: &str) -> String {
    format!("api/download/{}", version)
}

/// Path deleting the firmware of `version`.
pub fn firmware_path(version: &str) -> String {
    format!("api/firmware/{}", version)
}

/// Sent by a device to ask for a newer firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    /// Version running on the device
    pub current_version: String,
    /// Device identifier
    pub device_id: String,
}

/// Answer to a [`CheckRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    /// Whether `firmware_info` describes a strictly newer firmware
    pub update_available: bool,
    /// Newest published version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    /// Echo of the device version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    /// The newer firmware
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_info: Option<FirmwareInfo>,
    /// Human-readable explanation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Public description of a published firmware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareInfo {
    /// Firmware version
    pub version: String,
    /// Artifact size in bytes
    pub size: u64,
    /// Hex SHA-256 digest of the artifact
    #[serde(default)]
    pub checksum: Option<String>,
    /// Release notes
    #[serde(default)]
    pub description: String,
    /// URL or server-relative path of the artifact
    pub download_url: String,
    /// Publication time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<DateTime<Utc>>,
}

/// All published firmwares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirmwareList {
    /// Firmwares, oldest version first
    pub firmwares: Vec<FirmwareInfo>,
    /// Number of firmwares
    pub count: usize,
}

/// Answer to a successful upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    /// Human-readable status
    pub message: String,
    /// What was stored, as computed by the server
    pub firmware_info: FirmwareInfo,
}

/// Registration of a device by a publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Device identifier the token will be bound to
    pub device_id: String,
    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Optional hardware type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
}

/// Token issued to a registered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    /// Device identifier
    pub device_id: String,
    /// Signed device token
    pub token: String,
}

/// A freshly generated API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyResponse {
    /// The key; it is never shown again
    pub api_key: String,
    /// Its label
    pub name: String,
}

/// Public part of an API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeySummary {
    /// Label
    pub name: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// All API keys, without secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyList {
    /// Keys
    pub keys: Vec<ApiKeySummary>,
}

/// Plain status answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Human-readable status
    pub message: String,
}

// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mock of the update server API.
//!
//! Firmwares are registered first, then devices: the check-update answer of
//! a device is computed from the firmwares known when it is added.
//!
//! ```
//! use ota_mock::server::{Firmware, ServerBuilder};
//!
//! let server = ServerBuilder::default().build();
//! let download = server.add_firmware(Firmware::new("1.1.0", b"new firmware".to_vec()));
//! let device = server.add_device("esp32-01", "1.0.0");
//!
//! assert_eq!(device.check_hits(), 0);
//! assert_eq!(download.hits(), 0);
//! ```

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use httpmock::{
    Method::{DELETE, GET, POST},
    MockRef, MockServer,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use ota::Version;

const API_KEY_HEADER: &str = "X-API-Key";

/// Builder of [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    check_delay: Option<Duration>,
}

impl ServerBuilder {
    /// Delay every check-update answer by `delay`.
    pub fn check_delay(self, delay: Duration) -> Self {
        let mut builder = self;
        builder.check_delay = Some(delay);
        builder
    }

    /// Start the mock server.
    pub fn build(self) -> Server {
        Server {
            server: Rc::new(MockServer::start()),
            firmwares: RefCell::new(Vec::new()),
            check_delay: self.check_delay,
        }
    }
}

/// A firmware served by the mock.
#[derive(Debug, Clone)]
pub struct Firmware {
    version: String,
    content: Vec<u8>,
    checksum: Option<String>,
    size: u64,
    description: String,
    download_delay: Option<Duration>,
}

impl Firmware {
    /// A firmware whose advertised size and checksum match `content`.
    pub fn new(version: &str, content: Vec<u8>) -> Self {
        let checksum = hex::encode(Sha256::digest(&content));
        Self {
            version: version.to_string(),
            size: content.len() as u64,
            checksum: Some(checksum),
            content,
            description: String::new(),
            download_delay: None,
        }
    }

    /// Advertise `checksum` instead of the real one; `None` advertises none.
    pub fn checksum(self, checksum: Option<&str>) -> Self {
        let mut firmware = self;
        firmware.checksum = checksum.map(str::to_string);
        firmware
    }

    /// Advertise `size` instead of the real one.
    pub fn size(self, size: u64) -> Self {
        let mut firmware = self;
        firmware.size = size;
        firmware
    }

    /// Set the release notes.
    pub fn description(self, description: &str) -> Self {
        let mut firmware = self;
        firmware.description = description.to_string();
        firmware
    }

    /// Delay the download answer by `delay`.
    pub fn download_delay(self, delay: Duration) -> Self {
        let mut firmware = self;
        firmware.download_delay = Some(delay);
        firmware
    }

    /// The firmware version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The served bytes.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Server path of the artifact.
    pub fn download_path(&self) -> String {
        format!("/api/download/{}", self.version)
    }

    fn info(&self) -> Value {
        json!({
            "version": self.version,
            "size": self.size,
            "checksum": self.checksum,
            "description": self.description,
            "downloadUrl": self.download_path(),
        })
    }
}

/// Mock update server.
pub struct Server {
    server: Rc<MockServer>,
    firmwares: RefCell<Vec<Firmware>>,
    check_delay: Option<Duration>,
}

impl Server {
    /// URL of the server.
    pub fn base_url(&self) -> String {
        self.server.base_url()
    }

    /// Publish `firmware` and serve its artifact. Returns the download mock.
    pub fn add_firmware(&self, firmware: Firmware) -> MockRef<'_> {
        let mock = self.server.mock(|when, then| {
            when.method(GET).path(firmware.download_path());

            let then = then
                .status(200)
                .header("Content-Type", "application/octet-stream")
                .body(&firmware.content);
            if let Some(delay) = firmware.download_delay {
                then.delay(delay);
            }
        });

        self.firmwares.borrow_mut().push(firmware);
        mock
    }

    /// Add a device running `current_version`.
    ///
    /// Its check-update requests must carry the bearer token
    /// [`Device::token`] and are answered with the newest registered
    /// firmware if strictly newer.
    pub fn add_device(&self, name: &str, current_version: &str) -> Device<'_> {
        let response = self.check_response(current_version);
        self.add_device_with_response(name, current_version, response)
    }

    /// Add a device whose check-update requests are answered with `response`.
    pub fn add_device_with_response(
        &self,
        name: &str,
        current_version: &str,
        response: Value,
    ) -> Device<'_> {
        let token = format!("Token{}", name);
        let check = self.server.mock(|when, then| {
            when.method(POST)
                .path("/api/check-update")
                .header("Content-Type", "application/json")
                .header("Authorization", &format!("Bearer {}", token))
                .json_body(json!({
                    "currentVersion": current_version,
                    "deviceId": name,
                }));

            let then = then
                .status(200)
                .header("Content-Type", "application/json")
                .json_body(response);
            if let Some(delay) = self.check_delay {
                then.delay(delay);
            }
        });

        Device {
            name: name.to_string(),
            token,
            check,
        }
    }

    /// Answer every check-update request with HTTP 401.
    pub fn reject_checks(&self) -> MockRef<'_> {
        self.server.mock(|when, then| {
            when.method(POST).path("/api/check-update");

            then.status(401)
                .header("Content-Type", "application/json")
                .json_body(json!({
                    "detail": "Authentication required. Use X-API-Key header or Bearer token"
                }));
        })
    }

    /// Expect an upload of `version` by the holder of `api_key`.
    pub fn expect_upload(&self, api_key: &str, firmware: &Firmware) -> MockRef<'_> {
        self.server.mock(|when, then| {
            when.method(POST)
                .path("/api/upload")
                .header(API_KEY_HEADER, api_key)
                .body_contains("name=\"version\"")
                .body_contains(&firmware.version);

            then.status(200)
                .header("Content-Type", "application/json")
                .json_body(json!({
                    "message": "Firmware uploaded",
                    "firmwareInfo": firmware.info(),
                }));
        })
    }

    /// Reject any upload as too large.
    pub fn reject_uploads(&self) -> MockRef<'_> {
        self.server.mock(|when, then| {
            when.method(POST).path("/api/upload");

            then.status(413)
                .header("Content-Type", "application/json")
                .json_body(json!({ "detail": "Firmware too large" }));
        })
    }

    /// Expect a listing by the holder of `api_key`; answers with the
    /// registered firmwares.
    pub fn expect_list(&self, api_key: &str) -> MockRef<'_> {
        let firmwares: Vec<Value> = self.firmwares.borrow().iter().map(Firmware::info).collect();
        let count = firmwares.len();

        self.server.mock(|when, then| {
            when.method(GET)
                .path("/api/firmwares")
                .header(API_KEY_HEADER, api_key);

            then.status(200)
                .header("Content-Type", "application/json")
                .json_body(json!({
                    "firmwares": firmwares,
                    "count": count,
                }));
        })
    }

    /// Expect the deletion of `version`; answers 404 if it is not registered.
    pub fn expect_delete(&self, api_key: &str, version: &str) -> MockRef<'_> {
        let known = self.firmwares.borrow().iter().any(|f| f.version == version);

        self.server.mock(|when, then| {
            when.method(DELETE)
                .path(format!("/api/firmware/{}", version))
                .header(API_KEY_HEADER, api_key);

            if known {
                then.status(200)
                    .header("Content-Type", "application/json")
                    .json_body(json!({
                        "message": format!("Firmware version {} deleted", version)
                    }));
            } else {
                then.status(404)
                    .header("Content-Type", "application/json")
                    .json_body(json!({ "detail": "Firmware not found" }));
            }
        })
    }

    /// Expect the registration of `device_id`; answers with the token the
    /// device mock of the same name accepts.
    pub fn expect_register(&self, api_key: &str, device_id: &str) -> MockRef<'_> {
        self.server.mock(|when, then| {
            when.method(POST)
                .path("/api/auth/register")
                .header(API_KEY_HEADER, api_key)
                .body_contains(device_id);

            then.status(200)
                .header("Content-Type", "application/json")
                .json_body(json!({
                    "deviceId": device_id,
                    "token": format!("Token{}", device_id),
                }));
        })
    }

    /// Expect the generation of an API key labelled `name`; the new key is
    /// `Key{name}`.
    pub fn expect_generate_key(&self, api_key: &str, name: &str) -> MockRef<'_> {
        self.server.mock(|when, then| {
            when.method(POST)
                .path("/api/auth/generate-key")
                .header(API_KEY_HEADER, api_key)
                .query_param("name", name);

            then.status(200)
                .header("Content-Type", "application/json")
                .json_body(json!({
                    "apiKey": format!("Key{}", name),
                    "name": name,
                }));
        })
    }

    /// Expect a listing of API keys; answers with `names`.
    pub fn expect_keys(&self, api_key: &str, names: &[&str]) -> MockRef<'_> {
        let keys: Vec<Value> = names
            .iter()
            .map(|name| json!({ "name": name, "createdAt": "2021-03-01T12:00:00Z" }))
            .collect();

        self.server.mock(|when, then| {
            when.method(GET)
                .path("/api/auth/keys")
                .header(API_KEY_HEADER, api_key);

            then.status(200)
                .header("Content-Type", "application/json")
                .json_body(json!({ "keys": keys }));
        })
    }

    fn check_response(&self, current_version: &str) -> Value {
        let firmwares = self.firmwares.borrow();
        let latest = firmwares
            .iter()
            .filter_map(|f| f.version.parse::<Version>().ok().map(|v| (v, f)))
            .max_by(|(a, _), (b, _)| a.cmp(b));

        let current: Option<Version> = current_version.parse().ok();
        match (latest, current) {
            (Some((latest, firmware)), Some(current)) if latest > current => json!({
                "updateAvailable": true,
                "latestVersion": firmware.version,
                "currentVersion": current_version,
                "firmwareInfo": firmware.info(),
            }),
            (Some((_, firmware)), _) => json!({
                "updateAvailable": false,
                "latestVersion": firmware.version,
                "currentVersion": current_version,
                "message": "Already on the latest version",
            }),
            (None, _) => json!({
                "updateAvailable": false,
                "message": "No firmware published",
            }),
        }
    }
}

/// A device known to the mock server.
pub struct Device<'a> {
    /// Device identifier
    pub name: String,
    /// Bearer token the device must present
    pub token: String,
    check: MockRef<'a>,
}

impl<'a> Device<'a> {
    /// Number of check-update requests received from this device.
    pub fn check_hits(&self) -> usize {
        self.check.hits()
    }
}

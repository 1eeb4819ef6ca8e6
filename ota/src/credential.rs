// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

// Credentials and the publisher/consumer gate

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, info};
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::server::JsonStore;

/// Header carrying an API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// A secret presented by a client.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Long-lived publisher key, sent in the `X-API-Key` header.
    ApiKey(String),
    /// Signed, self-expiring device token, sent as `Authorization: Bearer`.
    DeviceToken(String),
}

impl Credential {
    /// Attach the credential to an outgoing request.
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Credential::ApiKey(key) => request.header(API_KEY_HEADER, key),
            Credential::DeviceToken(token) => request.bearer_auth(token),
        }
    }

    /// The raw secret.
    pub fn secret(&self) -> &str {
        match self {
            Credential::ApiKey(s) | Credential::DeviceToken(s) => s,
        }
    }
}

// Never print secrets
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::ApiKey(_) => write!(f, "ApiKey(***)"),
            Credential::DeviceToken(_) => write!(f, "DeviceToken(***)"),
        }
    }
}

pub(crate) fn apply_credential(
    request: RequestBuilder,
    credential: Option<&Credential>,
) -> RequestBuilder {
    match credential {
        Some(credential) => credential.apply(request),
        None => request,
    }
}

/// Credentials carried by one inbound request: zero or one of each kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct Presented<'a> {
    /// Value of the `X-API-Key` header
    pub api_key: Option<&'a str>,
    /// Token of an `Authorization: Bearer` header
    pub bearer: Option<&'a str>,
}

impl<'a> Presented<'a> {
    /// An anonymous request.
    pub fn none() -> Self {
        Self::default()
    }

    /// A request carrying an API key.
    pub fn api_key(key: &'a str) -> Self {
        Self {
            api_key: Some(key),
            bearer: None,
        }
    }

    /// A request carrying a bearer token.
    pub fn bearer(token: &'a str) -> Self {
        Self {
            api_key: None,
            bearer: Some(token),
        }
    }

    /// Extract credentials from request headers.
    pub fn from_headers(headers: &'a HeaderMap) -> Self {
        let api_key = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                let (scheme, token) = v.split_at(v.find(' ')?);
                if scheme.eq_ignore_ascii_case("bearer") {
                    Some(token.trim())
                } else {
                    None
                }
            })
            .filter(|v| !v.is_empty());

        Self { api_key, bearer }
    }
}

/// Operation classes guarded by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    /// Upload, delete, issue credentials
    Publish,
    /// Check for and download updates
    Consume,
}

/// Who is calling, as resolved by [`Gate::authenticate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// Holder of a valid API key
    Publisher {
        /// Name the key was generated with
        key_name: String,
    },
    /// Holder of a valid device token
    Consumer {
        /// Device the token was issued for
        device_id: String,
    },
}

impl Principal {
    /// Whether this principal may perform operations of `class`.
    pub fn satisfies(&self, class: Class) -> bool {
        match (self, class) {
            (Principal::Publisher { .. }, _) => true,
            (Principal::Consumer { .. }, Class::Consume) => true,
            (Principal::Consumer { .. }, Class::Publish) => false,
        }
    }
}

/// Metadata of an API key. The key itself is the document key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyInfo {
    /// Human-readable label
    pub name: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last successful authentication
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Record of the last token issued to a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    /// The signed token
    pub token: String,
    /// Issue time
    pub issued_at: DateTime<Utc>,
    /// Expiry time
    pub expires_at: DateTime<Utc>,
}

/// Claims signed into a device token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceClaims {
    /// Device the token is bound to
    pub device_id: String,
    /// Issued at, seconds since the epoch
    pub iat: i64,
    /// Expiry, seconds since the epoch
    pub exp: i64,
}

/// Stateless per-request classifier of callers into publishers and consumers.
pub struct Gate {
    api_keys: JsonStore<ApiKeyInfo>,
    device_tokens: JsonStore<IssuedToken>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_validity: Duration,
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("api_keys", &self.api_keys.len())
            .field("device_tokens", &self.device_tokens.len())
            .field("token_validity", &self.token_validity)
            .finish()
    }
}

impl Gate {
    /// Create a gate.
    ///
    /// # Arguments
    /// * `secret`: HMAC secret signing device tokens
    /// * `api_keys`: the API key document
    /// * `device_tokens`: the log of issued device tokens
    /// * `token_validity`: lifetime of newly issued device tokens
    pub fn new(
        secret: &[u8],
        api_keys: JsonStore<ApiKeyInfo>,
        device_tokens: JsonStore<IssuedToken>,
        token_validity: Duration,
    ) -> Self {
        Self {
            api_keys,
            device_tokens,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            token_validity,
        }
    }

    /// Resolve the caller: a valid API key wins, then a valid device token.
    pub fn authenticate(&self, presented: Presented<'_>) -> Result<Principal, Error> {
        if let Some(key) = presented.api_key {
            if let Some(key_name) = self.verify_api_key(key)? {
                return Ok(Principal::Publisher { key_name });
            }
            debug!("rejected unknown API key");
        }

        if let Some(token) = presented.bearer {
            if let Some(claims) = self.verify_device_token(token) {
                return Ok(Principal::Consumer {
                    device_id: claims.device_id,
                });
            }
            debug!("rejected invalid or expired device token");
        }

        Err(Error::Unauthenticated)
    }

    /// Resolve the caller and require it to satisfy `class`.
    pub fn authorize(&self, presented: Presented<'_>, class: Class) -> Result<Principal, Error> {
        let principal = self.authenticate(presented)?;
        if principal.satisfies(class) {
            Ok(principal)
        } else {
            Err(Error::PermissionDenied)
        }
    }

    /// Issue a device token. Only publishers may vouch for a device.
    pub fn issue_device_token(&self, caller: &Principal, device_id: &str) -> Result<String, Error> {
        if !caller.satisfies(Class::Publish) {
            return Err(Error::PermissionDenied);
        }

        let issued_at = Utc::now();
        let expires_at = issued_at + self.token_validity;
        let claims = DeviceClaims {
            device_id: device_id.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(Error::TokenSigning)?;

        self.device_tokens.insert(
            device_id,
            IssuedToken {
                token: token.clone(),
                issued_at,
                expires_at,
            },
        )?;
        info!("issued device token for '{}' until {}", device_id, expires_at);

        Ok(token)
    }

    /// Generate a new API key.
    ///
    /// Requires a publisher, except for the very first key which bootstraps
    /// an empty installation.
    pub fn generate_api_key(&self, caller: Option<&Principal>, name: &str) -> Result<String, Error> {
        let key = hex::encode(rand::random::<[u8; 32]>());
        let info = ApiKeyInfo {
            name: name.to_string(),
            created_at: Utc::now(),
            last_used_at: None,
        };

        // Emptiness is checked under the same lock as the insertion
        self.api_keys.try_modify(|keys| {
            match caller {
                _ if keys.is_empty() => info!("bootstrapping first API key '{}'", name),
                Some(caller) if caller.satisfies(Class::Publish) => {}
                Some(_) => return Err(Error::PermissionDenied),
                None => return Err(Error::Unauthenticated),
            }
            keys.insert(key.clone(), info);
            Ok(())
        })?;

        Ok(key)
    }

    /// Metadata of all API keys, without the keys themselves.
    pub fn api_keys(&self, caller: &Principal) -> Result<Vec<ApiKeyInfo>, Error> {
        if !caller.satisfies(Class::Publish) {
            return Err(Error::PermissionDenied);
        }
        Ok(self.api_keys.entries().into_iter().map(|(_, v)| v).collect())
    }

    /// Revoke an API key. Returns whether it existed.
    pub fn revoke_api_key(&self, caller: &Principal, key: &str) -> Result<bool, Error> {
        if !caller.satisfies(Class::Publish) {
            return Err(Error::PermissionDenied);
        }
        Ok(self.api_keys.remove(key)?.is_some())
    }

    /// Last token issued to `device_id`, if any.
    pub fn issued_token(&self, device_id: &str) -> Option<IssuedToken> {
        self.device_tokens.get(device_id)
    }

    // Returns the key name and records its use
    fn verify_api_key(&self, key: &str) -> Result<Option<String>, Error> {
        // Unknown keys never cause a write
        if self.api_keys.get(key).is_none() {
            return Ok(None);
        }
        self.api_keys.modify(|keys| {
            keys.get_mut(key).map(|info| {
                info.last_used_at = Some(Utc::now());
                info.name.clone()
            })
        })
    }

    fn verify_device_token(&self, token: &str) -> Option<DeviceClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        decode::<DeviceClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .ok()
    }
}

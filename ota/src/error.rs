// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

/// Errors raised while checking, fetching, verifying, installing or publishing firmware.
#[derive(Error, Debug)]
pub enum Error {
    /// A version string has a component which is not a non-negative integer
    #[error("Malformed version '{0}'")]
    MalformedVersion(String),
    /// The update feed could not be reached or answered with garbage
    #[error("Update source unreachable: {0}")]
    SourceUnreachable(String),
    /// The remote rejected an anonymous or badly authenticated request
    #[error("Authentication required")]
    AuthenticationRequired,
    /// No valid API key nor device token was presented
    #[error("Authentication required. Use X-API-Key header or Bearer token")]
    Unauthenticated,
    /// A consumer credential was presented for a publish-class operation
    #[error("Operation requires a publisher API key")]
    PermissionDenied,
    /// Transport error while receiving the artifact
    #[error("Failed to download firmware: {0}")]
    DownloadFailed(String),
    /// Received size differs from the declared size
    #[error("Size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch {
        /// Declared size
        expected: u64,
        /// Received size
        actual: u64,
    },
    /// Digest of the received artifact differs from the published one
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Published digest
        expected: String,
        /// Digest of the received bytes
        actual: String,
    },
    /// The descriptor has no digest and unverified installs are not allowed
    #[error("Firmware has no published digest, refusing unverified install")]
    IntegrityUnavailable,
    /// Another cycle is in flight for this device
    #[error("An update cycle is already running")]
    CycleAlreadyRunning,
    /// The install capability reported a failure
    #[error("Installation failed: {0}")]
    InstallFailed(String),
    /// The cycle was aborted by the caller or by shutdown
    #[error("Update cancelled")]
    Cancelled,
    /// No firmware is published for this version
    #[error("Firmware version {0} not found")]
    NotFound(String),
    /// Rejected upload
    #[error("Invalid upload: {0}")]
    InvalidUpload(String),
    /// Upload above the configured limit
    #[error("Firmware too large: {size} bytes, maximum is {max}")]
    PayloadTooLarge {
        /// Uploaded size
        size: u64,
        /// Configured maximum
        max: u64,
    },
    /// A configuration value could not be parsed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// URL error
    #[error("Could not parse url")]
    ParseUrlError(#[from] url::ParseError),
    /// Token error
    #[error("Invalid token format")]
    InvalidToken(#[from] reqwest::header::InvalidHeaderValue),
    /// Signing or decoding a device token failed for a reason other than validity
    #[error("Failed to sign device token")]
    TokenSigning(#[source] jsonwebtoken::errors::Error),
    /// IO error
    #[error("IO error")]
    Io(#[from] std::io::Error),
    /// Document (de)serialization error
    #[error("Invalid JSON document")]
    Json(#[from] serde_json::Error),
}

/// Why a cycle ended in the `Failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FailureReason {
    /// See [`Error::MalformedVersion`]
    MalformedVersion,
    /// See [`Error::SourceUnreachable`]
    SourceUnreachable,
    /// See [`Error::AuthenticationRequired`]
    AuthenticationRequired,
    /// See [`Error::DownloadFailed`]
    DownloadFailed,
    /// See [`Error::SizeMismatch`]
    SizeMismatch,
    /// See [`Error::ChecksumMismatch`]
    ChecksumMismatch,
    /// See [`Error::IntegrityUnavailable`]
    IntegrityUnavailable,
    /// See [`Error::InstallFailed`]
    InstallFailed,
    /// See [`Error::Cancelled`]
    Cancelled,
    /// Local failure (file system, bad URL...)
    Internal,
}

impl Error {
    /// Classify this error for the orchestrator's `Failed` state.
    pub fn reason(&self) -> FailureReason {
        match self {
            Error::MalformedVersion(_) => FailureReason::MalformedVersion,
            Error::SourceUnreachable(_) | Error::NotFound(_) => FailureReason::SourceUnreachable,
            Error::AuthenticationRequired
            | Error::Unauthenticated
            | Error::PermissionDenied => FailureReason::AuthenticationRequired,
            Error::DownloadFailed(_) => FailureReason::DownloadFailed,
            Error::SizeMismatch { .. } => FailureReason::SizeMismatch,
            Error::ChecksumMismatch { .. } => FailureReason::ChecksumMismatch,
            Error::IntegrityUnavailable => FailureReason::IntegrityUnavailable,
            Error::InstallFailed(_) => FailureReason::InstallFailed,
            Error::Cancelled => FailureReason::Cancelled,
            _ => FailureReason::Internal,
        }
    }

    /// HTTP status an update server answers with when a handler fails.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::MalformedVersion(_) | Error::InvalidUpload(_) => 400,
            Error::AuthenticationRequired | Error::Unauthenticated => 401,
            Error::PermissionDenied => 403,
            Error::NotFound(_) => 404,
            Error::PayloadTooLarge { .. } => 413,
            _ => 500,
        }
    }

    /// Whether retrying later (e.g. on the next scheduled tick) may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::SourceUnreachable(_) | Error::DownloadFailed(_) | Error::Cancelled
        )
    }
}

// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Over-the-air firmware updates.
//!
//! A device asks an [`UpdateSource`] whether a firmware strictly newer than
//! its running [`Version`] is published, downloads it, checks its SHA-256
//! digest and hands it to an installer. The [`Orchestrator`] drives that
//! cycle for one device; the [`server`] module holds the registry and the
//! credential gate answering the other side of the protocol.

#![warn(missing_docs)]

pub mod config;
pub mod credential;
pub mod integrity;
pub mod protocol;
pub mod publish;
pub mod server;
pub mod source;
pub mod version;

mod descriptor;
mod download;
mod driver;
mod error;
mod orchestrator;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use credential::Credential;
pub use descriptor::{ArtifactOrigin, DeviceIdentity, FirmwareDescriptor, UpdateCheckResult};
pub use download::{DownloadedArtifact, NoProgress, Progress, PROGRESS_STEP};
pub use driver::Driver;
pub use error::{Error, FailureReason};
pub use orchestrator::{Install, InstallError, Orchestrator, OrchestratorConfig, Outcome, State};
pub use publish::PublisherClient;
pub use source::{ReleaseFeed, ServerFeed, UpdateSource};
pub use version::Version;

// State guarded by our mutexes stays consistent even if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

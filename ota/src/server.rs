// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Update server side of the protocol.
//!
//! [`UpdateService`] answers every endpoint of the protocol, independently of
//! the HTTP framework serving it: each handler takes the credentials the
//! request [presented](crate::credential::Presented) and its decoded body.

mod registry;
mod service;
mod store;

pub use registry::{
    Registry, RegistryEntry, RegistryStore, Upload, DEFAULT_MAX_UPLOAD_SIZE, REGISTRY_DOCUMENT,
};
pub use service::UpdateService;
pub use store::JsonStore;

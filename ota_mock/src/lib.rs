// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! # ota_mock
//!
//! Mock implementations of the services an `ota` client talks to, built on
//! [httpmock](https://crates.io/crates/httpmock).
//!
//! The [`server`] module mocks the update server HTTP API, both its device
//! side (check and download) and its publisher side. The [`release`] module
//! mocks a GitHub-style release index.

pub mod release;
pub mod server;

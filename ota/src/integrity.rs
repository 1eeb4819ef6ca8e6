// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

// SHA-256 content digests

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::{fs::File, io::AsyncReadExt};

use crate::error::Error;

const HASH_BUFFER_SIZE: usize = 4096;

/// Lowercase hex SHA-256 digest of `bytes`.
pub fn digest_of(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// Check `bytes` against `expected`, ignoring case and surrounding whitespace.
pub fn verify(bytes: impl AsRef<[u8]>, expected: &str) -> bool {
    matches(&digest_of(bytes), expected)
}

/// Digest of a file, read in small blocks.
pub async fn digest_file(path: &Path) -> Result<String, Error> {
    let mut file = File::open(path).await?;
    let mut hasher = StreamHasher::default();
    let mut buffer = [0; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer[..]).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Check the digest of a file, failing with [`Error::ChecksumMismatch`].
pub async fn verify_file(path: &Path, expected: &str) -> Result<(), Error> {
    let actual = digest_file(path).await?;
    check(actual, expected)
}

pub(crate) fn check(actual: String, expected: &str) -> Result<(), Error> {
    if matches(&actual, expected) {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            expected: expected.trim().to_lowercase(),
            actual,
        })
    }
}

fn matches(actual: &str, expected: &str) -> bool {
    actual.eq_ignore_ascii_case(expected.trim())
}

/// Incremental digest, fed while bytes are received.
#[derive(Clone, Default)]
pub(crate) struct StreamHasher {
    hasher: Sha256,
}

impl StreamHasher {
    pub(crate) fn update(&mut self, data: impl AsRef<[u8]>) {
        self.hasher.update(data);
    }

    pub(crate) fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

// Streaming artifacts to disk

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use log::{debug, warn};
use tokio::{
    fs::{DirBuilder, File},
    io::AsyncWriteExt,
};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::integrity::{self, StreamHasher};

/// Minimum number of bytes received between two progress reports.
pub const PROGRESS_STEP: u64 = 64 * 1024;

/// Receives download progress.
pub trait Progress: Send + Sync {
    /// `done` bytes received out of `total`, 0 meaning the total is unknown.
    fn on_progress(&self, done: u64, total: u64);
}

impl<F> Progress for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn on_progress(&self, done: u64, total: u64) {
        self(done, total)
    }
}

/// Ignores progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn on_progress(&self, _done: u64, _total: u64) {}
}

/// A fully received artifact.
///
/// The file is deleted when the artifact is dropped, unless it was
/// [kept](DownloadedArtifact::keep).
#[derive(Debug)]
pub struct DownloadedArtifact {
    file: PathBuf,
    size: u64,
    digest: String,
    kept: bool,
}

impl DownloadedArtifact {
    /// Path of the downloaded file.
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Number of bytes received.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Hex SHA-256 digest of the received bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Check if the sha256sum of the received bytes matches `expected`.
    pub fn check_sha256(&self, expected: &str) -> Result<(), Error> {
        integrity::check(self.digest.clone(), expected)
    }

    /// Delete the file.
    pub fn discard(self) {
        drop(self);
    }

    /// Keep the file past the artifact, returning its path.
    pub fn keep(mut self) -> PathBuf {
        self.kept = true;
        std::mem::take(&mut self.file)
    }
}

impl Drop for DownloadedArtifact {
    fn drop(&mut self) {
        if !self.kept {
            remove_file(&self.file);
        }
    }
}

// Deletes the destination unless the download completed
struct PartialArtifact {
    path: PathBuf,
    complete: bool,
}

impl Drop for PartialArtifact {
    fn drop(&mut self) {
        if !self.complete {
            remove_file(&self.path);
        }
    }
}

fn remove_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove {}: {}", path.display(), e),
    }
}

/// Parameters of one transfer.
pub(crate) struct Transfer<'a, P: ?Sized> {
    pub(crate) dest: PathBuf,
    /// Progress denominator, 0 if unknown
    pub(crate) total: u64,
    /// Size the received bytes must add up to
    pub(crate) expected_size: Option<u64>,
    /// Maximum wait for the next chunk
    pub(crate) idle_timeout: Duration,
    pub(crate) progress: &'a P,
    pub(crate) cancel: &'a CancellationToken,
}

/// Write `stream` to `transfer.dest`, hashing on the fly.
///
/// The destination is removed on any failure, on cancellation, and if the
/// returned future is dropped before completion.
pub(crate) async fn receive<S, P>(
    stream: S,
    transfer: Transfer<'_, P>,
) -> Result<DownloadedArtifact, Error>
where
    S: Stream<Item = Result<Bytes, Error>> + Unpin,
    P: Progress + ?Sized,
{
    if let Some(dir) = transfer.dest.parent() {
        if !dir.exists() {
            DirBuilder::new().recursive(true).create(dir).await?;
        }
    }

    let mut partial = PartialArtifact {
        path: transfer.dest.clone(),
        complete: false,
    };
    let mut stream = stream;
    let mut dest = File::create(&transfer.dest).await?;
    let mut hasher = StreamHasher::default();
    let mut done: u64 = 0;
    let mut reported: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = transfer.cancel.cancelled() => return Err(Error::Cancelled),
            next = tokio::time::timeout(transfer.idle_timeout, stream.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                return Err(Error::DownloadFailed(format!(
                    "no data received for {:?}",
                    transfer.idle_timeout
                )))
            }
            Ok(None) => break,
            Ok(Some(chunk)) => chunk?,
        };

        let received = done + chunk.len() as u64;
        match transfer.expected_size {
            Some(expected) if received > expected => {
                return Err(Error::SizeMismatch {
                    expected,
                    actual: received,
                })
            }
            _ => {}
        }

        dest.write_all(&chunk).await?;
        hasher.update(&chunk);
        done = received;

        if done - reported >= PROGRESS_STEP {
            transfer.progress.on_progress(done, transfer.total);
            reported = done;
        }
    }

    dest.flush().await?;
    drop(dest);

    if let Some(expected) = transfer.expected_size {
        if expected != done {
            return Err(Error::SizeMismatch {
                expected,
                actual: done,
            });
        }
    }

    if reported != done || done == 0 {
        transfer.progress.on_progress(done, transfer.total);
    }

    partial.complete = true;
    Ok(DownloadedArtifact {
        file: partial.path.clone(),
        size: done,
        digest: hasher.finalize(),
        kept: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::Mutex;
    use tempdir::TempDir;

    fn chunks(data: &[&'static [u8]]) -> Vec<Result<Bytes, Error>> {
        data.iter().map(|d| Ok(Bytes::from_static(d))).collect()
    }

    #[tokio::test]
    async fn complete() {
        let dir = TempDir::new("ota-download").unwrap();
        let dest = dir.path().join("nested").join("fw.bin");
        let cancel = CancellationToken::new();
        let calls = Mutex::new(Vec::new());
        let progress = |done: u64, total: u64| calls.lock().unwrap().push((done, total));

        let artifact = receive(
            stream::iter(chunks(&[b"hello", b" ", b"world"])),
            Transfer {
                dest: dest.clone(),
                total: 11,
                expected_size: Some(11),
                idle_timeout: Duration::from_secs(5),
                progress: &progress,
                cancel: &cancel,
            },
        )
        .await
        .unwrap();

        assert_eq!(artifact.file(), dest.as_path());
        assert_eq!(artifact.size(), 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        artifact
            .check_sha256("B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9")
            .unwrap();
        // Small chunks are coalesced into one final report
        assert_eq!(*calls.lock().unwrap(), vec![(11, 11)]);

        artifact.discard();
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn bounded_progress() {
        let dir = TempDir::new("ota-download").unwrap();
        let cancel = CancellationToken::new();
        let calls = Mutex::new(0u32);
        let progress = |_: u64, _: u64| *calls.lock().unwrap() += 1;

        // 256 chunks of 1 KiB
        let data: Vec<Result<Bytes, Error>> =
            (0..256).map(|_| Ok(Bytes::from(vec![0u8; 1024]))).collect();

        let artifact = receive(
            stream::iter(data),
            Transfer {
                dest: dir.path().join("fw.bin"),
                total: 0,
                expected_size: None,
                idle_timeout: Duration::from_secs(5),
                progress: &progress,
                cancel: &cancel,
            },
        )
        .await
        .unwrap();

        assert_eq!(artifact.size(), 256 * 1024);
        assert_eq!(*calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn size_mismatch() {
        let dir = TempDir::new("ota-download").unwrap();
        let dest = dir.path().join("fw.bin");
        let cancel = CancellationToken::new();

        let result = receive(
            stream::iter(chunks(&[b"short"])),
            Transfer {
                dest: dest.clone(),
                total: 0,
                expected_size: Some(100),
                idle_timeout: Duration::from_secs(5),
                progress: &NoProgress,
                cancel: &cancel,
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::SizeMismatch {
                expected: 100,
                actual: 5
            })
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn oversized_body() {
        let dir = TempDir::new("ota-download").unwrap();
        let dest = dir.path().join("fw.bin");
        let cancel = CancellationToken::new();

        // Never ends
        let endless =
            stream::iter(std::iter::repeat_with(|| Ok(Bytes::from(vec![0u8; 1024]))));

        let result = receive(
            endless,
            Transfer {
                dest: dest.clone(),
                total: 0,
                expected_size: Some(2048),
                idle_timeout: Duration::from_secs(5),
                progress: &NoProgress,
                cancel: &cancel,
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::SizeMismatch {
                expected: 2048,
                actual: 3072
            })
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn dropped_artifact() {
        let dir = TempDir::new("ota-download").unwrap();
        let cancel = CancellationToken::new();
        let transfer = |name: &str| Transfer {
            dest: dir.path().join(name),
            total: 0,
            expected_size: None,
            idle_timeout: Duration::from_secs(5),
            progress: &NoProgress,
            cancel: &cancel,
        };

        let artifact = receive(stream::iter(chunks(&[b"a"])), transfer("dropped.bin"))
            .await
            .unwrap();
        let path = artifact.file().to_path_buf();
        drop(artifact);
        assert!(!path.exists());

        let artifact = receive(stream::iter(chunks(&[b"b"])), transfer("kept.bin"))
            .await
            .unwrap();
        let path = artifact.keep();
        assert_eq!(std::fs::read(path).unwrap(), b"b");
    }

    #[tokio::test]
    async fn transport_error() {
        let dir = TempDir::new("ota-download").unwrap();
        let dest = dir.path().join("fw.bin");
        let cancel = CancellationToken::new();

        let data = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(Error::DownloadFailed("connection reset".into())),
        ];
        let result = receive(
            stream::iter(data),
            Transfer {
                dest: dest.clone(),
                total: 0,
                expected_size: None,
                idle_timeout: Duration::from_secs(5),
                progress: &NoProgress,
                cancel: &cancel,
            },
        )
        .await;

        assert!(matches!(result, Err(Error::DownloadFailed(_))));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn cancelled_mid_transfer() {
        let dir = TempDir::new("ota-download").unwrap();
        let dest = dir.path().join("fw.bin");
        let cancel = CancellationToken::new();

        // Some bytes, then a stalled connection
        let stalled = stream::iter(chunks(&[b"first bytes"])).chain(stream::pending::<Result<Bytes, Error>>());

        let canceller = cancel.clone();
        let watched = dest.clone();
        tokio::spawn(async move {
            while !watched.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = receive(
            stalled,
            Transfer {
                dest: dest.clone(),
                total: 0,
                expected_size: None,
                idle_timeout: Duration::from_secs(30),
                progress: &NoProgress,
                cancel: &cancel,
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn stalled() {
        let dir = TempDir::new("ota-download").unwrap();
        let dest = dir.path().join("fw.bin");
        let cancel = CancellationToken::new();

        let result = receive(
            stream::pending::<Result<Bytes, Error>>(),
            Transfer {
                dest: dest.clone(),
                total: 0,
                expected_size: None,
                idle_timeout: Duration::from_millis(50),
                progress: &NoProgress,
                cancel: &cancel,
            },
        )
        .await;

        assert!(matches!(result, Err(Error::DownloadFailed(_))));
        assert!(!dest.exists());
    }
}

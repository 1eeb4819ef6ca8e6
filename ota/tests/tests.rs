// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use tempdir::TempDir;
use tokio_util::sync::CancellationToken;

use ota::{
    ArtifactOrigin, Credential, DeviceIdentity, DownloadedArtifact, Driver, Error, FailureReason,
    Install, InstallError, Orchestrator, OrchestratorConfig, Outcome, PublisherClient,
    ReleaseFeed, ServerFeed, State, Version,
};
use ota_mock::release::{Asset, Release, ReleaseServer};
use ota_mock::server::{Device, Firmware, Server, ServerBuilder};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn v(s: &str) -> Version {
    s.parse().expect("invalid version")
}

// Records installed images instead of flashing them
#[derive(Clone, Default)]
struct Flasher {
    images: Arc<Mutex<Vec<Vec<u8>>>>,
    broken: bool,
}

impl Flasher {
    fn broken() -> Self {
        Self {
            broken: true,
            ..Default::default()
        }
    }

    fn images(&self) -> Vec<Vec<u8>> {
        self.images.lock().unwrap().clone()
    }
}

impl Install for Flasher {
    fn install(&self, artifact: &DownloadedArtifact) -> Result<(), InstallError> {
        if self.broken {
            return Err("flash write failed".into());
        }
        let image = std::fs::read(artifact.file())?;
        self.images.lock().unwrap().push(image);
        Ok(())
    }
}

fn config(dir: &TempDir) -> OrchestratorConfig {
    OrchestratorConfig {
        download_dir: dir.path().join("downloads"),
        ..Default::default()
    }
}

fn leftovers(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path().join("downloads"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

fn server_feed(server: &Server) -> ServerFeed {
    ServerFeed::new(&server.base_url())
        .expect("feed creation failed")
        .check_timeout(Duration::from_secs(5))
        .download_timeout(Duration::from_secs(10))
}

fn identity(device: &Device, current_version: &str) -> DeviceIdentity {
    DeviceIdentity::new(&device.name, v(current_version))
        .with_credential(Credential::DeviceToken(device.token.clone()))
}

fn server_with_firmwares(versions: &[&str]) -> Server {
    let server = ServerBuilder::default().build();
    for version in versions {
        server.add_firmware(Firmware::new(version, format!("firmware {}", version).into_bytes()));
    }
    server
}

#[tokio::test]
async fn update_committed() {
    init();

    let server = ServerBuilder::default().build();
    let old = server.add_firmware(Firmware::new("1.0.1", b"patch".to_vec()));
    let image = vec![0xa5u8; 200 * 1024];
    let new = server.add_firmware(Firmware::new("1.1.0", image.clone()));
    server.add_firmware(Firmware::new("1.0.0", b"initial".to_vec()));
    let device = server.add_device("esp32-01", "1.0.0");

    let dir = TempDir::new("ota-test").unwrap();
    let flasher = Flasher::default();
    let reports = Arc::new(Mutex::new(Vec::new()));
    let recorder = reports.clone();
    let orchestrator = Orchestrator::new(
        server_feed(&server),
        identity(&device, "1.0.0"),
        flasher.clone(),
        config(&dir),
    )
    .with_progress(move |done: u64, total: u64| recorder.lock().unwrap().push((done, total)));

    let outcome = orchestrator
        .check_and_update()
        .await
        .expect("update failed");
    assert_matches!(outcome, Outcome::Committed { from, to } if from == v("1.0.0") && to == v("1.1.0"));
    assert_eq!(orchestrator.state(), State::Committed { version: v("1.1.0") });
    assert_eq!(orchestrator.current_version(), v("1.1.0"));

    // The maximum version was fetched, once
    assert_eq!(device.check_hits(), 1);
    assert_eq!(new.hits(), 1);
    assert_eq!(old.hits(), 0);
    assert_eq!(flasher.images(), vec![image.clone()]);

    // Bounded progress, ending with the full size
    let reports = reports.lock().unwrap().clone();
    assert!(reports.len() <= (image.len() as u64 / ota::PROGRESS_STEP) as usize + 1);
    assert_eq!(reports.last(), Some(&(image.len() as u64, image.len() as u64)));

    // The artifact does not outlive the cycle
    assert_eq!(leftovers(&dir), 0);
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn up_to_date() {
    init();

    let server = server_with_firmwares(&["1.0.0", "1.1.0"]);
    let device = server.add_device("esp32-01", "1.1");
    let dir = TempDir::new("ota-test").unwrap();
    let flasher = Flasher::default();
    let orchestrator = Orchestrator::new(
        server_feed(&server),
        identity(&device, "1.1"),
        flasher.clone(),
        config(&dir),
    );

    let outcome = orchestrator.check_and_update().await.expect("check failed");
    assert_matches!(outcome, Outcome::NoUpdate { latest: Some(latest), .. } if latest == v("1.1.0"));
    assert_matches!(orchestrator.state(), State::NoUpdate { .. });
    assert_eq!(orchestrator.current_version(), v("1.1"));
    assert!(flasher.images().is_empty());
}

#[tokio::test]
async fn checksum_mismatch() {
    init();

    let server = ServerBuilder::default().build();
    let download = server.add_firmware(
        Firmware::new("2.0.0", b"tampered image".to_vec()).checksum(Some(
            "0000000000000000000000000000000000000000000000000000000000000000",
        )),
    );
    let device = server.add_device("esp32-01", "1.0.0");
    let dir = TempDir::new("ota-test").unwrap();
    let flasher = Flasher::default();
    let orchestrator = Orchestrator::new(
        server_feed(&server),
        identity(&device, "1.0.0"),
        flasher.clone(),
        config(&dir),
    );

    let result = orchestrator.check_and_update().await;
    assert_matches!(result, Err(Error::ChecksumMismatch { .. }));
    assert_matches!(
        orchestrator.state(),
        State::Failed {
            reason: FailureReason::ChecksumMismatch,
            ..
        }
    );
    assert_eq!(download.hits(), 1);
    assert_eq!(orchestrator.current_version(), v("1.0.0"));
    assert!(flasher.images().is_empty());
    assert_eq!(leftovers(&dir), 0);
}

#[tokio::test]
async fn size_mismatch() {
    init();

    let server = ServerBuilder::default().build();
    server.add_firmware(Firmware::new("2.0.0", b"short".to_vec()).size(4096));
    let device = server.add_device("esp32-01", "1.0.0");
    let dir = TempDir::new("ota-test").unwrap();
    let orchestrator = Orchestrator::new(
        server_feed(&server),
        identity(&device, "1.0.0"),
        Flasher::default(),
        config(&dir),
    );

    let result = orchestrator.check_and_update().await;
    assert_matches!(
        result,
        Err(Error::SizeMismatch {
            expected: 4096,
            actual: 5
        })
    );
    assert_eq!(orchestrator.current_version(), v("1.0.0"));
    assert_eq!(leftovers(&dir), 0);
}

#[tokio::test]
async fn auto_install_disabled() {
    init();

    let server = server_with_firmwares(&["1.0.0", "1.2.0"]);
    let device = server.add_device("esp32-01", "1.0.0");
    let dir = TempDir::new("ota-test").unwrap();
    let flasher = Flasher::default();
    let orchestrator = Orchestrator::new(
        server_feed(&server),
        identity(&device, "1.0.0"),
        flasher.clone(),
        OrchestratorConfig {
            auto_install: false,
            ..config(&dir)
        },
    );

    let outcome = orchestrator.check_and_update().await.expect("check failed");
    assert_matches!(outcome, Outcome::UpdateFound { descriptor } => {
        assert_eq!(descriptor.version, v("1.2.0"));
        assert_eq!(descriptor.origin, ArtifactOrigin::Registry);
        assert!(descriptor.digest.is_some());
    });
    assert_eq!(orchestrator.state(), State::UpdateFound { version: v("1.2.0") });
    assert_eq!(orchestrator.current_version(), v("1.0.0"));
    assert!(flasher.images().is_empty());
    assert_eq!(leftovers(&dir), 0);
}

#[tokio::test]
async fn missing_digest() {
    init();

    let server = ServerBuilder::default().build();
    let download = server.add_firmware(Firmware::new("2.0.0", b"unsigned".to_vec()).checksum(None));
    let device = server.add_device("esp32-01", "1.0.0");
    let dir = TempDir::new("ota-test").unwrap();

    // Refused before downloading anything
    let strict = Orchestrator::new(
        server_feed(&server),
        identity(&device, "1.0.0"),
        Flasher::default(),
        config(&dir),
    );
    assert_matches!(
        strict.check_and_update().await,
        Err(Error::IntegrityUnavailable)
    );
    assert_matches!(
        strict.state(),
        State::Failed {
            reason: FailureReason::IntegrityUnavailable,
            ..
        }
    );
    assert_eq!(download.hits(), 0);

    let flasher = Flasher::default();
    let lenient = Orchestrator::new(
        server_feed(&server),
        identity(&device, "1.0.0"),
        flasher.clone(),
        OrchestratorConfig {
            allow_unverified: true,
            ..config(&dir)
        },
    );
    lenient.check_and_update().await.expect("update failed");
    assert_eq!(lenient.current_version(), v("2.0.0"));
    assert_eq!(flasher.images(), vec![b"unsigned".to_vec()]);
}

#[tokio::test]
async fn install_failure() {
    init();

    let server = server_with_firmwares(&["2.0.0"]);
    let device = server.add_device("esp32-01", "1.0.0");
    let dir = TempDir::new("ota-test").unwrap();
    let orchestrator = Orchestrator::new(
        server_feed(&server),
        identity(&device, "1.0.0"),
        Flasher::broken(),
        config(&dir),
    );

    let result = orchestrator.check_and_update().await;
    assert_matches!(result, Err(Error::InstallFailed(msg)) if msg.contains("flash write failed"));
    assert_matches!(
        orchestrator.state(),
        State::Failed {
            reason: FailureReason::InstallFailed,
            ..
        }
    );
    assert_eq!(orchestrator.current_version(), v("1.0.0"));
    assert_eq!(leftovers(&dir), 0);

    // Nothing was committed, so the next cycle tries again
    let result = orchestrator.check_and_update().await;
    assert_matches!(result, Err(Error::InstallFailed(_)));
    assert_eq!(device.check_hits(), 2);
}

#[tokio::test]
async fn installer_panic() {
    use futures::FutureExt;
    use std::panic::AssertUnwindSafe;

    init();

    let server = server_with_firmwares(&["2.0.0"]);
    let device = server.add_device("esp32-01", "1.0.0");
    let dir = TempDir::new("ota-test").unwrap();
    let panicking = |_: &DownloadedArtifact| -> Result<(), InstallError> { panic!("flash driver crashed") };
    let orchestrator = Orchestrator::new(
        server_feed(&server),
        identity(&device, "1.0.0"),
        panicking,
        config(&dir),
    );

    let result = AssertUnwindSafe(orchestrator.check_and_update())
        .catch_unwind()
        .await;
    assert!(result.is_err());

    // The verified artifact did not survive the unwinding
    assert_eq!(leftovers(&dir), 0);
    assert!(!orchestrator.is_running());
    assert_eq!(orchestrator.current_version(), v("1.0.0"));
}

#[tokio::test]
async fn concurrent_triggers() {
    init();

    let server = ServerBuilder::default()
        .check_delay(Duration::from_millis(500))
        .build();
    server.add_firmware(Firmware::new("1.0.0", b"initial".to_vec()));
    let device = server.add_device("esp32-01", "1.0.0");
    let dir = TempDir::new("ota-test").unwrap();
    let orchestrator = Orchestrator::new(
        server_feed(&server),
        identity(&device, "1.0.0"),
        Flasher::default(),
        config(&dir),
    );

    let (first, second) = tokio::join!(orchestrator.check_and_update(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.check_and_update().await
    });

    assert_matches!(first, Ok(Outcome::NoUpdate { .. }));
    assert_matches!(second, Err(Error::CycleAlreadyRunning));
    // The refused trigger never reached the server
    assert_eq!(device.check_hits(), 1);
    // And did not clobber the state of the running cycle
    assert_matches!(orchestrator.state(), State::NoUpdate { .. });
}

#[tokio::test]
async fn cancel_mid_download() {
    init();

    let server = ServerBuilder::default().build();
    let download = server.add_firmware(
        Firmware::new("2.0.0", vec![1u8; 1024]).download_delay(Duration::from_secs(5)),
    );
    let device = server.add_device("esp32-01", "1.0.0");
    let dir = TempDir::new("ota-test").unwrap();
    let flasher = Flasher::default();
    let orchestrator = Orchestrator::new(
        server_feed(&server),
        identity(&device, "1.0.0"),
        flasher.clone(),
        config(&dir),
    );

    let (result, _) = tokio::join!(orchestrator.check_and_update(), async {
        while !matches!(orchestrator.state(), State::Downloading { .. }) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        orchestrator.cancel();
    });

    assert_matches!(result, Err(Error::Cancelled));
    assert_matches!(
        orchestrator.state(),
        State::Failed {
            reason: FailureReason::Cancelled,
            ..
        }
    );
    assert!(download.hits() <= 1);
    assert_eq!(orchestrator.current_version(), v("1.0.0"));
    assert!(flasher.images().is_empty());
    assert_eq!(leftovers(&dir), 0);
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn shutdown_aborts_cycle() {
    init();

    let server = ServerBuilder::default()
        .check_delay(Duration::from_secs(5))
        .build();
    let device = server.add_device("esp32-01", "1.0.0");
    let dir = TempDir::new("ota-test").unwrap();
    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(
        server_feed(&server),
        identity(&device, "1.0.0"),
        Flasher::default(),
        config(&dir),
    )
    .with_shutdown(shutdown.clone());

    let (result, _) = tokio::join!(orchestrator.check_and_update(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
    });

    assert_matches!(result, Err(Error::Cancelled));
    assert_matches!(
        orchestrator.state(),
        State::Failed {
            reason: FailureReason::Cancelled,
            ..
        }
    );
}

#[tokio::test]
async fn authentication_required() {
    init();

    let server = ServerBuilder::default().build();
    let reject = server.reject_checks();
    let dir = TempDir::new("ota-test").unwrap();
    let orchestrator = Orchestrator::new(
        server_feed(&server),
        DeviceIdentity::new("anonymous", v("1.0.0")),
        Flasher::default(),
        config(&dir),
    );

    assert_matches!(
        orchestrator.check_and_update().await,
        Err(Error::AuthenticationRequired)
    );
    assert_matches!(
        orchestrator.state(),
        State::Failed {
            reason: FailureReason::AuthenticationRequired,
            ..
        }
    );
    assert_eq!(reject.hits(), 1);
}

#[tokio::test]
async fn server_answers_checked() {
    init();

    let server = ServerBuilder::default().build();
    // Claims an update which is actually older
    let older = server.add_device_with_response(
        "older",
        "2.0.0",
        serde_json::json!({
            "updateAvailable": true,
            "firmwareInfo": {
                "version": "1.9.9",
                "size": 1,
                "checksum": "00",
                "downloadUrl": "/api/download/1.9.9"
            }
        }),
    );
    let garbled = server.add_device_with_response(
        "garbled",
        "1.0.0",
        serde_json::json!({
            "updateAvailable": true,
            "firmwareInfo": {
                "version": "2.0-beta",
                "size": 1,
                "checksum": "00",
                "downloadUrl": "/api/download/2.0-beta"
            }
        }),
    );
    let dir = TempDir::new("ota-test").unwrap();

    let orchestrator = Orchestrator::new(
        server_feed(&server),
        identity(&older, "2.0.0"),
        Flasher::default(),
        config(&dir),
    );
    assert_matches!(
        orchestrator.check_and_update().await,
        Ok(Outcome::NoUpdate { latest: Some(latest), .. }) if latest == v("1.9.9")
    );

    let orchestrator = Orchestrator::new(
        server_feed(&server),
        identity(&garbled, "1.0.0"),
        Flasher::default(),
        config(&dir),
    );
    assert_matches!(
        orchestrator.check_and_update().await,
        Err(Error::MalformedVersion(_))
    );
    assert_matches!(
        orchestrator.state(),
        State::Failed {
            reason: FailureReason::MalformedVersion,
            ..
        }
    );
}

fn release_feed(server: &ReleaseServer) -> ReleaseFeed {
    ReleaseFeed::with_api_url(&server.base_url(), &server.repo)
        .expect("feed creation failed")
        .check_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn release_update() {
    init();

    let server = ReleaseServer::new("acme/firmware");
    let release = Release::new("v1.2.0")
        .body("Faster boot")
        .asset(Asset::new("CHANGELOG.md", b"changes".to_vec()))
        .asset(Asset::new("firmware.BIN", b"release image".to_vec()).with_digest());
    let published = server.add_latest(&release);

    let dir = TempDir::new("ota-test").unwrap();
    let flasher = Flasher::default();
    let orchestrator = Orchestrator::new(
        release_feed(&server),
        DeviceIdentity::new("esp32-01", v("1.1.9")),
        flasher.clone(),
        config(&dir),
    );

    let outcome = orchestrator.check_and_update().await.expect("update failed");
    assert_matches!(outcome, Outcome::Committed { to, .. } if to == v("1.2.0"));
    assert_eq!(flasher.images(), vec![b"release image".to_vec()]);
    assert_eq!(published.download_hits("firmware.BIN"), 1);
    assert_eq!(published.download_hits("CHANGELOG.md"), 0);
    assert_eq!(leftovers(&dir), 0);

    // Now up to date
    let outcome = orchestrator.check_and_update().await.expect("check failed");
    assert_matches!(outcome, Outcome::NoUpdate { .. });
    assert_eq!(published.release_hits(), 2);
}

#[tokio::test]
async fn release_fallback_asset() {
    init();

    let server = ReleaseServer::new("acme/firmware");
    let release = Release::new("V3")
        .asset(Asset::new("image.img", b"disk image".to_vec()).with_digest())
        .asset(Asset::new("notes.txt", b"notes".to_vec()));
    server.add_latest(&release);

    let dir = TempDir::new("ota-test").unwrap();
    let orchestrator = Orchestrator::new(
        release_feed(&server),
        DeviceIdentity::new("esp32-01", v("2.5")),
        Flasher::default(),
        OrchestratorConfig {
            auto_install: false,
            ..config(&dir)
        },
    );

    let outcome = orchestrator.check_and_update().await.expect("check failed");
    assert_matches!(outcome, Outcome::UpdateFound { descriptor } => {
        assert_eq!(descriptor.version, v("3"));
        assert_eq!(descriptor.file_name, "image.img");
        assert_eq!(descriptor.origin, ArtifactOrigin::ReleaseFallback);
        assert_eq!(descriptor.size, 10);
    });
}

#[tokio::test]
async fn release_without_digest() {
    init();

    let server = ReleaseServer::new("acme/firmware");
    let release = Release::new("v2.0").asset(Asset::new("fw.hex", b":00000001FF".to_vec()));
    let published = server.add_latest(&release);
    let dir = TempDir::new("ota-test").unwrap();

    let strict = Orchestrator::new(
        release_feed(&server),
        DeviceIdentity::new("esp32-01", v("1.0")),
        Flasher::default(),
        config(&dir),
    );
    assert_matches!(
        strict.check_and_update().await,
        Err(Error::IntegrityUnavailable)
    );
    assert_eq!(published.total_download_hits(), 0);

    let flasher = Flasher::default();
    let lenient = Orchestrator::new(
        release_feed(&server),
        DeviceIdentity::new("esp32-01", v("1.0")),
        flasher.clone(),
        OrchestratorConfig {
            allow_unverified: true,
            ..config(&dir)
        },
    );
    lenient.check_and_update().await.expect("update failed");
    assert_eq!(lenient.current_version(), v("2.0"));
    assert_eq!(flasher.images().len(), 1);
}

#[tokio::test]
async fn release_checksum_mismatch() {
    init();

    let server = ReleaseServer::new("acme/firmware");
    let release = Release::new("v2.0").asset(
        Asset::new("fw.bin", b"image".to_vec())
            .digest("sha256:0000000000000000000000000000000000000000000000000000000000000000"),
    );
    server.add_latest(&release);
    let dir = TempDir::new("ota-test").unwrap();

    let orchestrator = Orchestrator::new(
        release_feed(&server),
        DeviceIdentity::new("esp32-01", v("1.0")),
        Flasher::default(),
        config(&dir),
    );
    assert_matches!(
        orchestrator.check_and_update().await,
        Err(Error::ChecksumMismatch { .. })
    );
    assert_eq!(orchestrator.current_version(), v("1.0"));
    assert_eq!(leftovers(&dir), 0);
}

#[tokio::test]
async fn no_release() {
    init();

    let server = ReleaseServer::new("acme/firmware");
    let latest = server.no_release();
    let dir = TempDir::new("ota-test").unwrap();
    let orchestrator = Orchestrator::new(
        release_feed(&server),
        DeviceIdentity::new("esp32-01", v("1.0")),
        Flasher::default(),
        config(&dir),
    );

    let outcome = orchestrator.check_and_update().await.expect("check failed");
    assert_matches!(outcome, Outcome::NoUpdate { latest: None, reason, .. } if reason == "no release published");
    assert_eq!(latest.hits(), 1);
}

#[tokio::test]
async fn private_release() {
    init();

    let server = ReleaseServer::private("acme/secret", "ghp_test");
    let release = Release::new("v1.0.1").asset(Asset::new("fw.bin", b"secret".to_vec()).with_digest());
    let published = server.add_latest(&release);
    let dir = TempDir::new("ota-test").unwrap();

    let orchestrator = Orchestrator::new(
        release_feed(&server).token("ghp_test"),
        DeviceIdentity::new("esp32-01", v("1.0")),
        Flasher::default(),
        config(&dir),
    );
    orchestrator.check_and_update().await.expect("update failed");
    assert_eq!(orchestrator.current_version(), v("1.0.1"));
    assert_eq!(published.release_hits(), 1);
}

#[tokio::test]
async fn release_queries() {
    init();

    let server = ReleaseServer::new("acme/firmware");
    let old = Release::new("v1.0.0").asset(Asset::new("fw.bin", b"one".to_vec()));
    let new = Release::new("v1.1.0").asset(Asset::new("fw.bin", b"two".to_vec()));
    server.add_release(&old);
    server.list_releases(&[new.clone(), old.clone()]);

    let feed = release_feed(&server);
    let release = feed.release("v1.0.0").await.expect("release failed");
    assert_eq!(release.tag_name, "v1.0.0");
    assert_eq!(release.assets[0].size, 3);
    assert!(release.assets[0].sha256().is_none());
    assert_matches!(feed.release("v9.9.9").await, Err(Error::NotFound(tag)) if tag == "v9.9.9");

    let releases = feed.releases().await.expect("listing failed");
    let tags: Vec<&str> = releases.iter().map(|r| r.tag_name.as_str()).collect();
    assert_eq!(tags, vec!["v1.1.0", "v1.0.0"]);
}

#[tokio::test]
async fn release_publish() {
    init();

    let server = ReleaseServer::private("acme/firmware", "ghp_test");
    let asset = Asset::new("fw.bin", b"release image".to_vec());
    let publication = server.expect_new_release("v1.3.0", "Faster boot", &asset);

    let dir = TempDir::new("ota-test").unwrap();
    let path = dir.path().join("fw.bin");
    std::fs::write(&path, b"release image").unwrap();

    let feed = release_feed(&server).token("ghp_test");
    let published = feed
        .publish("v1.3.0", &path, Some("Faster boot"))
        .await
        .expect("publish failed");
    assert_eq!(published.name, "fw.bin");
    assert_eq!(published.size, 13);
    let digest = ota::integrity::digest_of(b"release image");
    assert_eq!(published.sha256(), Some(digest.as_str()));
    assert_eq!(publication.lookup_hits(), 1);
    assert_eq!(publication.create_hits(), 1);
    assert_eq!(publication.delete_hits(), 0);
    assert_eq!(publication.upload_hits(), 1);

    // Devices following the repository pick it up
    server.add_latest(&Release::new("v1.3.0").asset(asset.with_digest()));
    let flasher = Flasher::default();
    let orchestrator = Orchestrator::new(
        feed,
        DeviceIdentity::new("esp32-01", v("1.2")),
        flasher.clone(),
        config(&dir),
    );
    orchestrator.check_and_update().await.expect("update failed");
    assert_eq!(orchestrator.current_version(), v("1.3.0"));
    assert_eq!(flasher.images(), vec![b"release image".to_vec()]);
}

#[tokio::test]
async fn release_publish_replaces_asset() {
    init();

    let server = ReleaseServer::private("acme/firmware", "ghp_test");
    let existing = Release::new("v1.3.0")
        .asset(Asset::new("notes.txt", b"notes".to_vec()))
        .asset(Asset::new("fw.bin", b"broken image".to_vec()));
    let fixed = Asset::new("fw.bin", b"fixed image".to_vec());
    let publication = server.expect_replacement(&existing, &fixed);

    let dir = TempDir::new("ota-test").unwrap();
    let path = dir.path().join("fw.bin");
    std::fs::write(&path, b"fixed image").unwrap();

    let feed = release_feed(&server).token("ghp_test");
    let published = feed
        .publish("v1.3.0", &path, None)
        .await
        .expect("publish failed");
    assert_eq!(published.id, 102);
    assert_eq!(publication.lookup_hits(), 1);
    assert_eq!(publication.create_hits(), 0);
    assert_eq!(publication.delete_hits(), 1);
    assert_eq!(publication.upload_hits(), 1);
}

#[tokio::test]
async fn release_publish_refused() {
    init();

    let server = ReleaseServer::private("acme/firmware", "ghp_test");
    let asset = Asset::new("fw.bin", b"image".to_vec());
    let publication = server.expect_new_release("v2.0", "notes", &asset);

    let dir = TempDir::new("ota-test").unwrap();
    let path = dir.path().join("fw.bin");
    std::fs::write(&path, b"image").unwrap();

    // No token
    assert_matches!(
        release_feed(&server).publish("v2.0", &path, None).await,
        Err(Error::AuthenticationRequired)
    );
    // Devices could not order this tag
    assert_matches!(
        release_feed(&server)
            .token("ghp_test")
            .publish("nightly", &path, None)
            .await,
        Err(Error::MalformedVersion(_))
    );
    // Nothing to publish
    let empty = dir.path().join("empty.bin");
    std::fs::write(&empty, b"").unwrap();
    assert_matches!(
        release_feed(&server)
            .token("ghp_test")
            .publish("v2.0", &empty, None)
            .await,
        Err(Error::InvalidUpload(_))
    );

    assert_eq!(publication.lookup_hits(), 0);
    assert_eq!(publication.upload_hits(), 0);
}

#[tokio::test]
async fn publisher() {
    init();

    let server = ServerBuilder::default().build();
    let firmware = Firmware::new("1.2.0", b"firmware image".to_vec()).description("Fixes");
    let upload = server.expect_upload("KeyAdmin", &firmware);

    let dir = TempDir::new("ota-test").unwrap();
    let path = dir.path().join("firmware.bin");
    std::fs::write(&path, firmware.content()).unwrap();

    let client = PublisherClient::new(&server.base_url(), "KeyAdmin").expect("client failed");
    let reply = client
        .upload(&v("1.2.0"), &path, Some("Fixes"))
        .await
        .expect("upload failed");
    assert_eq!(upload.hits(), 1);
    assert_eq!(reply.firmware_info.size, 14);
    assert_eq!(
        reply.firmware_info.checksum,
        Some(ota::integrity::digest_of(firmware.content()))
    );

    server.add_firmware(firmware);
    let list = server.expect_list("KeyAdmin");
    let firmwares = client.list().await.expect("list failed");
    assert_eq!(firmwares.count, 1);
    assert_eq!(firmwares.firmwares[0].version, "1.2.0");
    assert_eq!(list.hits(), 1);

    server.expect_delete("KeyAdmin", "1.2.0");
    server.expect_delete("KeyAdmin", "9.9");
    client.delete(&v("1.2.0")).await.expect("delete failed");
    assert_matches!(client.delete(&v("9.9")).await, Err(Error::NotFound(_)));

    server.expect_register("KeyAdmin", "esp32-07");
    let registered = client
        .register_device("esp32-07", Some("Kitchen sensor"), None)
        .await
        .expect("register failed");
    assert_eq!(registered.token, "Tokenesp32-07");

    server.expect_generate_key("KeyAdmin", "ci");
    let key = client.generate_api_key("ci").await.expect("generate failed");
    assert_eq!(key.api_key, "Keyci");

    server.expect_keys("KeyAdmin", &["admin", "ci"]);
    let keys = client.api_keys().await.expect("keys failed");
    assert_eq!(keys.keys.len(), 2);
}

#[tokio::test]
async fn registered_device_updates() {
    init();

    let server = server_with_firmwares(&["1.0.0", "1.1.0"]);
    let device = server.add_device("esp32-07", "1.0.0");
    server.expect_register("KeyAdmin", "esp32-07");

    // The publisher vouches for the device, which then uses its token
    let publisher = PublisherClient::new(&server.base_url(), "KeyAdmin").expect("client failed");
    let token = publisher
        .register_device("esp32-07", None, None)
        .await
        .expect("register failed")
        .token;

    let dir = TempDir::new("ota-test").unwrap();
    let orchestrator = Orchestrator::new(
        server_feed(&server),
        DeviceIdentity::new("esp32-07", v("1.0.0")).with_credential(Credential::DeviceToken(token)),
        Flasher::default(),
        config(&dir),
    );
    orchestrator.check_and_update().await.expect("update failed");
    assert_eq!(orchestrator.current_version(), v("1.1.0"));
    assert_eq!(device.check_hits(), 1);
}

#[tokio::test]
async fn rejected_upload() {
    init();

    let server = ServerBuilder::default().build();
    server.reject_uploads();
    let dir = TempDir::new("ota-test").unwrap();
    let path = dir.path().join("huge.bin");
    std::fs::write(&path, vec![0u8; 128]).unwrap();

    let client = PublisherClient::new(&server.base_url(), "KeyAdmin").expect("client failed");
    assert_matches!(
        client.upload(&v("1.0"), &path, None).await,
        Err(Error::InvalidUpload(_))
    );
    assert_matches!(
        client.upload(&v("1.0"), Path::new("/nonexistent/fw.bin"), None).await,
        Err(Error::Io(_))
    );
}

#[tokio::test]
async fn driver_ticks() {
    init();

    let server = server_with_firmwares(&["1.0.0"]);
    let device = server.add_device("esp32-01", "1.0.0");
    let dir = TempDir::new("ota-test").unwrap();
    let orchestrator = Arc::new(Orchestrator::new(
        server_feed(&server),
        identity(&device, "1.0.0"),
        Flasher::default(),
        config(&dir),
    ));
    let driver = Driver::new(orchestrator.clone(), Duration::from_millis(100));

    // A manual trigger next to the driver
    assert_matches!(driver.tick().await, Ok(Outcome::NoUpdate { .. }));

    let shutdown = CancellationToken::new();
    let (ticks, _) = tokio::join!(driver.run(shutdown.clone()), async {
        tokio::time::sleep(Duration::from_millis(350)).await;
        shutdown.cancel();
    });

    // Immediate first check, then one per interval
    assert!(ticks >= 2, "only {} ticks", ticks);
    assert!(device.check_hits() >= 3);
    assert!(!orchestrator.is_running());
}

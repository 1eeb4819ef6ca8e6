// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

// Check, download, verify, install and commit, one cycle at a time

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::descriptor::{DeviceIdentity, FirmwareDescriptor, UpdateCheckResult};
use crate::download::{DownloadedArtifact, NoProgress, Progress};
use crate::error::{Error, FailureReason};
use crate::lock;
use crate::source::UpdateSource;
use crate::version::Version;

/// Error reported by an installer.
pub type InstallError = Box<dyn std::error::Error + Send + Sync>;

/// Applies a verified artifact to the device.
///
/// The artifact file is deleted once `install` returns, so implementations
/// must copy or flash it before returning. Installs are at-least-once: if the
/// process dies after `install` succeeded but before the new version was
/// persisted by the caller, the next cycle installs the same firmware again.
pub trait Install: Send + Sync {
    /// Install `artifact`.
    fn install(&self, artifact: &DownloadedArtifact) -> Result<(), InstallError>;
}

impl<F> Install for F
where
    F: Fn(&DownloadedArtifact) -> Result<(), InstallError> + Send + Sync,
{
    fn install(&self, artifact: &DownloadedArtifact) -> Result<(), InstallError> {
        self(artifact)
    }
}

/// Where an orchestrator stands.
///
/// `NoUpdate`, `UpdateFound`, `Committed` and `Failed` end a cycle; the
/// orchestrator accepts a new cycle from any of them.
#[derive(Debug, Clone, PartialEq)]
pub enum State {
    /// No cycle ran yet
    Idle,
    /// Asking the source for a newer firmware
    Checking,
    /// Nothing newer is published
    NoUpdate {
        /// Explanation from the source
        reason: String,
    },
    /// A newer firmware is published; final when auto-install is disabled
    UpdateFound {
        /// The newer version
        version: Version,
    },
    /// Receiving the artifact
    Downloading {
        /// Bytes received
        done: u64,
        /// Expected bytes, 0 if unknown
        total: u64,
    },
    /// Checking the artifact digest
    Verifying,
    /// Running the installer
    Installing,
    /// The new version is installed and recorded
    Committed {
        /// The installed version
        version: Version,
    },
    /// The cycle failed
    Failed {
        /// Failure class
        reason: FailureReason,
        /// Human-readable details
        message: String,
    },
}

impl State {
    /// Whether a cycle is in progress in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            State::Checking | State::Downloading { .. } | State::Verifying | State::Installing
        )
    }
}

/// Result of a completed cycle.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The device already runs the newest firmware.
    NoUpdate {
        /// Version the device runs
        current: Version,
        /// Newest version known to the source, if any
        latest: Option<Version>,
        /// Explanation from the source
        reason: String,
    },
    /// A newer firmware was found but auto-install is disabled.
    UpdateFound {
        /// The firmware which would be installed
        descriptor: FirmwareDescriptor,
    },
    /// A newer firmware was installed. Persist `to` to survive a restart.
    Committed {
        /// Version before the update
        from: Version,
        /// Installed version
        to: Version,
    },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::NoUpdate {
                current, reason, ..
            } => write!(f, "no update for {}: {}", current, reason),
            Outcome::UpdateFound { descriptor } => write!(
                f,
                "firmware {} available but auto-install is disabled",
                descriptor.version
            ),
            Outcome::Committed { from, to } => write!(f, "updated from {} to {}", from, to),
        }
    }
}

/// Behavior of an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory artifacts are downloaded to
    pub download_dir: PathBuf,
    /// Download and install updates as soon as they are found
    pub auto_install: bool,
    /// Install firmware published without a digest
    pub allow_unverified: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            auto_install: true,
            allow_unverified: false,
        }
    }
}

/// Drives update cycles for one device.
///
/// At most one cycle runs at a time; a concurrent call to
/// [`Orchestrator::check_and_update`] fails immediately with
/// [`Error::CycleAlreadyRunning`] without touching the network.
pub struct Orchestrator<I, P = NoProgress> {
    source: UpdateSource,
    installer: I,
    progress: P,
    config: OrchestratorConfig,
    device: Mutex<DeviceIdentity>,
    state: Mutex<State>,
    running: AtomicBool,
    shutdown: CancellationToken,
    cycle: Mutex<Option<CancellationToken>>,
}

impl<I, P> fmt::Debug for Orchestrator<I, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("source", &self.source)
            .field("config", &self.config)
            .field("device", &*lock(&self.device))
            .field("state", &*lock(&self.state))
            .finish()
    }
}

impl<I: Install> Orchestrator<I> {
    /// Create an orchestrator for `device`.
    ///
    /// # Arguments
    /// * `source`: where updates are looked for
    /// * `device`: the device identity, including its running version
    /// * `installer`: applies verified artifacts
    /// * `config`: download directory and install policy
    pub fn new(
        source: impl Into<UpdateSource>,
        device: DeviceIdentity,
        installer: I,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            source: source.into(),
            installer,
            progress: NoProgress,
            config,
            device: Mutex::new(device),
            state: Mutex::new(State::Idle),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            cycle: Mutex::new(None),
        }
    }
}

impl<I: Install, P: Progress> Orchestrator<I, P> {
    /// Report download progress to `progress`.
    pub fn with_progress<Q: Progress>(self, progress: Q) -> Orchestrator<I, Q> {
        Orchestrator {
            source: self.source,
            installer: self.installer,
            progress,
            config: self.config,
            device: self.device,
            state: self.state,
            running: self.running,
            shutdown: self.shutdown,
            cycle: self.cycle,
        }
    }

    /// Abort any cycle, current or future, once `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Current state.
    pub fn state(&self) -> State {
        lock(&self.state).clone()
    }

    /// The committed version of the device.
    pub fn current_version(&self) -> Version {
        lock(&self.device).current_version.clone()
    }

    /// The device identity, with its committed version.
    pub fn device(&self) -> DeviceIdentity {
        lock(&self.device).clone()
    }

    /// Whether a cycle is in flight.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The update source.
    pub fn source(&self) -> &UpdateSource {
        &self.source
    }

    /// Abort the cycle in flight, if any. It ends in `Failed(Cancelled)`.
    pub fn cancel(&self) {
        if let Some(cycle) = lock(&self.cycle).as_ref() {
            info!("cancelling update cycle");
            cycle.cancel();
        }
    }

    /// Run one update cycle.
    ///
    /// Returns [`Error::CycleAlreadyRunning`] if another cycle is in flight.
    /// Any other error also leaves the orchestrator in [`State::Failed`]; the
    /// device version only changes on [`Outcome::Committed`].
    pub async fn check_and_update(&self) -> Result<Outcome, Error> {
        let cancel = self.shutdown.child_token();
        let _guard = CycleGuard::acquire(self, cancel.clone())?;

        let result = self.run_cycle(&cancel).await;
        match &result {
            Ok(outcome) => info!("{}", outcome),
            Err(e) => {
                warn!("update cycle failed: {}", e);
                self.set_state(State::Failed {
                    reason: e.reason(),
                    message: e.to_string(),
                });
            }
        }

        result
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<Outcome, Error> {
        let device = self.device();

        self.set_state(State::Checking);
        let check = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            check = self.source.latest(&device) => check?,
        };

        let (latest, descriptor) = match check {
            UpdateCheckResult::NoUpdate {
                current,
                latest,
                reason,
            } => {
                self.set_state(State::NoUpdate {
                    reason: reason.clone(),
                });
                return Ok(Outcome::NoUpdate {
                    current,
                    latest,
                    reason,
                });
            }
            UpdateCheckResult::UpdateAvailable { latest, descriptor } => (latest, descriptor),
        };

        self.set_state(State::UpdateFound {
            version: latest.clone(),
        });
        if !self.config.auto_install {
            return Ok(Outcome::UpdateFound { descriptor });
        }

        // Refuse before downloading anything we could not verify
        let expected = match &descriptor.digest {
            Some(digest) => Some(digest.clone()),
            None if self.config.allow_unverified => {
                warn!("firmware {} has no digest, installing unverified", latest);
                None
            }
            None => {
                warn!("firmware {} has no digest, refusing to install", latest);
                return Err(Error::IntegrityUnavailable);
            }
        };

        self.set_state(State::Downloading {
            done: 0,
            total: descriptor.size,
        });
        let progress = CycleProgress {
            state: &self.state,
            inner: &self.progress,
        };
        let artifact = self
            .source
            .fetch(
                &descriptor,
                &device,
                &self.config.download_dir,
                &progress,
                cancel,
            )
            .await?;

        self.set_state(State::Verifying);
        if let Some(expected) = expected {
            if let Err(e) = artifact.check_sha256(&expected) {
                artifact.discard();
                return Err(e);
            }
        }
        if cancel.is_cancelled() {
            artifact.discard();
            return Err(Error::Cancelled);
        }

        self.set_state(State::Installing);
        let installed = self.installer.install(&artifact);
        artifact.discard();
        installed.map_err(|e| Error::InstallFailed(e.to_string()))?;

        let from = {
            let mut device = lock(&self.device);
            std::mem::replace(&mut device.current_version, latest.clone())
        };
        self.set_state(State::Committed {
            version: latest.clone(),
        });

        Ok(Outcome::Committed { from, to: latest })
    }

    fn set_state(&self, state: State) {
        set_state(&self.state, state);
    }
}

fn set_state(current: &Mutex<State>, state: State) {
    let mut current = lock(current);
    if !matches!(
        (&*current, &state),
        (State::Downloading { .. }, State::Downloading { .. })
    ) {
        debug!("{:?} -> {:?}", *current, state);
    }
    *current = state;
}

// Mirrors download progress into the state before forwarding it
struct CycleProgress<'a, P> {
    state: &'a Mutex<State>,
    inner: &'a P,
}

impl<P: Progress> Progress for CycleProgress<'_, P> {
    fn on_progress(&self, done: u64, total: u64) {
        set_state(self.state, State::Downloading { done, total });
        self.inner.on_progress(done, total);
    }
}

// Holds the reentrancy flag for the duration of one cycle
struct CycleGuard<'a> {
    running: &'a AtomicBool,
    state: &'a Mutex<State>,
    cycle: &'a Mutex<Option<CancellationToken>>,
}

impl<'a> CycleGuard<'a> {
    fn acquire<I, P>(
        orchestrator: &'a Orchestrator<I, P>,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        orchestrator
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::CycleAlreadyRunning)?;
        *lock(&orchestrator.cycle) = Some(cancel);

        Ok(Self {
            running: &orchestrator.running,
            state: &orchestrator.state,
            cycle: &orchestrator.cycle,
        })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        // The cycle future was dropped mid-flight
        {
            let mut state = lock(self.state);
            if state.is_active() {
                *state = State::Failed {
                    reason: FailureReason::Cancelled,
                    message: Error::Cancelled.to_string(),
                };
            }
        }
        *lock(self.cycle) = None;
        self.running.store(false, Ordering::SeqCst);
    }
}

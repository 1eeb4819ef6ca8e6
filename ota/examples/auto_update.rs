// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use ota::config::ClientConfig;
use ota::{DownloadedArtifact, Driver, InstallError, Orchestrator};
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;

#[derive(StructOpt, Debug)]
#[structopt(name = "auto update example")]
struct Opt {
    /// Where installed images are copied
    target: PathBuf,
    #[structopt(short, long)]
    server: Option<String>,
    /// Follow the releases of `owner/name` instead of the server
    #[structopt(short, long)]
    release: Option<String>,
    #[structopt(short, long)]
    device: Option<String>,
    #[structopt(short = "v", long)]
    current_version: Option<String>,
    /// Seconds between checks
    #[structopt(short, long)]
    interval: Option<u64>,
    /// Check once and exit
    #[structopt(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let mut config = ClientConfig::from_env()?;
    if let Some(url) = opt.server {
        config.server_url = url;
    }
    if opt.release.is_some() {
        config.release_repo = opt.release;
    }
    if let Some(device) = opt.device {
        config.device_id = device;
    }
    if let Some(version) = opt.current_version {
        config.current_version = version.parse()?;
    }
    if let Some(interval) = opt.interval {
        config.check_interval = interval;
    }

    let target = opt.target;
    let install = move |artifact: &DownloadedArtifact| -> Result<(), InstallError> {
        std::fs::copy(artifact.file(), &target)?;
        Ok(())
    };

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(
        config.source()?,
        config.device_identity(),
        install,
        config.orchestrator_config(),
    )
    .with_progress(|done: u64, total: u64| println!("downloaded {}/{} bytes", done, total))
    .with_shutdown(shutdown.clone());

    if opt.once {
        let outcome = orchestrator.check_and_update().await?;
        println!("{}", outcome);
        return Ok(());
    }

    let driver = Driver::new(Arc::new(orchestrator), config.check_interval_duration());
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let ticks = driver.run(shutdown).await;
    println!(
        "stopped after {} checks, running {}",
        ticks,
        driver.orchestrator().current_version()
    );

    Ok(())
}

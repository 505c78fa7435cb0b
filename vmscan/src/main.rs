//! The canonical binary for scanning VM images.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{debug, info, Level};
use stable_eyre::{
    eyre::{ensure, Context},
    Result,
};
use stderrlog::ColorChoice;
use trivy_report::Severity;
use vmscan::{
    api::{Backend, Devnull},
    config,
    image::{Image, ImageId},
    orchestrator,
    userdata::UserData,
};

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cmd {
    /// The mode for the binary.
    #[clap(subcommand)]
    mode: Mode,
}

impl Cmd {
    fn validate(self) -> Result<Self> {
        Ok(Cmd {
            mode: match self.mode {
                Mode::DryRun(opts) => Mode::DryRun(opts.validate()?),
                Mode::UserData(opts) => Mode::UserData(opts),
                Mode::Severities(opts) => Mode::Severities(opts.validate()?),
            },
        })
    }
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run in "dry run" mode.
    ///
    /// Does not communicate with any cloud at all; instead it just logs what it would have done.
    /// Every image is scanned against a simulated cloud whose scanner reports the same results.
    DryRun(CmdDryRun),

    /// Print the boot script scanning instances run.
    UserData(CmdUserData),

    /// Print, as JSON, every severity at or above a threshold.
    Severities(CmdSeverities),
}

#[derive(Parser, Debug)]
#[clap(version, about)]
struct CmdDryRun {
    #[clap(flatten)]
    cloud: config::Cloud,

    #[clap(flatten)]
    scan: config::Scan,

    #[clap(flatten)]
    dryrun: config::DryRun,
}

impl CmdDryRun {
    fn validate(self) -> Result<Self> {
        Ok(Self {
            cloud: self.cloud.validate()?,
            scan: self.scan.validate()?,
            ..self
        })
    }
}

#[derive(Parser, Debug)]
#[clap(version, about)]
struct CmdUserData {
    #[clap(flatten)]
    scan: config::Scan,
}

#[derive(Parser, Debug)]
#[clap(version, about)]
struct CmdSeverities {
    /// The lowest severity to include, spelled exactly as the scanner does (e.g. `HIGH`).
    threshold: String,
}

impl CmdSeverities {
    fn validate(self) -> Result<Self> {
        ensure!(
            Severity::is_valid(&self.threshold),
            "invalid severity '{}'",
            self.threshold
        );
        Ok(self)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    stable_eyre::install()?;

    let cmd = Cmd::parse().validate()?;
    match cmd.mode {
        Mode::DryRun(opts) => main_dryrun(opts).await,
        Mode::UserData(opts) => main_userdata(opts),
        Mode::Severities(opts) => main_severities(opts),
    }
}

async fn main_dryrun(CmdDryRun { cloud, scan, dryrun }: CmdDryRun) -> Result<()> {
    init_logging(&scan)?;
    info!("running in dry run mode");
    if let Some(name) = cloud.cloud() {
        debug!("cloud {name} is ignored in dry run mode");
    }

    let report = match dryrun.report() {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("read simulated report {path:?}"))?,
        None => b"{}".to_vec(),
    };
    let images = dryrun
        .images()
        .iter()
        .enumerate()
        .map(|(n, name)| {
            Image::builder()
                .id(ImageId::from(format!("dryrun-{n}")))
                .name(name)
                .build()
        })
        .collect::<Vec<_>>();

    let backend = Arc::new(Backend::uniform(Arc::new(Devnull::new(images, report))));
    let summary = orchestrator::run(backend, &cloud, &scan)
        .await
        .context("run scan")?;

    let encoded = serde_json::json!({
        "dispatched": summary.dispatched(),
        "completed": summary.completed(),
        "passed": summary.passed(),
        "failed": summary.failed(),
    });
    println!("{encoded}");
    Ok(())
}

fn main_userdata(CmdUserData { scan }: CmdUserData) -> Result<()> {
    init_logging(&scan)?;

    // Ignore files in object storage need a real backend; only the inline list applies here.
    let script = UserData::builder()
        .threshold(scan.severity())
        .ignore(scan.ignore().clone())
        .build()
        .render();
    print!("{script}");
    Ok(())
}

fn main_severities(CmdSeverities { threshold }: CmdSeverities) -> Result<()> {
    let severities = Severity::at_or_above(&threshold);
    let encoded = serde_json::to_string(&severities).context("render severities")?;
    println!("{encoded}");
    Ok(())
}

/// Configures the global logger for the application based on the scan options.
fn init_logging(scan: &config::Scan) -> Result<()> {
    Ok(stderrlog::new()
        .module(module_path!())
        .color(ColorChoice::Auto)
        .verbosity(if scan.debug() {
            Level::Debug
        } else {
            Level::Info
        })
        .init()?)
}

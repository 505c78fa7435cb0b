//! Scans many images concurrently.
//!
//! A fixed pool of workers pulls images off one queue; each worker runs a whole [`ScanJob`]
//! before pulling the next image. A producer fills the queue and closes it once every image
//! has been enqueued. Failures are collected per image and never stop other images from being
//! processed; once every worker is done they are reported together as [`ScanFailures`].

use std::sync::Arc;

use defer_lite::defer;
use getset::CopyGetters;
use log::{debug, error, info};
use stable_eyre::{
    eyre::{eyre, Context},
    Result,
};
use tokio::sync::{
    mpsc::{channel, Receiver, Sender},
    Mutex,
};
use trivy_report::Classification;

use crate::{
    api::Backend,
    config,
    error::{ImageFailure, ScanFailures},
    image::{property_key, Image},
    job::{ScanJob, Settings},
    userdata::UserData,
};

/// What a run did.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Summary {
    /// Images handed to workers.
    dispatched: usize,

    /// Jobs that ran to completion, successfully or not.
    completed: usize,

    /// Images whose scan found nothing.
    passed: usize,

    /// Images whose scan found vulnerabilities.
    failed: usize,
}

impl std::ops::Add for Summary {
    type Output = Summary;

    fn add(self, rhs: Self) -> Self::Output {
        Summary {
            dispatched: self.dispatched + rhs.dispatched,
            completed: self.completed + rhs.completed,
            passed: self.passed + rhs.passed,
            failed: self.failed + rhs.failed,
        }
    }
}

/// Resolve the configured images and scan them.
pub async fn run(
    backend: Arc<Backend>,
    cloud: &config::Cloud,
    scan: &config::Scan,
) -> Result<Summary> {
    let selector = scan.selector()?;
    let images = selector
        .resolve(backend.images().as_ref())
        .await
        .context("resolve images")?;
    info!("resolved {} image(s) to scan", images.len());

    let flavor = backend
        .compute()
        .resolve_flavor(cloud.flavor())
        .await
        .with_context(|| format!("resolve flavor {}", cloud.flavor()))?;

    let user_data = user_data(&backend, scan).await.context("generate user data")?;

    let settings = Settings::builder()
        .flavor(flavor)
        .network(cloud.network())
        .floating_ip_network(cloud.floating_ip_network())
        .security_groups(cloud.security_groups().clone())
        .config_drive(cloud.config_drive())
        .user_data(user_data.render().into_bytes())
        .visibility(scan.image_visibility())
        .tag_key(property_key(
            scan.metadata_prefix().as_deref(),
            scan.tag_key(),
        ))
        .auto_delete(scan.auto_delete_image())
        .skip_cve_check(scan.skip_cve_check())
        .results_dir(scan.results_dir())
        .ssh_user(cloud.ssh_user())
        .ssh_port(cloud.ssh_port())
        .instance_poll(scan.instance_poll())
        .scan_poll(scan.scan_poll())
        .build();

    scan_images(backend, Arc::new(settings), images, scan.concurrency()).await
}

/// Build the boot script for a run, fetching the ignore file from object storage if one is configured.
pub async fn user_data(backend: &Backend, scan: &config::Scan) -> Result<UserData> {
    let ignore_file = match scan.ignore_object() {
        Some(key) => {
            let raw = backend
                .storage()
                .fetch(key)
                .await
                .with_context(|| format!("fetch ignore file {key}"))?;
            Some(String::from_utf8(raw).with_context(|| format!("decode ignore file {key}"))?)
        }
        None => None,
    };

    let builder = UserData::builder()
        .threshold(scan.severity())
        .ignore(scan.ignore().clone());
    Ok(match ignore_file {
        Some(content) => builder.ignore_file(content).build(),
        None => builder.build(),
    })
}

/// Scan every image with at most `concurrency` jobs in flight.
///
/// Returns a [`ScanFailures`] (downcastable from the report) listing every image that failed,
/// after every image has been processed. A job that panics fails only its own image.
pub async fn scan_images(
    backend: Arc<Backend>,
    settings: Arc<Settings>,
    images: Vec<Image>,
    concurrency: usize,
) -> Result<Summary> {
    let workers = concurrency.max(1);
    let total = images.len();
    if total == 0 {
        info!("no images to scan");
        return Ok(Summary::default());
    }
    info!("scanning {total} image(s) with {workers} worker(s)");

    let (queue_tx, queue_rx) = channel::<Image>(workers);
    let queue = Arc::new(Mutex::new(queue_rx));

    // Sized so reporting a failure never waits on the collector.
    let (error_tx, mut error_rx) = channel::<ImageFailure>(total);

    let pool = (0..workers)
        .map(|worker| {
            tokio::spawn(work(
                worker,
                queue.clone(),
                error_tx.clone(),
                backend.clone(),
                settings.clone(),
            ))
        })
        .collect::<Vec<_>>();
    drop(error_tx);
    drop(queue);

    let producer = tokio::spawn(produce(images, queue_tx));

    let mut summary = Summary::default();
    for handle in pool {
        match handle.await {
            Ok(tally) => summary = summary + tally,
            Err(err) => error!("scan worker exited abnormally: {err}"),
        }
    }
    let (dispatched, undispatched) = producer.await.context("join image producer")?;
    summary.dispatched = dispatched;

    let mut failures = Vec::new();
    while let Some(failure) = error_rx.recv().await {
        failures.push(failure);
    }
    for image in undispatched {
        failures.push(ImageFailure {
            id: image.id().clone(),
            name: image.name().clone(),
            error: eyre!("never dispatched: every scan worker exited"),
        });
    }

    let lost = summary.dispatched.saturating_sub(summary.completed);
    if lost > 0 {
        error!(
            "dispatched {} image(s) but only {} scan(s) completed",
            summary.dispatched, summary.completed
        );
    }
    if lost > 0 || !failures.is_empty() {
        return Err(ScanFailures { failures, lost }.into());
    }

    info!(
        "scanned {} image(s): {} passed, {} failed",
        summary.completed, summary.passed, summary.failed
    );
    Ok(summary)
}

/// Enqueue every image, then close the queue by dropping the sender.
/// Returns how many images were enqueued, and the images that could not be.
async fn produce(images: Vec<Image>, queue: Sender<Image>) -> (usize, Vec<Image>) {
    let mut dispatched = 0;
    let mut images = images.into_iter();
    while let Some(image) = images.next() {
        if let Err(unsent) = queue.send(image).await {
            error!("every scan worker has exited; stopping dispatch");
            let mut undispatched = vec![unsent.0];
            undispatched.extend(images);
            return (dispatched, undispatched);
        }
        dispatched += 1;
    }
    (dispatched, Vec::new())
}

/// Pull images off the queue until it closes, running one job at a time.
///
/// Each job runs in its own task so a panic inside it is reported against that image
/// and the worker moves on to the next one.
async fn work(
    worker: usize,
    queue: Arc<Mutex<Receiver<Image>>>,
    errors: Sender<ImageFailure>,
    backend: Arc<Backend>,
    settings: Arc<Settings>,
) -> Summary {
    debug!("scan worker {worker} started");
    defer! { debug!("scan worker {worker} exited"); }

    let mut tally = Summary::default();
    loop {
        let next = {
            let mut queue = queue.lock().await;
            queue.recv().await
        };
        let Some(image) = next else { break };

        let id = image.id().clone();
        let name = image.name().clone();
        let mut job = ScanJob::new(image, backend.clone(), settings.clone());
        let running = tokio::spawn(async move {
            let outcome = job.run().await;
            (job.result().map(|r| r.classification()), outcome)
        });
        let (classification, outcome) = match running.await {
            Ok(finished) => finished,
            Err(err) => (None, Err(eyre!("scan job aborted: {err}"))),
        };
        tally.completed += 1;

        match classification {
            Some(Classification::Passed) => tally.passed += 1,
            Some(Classification::Failed) => tally.failed += 1,
            None => {}
        }

        if let Err(error) = outcome {
            error!("[{id}] scan failed: {error:#}");
            let failure = ImageFailure { id, name, error };
            if let Err(unsent) = errors.send(failure).await {
                error!("failure collector closed: {}", unsent.0);
            }
        }
    }
    tally
}

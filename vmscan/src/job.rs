//! Scans a single image.
//!
//! A job walks one image through a fixed sequence of states:
//!
//! 1. Create a keypair for the scanning instance.
//! 2. Acquire a floating IP.
//! 3. Boot an instance of the image, with a boot script that runs the scanner.
//! 4. Wait for the instance to become active.
//! 5. Attach the floating IP to the instance.
//! 6. Connect to the instance and wait for the scanner to write its completion marker.
//! 7. Copy the results document from the instance.
//! 8. Parse the results into findings and classify the image.
//! 9. Record the outcome on the image: visibility, the classification property, or deletion.
//! 10. Upload the normalized results and remove the keypair, floating IP and instance.
//!
//! Any step may fail, moving the job to [`State::Failed`].
//! Whether the job succeeds or fails, every resource it created is removed before [`ScanJob::run`] returns.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use defer_lite::defer;
use getset::{CopyGetters, Getters};
use log::{debug, error, info, warn};
use stable_eyre::{
    eyre::{Context, Report},
    Result,
};
use strum::Display;
use tokio::time::sleep;
use trivy_report::{Classification, Finding};
use typed_builder::TypedBuilder;

use crate::{
    api::{Backend, Compute, FlavorId, InstanceId, InstanceSpec, Session, SessionTarget},
    error::{MissingImage, Timeout, VulnerabilitiesFound},
    image::{Image, PropertyOp, Visibility},
    resources::ResourceSet,
    userdata::{REMOTE_MARKER, REMOTE_RESULTS},
};

/// A bounded wait: check up to `attempts` times, sleeping `interval` between checks.
#[derive(Copy, Clone, Eq, PartialEq, Debug, CopyGetters, TypedBuilder)]
#[getset(get_copy = "pub")]
pub struct Poll {
    /// How many checks to make before giving up.
    attempts: usize,

    /// How long to wait between checks.
    interval: Duration,
}

impl Poll {
    /// The default wait for an instance to boot: 100 checks, 5 seconds apart.
    pub fn instance_active() -> Self {
        Self {
            attempts: 100,
            interval: Duration::from_secs(5),
        }
    }

    /// The default wait for the scanner to finish: 20 checks, 10 seconds apart.
    pub fn scan_completion() -> Self {
        Self {
            attempts: 20,
            interval: Duration::from_secs(10),
        }
    }
}

/// Settings shared by every job in a run.
#[derive(Clone, Debug, Getters, CopyGetters, TypedBuilder)]
pub struct Settings {
    /// The flavor scanning instances boot with.
    #[getset(get = "pub")]
    flavor: FlavorId,

    /// The network scanning instances attach to.
    #[getset(get = "pub")]
    #[builder(setter(into))]
    network: String,

    /// The network floating IPs are allocated from.
    #[getset(get = "pub")]
    #[builder(setter(into))]
    floating_ip_network: String,

    /// Security groups applied to scanning instances.
    #[getset(get = "pub")]
    #[builder(default)]
    security_groups: Vec<String>,

    /// Whether scanning instances get a config drive.
    #[getset(get_copy = "pub")]
    #[builder(default)]
    config_drive: bool,

    /// The boot script for scanning instances.
    #[getset(get = "pub")]
    #[builder(setter(into))]
    user_data: Vec<u8>,

    /// When set, image visibility is left alone; otherwise it follows the scan outcome.
    #[getset(get_copy = "pub")]
    #[builder(default)]
    visibility: Option<Visibility>,

    /// The property key the classification is written under, prefix included.
    #[getset(get = "pub")]
    #[builder(setter(into))]
    tag_key: String,

    /// Delete images that have findings instead of tagging them.
    #[getset(get_copy = "pub")]
    #[builder(default)]
    auto_delete: bool,

    /// Treat findings as a normal outcome instead of a job failure.
    #[getset(get_copy = "pub")]
    #[builder(default)]
    skip_cve_check: bool,

    /// Where results documents are written locally.
    #[getset(get = "pub")]
    #[builder(setter(into))]
    results_dir: PathBuf,

    /// The login user on scanning instances.
    #[getset(get = "pub")]
    #[builder(default = String::from("ubuntu"), setter(into))]
    ssh_user: String,

    /// The SSH port on scanning instances.
    #[getset(get_copy = "pub")]
    #[builder(default = 22)]
    ssh_port: u16,

    /// The wait for scanning instances to boot.
    #[getset(get_copy = "pub")]
    #[builder(default = Poll::instance_active())]
    instance_poll: Poll,

    /// The wait for the scanner to finish.
    #[getset(get_copy = "pub")]
    #[builder(default = Poll::scan_completion())]
    scan_poll: Poll,
}

/// Where a job is in its lifecycle.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum State {
    /// Nothing has happened yet.
    Pending,
    /// The keypair exists.
    KeypairReady,
    /// The floating IP is allocated.
    FipReady,
    /// The instance has been requested.
    InstanceBooting,
    /// The instance is active.
    InstanceActive,
    /// The floating IP is bound to the instance.
    IpAttached,
    /// Connected to the instance; the scanner is running.
    ScanRunning,
    /// The results document is on local disk.
    ResultsFetched,
    /// The results are parsed and classified.
    ResultsParsed,
    /// The image metadata reflects the outcome.
    Finalized,
    /// Results are uploaded and every resource is gone.
    TornDown,
    /// Some step failed; resources have been rolled back.
    Failed,
}

/// The interpreted outcome of a scan.
#[derive(Clone, Debug, Getters, CopyGetters)]
pub struct ScanResult {
    /// The local normalized results document.
    #[getset(get = "pub")]
    path: PathBuf,

    /// The findings, in report order.
    #[getset(get = "pub")]
    findings: Vec<Finding>,

    /// Whether anything was found.
    #[getset(get_copy = "pub")]
    classification: Classification,
}

/// The name of the keypair created for scanning `image`.
pub fn keypair_name(image: &Image) -> String {
    format!("vmscan-{}", image.id())
}

/// The object storage key results for `image` are uploaded under.
pub fn results_key(image: &Image) -> String {
    format!("scans/{}/results.json", image.id())
}

/// Scans one image. See the module documentation for the sequence of steps.
#[derive(Debug, Getters, CopyGetters)]
pub struct ScanJob {
    /// The image being scanned.
    #[getset(get = "pub")]
    image: Image,

    /// The resources the job currently holds.
    #[getset(get = "pub")]
    resources: ResourceSet,

    /// The current state.
    #[getset(get_copy = "pub")]
    state: State,

    /// Whether the job deleted the image.
    #[getset(get_copy = "pub")]
    deleted: bool,

    result: Option<ScanResult>,
    backend: Arc<Backend>,
    settings: Arc<Settings>,
}

impl ScanJob {
    /// Create a job for `image`.
    pub fn new(image: Image, backend: Arc<Backend>, settings: Arc<Settings>) -> Self {
        Self {
            image,
            resources: ResourceSet::default(),
            state: State::Pending,
            deleted: false,
            result: None,
            backend,
            settings,
        }
    }

    /// The scan result, once the results have been parsed.
    pub fn result(&self) -> Option<&ScanResult> {
        self.result.as_ref()
    }

    /// Run the job to completion.
    ///
    /// Resources are always torn down before this returns.
    /// If a step fails and tearing down fails too, the step's error is returned
    /// with the teardown failure attached.
    pub async fn run(&mut self) -> Result<()> {
        let id = self.image.id().clone();
        info!("[{id}] processing image {}", self.image.name());
        defer! { debug!("[{id}] exited scan job"); }

        let outcome = self.drive().await;
        let teardown = self
            .resources
            .teardown(
                self.backend.compute().as_ref(),
                self.backend.network().as_ref(),
            )
            .await
            .context("tear down scan resources");

        match (outcome, teardown) {
            (Ok(()), Ok(())) => {
                self.advance(State::TornDown);
                info!("[{id}] finished processing image");
                self.verdict()
            }
            (Ok(()), Err(err)) | (Err(err), Ok(())) => {
                self.fail(&err);
                Err(err)
            }
            (Err(err), Err(teardown)) => {
                self.fail(&err);
                error!("[{id}] {teardown:#}");
                Err(err.wrap_err(format!("{teardown:#}")))
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let compute = self.backend.compute().clone();
        let network = self.backend.network().clone();
        let settings = self.settings.clone();

        let keypair = compute
            .create_keypair(&keypair_name(&self.image))
            .await
            .context("create keypair")?;
        self.resources.set_keypair(keypair.clone());
        self.advance(State::KeypairReady);

        let floating_ip = network
            .acquire_floating_ip(settings.floating_ip_network())
            .await
            .with_context(|| {
                format!(
                    "acquire floating ip from network {}",
                    settings.floating_ip_network()
                )
            })?;
        self.resources.set_floating_ip(floating_ip.clone());
        self.advance(State::FipReady);

        let spec = InstanceSpec::builder()
            .keypair(keypair.name())
            .flavor(settings.flavor().clone())
            .network(settings.network())
            .config_drive(settings.config_drive())
            .user_data(settings.user_data().clone())
            .image(self.image.id().clone())
            .security_groups(settings.security_groups().clone())
            .build();
        let instance = compute
            .create_instance(&spec)
            .await
            .context("create instance")?;
        self.resources.set_instance(instance.clone());
        self.advance(State::InstanceBooting);

        self.wait_active(compute.as_ref(), instance.id()).await?;
        self.advance(State::InstanceActive);

        compute
            .attach_floating_ip(instance.id(), floating_ip.address())
            .await
            .with_context(|| format!("attach floating ip {}", floating_ip.address()))?;
        self.advance(State::IpAttached);

        let target = SessionTarget::builder()
            .user(settings.ssh_user())
            .private_key(keypair.private_key())
            .host(floating_ip.address())
            .port(settings.ssh_port())
            .build();
        let local = self.collect_results(&target).await?;

        let result = interpret(local).await?;
        self.advance(State::ResultsParsed);
        debug!(
            "[{}] {} finding(s), classified {}",
            self.image.id(),
            result.findings.len(),
            result.classification
        );

        let finished = self.finish(&result).await;
        self.result = Some(result);
        finished
    }

    /// Poll until the instance is active.
    async fn wait_active(&self, compute: &dyn Compute, id: &InstanceId) -> Result<()> {
        let poll = self.settings.instance_poll();
        for attempt in 1..=poll.attempts() {
            let active = compute
                .instance_active(id)
                .await
                .with_context(|| format!("check status of instance {id}"))?;
            if active {
                return Ok(());
            }
            if attempt < poll.attempts() {
                debug!(
                    "[{}] instance {id} not active ({attempt}/{}), checking again in {:?}",
                    self.image.id(),
                    poll.attempts(),
                    poll.interval()
                );
                sleep(poll.interval()).await;
            }
        }
        Err(Timeout::InstanceActive {
            instance: id.clone(),
            attempts: poll.attempts(),
        }
        .into())
    }

    /// Connect to the instance, wait for the scan and copy the results.
    /// The session is closed whether or not that worked.
    async fn collect_results(&mut self, target: &SessionTarget) -> Result<PathBuf> {
        let mut session = self
            .backend
            .remote()
            .connect(target)
            .await
            .with_context(|| format!("connect to {}:{}", target.host(), target.port()))?;
        debug!("[{}] connected to {}", self.image.id(), target.host());
        self.advance(State::ScanRunning);

        let fetched = self.fetch_results(session.as_mut()).await;
        let closed = close_session(session.as_mut()).await;
        match (fetched, closed) {
            (Ok(path), closed) => closed.map(|_| path),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                warn!("[{}] {close_err:#}", self.image.id());
                Err(err)
            }
        }
    }

    async fn fetch_results(&mut self, session: &mut dyn Session) -> Result<PathBuf> {
        self.wait_scan(session).await?;
        info!("[{}] scan completed, fetching results", self.image.id());

        let local = self.local_path("json");
        let path = session
            .copy_from_remote(Path::new(REMOTE_RESULTS), &local)
            .await
            .context("copy results from instance")?;
        self.advance(State::ResultsFetched);
        Ok(path)
    }

    /// Poll until the scanner's completion marker exists and isn't empty.
    async fn wait_scan(&self, session: &mut dyn Session) -> Result<()> {
        let poll = self.settings.scan_poll();
        let marker = self.local_path("finished");
        for attempt in 1..=poll.attempts() {
            if scan_completed(session, &marker).await {
                return Ok(());
            }
            if attempt < poll.attempts() {
                info!(
                    "[{}] scan still running ({attempt}/{}), checking again in {:?}",
                    self.image.id(),
                    poll.attempts(),
                    poll.interval()
                );
                sleep(poll.interval()).await;
            }
        }
        Err(Timeout::ScanCompletion {
            image: self.image.id().clone(),
            attempts: poll.attempts(),
        }
        .into())
    }

    /// Record the outcome on the image, then upload the results.
    async fn finish(&mut self, result: &ScanResult) -> Result<()> {
        let id = self.image.id().clone();
        let images = self.backend.images().clone();

        if self.settings.visibility().is_none() {
            let visibility = match result.classification {
                Classification::Passed => Visibility::Public,
                Classification::Failed => Visibility::Private,
            };
            images
                .set_visibility(&id, visibility)
                .await
                .with_context(|| format!("set visibility {visibility}"))?;
        }

        if self.settings.auto_delete() && result.classification == Classification::Failed {
            images.delete_image(&id).await.context("delete image")?;
            self.deleted = true;
            info!("[{id}] removed image: vulnerabilities detected");
        } else {
            let current = images
                .fetch_image(&id)
                .await
                .context("fetch image properties")?
                .ok_or_else(|| MissingImage { id: id.clone() })?;
            let key = self.settings.tag_key();
            let op = PropertyOp::for_key(current.properties(), key);
            images
                .modify_property(&id, op, key, result.classification.as_ref())
                .await
                .with_context(|| format!("{op} property {key}"))?;
        }
        self.advance(State::Finalized);

        let key = results_key(&self.image);
        let body = tokio::fs::File::open(&result.path)
            .await
            .with_context(|| format!("open {:?}", result.path))?;
        self.backend
            .storage()
            .put(&key, Box::new(body))
            .await
            .with_context(|| format!("upload results to {key}"))?;
        debug!("[{id}] uploaded results to {key}");
        Ok(())
    }

    /// Whether a completed job counts as a success.
    fn verdict(&self) -> Result<()> {
        let count = self.result.as_ref().map_or(0, |r| r.findings.len());
        if count == 0 || self.settings.skip_cve_check() {
            return Ok(());
        }
        Err(VulnerabilitiesFound {
            image: self.image.id().clone(),
            count,
            deleted: self.deleted,
        }
        .into())
    }

    fn local_path(&self, extension: &str) -> PathBuf {
        self.settings
            .results_dir()
            .join(format!("{}.{extension}", self.image.id()))
    }

    fn advance(&mut self, next: State) {
        debug!("[{}] {} -> {next}", self.image.id(), self.state);
        self.state = next;
    }

    fn fail(&mut self, err: &Report) {
        debug!("[{}] {} -> {}: {err:#}", self.image.id(), self.state, State::Failed);
        self.state = State::Failed;
    }
}

/// Read, parse and normalize the results document at `path`.
async fn interpret(path: PathBuf) -> Result<ScanResult> {
    let raw = tokio::fs::read(&path)
        .await
        .with_context(|| format!("read results {path:?}"))?;
    let findings = trivy_report::parse(&raw).with_context(|| format!("parse results {path:?}"))?;
    let classification = Classification::of(&findings);

    let normalized = trivy_report::render(&findings).context("render findings")?;
    tokio::fs::write(&path, normalized)
        .await
        .with_context(|| format!("write normalized results {path:?}"))?;

    Ok(ScanResult {
        path,
        findings,
        classification,
    })
}

/// Whether the scanner has written a non-empty completion marker.
/// Failing to copy it just means it isn't there yet.
async fn scan_completed(session: &mut dyn Session, local: &Path) -> bool {
    let path = match session
        .copy_from_remote(Path::new(REMOTE_MARKER), local)
        .await
    {
        Ok(path) => path,
        Err(err) => {
            debug!("completion marker unavailable: {err:#}");
            return false;
        }
    };
    match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.len() > 0,
        Err(err) => {
            debug!("stat completion marker {path:?}: {err}");
            false
        }
    }
}

/// Close both channels of the session, reporting the first failure.
async fn close_session(session: &mut dyn Session) -> Result<()> {
    let transfer = session
        .close_transfer()
        .await
        .context("close file transfer channel");
    let shell = session.close_shell().await.context("close shell channel");
    transfer.and(shell)
}

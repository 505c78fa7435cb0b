//! Provides application configuration structures.

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use getset::{CopyGetters, Getters};
use stable_eyre::{
    eyre::{ensure, eyre},
    Result,
};
use trivy_report::Severity;
use typed_builder::TypedBuilder;

use crate::{
    image::{Selector, Visibility, DEFAULT_TAG_KEY},
    job::Poll,
};

/// Configures the cloud scanning instances run in.
#[derive(Parser, Debug, Getters, CopyGetters, TypedBuilder)]
pub struct Cloud {
    /// The named cloud to authenticate against. Also available via the `OS_CLOUD` environment variable.
    #[clap(long, env = "OS_CLOUD")]
    #[getset(get = "pub")]
    #[builder(default, setter(strip_option, into))]
    cloud: Option<String>,

    /// The name of the flavor scanning instances boot with.
    #[clap(long)]
    #[getset(get = "pub")]
    #[builder(setter(into))]
    flavor: String,

    /// The network scanning instances attach to.
    #[clap(long)]
    #[getset(get = "pub")]
    #[builder(setter(into))]
    network: String,

    /// The network floating IPs are allocated from.
    #[clap(long)]
    #[getset(get = "pub")]
    #[builder(setter(into))]
    floating_ip_network: String,

    /// Security groups applied to scanning instances. May be provided multiple times.
    #[clap(long = "security-group")]
    #[getset(get = "pub")]
    #[builder(default)]
    security_groups: Vec<String>,

    /// Attach a config drive to scanning instances.
    #[clap(long)]
    #[getset(get_copy = "pub")]
    #[builder(default)]
    config_drive: bool,

    /// The login user on scanning instances.
    #[clap(long, default_value = "ubuntu")]
    #[getset(get = "pub")]
    #[builder(default = String::from("ubuntu"), setter(into))]
    ssh_user: String,

    /// The SSH port on scanning instances.
    #[clap(long, default_value_t = 22)]
    #[getset(get_copy = "pub")]
    #[builder(default = 22)]
    ssh_port: u16,
}

impl Cloud {
    /// Validates that self is correctly formed.
    pub fn validate(self) -> Result<Self> {
        ensure!(!self.flavor.is_empty(), "flavor must not be empty");
        ensure!(!self.network.is_empty(), "network must not be empty");
        ensure!(
            !self.floating_ip_network.is_empty(),
            "floating IP network must not be empty"
        );
        Ok(self)
    }
}

/// Configures options related to the scan.
#[derive(Parser, Debug, Getters, CopyGetters, TypedBuilder)]
pub struct Scan {
    /// Whether to enable debug logging.
    #[clap(long, short)]
    #[getset(get_copy = "pub")]
    #[builder(default = false)]
    debug: bool,

    /// Scan exactly the image with this id.
    #[clap(long, conflicts_with = "image_search")]
    #[getset(get = "pub")]
    #[builder(default, setter(strip_option, into))]
    image_id: Option<String>,

    /// Scan every image whose name contains this text.
    #[clap(long)]
    #[getset(get = "pub")]
    #[builder(default, setter(strip_option, into))]
    image_search: Option<String>,

    /// How many images are scanned at once.
    #[clap(long, default_value_t = 1)]
    #[getset(get_copy = "pub")]
    #[builder(default = 1)]
    concurrency: usize,

    /// The lowest severity reported by the scanner.
    #[clap(long, default_value_t = Severity::Medium)]
    #[getset(get_copy = "pub")]
    #[builder(default)]
    severity: Severity,

    /// Delete images with findings instead of tagging them.
    #[clap(long)]
    #[getset(get_copy = "pub")]
    #[builder(default)]
    auto_delete_image: bool,

    /// Treat findings as a normal outcome instead of a failure.
    #[clap(long)]
    #[getset(get_copy = "pub")]
    #[builder(default)]
    skip_cve_check: bool,

    /// Leave image visibility alone. Without this, visibility follows the scan outcome.
    #[clap(long, value_enum)]
    #[getset(get_copy = "pub")]
    #[builder(default, setter(strip_option))]
    image_visibility: Option<Visibility>,

    /// Namespace the classification property as `<prefix>:<tag key>`.
    #[clap(long)]
    #[getset(get = "pub")]
    #[builder(default, setter(strip_option, into))]
    metadata_prefix: Option<String>,

    /// The property key the classification is written under.
    #[clap(long, default_value = DEFAULT_TAG_KEY)]
    #[getset(get = "pub")]
    #[builder(default = String::from(DEFAULT_TAG_KEY), setter(into))]
    tag_key: String,

    /// Where results documents are written locally.
    #[clap(long, default_value = "/tmp")]
    #[getset(get = "pub")]
    #[builder(default = PathBuf::from("/tmp"), setter(into))]
    results_dir: PathBuf,

    /// Vulnerability ids the scanner ignores. May be provided multiple times.
    #[clap(long = "ignore")]
    #[getset(get = "pub")]
    #[builder(default)]
    ignore: Vec<String>,

    /// An object storage key holding additional scanner ignore entries.
    #[clap(long)]
    #[builder(default, setter(strip_option, into))]
    ignore_object: Option<String>,

    /// How many times to check whether a scanning instance is active.
    #[clap(long, default_value_t = 100)]
    #[builder(default = 100)]
    instance_attempts: usize,

    /// Seconds between checks of whether a scanning instance is active.
    #[clap(long, default_value_t = 5)]
    #[builder(default = 5)]
    instance_interval: u64,

    /// How many times to check whether the scan has finished.
    #[clap(long, default_value_t = 20)]
    #[builder(default = 20)]
    scan_attempts: usize,

    /// Seconds between checks of whether the scan has finished.
    #[clap(long, default_value_t = 10)]
    #[builder(default = 10)]
    scan_interval: u64,
}

impl Scan {
    /// Validates that self is correctly formed.
    pub fn validate(self) -> Result<Self> {
        ensure!(self.concurrency >= 1, "concurrency must be at least 1");
        ensure!(
            self.image_id.is_some() != self.image_search.is_some(),
            "exactly one of image id or image search must be provided"
        );
        ensure!(
            self.instance_attempts >= 1 && self.scan_attempts >= 1,
            "polling attempts must be at least 1"
        );
        Ok(self)
    }

    /// The images this run processes.
    pub fn selector(&self) -> Result<Selector> {
        match (&self.image_id, &self.image_search) {
            (Some(id), None) => Ok(Selector::Id(id.as_str().into())),
            (None, Some(search)) => Ok(Selector::Search(search.clone())),
            _ => Err(eyre!(
                "exactly one of image id or image search must be provided"
            )),
        }
    }

    /// The object storage key of the extra ignore file, if any.
    pub fn ignore_object(&self) -> Option<&str> {
        self.ignore_object.as_deref()
    }

    /// The wait for scanning instances to boot.
    pub fn instance_poll(&self) -> Poll {
        Poll::builder()
            .attempts(self.instance_attempts)
            .interval(Duration::from_secs(self.instance_interval))
            .build()
    }

    /// The wait for the scanner to finish.
    pub fn scan_poll(&self) -> Poll {
        Poll::builder()
            .attempts(self.scan_attempts)
            .interval(Duration::from_secs(self.scan_interval))
            .build()
    }
}

/// Configures the simulated cloud used in dry run mode.
#[derive(Parser, Debug, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct DryRun {
    /// A results document the simulated scanner reports for every image.
    /// Without this, every image scans clean.
    #[clap(long)]
    #[builder(default, setter(strip_option, into))]
    report: Option<PathBuf>,

    /// Names of the images the simulated registry holds. May be provided multiple times.
    #[clap(long = "image-name", default_value = "dryrun-image")]
    #[builder(default = vec![String::from("dryrun-image")])]
    images: Vec<String>,
}

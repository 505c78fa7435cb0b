//! Errors the pipeline reports in a form callers can match on.
//!
//! Everything else travels as an `eyre` report; these types ride inside those reports
//! and can be recovered with `downcast_ref`.

use std::fmt::{self, Display};

use stable_eyre::eyre::Report;
use thiserror::Error;

use crate::{api::InstanceId, image::ImageId};

/// A bounded wait ran out of attempts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Timeout {
    /// The instance never reported itself active.
    #[error("instance {instance} did not become active after {attempts} checks")]
    InstanceActive {
        /// The instance being waited on.
        instance: InstanceId,

        /// How many times the status was checked.
        attempts: usize,
    },

    /// The scan never wrote its completion marker.
    #[error("scan on image {image} did not complete after {attempts} checks")]
    ScanCompletion {
        /// The image being scanned.
        image: ImageId,

        /// How many times the marker was checked.
        attempts: usize,
    },
}

/// The registry has no image with the requested id.
#[derive(Debug, Error)]
#[error("image {id} not found")]
pub struct MissingImage {
    /// The id that was looked up.
    pub id: ImageId,
}

/// The scan found vulnerabilities and the run is configured to treat that as a failure.
#[derive(Debug, Error)]
pub struct VulnerabilitiesFound {
    /// The image that was scanned.
    pub image: ImageId,

    /// How many findings the scan produced.
    pub count: usize,

    /// Whether the image was deleted because of them.
    pub deleted: bool,
}

impl Display for VulnerabilitiesFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} vulnerabilities detected at or above the severity threshold",
            self.count
        )?;
        if self.deleted {
            write!(f, "; the image has been removed")?;
        }
        Ok(())
    }
}

/// One image that could not be processed.
#[derive(Debug)]
pub struct ImageFailure {
    /// The image's id.
    pub id: ImageId,

    /// The image's name.
    pub name: String,

    /// What went wrong.
    pub error: Report,
}

impl Display for ImageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to scan image {} with ID {}: {:#}",
            self.name, self.id, self.error
        )
    }
}

/// Every per-image failure from one run.
#[derive(Debug, Error)]
pub struct ScanFailures {
    /// The failures, in the order they were reported.
    pub failures: Vec<ImageFailure>,

    /// Images handed to a worker that exited before reporting on them.
    pub lost: usize,
}

impl ScanFailures {
    /// Whether `id` is among the failed images.
    pub fn contains(&self, id: &ImageId) -> bool {
        self.failures.iter().any(|failure| &failure.id == id)
    }
}

impl Display for ScanFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "encountered errors scanning {} image(s)",
            self.failures.len() + self.lost
        )?;
        for failure in &self.failures {
            write!(f, "\n- {failure}")?;
        }
        if self.lost > 0 {
            write!(
                f,
                "\n- {} image(s) were dispatched but never reported on",
                self.lost
            )?;
        }
        Ok(())
    }
}

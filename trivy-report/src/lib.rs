//! Decodes the results document produced by the in-instance vulnerability scanner
//! into a flat, normalized list of [`Finding`]s.
//!
//! The scanner groups vulnerabilities by scan target (`Results[].Vulnerabilities[]`).
//! The pipeline doesn't care about targets; it only cares whether anything was found,
//! and wants to persist a smaller document than the raw report.
//! Each field of a [`Finding`] is copied verbatim from the record it came from,
//! including severity labels the [`Severity`] scale doesn't know about.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(clippy::unwrap_used)]

use getset::Getters;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use typed_builder::TypedBuilder;

mod schema;
mod severity;

pub use severity::Severity;

/// Errors reported by this library.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The results document was not a well formed report.
    #[error("decode results document")]
    Decode(#[source] serde_json::Error),

    /// The normalized findings could not be rendered.
    #[error("encode findings")]
    Encode(#[source] serde_json::Error),
}

/// One normalized vulnerability record.
#[derive(Clone, PartialEq, Debug, Getters, TypedBuilder, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct Finding {
    /// The identifier of the vulnerability, for example a CVE id.
    #[serde(rename = "VulnerabilityID")]
    #[builder(setter(into))]
    vulnerability_id: String,

    /// Free text description of the vulnerability.
    #[serde(rename = "Description")]
    #[builder(default, setter(into))]
    description: String,

    /// The affected package.
    #[serde(rename = "PkgName")]
    #[builder(setter(into))]
    pkg_name: String,

    /// The package version installed in the image.
    #[serde(rename = "InstalledVersion")]
    #[builder(default, setter(into))]
    installed_version: String,

    /// The severity label as reported by the scanner.
    ///
    /// This is intentionally not a [`Severity`]: the value is passed through unvalidated.
    #[serde(rename = "Severity")]
    #[builder(setter(into))]
    severity: String,

    /// Scores and vectors from each source that scored the vulnerability.
    #[serde(rename = "CVSS")]
    #[builder(default)]
    cvss: Cvss,

    /// The first package version that fixes the vulnerability, if any.
    #[serde(rename = "FixedVersion")]
    #[builder(default, setter(into))]
    fixed_version: String,
}

/// Score data from the sources the scanner consults.
/// Any of them may be missing.
#[derive(Clone, PartialEq, Debug, Default, Getters, TypedBuilder, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct Cvss {
    /// GitHub security advisory scoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    ghsa: Option<Score>,

    /// National vulnerability database scoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    nvd: Option<Score>,

    /// Red Hat scoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    redhat: Option<Score>,
}

/// Scores and vectors from one scoring source.
#[derive(Clone, PartialEq, Debug, Default, Getters, TypedBuilder, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct Score {
    /// CVSS v2 vector string.
    #[serde(rename = "V2Vector", default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    v2_vector: Option<String>,

    /// CVSS v3 vector string.
    #[serde(rename = "V3Vector", default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    v3_vector: Option<String>,

    /// CVSS v2 base score.
    #[serde(rename = "V2Score", default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    v2_score: Option<f64>,

    /// CVSS v3 base score.
    #[serde(rename = "V3Score", default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    v3_score: Option<f64>,
}

/// The outcome of a scan.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Classification {
    /// Nothing was found.
    Passed,
    /// At least one vulnerability was found.
    Failed,
}

impl Classification {
    /// Classify a list of findings: `Passed` iff the list is empty.
    ///
    /// The severity of individual findings doesn't matter here;
    /// the scanner was already told which severities to report.
    pub fn of(findings: &[Finding]) -> Self {
        if findings.is_empty() {
            Self::Passed
        } else {
            Self::Failed
        }
    }
}

/// Decode a results document into its findings, in document order.
///
/// An empty document, or one without any results, yields no findings.
pub fn parse(document: &[u8]) -> Result<Vec<Finding>, Error> {
    let report = serde_json::from_slice::<schema::Report>(document).map_err(Error::Decode)?;
    let findings = report
        .results
        .unwrap_or_default()
        .into_iter()
        .flat_map(|group| group.vulnerabilities.unwrap_or_default())
        .map(|v| Finding {
            vulnerability_id: v.vulnerability_id,
            description: v.description,
            pkg_name: v.pkg_name,
            installed_version: v.installed_version,
            severity: v.severity,
            cvss: v.cvss.unwrap_or_default(),
            fixed_version: v.fixed_version,
        })
        .collect();
    Ok(findings)
}

/// Render the normalized document persisted after a scan:
/// the list of findings, or an empty object if there are none.
pub fn render(findings: &[Finding]) -> Result<Vec<u8>, Error> {
    if findings.is_empty() {
        return Ok(b"{}".to_vec());
    }
    serde_json::to_vec(findings).map_err(Error::Encode)
}

//! The subset of the scanner's JSON report that the pipeline consumes.
//!
//! The scanner emits `null` instead of an empty list in several places,
//! so every list is optional here and flattened by the caller.

use serde::Deserialize;

use crate::Cvss;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Report {
    #[serde(rename = "Results", default)]
    pub(crate) results: Option<Vec<ResultGroup>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResultGroup {
    #[serde(rename = "Vulnerabilities", default)]
    pub(crate) vulnerabilities: Option<Vec<Vulnerability>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Vulnerability {
    #[serde(rename = "VulnerabilityID", default)]
    pub(crate) vulnerability_id: String,

    #[serde(rename = "PkgName", default)]
    pub(crate) pkg_name: String,

    #[serde(rename = "InstalledVersion", default)]
    pub(crate) installed_version: String,

    #[serde(rename = "FixedVersion", default)]
    pub(crate) fixed_version: String,

    #[serde(rename = "Description", default)]
    pub(crate) description: String,

    #[serde(rename = "Severity", default)]
    pub(crate) severity: String,

    #[serde(rename = "CVSS", default)]
    pub(crate) cvss: Option<Cvss>,
}

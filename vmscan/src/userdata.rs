//! The boot script run by scanning instances.
//!
//! The instance installs the scanner, scans its own root filesystem,
//! writes the results document and finally a completion marker.
//! The job polls for the marker before fetching the results.

use getset::Getters;
use trivy_report::Severity;
use typed_builder::TypedBuilder;

/// Where the instance writes the results document.
pub const REMOTE_RESULTS: &str = "/tmp/results.json";

/// Where the instance writes the completion marker once the results are in place.
pub const REMOTE_MARKER: &str = "/tmp/finished";

/// The scanner release installed on instances.
pub const SCANNER_VERSION: &str = "0.60.0";

const IGNORE_FILE: &str = "/tmp/.trivyignore";

/// Inputs for the boot script.
#[derive(Clone, Eq, PartialEq, Debug, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct UserData {
    /// The lowest severity the scanner reports.
    threshold: Severity,

    /// Vulnerability ids the scanner ignores.
    #[builder(default)]
    ignore: Vec<String>,

    /// Extra ignore file content, appended after `ignore`.
    #[builder(default, setter(strip_option))]
    ignore_file: Option<String>,

    /// The scanner release to install.
    #[builder(default = SCANNER_VERSION.to_string(), setter(into))]
    scanner_version: String,
}

impl UserData {
    /// Render the script.
    pub fn render(&self) -> String {
        let severities = self
            .threshold
            .and_above()
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        let version = &self.scanner_version;

        let entries = self
            .ignore
            .iter()
            .map(String::as_str)
            .chain(self.ignore_file.as_deref())
            .flat_map(str::lines)
            .collect::<Vec<_>>();
        let delimiter = heredoc_delimiter(&entries);
        let ignored = entries
            .iter()
            .map(|entry| format!("{entry}\n"))
            .collect::<String>();

        format!(
            "#!/usr/bin/env bash\n\
             set -euo pipefail\n\
             \n\
             cat > {IGNORE_FILE} <<'{delimiter}'\n\
             {ignored}\
             {delimiter}\n\
             \n\
             curl -sfL https://github.com/aquasecurity/trivy/releases/download/v{version}/trivy_{version}_Linux-64bit.tar.gz \
             | tar -xz -C /usr/local/bin trivy\n\
             trivy rootfs --scanners vuln --ignorefile {IGNORE_FILE} \
             --severity {severities} --format json --output {REMOTE_RESULTS} /\n\
             echo done > {REMOTE_MARKER}\n"
        )
    }
}

/// A heredoc delimiter that no line of `lines` equals, so the heredoc can't end early.
fn heredoc_delimiter(lines: &[&str]) -> String {
    let mut delimiter = String::from("IGNORE");
    while lines.iter().any(|line| line.trim() == delimiter) {
        delimiter.push('_');
    }
    delimiter
}

//! Integration tests.

use trivy_report::{parse, render, Classification, Finding};

const REPORT: &[u8] = include_bytes!("testdata/report.json");

#[test]
fn flattens_every_group_in_order() {
    let findings = parse(REPORT).expect("parse report");
    let ids = findings
        .iter()
        .map(|f| f.vulnerability_id().as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        ids,
        vec!["CVE-2023-4911", "CVE-2022-3715", "GHSA-m425-mq94-257g"]
    );
    assert_eq!(Classification::of(&findings), Classification::Failed);
}

#[test]
fn copies_fields_verbatim() {
    let findings = parse(REPORT).expect("parse report");
    let glibc = &findings[0];
    assert_eq!(glibc.pkg_name(), "libc6");
    assert_eq!(glibc.installed_version(), "2.35-0ubuntu3.1");
    assert_eq!(glibc.fixed_version(), "2.35-0ubuntu3.4");
    assert_eq!(glibc.severity(), "HIGH");
    assert_eq!(
        glibc.description(),
        "A buffer overflow was discovered in the GNU C Library's dynamic loader ld.so."
    );

    let nvd = glibc.cvss().nvd().as_ref().expect("nvd score present");
    assert_eq!(
        nvd.v3_vector().as_deref(),
        Some("CVSS:3.1/AV:L/AC:L/PR:L/UI:N/S:U/C:H/I:H/A:H")
    );
    assert_eq!(*nvd.v3_score(), Some(7.8));
    assert_eq!(*nvd.v2_score(), None);
    assert!(glibc.cvss().ghsa().is_none());
}

#[test]
fn tolerates_missing_score_sources() {
    let findings = parse(REPORT).expect("parse report");
    let bash = &findings[1];
    assert!(bash.cvss().ghsa().is_none());
    assert!(bash.cvss().nvd().is_none());
    assert!(bash.cvss().redhat().is_none());
}

#[test]
fn passes_unknown_severity_through() {
    let findings = parse(REPORT).expect("parse report");
    assert_eq!(findings[2].severity(), "NEGLIGIBLE");
}

#[test]
fn empty_results_pass() {
    let findings = parse(br#"{"SchemaVersion": 2, "Results": []}"#).expect("parse report");
    assert!(findings.is_empty());
    assert_eq!(Classification::of(&findings), Classification::Passed);
    assert_eq!(render(&findings).expect("render"), b"{}");
}

#[test]
fn normalized_document_keeps_every_finding() {
    let findings = parse(REPORT).expect("parse report");
    let rendered = render(&findings).expect("render");
    let decoded: Vec<Finding> = serde_json::from_slice(&rendered).expect("decode normalized");
    assert_eq!(decoded, findings);
}

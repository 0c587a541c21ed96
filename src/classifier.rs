//! Failure Classifier Module
//!
//! A record fails DMARC when either policy-evaluated result is not `pass`.
//! The raw `auth_results` attestations never take part in this decision: a raw
//! DKIM signature can fail while the evaluated result passes through SPF
//! alignment, and the other way round.
//!
//! This module also derives the remediation hints shown next to each failure.

use crate::models::{AuthResult, Disposition, Failure};

/// Returns `true` when the record did not pass DMARC evaluation.
pub fn classify(dkim: AuthResult, spf: AuthResult) -> bool {
    !dkim.is_pass() || !spf.is_pass()
}

/// Severity of a recommendation block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A titled group of remediation hints.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub severity: Severity,
    pub title: String,
    pub actions: Vec<String>,
}

impl Recommendation {
    fn new(severity: Severity, title: impl Into<String>, actions: Vec<String>) -> Self {
        Recommendation {
            severity,
            title: title.into(),
            actions,
        }
    }
}

/// Builds the remediation hints for one failure.
pub fn recommendations(failure: &Failure) -> Vec<Recommendation> {
    let record = &failure.record;
    let ip = &record.source_ip;
    let mut out = Vec::new();

    if !record.dkim_result.is_pass() {
        out.push(Recommendation::new(
            Severity::Info,
            "DKIM Failure:",
            vec![
                "Verify DKIM signing is enabled on your mail server".into(),
                "Check DKIM private key configuration".into(),
                "Ensure DKIM DNS record is published correctly".into(),
                "Verify selector and domain match in email headers".into(),
            ],
        ));
    }

    if !record.spf_result.is_pass() {
        out.push(Recommendation::new(
            Severity::Info,
            "SPF Failure:",
            vec![
                format!("Add IP {} to SPF record if legitimate", ip),
                "Review SPF record for missing authorized servers".into(),
                "Check for SPF record syntax errors".into(),
                "Ensure SPF record is not exceeding DNS lookup limit (10)".into(),
            ],
        ));
    }

    match record.disposition {
        Disposition::Reject => out.push(Recommendation::new(
            Severity::Critical,
            "CRITICAL: Messages are being REJECTED!",
            vec!["Immediate action required to prevent email delivery issues".into()],
        )),
        Disposition::Quarantine => out.push(Recommendation::new(
            Severity::Warning,
            "WARNING: Messages are being QUARANTINED (likely spam folder)",
            vec![],
        )),
        Disposition::None => {}
    }

    out.push(Recommendation::new(
        Severity::Info,
        "General recommendations:",
        vec![
            format!("Check IP reputation for {}", ip),
            "Verify this IP is authorized to send on your behalf".into(),
            "Use DMARC alignment to ensure domain consistency".into(),
        ],
    ));

    out
}

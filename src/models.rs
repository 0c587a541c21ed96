//! Data Models Module
//!
//! This module defines the core data structures used by dmarcscan to represent
//! parsed aggregate reports, their records and the denormalized failures handed
//! to the renderers and the exporter. It also provides conversions from the
//! report's string vocabulary into closed enumerations.
use chrono::{DateTime, NaiveDate, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::classifier;

/// One aggregate report document.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Report {
    pub org_name: String,
    pub report_id: String,
    pub domain: String,
    pub dmarc_policy: String,
    pub date_begin: DateTime<Utc>,
    pub date_end: DateTime<Utc>,
    pub records: Vec<Record>,
    pub source_filename: String,
}

impl Report {
    /// Records that did not pass DMARC evaluation, in document order.
    pub fn failing_records(&self) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(|r| r.has_failure())
    }
}

/// One `<record>` bucket: a source IP plus its policy outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub source_ip: String,
    pub count: u64,
    pub disposition: Disposition,
    pub dkim_result: AuthResult,
    pub spf_result: AuthResult,
    pub dkim_details: Vec<AuthDetail>,
    pub spf_details: Vec<AuthDetail>,
    pub header_from: String,
    pub envelope_from: Option<String>,
}

impl Record {
    /// Derived from the policy-evaluated results on every call.
    pub fn has_failure(&self) -> bool {
        classifier::classify(self.dkim_result, self.spf_result)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Record", 10)?;
        state.serialize_field("source_ip", &self.source_ip)?;
        state.serialize_field("count", &self.count)?;
        state.serialize_field("disposition", &self.disposition)?;
        state.serialize_field("dkim_result", &self.dkim_result)?;
        state.serialize_field("spf_result", &self.spf_result)?;
        state.serialize_field("dkim_details", &self.dkim_details)?;
        state.serialize_field("spf_details", &self.spf_details)?;
        state.serialize_field("header_from", &self.header_from)?;
        state.serialize_field("envelope_from", &self.envelope_from)?;
        state.serialize_field("has_failure", &self.has_failure())?;
        state.end()
    }
}

/// A raw authentication attestation from `auth_results`. Evidence only.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AuthDetail {
    pub domain: String,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// A failing record joined with the identifying metadata of its report.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Failure {
    pub domain: String,
    pub org_name: String,
    pub report_id: String,
    pub date: NaiveDate,
    #[serde(flatten)]
    pub record: Record,
}

impl Failure {
    pub fn new(report: &Report, record: &Record) -> Self {
        Failure {
            domain: report.domain.clone(),
            org_name: report.org_name.clone(),
            report_id: report.report_id.clone(),
            date: report.date_begin.date_naive(),
            record: record.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    #[default]
    None,
    Quarantine,
    Reject,
}

/// Authentication outcome vocabulary of RFC 7489 aggregate reports.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthResult {
    #[default]
    None,
    Pass,
    Fail,
    SoftFail,
    Neutral,
    Policy,
    TempError,
    PermError,
}

impl AuthResult {
    pub fn is_pass(self) -> bool {
        matches!(self, AuthResult::Pass)
    }
}

impl fmt::Display for AuthResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthResult::None => "none",
            AuthResult::Pass => "pass",
            AuthResult::Fail => "fail",
            AuthResult::SoftFail => "softfail",
            AuthResult::Neutral => "neutral",
            AuthResult::Policy => "policy",
            AuthResult::TempError => "temperror",
            AuthResult::PermError => "permerror",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::None => write!(f, "none"),
            Disposition::Quarantine => write!(f, "quarantine"),
            Disposition::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for AuthResult {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pass" => Ok(AuthResult::Pass),
            "fail" | "hardfail" => Ok(AuthResult::Fail),
            "softfail" => Ok(AuthResult::SoftFail),
            "neutral" => Ok(AuthResult::Neutral),
            "none" => Ok(AuthResult::None),
            "policy" => Ok(AuthResult::Policy),
            "temperror" => Ok(AuthResult::TempError),
            "permerror" => Ok(AuthResult::PermError),
            _ => Err(format!("Invalid authentication result: {}", s)),
        }
    }
}

impl FromStr for Disposition {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Disposition::None),
            "quarantine" => Ok(Disposition::Quarantine),
            "reject" => Ok(Disposition::Reject),
            _ => Err(format!("Invalid disposition: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(dkim: AuthResult, spf: AuthResult) -> Record {
        Record {
            source_ip: "192.0.2.1".into(),
            count: 4,
            disposition: Disposition::None,
            dkim_result: dkim,
            spf_result: spf,
            dkim_details: vec![],
            spf_details: vec![],
            header_from: "example.com".into(),
            envelope_from: None,
        }
    }

    #[test]
    fn test_result_parsing() {
        assert_eq!("PASS".parse::<AuthResult>(), Ok(AuthResult::Pass));
        assert_eq!("hardfail".parse::<AuthResult>(), Ok(AuthResult::Fail));
        assert_eq!("temperror".parse::<AuthResult>(), Ok(AuthResult::TempError));
        assert!("maybe".parse::<AuthResult>().is_err());
        assert_eq!(" Reject ".parse::<Disposition>(), Ok(Disposition::Reject));
        assert!("drop".parse::<Disposition>().is_err());
    }

    #[test]
    fn test_record_serializes_derived_failure_flag() {
        let value = serde_json::to_value(record(AuthResult::Fail, AuthResult::Pass)).unwrap();
        assert_eq!(value["has_failure"], true);
        assert_eq!(value["dkim_result"], "fail");
        assert_eq!(value["disposition"], "none");

        let value = serde_json::to_value(record(AuthResult::Pass, AuthResult::Pass)).unwrap();
        assert_eq!(value["has_failure"], false);
    }

    #[test]
    fn test_failure_flattens_record() {
        let begin = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let report = Report {
            org_name: "google.com".into(),
            report_id: "abc".into(),
            domain: "example.com".into(),
            dmarc_policy: "none".into(),
            date_begin: begin,
            date_end: begin,
            records: vec![record(AuthResult::Pass, AuthResult::Fail)],
            source_filename: "r.xml".into(),
        };
        let failure = Failure::new(&report, &report.records[0]);
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["domain"], "example.com");
        assert_eq!(value["date"], "2024-03-01");
        assert_eq!(value["source_ip"], "192.0.2.1");
        assert_eq!(value["has_failure"], true);
    }
}

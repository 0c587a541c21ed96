//! Report Aggregator Module
//!
//! Accumulates parsed reports over one analysis run and keeps a denormalized
//! [`Failure`] for every record that did not pass DMARC evaluation.

use crate::models::{Failure, Report};

/// Sequential accumulator for one run. Owns every appended report.
#[derive(Debug, Default)]
pub struct Aggregator {
    reports: Vec<Report>,
    failures: Vec<Failure>,
}

/// Failures of one policy domain, in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainFailures<'a> {
    pub domain: &'a str,
    pub failures: Vec<&'a Failure>,
}

impl DomainFailures<'_> {
    /// Message volume behind the failures (sum of `count`).
    pub fn total_failed_count(&self) -> u64 {
        self.failures.iter().map(|f| f.record.count).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub total_reports: usize,
    pub domains_with_failures: usize,
    pub total_failure_records: usize,
    pub total_failed_message_count: u64,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `report`, recording a failure per failing record.
    pub fn append(&mut self, report: Report) {
        let before = self.failures.len();
        self.failures
            .extend(report.failing_records().map(|record| Failure::new(&report, record)));

        if self.failures.len() > before {
            log::warn!(
                "FAILURES FOUND in report from {} for domain {}",
                report.org_name,
                report.domain
            );
        } else {
            log::info!("All passed in report from {} for {}", report.org_name, report.domain);
        }
        self.reports.push(report);
    }

    pub fn reports(&self) -> &[Report] {
        &self.reports
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    /// Groups failures by domain, keeping first-seen domain order.
    pub fn failures_grouped_by_domain(&self) -> Vec<DomainFailures<'_>> {
        let mut groups: Vec<DomainFailures<'_>> = Vec::new();
        for failure in &self.failures {
            match groups.iter_mut().find(|g| g.domain == failure.domain) {
                Some(group) => group.failures.push(failure),
                None => groups.push(DomainFailures {
                    domain: &failure.domain,
                    failures: vec![failure],
                }),
            }
        }
        groups
    }

    pub fn summary(&self) -> Summary {
        Summary {
            total_reports: self.reports.len(),
            domains_with_failures: self.failures_grouped_by_domain().len(),
            total_failure_records: self.failures.len(),
            total_failed_message_count: self.failures.iter().map(|f| f.record.count).sum(),
        }
    }
}

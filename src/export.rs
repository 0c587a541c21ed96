//! Export Module
//!
//! The machine-readable export of one run: every failure plus every parsed
//! report, serialized as JSON.
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregator::Aggregator;
use crate::error::Result;
use crate::models::{Failure, Report};

#[derive(Debug, Serialize)]
pub struct ExportDocument<'a> {
    pub generated_at: DateTime<Utc>,
    pub total_reports: usize,
    pub total_failures: usize,
    pub failures: &'a [Failure],
    pub all_reports: &'a [Report],
}

impl<'a> ExportDocument<'a> {
    pub fn new(aggregator: &'a Aggregator, generated_at: DateTime<Utc>) -> Self {
        ExportDocument {
            generated_at,
            total_reports: aggregator.reports().len(),
            total_failures: aggregator.failures().len(),
            failures: aggregator.failures(),
            all_reports: aggregator.reports(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes the pretty-printed document to `path`.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

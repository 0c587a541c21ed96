//! Rendering Module
//!
//! Pure data-to-text renderers over an [`Aggregator`]: the grouped failure
//! report, a compact table and CSV. Nothing here performs I/O; colour comes from
//! `colored` and follows its global override.
use colored::*;
use prettytable::{Cell, Row, Table};
use serde::Serialize;

use crate::aggregator::Aggregator;
use crate::classifier::{recommendations, Severity};
use crate::error::{DmarcError, Result};
use crate::models::{AuthDetail, AuthResult, Failure};

const RULE_WIDTH: usize = 80;

/// Renders the human-readable failure report followed by the summary block.
pub fn render_text(aggregator: &Aggregator) -> String {
    let mut lines: Vec<String> = Vec::new();
    let groups = aggregator.failures_grouped_by_domain();

    if groups.is_empty() {
        lines.push(String::new());
        lines.push(
            "No DMARC failures found! All authentication checks passed."
                .green()
                .bold()
                .to_string(),
        );
        lines.push(String::new());
    } else {
        let rule = "=".repeat(RULE_WIDTH);
        lines.push(String::new());
        lines.push(rule.red().bold().to_string());
        lines.push("DMARC AUTHENTICATION FAILURES REPORT".red().bold().to_string());
        lines.push(rule.red().bold().to_string());
        lines.push(String::new());

        for group in &groups {
            lines.push(format!("Domain: {}", group.domain).cyan().bold().to_string());
            lines.push("─".repeat(RULE_WIDTH).cyan().to_string());
            lines.push(format!(
                "Total failed messages: {}",
                group.total_failed_count().to_string().red().bold()
            ));
            lines.push(String::new());

            for (idx, failure) in group.failures.iter().enumerate() {
                lines.push(format!("Failure #{}:", idx + 1).yellow().to_string());
                render_failure(&mut lines, failure);
                lines.push(String::new());
            }
            lines.push(String::new());
        }
    }

    let summary = aggregator.summary();
    lines.push("SUMMARY:".bold().to_string());
    lines.push(format!("Total reports analyzed: {}", summary.total_reports));
    lines.push(format!("Domains with failures: {}", summary.domains_with_failures));
    lines.push(format!("Total failure records: {}", summary.total_failure_records));
    lines.push(format!(
        "Total failed messages: {}",
        summary.total_failed_message_count
    ));
    lines.join("\n")
}

fn render_failure(lines: &mut Vec<String>, failure: &Failure) {
    let record = &failure.record;
    lines.push(format!("  Source IP: {}", record.source_ip));
    lines.push(format!("  Count: {} messages", record.count));
    lines.push(format!("  Header From: {}", record.header_from));
    lines.push(format!("  Date: {}", failure.date.format("%Y-%m-%d")));
    lines.push(format!("  Reporter: {}", failure.org_name));
    render_status(lines, "DKIM", record.dkim_result, &record.dkim_details);
    render_status(lines, "SPF", record.spf_result, &record.spf_details);
    lines.push(format!("  Disposition: {}", record.disposition));

    lines.push(String::new());
    lines.push(format!("  {}", "Recommendations:".magenta()));
    for rec in recommendations(failure) {
        let title = match rec.severity {
            Severity::Critical => rec.title.red().bold().to_string(),
            Severity::Warning => rec.title.yellow().to_string(),
            Severity::Info => rec.title.clone(),
        };
        lines.push(format!("    {}", title));
        for action in &rec.actions {
            lines.push(format!("      • {}", action));
        }
    }
}

fn render_status(lines: &mut Vec<String>, method: &str, result: AuthResult, details: &[AuthDetail]) {
    if result.is_pass() {
        lines.push(format!("  {}", format!("✓ {}: PASS", method).green()));
        return;
    }
    let label = result.to_string().to_uppercase();
    lines.push(format!("  {}", format!("✗ {}: {}", method, label).red()));
    for detail in details {
        lines.push(format!(
            "    - Domain: {}, Result: {}",
            detail.domain, detail.result
        ));
    }
}

/// One failure per row, for terminals.
pub fn render_table(aggregator: &Aggregator) -> String {
    let header = [
        "Domain",
        "Source IP",
        "Count",
        "DKIM",
        "SPF",
        "Disposition",
        "Reporter",
        "Date",
    ];
    let mut table = Table::new();
    table.add_row(Row::new(header.iter().map(|h| Cell::new(h)).collect()));
    for f in aggregator.failures() {
        table.add_row(Row::new(vec![
            Cell::new(&f.domain),
            Cell::new(&f.record.source_ip),
            Cell::new(&f.record.count.to_string()),
            Cell::new(&f.record.dkim_result.to_string()),
            Cell::new(&f.record.spf_result.to_string()),
            Cell::new(&f.record.disposition.to_string()),
            Cell::new(&f.org_name),
            Cell::new(&f.date.to_string()),
        ]));
    }
    table.to_string()
}

#[derive(Debug, Serialize)]
struct FailureRow<'a> {
    domain: &'a str,
    org_name: &'a str,
    report_id: &'a str,
    date: String,
    source_ip: &'a str,
    count: u64,
    header_from: &'a str,
    disposition: String,
    dkim_result: String,
    spf_result: String,
    dkim_details: String,
    spf_details: String,
}

fn join_details(details: &[AuthDetail]) -> String {
    details
        .iter()
        .map(|d| format!("{}:{}", d.domain, d.result))
        .collect::<Vec<_>>()
        .join("; ")
}

/// One CSV row per failure, with a header line.
pub fn render_csv(aggregator: &Aggregator) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    for f in aggregator.failures() {
        wtr.serialize(FailureRow {
            domain: &f.domain,
            org_name: &f.org_name,
            report_id: &f.report_id,
            date: f.date.to_string(),
            source_ip: &f.record.source_ip,
            count: f.record.count,
            header_from: &f.record.header_from,
            disposition: f.record.disposition.to_string(),
            dkim_result: f.record.dkim_result.to_string(),
            spf_result: f.record.spf_result.to_string(),
            dkim_details: join_details(&f.record.dkim_details),
            spf_details: join_details(&f.record.spf_details),
        })?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| DmarcError::Io(std::io::Error::other(e.to_string())))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

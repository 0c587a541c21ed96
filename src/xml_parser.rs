//! XML Parser Module
//!
//! This module parses DMARC aggregate report XML into a [`Report`]. The document
//! is first read into a small element tree with `quick-xml`, then each schema
//! element is normalized through one lookup that yields either a required value
//! or a default.
//!
//! Hardening: DOCTYPE declarations (and hence external/internal entities) are
//! removed before parsing, and a DOCTYPE block with two or more entity
//! definitions rejects the document outright. Element nesting is capped to
//! protect against deeply recursive input.

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::{ParseError, RecordError};
use crate::models::{AuthDetail, AuthResult, Disposition, Record, Report};

const MAX_DEPTH: usize = 20;
const UNKNOWN: &str = "Unknown";
const NOT_AVAILABLE: &str = "N/A";

/// A report together with the records that had to be dropped from it.
#[derive(Debug)]
pub struct ParsedReport {
    pub report: Report,
    pub skipped_records: Vec<RecordError>,
}

/// Parses report XML into a [`Report`]. Unusable records are skipped with a warning.
///
/// # Errors
///
/// `Malformed` for XML that cannot be read, `MissingRequiredField` when the
/// date range or the published domain is absent, and `InvalidDateRange` for
/// an inverted or out-of-range window.
pub fn parse_report(xml: &[u8], source_filename: &str) -> Result<Report, ParseError> {
    parse_report_detailed(xml, source_filename).map(|parsed| parsed.report)
}

/// Same as [`parse_report`] but also hands back the per-record errors.
pub fn parse_report_detailed(xml: &[u8], source_filename: &str) -> Result<ParsedReport, ParseError> {
    let text = std::str::from_utf8(xml)
        .map_err(|e| ParseError::Malformed(format!("report is not valid UTF-8: {}", e)))?;
    let cleaned = strip_doctype(text)?;
    let root = build_tree(cleaned.trim_start_matches('\u{feff}').trim())?;
    if root.name != "feedback" {
        return Err(ParseError::Malformed(format!(
            "root element is <{}>, expected <feedback>",
            root.name
        )));
    }

    let metadata = root.child("report_metadata");
    let org_name = text_or(metadata.and_then(|m| m.text_at(&["org_name"])), UNKNOWN);
    let report_id = text_or(metadata.and_then(|m| m.text_at(&["report_id"])), UNKNOWN);
    let begin = epoch_at(metadata, "date_range", "begin", "report_metadata/date_range/begin")?;
    let end = epoch_at(metadata, "date_range", "end", "report_metadata/date_range/end")?;
    let (date_begin, date_end) = date_window(begin, end)?;

    let policy = root.child("policy_published");
    let domain = policy
        .and_then(|p| p.text_at(&["domain"]))
        .ok_or(ParseError::MissingRequiredField("policy_published/domain"))?
        .to_string();
    let dmarc_policy = text_or(policy.and_then(|p| p.text_at(&["p"])), "");

    let mut records = Vec::new();
    let mut skipped_records = Vec::new();
    for (index, node) in root.children_named("record").enumerate() {
        match parse_record(node) {
            Ok(record) => records.push(record),
            Err(e) => {
                log::warn!(
                    "Skipping record #{} in {} ({}): {}",
                    index + 1,
                    source_filename,
                    domain,
                    e
                );
                skipped_records.push(e);
            }
        }
    }

    Ok(ParsedReport {
        report: Report {
            org_name,
            report_id,
            domain,
            dmarc_policy,
            date_begin,
            date_end,
            records,
            source_filename: source_filename.to_string(),
        },
        skipped_records,
    })
}

fn parse_record(node: &Node) -> Result<Record, RecordError> {
    let source_ip = node
        .text_at(&["row", "source_ip"])
        .ok_or(RecordError::MissingField("row/source_ip"))?
        .to_string();
    let raw_count = node
        .text_at(&["row", "count"])
        .ok_or(RecordError::MissingField("row/count"))?;
    let count = match raw_count.parse::<u64>() {
        Ok(n) if n >= 1 => n,
        _ => {
            return Err(RecordError::InvalidValue {
                field: "row/count",
                value: raw_count.to_string(),
            })
        }
    };

    let disposition = match node.text_at(&["row", "policy_evaluated", "disposition"]) {
        Some(raw) => raw.parse::<Disposition>().map_err(|_| RecordError::InvalidValue {
            field: "row/policy_evaluated/disposition",
            value: raw.to_string(),
        })?,
        None => Disposition::None,
    };
    let dkim_result = evaluated(node, "dkim", "row/policy_evaluated/dkim")?;
    let spf_result = evaluated(node, "spf", "row/policy_evaluated/spf")?;

    let auth = node.child("auth_results");
    let dkim_details: Vec<AuthDetail> = auth
        .map(|a| a.children_named("dkim").map(|d| auth_detail(d, "selector")).collect())
        .unwrap_or_default();
    let spf_details: Vec<AuthDetail> = auth
        .map(|a| a.children_named("spf").map(|s| auth_detail(s, "scope")).collect())
        .unwrap_or_default();

    let header_from = text_or(node.text_at(&["identifiers", "header_from"]), NOT_AVAILABLE);
    let envelope_from = node
        .text_at(&["identifiers", "envelope_from"])
        .map(str::to_string);

    Ok(Record {
        source_ip,
        count,
        disposition,
        dkim_result,
        spf_result,
        dkim_details,
        spf_details,
        header_from,
        envelope_from,
    })
}

/// Reads a policy-evaluated result. Absence counts as `none`.
fn evaluated(node: &Node, method: &str, field: &'static str) -> Result<AuthResult, RecordError> {
    match node.text_at(&["row", "policy_evaluated", method]) {
        Some(raw) => raw.parse().map_err(|_| RecordError::InvalidValue {
            field,
            value: raw.to_string(),
        }),
        None => Ok(AuthResult::None),
    }
}

fn auth_detail(node: &Node, qualifier: &str) -> AuthDetail {
    let extra = node.text_at(&[qualifier]).map(str::to_string);
    let (selector, scope) = if qualifier == "selector" {
        (extra, None)
    } else {
        (None, extra)
    };
    AuthDetail {
        domain: text_or(node.text_at(&["domain"]), NOT_AVAILABLE),
        result: text_or(node.text_at(&["result"]), "none"),
        selector,
        scope,
    }
}

fn text_or(value: Option<&str>, default: &str) -> String {
    value.unwrap_or(default).to_string()
}

fn epoch_at(
    metadata: Option<&Node>,
    range: &str,
    bound: &str,
    field: &'static str,
) -> Result<i64, ParseError> {
    metadata
        .and_then(|m| m.text_at(&[range, bound]))
        .and_then(|t| t.parse::<i64>().ok())
        .ok_or(ParseError::MissingRequiredField(field))
}

fn date_window(begin: i64, end: i64) -> Result<(DateTime<Utc>, DateTime<Utc>), ParseError> {
    let to_utc = |secs: i64| {
        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| ParseError::InvalidDateRange(format!("timestamp {} out of range", secs)))
    };
    let (date_begin, date_end) = (to_utc(begin)?, to_utc(end)?);
    if date_begin > date_end {
        return Err(ParseError::InvalidDateRange(format!(
            "begin {} is after end {}",
            begin, end
        )));
    }
    Ok((date_begin, date_end))
}

/// Removes a DOCTYPE block, rejecting it when it declares multiple entities.
fn strip_doctype(xml: &str) -> Result<String, ParseError> {
    let Some(start) = xml.find("<!DOCTYPE") else {
        return Ok(xml.to_string());
    };
    let rest = &xml[start..];
    // Internal subsets end with "]>", a bare declaration with the first ">".
    let end = match (rest.find('['), rest.find('>')) {
        (Some(bracket), Some(close)) if bracket < close => rest.find("]>").map(|i| i + 2),
        (_, Some(close)) => Some(close + 1),
        _ => None,
    }
    .ok_or_else(|| ParseError::Malformed("unterminated DOCTYPE declaration".into()))?;

    let doctype = &rest[..end];
    if doctype.matches("<!ENTITY").count() >= 2 {
        return Err(ParseError::Malformed("recursive entities detected".into()));
    }
    Ok(format!("{}{}", &xml[..start], &rest[end..]))
}

/// Minimal element tree: local name, trimmed text and child elements.
#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn new(name: String) -> Self {
        Node {
            name,
            ..Node::default()
        }
    }

    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of the descendant at `path`; empty text counts as absent.
    fn text_at(&self, path: &[&str]) -> Option<&str> {
        let node = path.iter().try_fold(self, |node, name| node.child(name))?;
        let text = node.text.trim();
        (!text.is_empty()).then_some(text)
    }
}

fn build_tree(xml: &str) -> Result<Node, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(ParseError::Malformed(
                        "XML recursion depth limit exceeded".into(),
                    ));
                }
                if root.is_some() {
                    return Err(ParseError::Malformed("multiple root elements".into()));
                }
                stack.push(Node::new(local_name(e.local_name().as_ref())));
            }
            Event::Empty(e) => {
                let node = Node::new(local_name(e.local_name().as_ref()));
                attach(&mut stack, &mut root, node)?;
            }
            Event::Text(e) => {
                let text = e.unescape()?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Event::CData(e) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| ParseError::Malformed("unexpected closing tag".into()))?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(ParseError::Malformed("unexpected end of document".into()));
    }
    root.ok_or_else(|| ParseError::Malformed("document has no root element".into()))
}

fn attach(stack: &mut [Node], root: &mut Option<Node>, node: Node) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None if root.is_none() => *root = Some(node),
        None => return Err(ParseError::Malformed("multiple root elements".into())),
    }
    Ok(())
}

fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

//! Message Candidate Selector Module
//!
//! Runs the heuristic searches against a [`MessageSource`], deduplicates and caps
//! the hits, then drives every candidate through extraction, parsing and
//! aggregation. Each message is processed completely before the next one; the
//! [`Aggregator`] is the only state shared between messages.
//!
//! Candidates are ordered by sequence number before the cap is applied, so
//! "the most recent N" means the N highest sequence numbers.
use std::collections::BTreeSet;
use std::fmt;

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::error::{DmarcError, Result};
use crate::extractor::{self, AttachmentKind};
use crate::mailbox::{MessageId, MessageSource, RawMessage, SearchCriterion};
use crate::xml_parser::parse_report_detailed;

/// Outcome of candidate selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Number of distinct messages matched by any criterion.
    pub total_unique: usize,
    /// The capped candidates, ascending by sequence number.
    pub candidates: Vec<MessageId>,
    /// Criteria whose search failed without losing the connection.
    pub failed_searches: Vec<String>,
}

/// Unions the hits of every criterion and keeps the `limit` newest.
///
/// A lost connection ends the run. Any other failing search is logged and
/// skipped; the other criteria still run.
pub fn select_candidates<S: MessageSource + ?Sized>(
    source: &mut S,
    criteria: &[SearchCriterion],
    limit: usize,
) -> Result<Selection> {
    let mut unique = BTreeSet::new();
    let mut failed_searches = Vec::new();
    for criterion in criteria {
        match source.search(criterion) {
            Ok(found) => {
                if !found.is_empty() {
                    log::debug!("Criteria '{}': found {} emails", criterion, found.len());
                }
                unique.extend(found);
            }
            Err(e @ DmarcError::Connection(_)) => return Err(e),
            Err(e) => {
                log::warn!("Search '{}' failed: {}", criterion, e);
                failed_searches.push(format!("{}: {}", criterion, e));
            }
        }
    }

    let total_unique = unique.len();
    let skip = total_unique.saturating_sub(limit);
    let candidates: Vec<MessageId> = unique.into_iter().skip(skip).collect();
    log::debug!(
        "Total unique emails: {}, processing last {}",
        total_unique,
        candidates.len()
    );
    Ok(Selection {
        total_unique,
        candidates,
        failed_searches,
    })
}

/// Whether a subject looks like an aggregate report notification.
pub fn looks_like_report(subject: &str) -> bool {
    let lower = subject.to_lowercase();
    subject.contains("Report Domain:") || lower.contains("dmarc") || lower.contains("aggregate")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    SearchFailed,
    FetchFailed,
    NotAReport,
    NoAttachment,
    AttachmentSkipped,
    ReportRejected,
    RecordSkipped,
}

/// A non-fatal event recorded while processing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// `None` for events that precede any single message, such as a failed search.
    pub message_id: Option<MessageId>,
    pub kind: DiagnosticKind,
    pub detail: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message_id {
            Some(id) => write!(f, "message {}: {:?}: {}", id, self.kind, self.detail),
            None => write!(f, "{:?}: {}", self.kind, self.detail),
        }
    }
}

/// Everything one run produced.
#[derive(Debug, Default)]
pub struct Analysis {
    pub aggregator: Aggregator,
    pub diagnostics: Vec<Diagnostic>,
    pub candidates_found: usize,
    pub candidates_processed: usize,
}

impl Analysis {
    pub fn diagnostics_of(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.kind == kind)
    }
}

/// Selects candidates from `source` and analyzes each of them.
///
/// Only [`DmarcError::Connection`] is returned; every other failure becomes a
/// [`Diagnostic`] and the run goes on.
pub fn analyze<S: MessageSource + ?Sized>(
    source: &mut S,
    criteria: &[SearchCriterion],
    config: &Config,
) -> Result<Analysis> {
    let selection = select_candidates(source, criteria, config.message_limit)?;
    log::info!(
        "Found {} potential DMARC report emails",
        selection.candidates.len()
    );

    let mut analysis = Analysis {
        candidates_found: selection.total_unique,
        candidates_processed: selection.candidates.len(),
        ..Analysis::default()
    };
    analysis
        .diagnostics
        .extend(selection.failed_searches.into_iter().map(|detail| Diagnostic {
            message_id: None,
            kind: DiagnosticKind::SearchFailed,
            detail,
        }));
    for id in selection.candidates {
        match source.fetch(id) {
            Ok(message) => process_message(
                id,
                &message,
                config,
                &mut analysis.aggregator,
                &mut analysis.diagnostics,
            ),
            Err(e @ DmarcError::Connection(_)) => return Err(e),
            Err(e) => {
                log::warn!("Could not process email {}: {}", id, e);
                analysis.diagnostics.push(Diagnostic {
                    message_id: Some(id),
                    kind: DiagnosticKind::FetchFailed,
                    detail: e.to_string(),
                });
            }
        }
    }
    Ok(analysis)
}

/// Extracts, parses and aggregates every report attachment of one message.
pub fn process_message(
    id: MessageId,
    message: &RawMessage,
    config: &Config,
    aggregator: &mut Aggregator,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let mut note = |kind: DiagnosticKind, detail: String| {
        diagnostics.push(Diagnostic {
            message_id: Some(id),
            kind,
            detail,
        })
    };

    if !looks_like_report(&message.subject) {
        log::debug!("Skipping email {}: subject '{}'", id, message.subject);
        note(DiagnosticKind::NotAReport, message.subject.clone());
        return;
    }

    let reports: Vec<_> = message
        .attachments
        .iter()
        .filter(|a| AttachmentKind::from_filename(&a.filename).is_some())
        .collect();
    if reports.is_empty() {
        let subject: String = message.subject.chars().take(50).collect();
        log::info!(
            "Note: Email with subject '{}...' has no XML/GZ/ZIP attachment",
            subject
        );
        note(DiagnosticKind::NoAttachment, message.subject.clone());
        return;
    }

    for attachment in reports {
        let xml = match extractor::extract(&attachment.filename, &attachment.data, config) {
            Ok(Some(xml)) => xml,
            Ok(None) => {
                log::info!("No XML report inside {}", attachment.filename);
                note(
                    DiagnosticKind::AttachmentSkipped,
                    format!("{}: no XML member", attachment.filename),
                );
                continue;
            }
            Err(e) => {
                log::warn!("Could not extract {}: {}", attachment.filename, e);
                note(
                    DiagnosticKind::AttachmentSkipped,
                    format!("{}: {}", attachment.filename, e),
                );
                continue;
            }
        };

        match parse_report_detailed(&xml, &attachment.filename) {
            Ok(parsed) => {
                for skipped in &parsed.skipped_records {
                    note(
                        DiagnosticKind::RecordSkipped,
                        format!("{}: {}", attachment.filename, skipped),
                    );
                }
                aggregator.append(parsed.report);
            }
            Err(e) => {
                log::warn!("Could not parse {}: {}", attachment.filename, e);
                note(
                    DiagnosticKind::ReportRejected,
                    format!("{}: {}", attachment.filename, e),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::Attachment;
    use std::collections::HashMap;

    /// Canned search hits keyed by criterion; unknown criteria are rejected
    /// by the server. Fetching `drop_on_fetch` loses the connection.
    #[derive(Default)]
    struct FakeSource {
        hits: HashMap<String, Vec<u32>>,
        messages: HashMap<u32, RawMessage>,
        fetches: Vec<u32>,
        drop_on_fetch: Option<u32>,
    }

    impl MessageSource for FakeSource {
        fn search(&mut self, criterion: &SearchCriterion) -> Result<Vec<MessageId>> {
            match self.hits.get(&criterion.to_string()) {
                Some(ids) => Ok(ids.iter().map(|n| MessageId(*n)).collect()),
                None => Err(DmarcError::Message(format!("search {} refused", criterion))),
            }
        }

        fn fetch(&mut self, id: MessageId) -> Result<RawMessage> {
            self.fetches.push(id.0);
            if self.drop_on_fetch == Some(id.0) {
                return Err(DmarcError::Connection("socket closed".into()));
            }
            self.messages
                .get(&id.0)
                .cloned()
                .ok_or_else(|| DmarcError::Message(format!("cannot fetch {}", id)))
        }
    }

    /// A mailbox whose server went away.
    struct DeadSource;

    impl MessageSource for DeadSource {
        fn search(&mut self, _criterion: &SearchCriterion) -> Result<Vec<MessageId>> {
            Err(DmarcError::Connection("socket closed".into()))
        }

        fn fetch(&mut self, _id: MessageId) -> Result<RawMessage> {
            Err(DmarcError::Connection("socket closed".into()))
        }
    }

    const XML: &str = r#"<feedback>
  <report_metadata><org_name>Yahoo</org_name><report_id>r1</report_id>
    <date_range><begin>1700000000</begin><end>1700086399</end></date_range></report_metadata>
  <policy_published><domain>example.com</domain><p>reject</p></policy_published>
  <record><row><source_ip>203.0.113.5</source_ip><count>10</count>
    <policy_evaluated><disposition>quarantine</disposition><dkim>fail</dkim><spf>pass</spf></policy_evaluated></row>
    <identifiers><header_from>example.com</header_from></identifiers></record>
</feedback>"#;

    fn report_message(filename: &str, data: &[u8]) -> RawMessage {
        RawMessage {
            subject: "Report Domain: example.com Submitter: yahoo.com".into(),
            from: "dmarc@yahoo.com".into(),
            attachments: vec![Attachment {
                filename: filename.into(),
                data: data.to_vec(),
            }],
        }
    }

    #[test]
    fn test_selection_dedups_and_keeps_newest() {
        let mut source = FakeSource::default();
        source.hits.insert("SUBJECT \"dmarc\"".into(), vec![5, 1, 3]);
        source.hits.insert("FROM \"dmarc\"".into(), vec![3, 4, 5]);
        let criteria = vec![
            SearchCriterion::Subject("dmarc".into()),
            SearchCriterion::From("dmarc".into()),
            SearchCriterion::From("yahoo".into()),
        ];

        let selection = select_candidates(&mut source, &criteria, 3).unwrap();
        assert_eq!(selection.total_unique, 4);
        assert_eq!(
            selection.candidates,
            vec![MessageId(3), MessageId(4), MessageId(5)]
        );
        assert_eq!(selection.failed_searches.len(), 1);
        assert!(selection.failed_searches[0].starts_with("FROM \"yahoo\""));
    }

    #[test]
    fn test_lost_connection_aborts_the_run() {
        let result = analyze(&mut DeadSource, &SearchCriterion::defaults(), &Config::default());
        assert!(matches!(result, Err(DmarcError::Connection(_))));
    }

    #[test]
    fn test_connection_lost_mid_fetch_aborts_the_run() {
        let mut source = FakeSource::default();
        source.hits.insert("SUBJECT \"dmarc\"".into(), vec![1, 2, 3]);
        source.messages.insert(1, report_message("r.xml", XML.as_bytes()));
        source.drop_on_fetch = Some(2);

        let criteria = vec![SearchCriterion::Subject("dmarc".into())];
        let result = analyze(&mut source, &criteria, &Config::default());
        assert!(matches!(result, Err(DmarcError::Connection(_))));
        assert_eq!(source.fetches, vec![1, 2]);
    }

    #[test]
    fn test_failed_search_is_recorded() {
        let mut source = FakeSource::default();
        source.hits.insert("SUBJECT \"dmarc\"".into(), vec![1]);
        source.messages.insert(1, report_message("r.xml", XML.as_bytes()));
        let criteria = vec![
            SearchCriterion::Subject("dmarc".into()),
            SearchCriterion::From("postmaster".into()),
        ];

        let analysis = analyze(&mut source, &criteria, &Config::default()).unwrap();
        let failed: Vec<&Diagnostic> = analysis.diagnostics_of(DiagnosticKind::SearchFailed).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].message_id, None);
        assert_eq!(analysis.aggregator.reports().len(), 1);
    }

    #[test]
    fn test_duplicate_hit_is_processed_once() {
        let mut source = FakeSource::default();
        source.hits.insert("SUBJECT \"Report Domain:\"".into(), vec![7]);
        source.hits.insert("FROM \"yahoo\"".into(), vec![7]);
        source.messages.insert(7, report_message("r.xml", XML.as_bytes()));
        let criteria = vec![
            SearchCriterion::Subject("Report Domain:".into()),
            SearchCriterion::From("yahoo".into()),
        ];

        let analysis = analyze(&mut source, &criteria, &Config::default()).unwrap();
        assert_eq!(source.fetches, vec![7]);
        assert_eq!(analysis.aggregator.reports().len(), 1);
        assert_eq!(analysis.aggregator.summary().total_failed_message_count, 10);
    }

    #[test]
    fn test_subject_sniffing() {
        assert!(looks_like_report("Report Domain: example.com Submitter: google.com"));
        assert!(looks_like_report("[Preview] DMARC Aggregate"));
        assert!(looks_like_report("Aggregate report for example.com"));
        assert!(!looks_like_report("report domain: lowercase does not count"));
        assert!(!looks_like_report("Lunch on Friday"));
    }

    #[test]
    fn test_non_report_and_missing_attachment_are_skipped() {
        let mut agg = Aggregator::new();
        let mut diags = Vec::new();
        let config = Config::default();

        let chatter = RawMessage {
            subject: "Lunch".into(),
            ..RawMessage::default()
        };
        process_message(MessageId(1), &chatter, &config, &mut agg, &mut diags);

        let mut bare = report_message("logo.png", b"\x89PNG");
        bare.subject = "DMARC report".into();
        process_message(MessageId(2), &bare, &config, &mut agg, &mut diags);

        let kinds: Vec<DiagnosticKind> = diags.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![DiagnosticKind::NotAReport, DiagnosticKind::NoAttachment]);
        assert!(agg.reports().is_empty());
    }

    #[test]
    fn test_bad_attachment_does_not_stop_the_next_one() {
        let mut message = report_message("broken.xml.gz", b"not gzip at all");
        message.attachments.push(Attachment {
            filename: "bad.xml".into(),
            data: b"<feedback><oops></feedback>".to_vec(),
        });
        message.attachments.push(Attachment {
            filename: "good.xml".into(),
            data: XML.as_bytes().to_vec(),
        });

        let mut agg = Aggregator::new();
        let mut diags = Vec::new();
        process_message(MessageId(9), &message, &Config::default(), &mut agg, &mut diags);

        let kinds: Vec<DiagnosticKind> = diags.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![DiagnosticKind::AttachmentSkipped, DiagnosticKind::ReportRejected]
        );
        assert_eq!(agg.reports().len(), 1);
        assert_eq!(agg.reports()[0].source_filename, "good.xml");
    }

    #[test]
    fn test_fetch_failure_is_a_warning() {
        let mut source = FakeSource::default();
        source.hits.insert("SUBJECT \"dmarc\"".into(), vec![1, 2]);
        source.messages.insert(2, report_message("r.xml", XML.as_bytes()));

        let criteria = vec![SearchCriterion::Subject("dmarc".into())];
        let analysis = analyze(&mut source, &criteria, &Config::default()).unwrap();
        assert_eq!(analysis.candidates_processed, 2);
        assert_eq!(analysis.diagnostics_of(DiagnosticKind::FetchFailed).count(), 1);
        assert_eq!(analysis.aggregator.reports().len(), 1);
    }
}
